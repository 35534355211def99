//! The `get_channel`/`set_channel` bridge helpers: services whose sole
//! client forwards its inbound traffic verbatim onto a caller-supplied
//! transport endpoint.
//!
//! The adapter that pumps bytes the *other* way — reading from the peer
//! endpoint and calling [`Multiplexer::send`] — is left to the caller's own
//! event loop; this module only provides the core-side half these two calls
//! need: registering a one-client service and wiring its forwarding.

use crate::client::{ClientContext, ClientHandler};
use crate::multiplexer::{ConnectContext, Multiplexer, ServiceId};
use crate::service::ServiceHandler;
use crate::transport::{Pipe, PipeEnd, Transport};

struct BridgeService {
    peer: PipeEnd,
}

impl ServiceHandler for BridgeService {
    fn on_connect(&mut self, ctx: &mut ConnectContext<'_>) {
        ctx.accept(
            Box::new(BridgeClient {
                peer: self.peer.clone(),
            }),
            false,
        );
    }
}

struct BridgeClient {
    peer: PipeEnd,
}

impl ClientHandler for BridgeClient {
    fn on_receive(&mut self, _ctx: &mut ClientContext<'_>, message: &[u8]) {
        if let Err(error) = self.peer.write_all(message) {
            tracing::warn!(%error, "bridge channel forwarding failed");
        }
    }
}

impl Multiplexer {
    /// Registers a service named `name` backed by a fresh in-memory pipe
    /// and returns the caller's end of it.
    ///
    /// The service accepts at most one client (`max_clients = 1`); every
    /// message that client sends is forwarded verbatim onto the returned
    /// endpoint, matching the upstream `get_channel` helper. Pumping bytes
    /// the other way — from the returned endpoint back into the guest
    /// channel via [`Multiplexer::send`] — is the caller's responsibility.
    pub fn get_channel(&mut self, name: impl Into<String>) -> (ServiceId, PipeEnd) {
        let (ours, theirs) = Pipe::pair();
        let id = self.bind_channel(name, ours);
        (id, theirs)
    }

    /// Registers a service named `name` whose sole client (`max_clients =
    /// 1`) forwards its traffic verbatim onto the caller-supplied `peer`
    /// endpoint, matching the upstream `set_channel` helper.
    pub fn bind_channel(&mut self, name: impl Into<String>, peer: PipeEnd) -> ServiceId {
        self.register_service(name, Some(1), Box::new(BridgeService { peer }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Pipe;

    #[test]
    fn get_channel_forwards_client_traffic_verbatim() {
        let mut mux = Multiplexer::new();
        let (_id, peer) = mux.get_channel("gsm-bridge");

        let (_guest, mut guest_transport) = Pipe::pair();
        mux.feed(b"000015connect:gsm-bridge:01", &mut guest_transport)
            .unwrap();
        assert!(mux.is_connected(0x01));

        mux.feed(b"010005hello", &mut guest_transport).unwrap();
        assert_eq!(peer.read(5), b"hello");
    }

    #[test]
    fn bind_channel_uses_caller_supplied_endpoint() {
        let mut mux = Multiplexer::new();
        let (ours, theirs) = Pipe::pair();
        mux.bind_channel("gps-bridge", ours);

        let (_guest, mut guest_transport) = Pipe::pair();
        mux.feed(b"000015connect:gps-bridge:02", &mut guest_transport)
            .unwrap();
        mux.feed(b"020003abc", &mut guest_transport).unwrap();
        assert_eq!(theirs.read(3), b"abc");
    }
}
