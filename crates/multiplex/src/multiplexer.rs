//! The root object: owns the wire codec, the channel-indexed client arena,
//! and the service registry, and dispatches inbound transport bytes to the
//! right client or the built-in channel-0 control handler.

use crate::client::{Client, ClientContext, ClientHandler};
use crate::codec::{SerialCodec, Version};
use crate::control::{self, ConnectFailure, ControlMessage};
use crate::error::{MultiplexError, SendError};
use crate::service::{Service, ServiceHandler};
use crate::transport::Transport;

const CONTROL_CHANNEL: u8 = 0;

/// Opaque handle to a registered service, returned by
/// [`Multiplexer::register_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(usize);

/// Handed to a [`ServiceHandler::on_connect`] implementation: the only way
/// it can learn the connecting channel and accept the connection.
pub struct ConnectContext<'a> {
    multiplexer: &'a mut Multiplexer,
    channel: u8,
    service_index: usize,
    accepted: bool,
}

impl ConnectContext<'_> {
    /// The channel id assigned to this connection, usable once
    /// [`ConnectContext::accept`] has been called.
    #[must_use]
    pub const fn channel(&self) -> u8 {
        self.channel
    }

    /// Accepts the connection, binding `handler` to the channel.
    ///
    /// `framed` enables the inner message-framing layer for this channel;
    /// most services leave it disabled and treat each transport record as
    /// one message.
    pub fn accept(&mut self, handler: Box<dyn ClientHandler>, framed: bool) {
        let client = Client::new(self.channel, handler, framed);
        self.multiplexer.slots[self.channel as usize] = Some(client);
        self.multiplexer.services[self.service_index].add_client(self.channel);
        self.accepted = true;
    }
}

/// The control channel's handler. Channel 0 is always bound to this and is
/// never exposed to a registered service.
struct ControlHandler;

impl ClientHandler for ControlHandler {
    fn on_receive(&mut self, ctx: &mut ClientContext<'_>, message: &[u8]) {
        let Some(parsed) = control::parse(message) else {
            if control::looks_like_known_command(message) {
                tracing::warn!(?message, "malformed control command, dropping");
                return;
            }
            tracing::warn!(?message, "unrecognized control message");
            if ctx.multiplexer.codec.version() != Version::Legacy {
                let _ = ctx
                    .multiplexer
                    .reply_control(control::UNKNOWN_COMMAND, ctx.transport);
            }
            return;
        };

        match parsed {
            ControlMessage::Connect { service, channel } => {
                let _ = ctx.multiplexer.handle_connect(service, channel, false, ctx.transport);
            }
            ControlMessage::Disconnect { channel } => {
                let _ = ctx
                    .multiplexer
                    .close_client_internal(channel, false, ctx.transport);
            }
            ControlMessage::LegacyConnect { service, channel } => {
                match ctx.multiplexer.codec.version() {
                    Version::Unknown => {
                        tracing::info!("legacy qemud peer detected via ok:connect:");
                        ctx.multiplexer.codec.lock_version(Version::Legacy);
                        let _ =
                            ctx.multiplexer
                                .handle_connect(service, channel, true, ctx.transport);
                    }
                    Version::Legacy => {
                        let _ =
                            ctx.multiplexer
                                .handle_connect(service, channel, true, ctx.transport);
                    }
                    Version::Normal => {
                        tracing::warn!("ignoring legacy connect, peer already normal");
                    }
                }
            }
        }
    }
}

/// The multiplexer: owns every channel's state and dispatches inbound
/// transport bytes to the right client or service.
///
/// Construct with [`Multiplexer::new`], feed inbound bytes with
/// [`Multiplexer::feed`], and reply or push unsolicited traffic with
/// [`Multiplexer::send`]. The multiplexer never owns the transport: every
/// call that can produce outbound bytes takes one as a `&mut dyn Transport`
/// argument.
pub struct Multiplexer {
    codec: SerialCodec,
    slots: [Option<Client>; 256],
    services: Vec<Service>,
    /// Channels whose teardown was requested while `dispatch` still held
    /// their `Client` locally (a re-entrant close from inside a handler
    /// callback). See [`Multiplexer::is_closed_marker`].
    closing: Vec<u8>,
    /// The channel `dispatch` currently holds the client of, if any. Lets
    /// [`Multiplexer::close_client_internal`] tell a legitimate re-entrant
    /// close (the slot is empty because dispatch is holding it) apart from
    /// a stale close on a channel nothing has open, which must be a no-op.
    dispatching: Option<u8>,
}

impl Multiplexer {
    /// Creates an empty multiplexer with no registered services and no
    /// connected clients besides the built-in control channel.
    #[must_use]
    pub fn new() -> Self {
        const EMPTY: Option<Client> = None;
        let mut slots = [EMPTY; 256];
        slots[CONTROL_CHANNEL as usize] = Some(Client::new(
            CONTROL_CHANNEL,
            Box::new(ControlHandler),
            false,
        ));
        Self {
            codec: SerialCodec::new(),
            slots,
            services: Vec::new(),
            closing: Vec::new(),
            dispatching: None,
        }
    }

    /// Registers a new named service. `max_clients` caps how many channels
    /// may be connected to it at once; `None` means unbounded.
    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        max_clients: Option<usize>,
        handler: Box<dyn ServiceHandler>,
    ) -> ServiceId {
        let index = self.services.len();
        self.services.push(Service::new(name, max_clients, handler));
        ServiceId(index)
    }

    /// Looks up a service by name.
    #[must_use]
    pub fn find_service(&self, name: &str) -> Option<ServiceId> {
        self.services.iter().position(|s| s.name() == name).map(ServiceId)
    }

    /// Convenience accessor for a registered service's metadata.
    #[must_use]
    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.0]
    }

    /// Whether `channel` currently has a connected client (including the
    /// permanent control channel 0).
    #[must_use]
    pub fn is_connected(&self, channel: u8) -> bool {
        self.slots[channel as usize].is_some()
    }

    /// The header orientation currently locked in, if detection has run.
    #[must_use]
    pub fn version(&self) -> Version {
        self.codec.version()
    }

    /// Sends a probe record that lets a legacy peer reveal itself before any
    /// client has connected. Call this once, immediately after establishing
    /// the transport, before feeding it any inbound bytes.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from `transport`.
    pub fn send_legacy_probe(&mut self, transport: &mut dyn Transport) -> std::io::Result<()> {
        SerialCodec::send_legacy_probe(transport)
    }

    /// Feeds inbound transport bytes to the decoder and dispatches every
    /// record they complete to its channel's handler.
    ///
    /// `transport` is the same transport the multiplexer replies on, since
    /// dispatch may synchronously produce outbound traffic (a control
    /// reply, a handler's own response).
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from `transport`.
    pub fn feed(&mut self, bytes: &[u8], transport: &mut dyn Transport) -> std::io::Result<()> {
        self.codec.push(bytes);
        while let Some(record) = self.codec.next_record() {
            self.dispatch(record.channel, &record.payload, transport)?;
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        channel: u8,
        payload: &[u8],
        transport: &mut dyn Transport,
    ) -> std::io::Result<()> {
        let Some(mut client) = self.slots[channel as usize].take() else {
            tracing::warn!(channel, "record for unknown or closed channel, discarding");
            return Ok(());
        };
        self.dispatching = Some(channel);

        for message in client.extract_messages(payload) {
            let mut ctx = ClientContext {
                multiplexer: &mut *self,
                channel,
                transport: &mut *transport,
            };
            client.handler.on_receive(&mut ctx, &message);

            if self.is_closed_marker(channel) {
                self.clear_closed_marker(channel);
                self.dispatching = None;
                client.handler.on_close(channel);
                return Ok(());
            }
        }

        self.dispatching = None;
        self.slots[channel as usize] = Some(client);
        Ok(())
    }

    /// `dispatch` pulls the client out of its slot before invoking its
    /// handler, so a re-entrant [`ClientContext::close`] call (the handler
    /// calling back into the multiplexer while `dispatch` still holds the
    /// client locally) cannot write `None` into that slot — there is nothing
    /// there to overwrite. Instead it records the channel in `closing`,
    /// which `dispatch` checks for after every message.
    fn is_closed_marker(&self, channel: u8) -> bool {
        self.closing.contains(&channel)
    }

    fn clear_closed_marker(&mut self, channel: u8) {
        self.closing.retain(|&c| c != channel);
    }

    fn handle_connect(
        &mut self,
        service_name: &str,
        channel: u8,
        legacy: bool,
        transport: &mut dyn Transport,
    ) -> std::io::Result<()> {
        if self.slots[channel as usize].is_some() {
            tracing::warn!(channel, "connect request for channel already in use");
            return Ok(());
        }

        let Some(index) = self.services.iter().position(|s| s.name() == service_name) else {
            tracing::info!(service = service_name, "connect to unknown service rejected");
            if legacy {
                return Ok(());
            }
            return self.reply_control(
                &control::format_connect_failure(channel, ConnectFailure::UnknownService),
                transport,
            );
        };

        if self.services[index].is_full() {
            tracing::info!(service = service_name, "connect rejected, service at capacity");
            if legacy {
                return Ok(());
            }
            return self.reply_control(
                &control::format_connect_failure(channel, ConnectFailure::ServiceBusy),
                transport,
            );
        }

        let mut ctx = ConnectContext {
            multiplexer: &mut *self,
            channel,
            service_index: index,
            accepted: false,
        };
        self.services[index].handler.on_connect(&mut ctx);
        let accepted = ctx.accepted;

        if !accepted {
            tracing::warn!(service = service_name, "service declined connection");
            if legacy {
                return Ok(());
            }
            return self.reply_control(
                &control::format_connect_failure(channel, ConnectFailure::UnknownService),
                transport,
            );
        }

        tracing::info!(service = service_name, channel, "client connected");
        if legacy {
            return Ok(());
        }
        self.reply_control(&control::format_connect_ok(channel), transport)
    }

    fn reply_control(&mut self, message: &str, transport: &mut dyn Transport) -> std::io::Result<()> {
        self.codec.encode_into(CONTROL_CHANNEL, message.as_bytes(), transport)
    }

    /// Sends `data` to the peer on `channel`, fragmenting as needed. If
    /// `channel`'s connected client has inner message-framing enabled, the
    /// 4-hex-digit frame length header is prepended before fragmentation,
    /// mirroring the reassembly this crate performs on inbound framed
    /// traffic.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexError::Send`] if `data` is empty; the wire
    /// protocol cannot distinguish an intentional empty message from a
    /// caller mistake, so this crate rejects it rather than silently
    /// dropping it the way the original service did. Returns
    /// [`SendError::FrameTooLarge`] if framing is enabled and `data` is
    /// longer than [`crate::MAX_FRAME_PAYLOAD`]. Returns
    /// [`MultiplexError::Io`] if `transport` rejects the write.
    pub fn send(
        &mut self,
        channel: u8,
        data: &[u8],
        transport: &mut dyn Transport,
    ) -> Result<(), MultiplexError> {
        if data.is_empty() {
            return Err(SendError::EmptyMessage.into());
        }
        let framed = self.slots[channel as usize]
            .as_ref()
            .is_some_and(Client::is_framed);
        if framed {
            self.codec.encode_framed_into(channel, data, transport)
        } else {
            self.codec.encode_into(channel, data, transport)?;
            Ok(())
        }
    }

    /// Toggles inner message-framing for `channel`'s connected client.
    ///
    /// Disabling framing while a framed payload is mid-arrival drops its
    /// partial buffer immediately (see [`Client::set_framed`]). Calling
    /// this twice with the same value is equivalent to calling it once.
    /// A no-op if `channel` has no connected client.
    pub fn set_framing(&mut self, channel: u8, framed: bool) {
        if let Some(client) = self.slots[channel as usize].as_mut() {
            client.set_framed(framed);
        }
    }

    /// Whether `channel`'s connected client currently reassembles inner
    /// message frames. `false` if `channel` has no connected client.
    #[must_use]
    pub fn is_framed(&self, channel: u8) -> bool {
        self.slots[channel as usize]
            .as_ref()
            .is_some_and(Client::is_framed)
    }

    /// Closes `channel` from the host side: notifies the peer with a
    /// `disconnect:` control message, detaches the client from its service,
    /// and calls the handler's [`ClientHandler::on_close`].
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the disconnect notification.
    pub fn close_client(&mut self, channel: u8, transport: &mut dyn Transport) -> std::io::Result<()> {
        self.close_client_internal(channel, true, transport)
    }

    /// Closes `channel` without notifying the peer, used both for
    /// peer-initiated `disconnect:` messages (which would otherwise echo
    /// back pointlessly) and for the re-entrant close path from inside
    /// [`ClientContext::close`], whose caller already owns the removal.
    fn close_client_internal(
        &mut self,
        channel: u8,
        notify: bool,
        transport: &mut dyn Transport,
    ) -> std::io::Result<()> {
        if channel == CONTROL_CHANNEL {
            tracing::warn!("refusing to close the control channel");
            return Ok(());
        }

        let has_client = self.slots[channel as usize].is_some();
        let mid_dispatch = self.dispatching == Some(channel) && !self.closing.contains(&channel);

        if !has_client && !mid_dispatch {
            tracing::debug!(channel, "close requested for an already-closed or unknown channel, ignoring");
            return Ok(());
        }

        for service in &mut self.services {
            service.remove_client(channel);
        }

        if let Some(mut client) = self.slots[channel as usize].take() {
            client.handler.on_close(channel);
        } else {
            // The client is still owned locally by an in-progress dispatch
            // call; mark it so dispatch finishes the teardown once its
            // handler call returns.
            self.closing.push(channel);
        }

        if notify {
            self.reply_control(&control::format_disconnect(channel), transport)?;
        }
        Ok(())
    }

    /// Broadcasts `data` to every client currently connected to `service`.
    ///
    /// # Errors
    ///
    /// Returns the first error any recipient's send produces; delivery to
    /// later recipients is not attempted once that happens.
    pub fn broadcast(
        &mut self,
        service: ServiceId,
        data: &[u8],
        transport: &mut dyn Transport,
    ) -> Result<(), MultiplexError> {
        let channels = self.services[service.0].clients.clone();
        for channel in channels {
            self.send(channel, data, transport)?;
        }
        Ok(())
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}
