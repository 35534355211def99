//! Per-channel client state: the handler callback, and the optional inner
//! message-framing layer above the transport's own record framing.

use crate::multiplexer::Multiplexer;
use crate::sink::Sink;
use crate::transport::Transport;

/// Callback invoked for traffic addressed to one client's channel.
///
/// A `ClientHandler` is handed to the multiplexer once, at connect time
/// (typically from inside [`crate::ServiceHandler::on_connect`]), and then
/// owns that channel's conversation until the channel closes.
pub trait ClientHandler {
    /// Called with one complete message.
    ///
    /// If the client was created with message framing enabled, this is one
    /// reassembled inner frame; otherwise it is the raw payload of one
    /// transport record. `ctx` lets the handler reply or close the channel,
    /// including re-entrantly from within this call.
    fn on_receive(&mut self, ctx: &mut ClientContext<'_>, message: &[u8]);

    /// Called once the channel has closed, whether from a peer-initiated
    /// disconnect or a local [`ClientContext::close`] call. The default
    /// implementation does nothing.
    fn on_close(&mut self, channel: u8) {
        let _ = channel;
    }
}

/// Handed to a [`ClientHandler`] during [`ClientHandler::on_receive`]; the
/// only way a handler can act on its own channel.
pub struct ClientContext<'a> {
    pub(crate) multiplexer: &'a mut Multiplexer,
    pub(crate) channel: u8,
    pub(crate) transport: &'a mut dyn Transport,
}

impl ClientContext<'_> {
    /// The channel this context belongs to.
    #[must_use]
    pub const fn channel(&self) -> u8 {
        self.channel
    }

    /// Sends `data` back to the peer on this channel. See
    /// [`Multiplexer::send`](crate::Multiplexer::send) for framing and
    /// fragmentation behavior.
    ///
    /// # Errors
    ///
    /// Returns [`crate::MultiplexError::Send`] if `data` is empty, or
    /// [`crate::MultiplexError::Io`] if the transport rejects the write.
    pub fn send(&mut self, data: &[u8]) -> Result<(), crate::MultiplexError> {
        self.multiplexer.send(self.channel, data, self.transport)
    }

    /// Closes this channel, notifying the peer and detaching the client
    /// from its service.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the disconnect notification.
    pub fn close(&mut self) -> std::io::Result<()> {
        self.multiplexer.close_client(self.channel, self.transport)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Length,
    Payload(usize),
}

/// Reassembles the optional inner message-framing layer: a 4-hex-digit
/// length header followed by that many payload bytes, which may itself be
/// split across several transport records.
#[derive(Debug)]
struct FrameAssembler {
    state: FrameState,
    length_buf: [u8; 4],
    length_sink: Sink,
    payload_buf: Vec<u8>,
    payload_sink: Sink,
}

impl FrameAssembler {
    fn new() -> Self {
        let mut length_sink = Sink::new();
        length_sink.reset(4);
        Self {
            state: FrameState::Length,
            length_buf: [0u8; 4],
            length_sink,
            payload_buf: Vec::new(),
            payload_sink: Sink::new(),
        }
    }

    /// Feeds transport-record bytes in, appending every inner message this
    /// call completes to `out`.
    fn push(&mut self, mut src: &[u8], out: &mut Vec<Vec<u8>>) {
        while !src.is_empty() {
            match self.state {
                FrameState::Length => {
                    if self.length_sink.fill_from(&mut self.length_buf, &mut src) {
                        self.length_sink.reset(4);
                        match parse_hex4(&self.length_buf) {
                            Some(0) => {
                                // an empty frame is ignored outright, not delivered
                                // as a zero-byte message
                            }
                            Some(length) => {
                                self.payload_buf.clear();
                                self.payload_buf.resize(length, 0);
                                self.payload_sink.reset(length);
                                self.state = FrameState::Payload(length);
                            }
                            None => {
                                tracing::warn!("malformed inner frame length, resetting assembler");
                            }
                        }
                    }
                }
                FrameState::Payload(_) => {
                    if self.payload_sink.fill_from(&mut self.payload_buf, &mut src) {
                        self.state = FrameState::Length;
                        out.push(std::mem::take(&mut self.payload_buf));
                    }
                }
            }
        }
    }
}

fn hex_value(byte: u8) -> Option<u16> {
    match byte {
        b'0'..=b'9' => Some(u16::from(byte - b'0')),
        b'a'..=b'f' => Some(u16::from(byte - b'a' + 10)),
        b'A'..=b'F' => Some(u16::from(byte - b'A' + 10)),
        _ => None,
    }
}

fn parse_hex4(buf: &[u8; 4]) -> Option<usize> {
    let a = hex_value(buf[0])?;
    let b = hex_value(buf[1])?;
    let c = hex_value(buf[2])?;
    let d = hex_value(buf[3])?;
    Some(usize::from((a << 12) | (b << 8) | (c << 4) | d))
}

/// One end of a logical conversation bound to a transport channel.
pub struct Client {
    pub(crate) channel: u8,
    pub(crate) handler: Box<dyn ClientHandler>,
    pub(crate) framed: bool,
    assembler: Option<FrameAssembler>,
}

impl Client {
    pub(crate) fn new(channel: u8, handler: Box<dyn ClientHandler>, framed: bool) -> Self {
        Self {
            channel,
            handler,
            framed,
            assembler: framed.then(FrameAssembler::new),
        }
    }

    /// Whether this channel's payloads are reassembled through the inner
    /// message-framing layer before being delivered to the handler.
    #[must_use]
    pub const fn is_framed(&self) -> bool {
        self.framed
    }

    pub(crate) fn set_framed(&mut self, framed: bool) {
        self.framed = framed;
        self.assembler = framed.then(FrameAssembler::new);
    }

    /// Splits an inbound transport-record payload into zero or more complete
    /// inner messages, per this client's framing mode.
    pub(crate) fn extract_messages(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        match &mut self.assembler {
            Some(assembler) => {
                let mut out = Vec::new();
                assembler.push(payload, &mut out);
                out
            }
            None => vec![payload.to_vec()],
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("channel", &self.channel)
            .field("framed", &self.framed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_reassembles_frame_split_across_pushes() {
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        assembler.push(b"000", &mut out);
        assert!(out.is_empty());
        assembler.push(b"3abc", &mut out);
        assert_eq!(out, vec![b"abc".to_vec()]);
    }

    #[test]
    fn assembler_handles_back_to_back_frames() {
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        assembler.push(b"0002ab0002cd", &mut out);
        assert_eq!(out, vec![b"ab".to_vec(), b"cd".to_vec()]);
    }

    #[test]
    fn assembler_ignores_zero_length_frame_without_disturbing_next_frame() {
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        assembler.push(b"0000", &mut out);
        assert!(out.is_empty());
        assembler.push(b"0002ok", &mut out);
        assert_eq!(out, vec![b"ok".to_vec()]);
    }
}
