//! The channel-0 control protocol: connect requests, disconnect
//! notifications, and the legacy-peer `ok:connect:` downgrade path.
//!
//! Channel 0 is never handed to a registered service; the multiplexer
//! terminates it internally and interprets every message received on it as
//! one of the commands below.

/// One parsed control-channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlMessage<'a> {
    /// `connect:<service-name>:<channel>` — a new-style connect request.
    Connect { service: &'a str, channel: u8 },
    /// `disconnect:<channel>` — the peer closed a channel from its side.
    Disconnect { channel: u8 },
    /// `ok:connect:<service>:<channel>` — a legacy peer's unsolicited
    /// connect, which must not be acknowledged.
    LegacyConnect { service: &'a str, channel: u8 },
}

fn hex2(src: &[u8]) -> Option<u8> {
    if src.len() != 2 {
        return None;
    }
    let hi = (src[0] as char).to_digit(16)?;
    let lo = (src[1] as char).to_digit(16)?;
    Some(((hi << 4) | lo) as u8)
}

/// Splits `prefix<name>:<channel-hex>` into `(name, channel)`, requiring the
/// trailing field to be exactly two hex digits and the channel to be
/// nonzero, matching the upstream parser's rejection of channel 0.
fn split_name_and_channel(body: &str) -> Option<(&str, u8)> {
    let colon = body.rfind(':')?;
    let (name, rest) = (&body[..colon], &body[colon + 1..]);
    if rest.len() != 2 {
        return None;
    }
    let channel = hex2(rest.as_bytes())?;
    if channel == 0 {
        return None;
    }
    Some((name, channel))
}

/// Parses one control-channel message.
///
/// `msg` must be valid UTF-8; a control peer speaking this protocol only
/// ever sends ASCII, so invalid UTF-8 is treated as an unrecognized
/// message.
pub(crate) fn parse(msg: &[u8]) -> Option<ControlMessage<'_>> {
    let text = std::str::from_utf8(msg).ok()?;

    if let Some(body) = text.strip_prefix("connect:") {
        let (service, channel) = split_name_and_channel(body)?;
        return Some(ControlMessage::Connect { service, channel });
    }

    if msg.len() == 13 {
        if let Some(id) = text.strip_prefix("disconnect:") {
            let channel = hex2(id.as_bytes())?;
            if channel == 0 {
                return None;
            }
            return Some(ControlMessage::Disconnect { channel });
        }
    }

    if let Some(body) = text.strip_prefix("ok:connect:") {
        let (service, channel) = split_name_and_channel(body)?;
        // "hw-control" was renamed from "control" after the 1.1 release;
        // a legacy peer still uses the old name.
        let service = if service == "control" { "hw-control" } else { service };
        return Some(ControlMessage::LegacyConnect { service, channel });
    }

    None
}

/// Whether `msg` has the shape of one of the known command prefixes
/// (`connect:`, `disconnect:`, `ok:connect:`) even though [`parse`] failed
/// to make sense of it — a bad channel digit, a missing or surplus
/// trailing byte, channel 0.
///
/// The original silently drops these (hw-qemud.c:916-927 for a malformed
/// `connect:`, hw-qemud.c:955-959 for a malformed `disconnect:`) rather
/// than replying `ko:unknown command`; that reply is reserved for text
/// that does not even resemble a known command.
pub(crate) fn looks_like_known_command(msg: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(msg) else {
        return false;
    };
    text.starts_with("connect:") || text.starts_with("disconnect:") || text.starts_with("ok:connect:")
}

/// Formats the success reply to a `connect:` request: `ok:connect:<channel>`.
pub(crate) fn format_connect_ok(channel: u8) -> String {
    format!("ok:connect:{channel:02x}")
}

/// Formats the failure reply to a `connect:` request naming why it failed.
pub(crate) fn format_connect_failure(channel: u8, reason: ConnectFailure) -> String {
    match reason {
        ConnectFailure::UnknownService => format!("ko:connect:{channel:02x}:unknown service"),
        ConnectFailure::ServiceBusy => format!("ko:connect:{channel:02x}:service busy"),
    }
}

/// Why a `connect:` request could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectFailure {
    /// No service is registered under the requested name.
    UnknownService,
    /// The service exists but has reached its concurrent-client cap.
    ServiceBusy,
}

/// Formats the notification sent when the multiplexer closes a channel
/// locally: `disconnect:<channel>`.
pub(crate) fn format_disconnect(channel: u8) -> String {
    format!("disconnect:{channel:02x}")
}

/// Reply sent on the control channel for any message that fails to parse
/// as one of the known commands, unless the peer is already known to be
/// [`crate::Version::Legacy`] (which never gets this reply, since a legacy
/// peer never expects one).
pub(crate) const UNKNOWN_COMMAND: &str = "ko:unknown command";
