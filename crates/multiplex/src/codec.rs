//! Wire framing for the transport byte stream: a 6-byte ASCII-hex header
//! followed by its payload, fragmented to fit an MTU-sized record.
//!
//! # Wire format
//!
//! Every record on the wire starts with a 6-byte header made of two ASCII-hex
//! fields: a 2-digit channel id and a 4-digit payload length. Two
//! orientations exist:
//!
//! - [`Version::Normal`]: `channel(2) length(4)`
//! - [`Version::Legacy`]: `length(4) channel(2)`
//!
//! A peer speaking the legacy orientation is detected from the very first
//! inbound header (see [`SerialCodec::push`]), or from the control
//! protocol's own legacy-connect handshake; once detected, the codec locks
//! to that orientation for the rest of the connection via
//! [`SerialCodec::lock_version`].

use crate::sink::Sink;

/// Largest payload a single transport record can carry.
///
/// Payloads larger than this are split across consecutive records by
/// [`SerialCodec::encode_into`]; this is the value the original C service
/// advertised, carried through unchanged.
pub const MAX_SERIAL_PAYLOAD: usize = 4000;

/// Largest payload the optional inner message-framing layer can declare in
/// its 4-hex-digit length field.
///
/// This bound is wider than a single transport record (`MAX_SERIAL_PAYLOAD`)
/// can ever carry in one piece, so it is only ever reached by a message that
/// [`crate::Client`]'s framing state machine reassembles across several
/// records. It exists for parity with the upstream declaration rather than
/// because any call site multiplies against it.
pub const MAX_FRAME_PAYLOAD: usize = 65535;

const HEADER_SIZE: usize = 6;
const CHANNEL_DIGITS: usize = 2;
const LENGTH_DIGITS: usize = 4;

/// Which of the two 6-byte header orientations a peer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    /// No inbound header has been seen yet; [`SerialCodec`] resolves this to
    /// [`Version::Normal`] or [`Version::Legacy`] the moment one arrives.
    #[default]
    Unknown,
    /// `channel(2) length(4)` — the orientation used once a peer is
    /// confirmed not to be legacy.
    Normal,
    /// `length(4) channel(2)` — used by peers that predate the
    /// channel-first convention.
    Legacy,
}

impl Version {
    /// The concrete header orientation to use for encoding or decoding.
    /// [`Version::Unknown`] behaves as [`Version::Normal`] since nothing has
    /// yet proven otherwise.
    const fn orientation(self) -> Self {
        match self {
            Self::Legacy => Self::Legacy,
            Self::Unknown | Self::Normal => Self::Normal,
        }
    }
}

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        _ => b'a' + (nibble - 10),
    }
}

fn write_hex2(dest: &mut [u8], value: u8) {
    dest[0] = hex_digit(value >> 4);
    dest[1] = hex_digit(value & 0xf);
}

fn write_hex4(dest: &mut [u8], value: u16) {
    dest[0] = hex_digit(((value >> 12) & 0xf) as u8);
    dest[1] = hex_digit(((value >> 8) & 0xf) as u8);
    dest[2] = hex_digit(((value >> 4) & 0xf) as u8);
    dest[3] = hex_digit((value & 0xf) as u8);
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn read_hex2(src: &[u8]) -> Option<u8> {
    Some((hex_value(src[0])? << 4) | hex_value(src[1])?)
}

fn read_hex4(src: &[u8]) -> Option<u16> {
    let a = u16::from(hex_value(src[0])?);
    let b = u16::from(hex_value(src[1])?);
    let c = u16::from(hex_value(src[2])?);
    let d = u16::from(hex_value(src[3])?);
    Some((a << 12) | (b << 8) | (c << 4) | d)
}

/// A decoded transport header: which channel a record belongs to and how
/// many payload bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Target channel id.
    pub channel: u8,
    /// Payload byte count, at most [`MAX_SERIAL_PAYLOAD`].
    pub length: u16,
}

impl Header {
    fn encode(self, version: Version, dest: &mut [u8; HEADER_SIZE]) {
        match version.orientation() {
            Version::Legacy => {
                write_hex4(&mut dest[0..LENGTH_DIGITS], self.length);
                write_hex2(&mut dest[LENGTH_DIGITS..], self.channel);
            }
            _ => {
                write_hex2(&mut dest[0..CHANNEL_DIGITS], self.channel);
                write_hex4(&mut dest[CHANNEL_DIGITS..], self.length);
            }
        }
    }

    fn decode(version: Version, src: &[u8; HEADER_SIZE]) -> Option<Self> {
        match version.orientation() {
            Version::Legacy => Some(Self {
                length: read_hex4(&src[0..LENGTH_DIGITS])?,
                channel: read_hex2(&src[LENGTH_DIGITS..])?,
            }),
            _ => Some(Self {
                channel: read_hex2(&src[0..CHANNEL_DIGITS])?,
                length: read_hex4(&src[CHANNEL_DIGITS..])?,
            }),
        }
    }
}

/// A fully decoded inbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Channel the payload belongs to.
    pub channel: u8,
    /// Payload bytes, exactly as declared by the header's length field.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Header,
    Payload(Header),
    /// Discarding the remaining bytes of a payload the header declared
    /// larger than [`MAX_SERIAL_PAYLOAD`], to keep the byte stream in sync
    /// without ever buffering the oversize body.
    Overflow(usize),
}

/// The segments of the probe the codec emits once, at connection start, to
/// let a legacy peer reveal itself, in wire order.
///
/// Each `(header, body)` pair is written verbatim, with `body` a fixed byte
/// run rather than a real message. A legacy peer reads each six-byte header
/// as `length`-then-`channel` and therefore sees, in order: a 1-byte message
/// `"X"` on channel 0, three `connect:` probes on channel 0, then a
/// 194-byte garbage payload on channel 0x10. A normal peer instead reads the
/// first header as `channel=0, length=0x0100` and silently consumes the
/// remaining 250 bytes as one oversize body it discards. Either way the
/// probe is harmless to send; only the *reply* (or its absence) identifies
/// the peer, via [`SerialCodec::resolve_version`]'s check on the first
/// inbound header.
const LEGACY_PROBE_SEGMENTS: &[(&[u8], &[u8])] = &[
    (b"000100", b"X"),
    (b"000b00", b"connect:gsm"),
    (b"000b00", b"connect:gps"),
    (b"000f00", b"connect:control"),
    (b"00c210", &[0u8; 194]),
];

/// Decodes inbound bytes into `(channel, payload)` records and encodes
/// outbound records into MTU-sized frames.
///
/// Construct with [`SerialCodec::new`] and feed inbound bytes via
/// [`SerialCodec::push`], draining completed records with
/// [`SerialCodec::next_record`]. A fresh codec starts at [`Version::Unknown`]
/// and resolves to [`Version::Normal`] or [`Version::Legacy`] from the very
/// first inbound header, or earlier via [`SerialCodec::lock_version`] if the
/// control protocol reveals a legacy peer first.
#[derive(Debug)]
pub struct SerialCodec {
    version: Version,
    state: ReadState,
    header_buf: [u8; HEADER_SIZE],
    header_sink: Sink,
    payload_buf: Vec<u8>,
    payload_sink: Sink,
    completed: std::collections::VecDeque<Record>,
}

impl SerialCodec {
    /// Creates a codec in the default ([`Version::Normal`]) orientation.
    #[must_use]
    pub fn new() -> Self {
        let mut header_sink = Sink::new();
        header_sink.reset(HEADER_SIZE);
        Self {
            version: Version::Unknown,
            state: ReadState::Header,
            header_buf: [0u8; HEADER_SIZE],
            header_sink,
            payload_buf: Vec::new(),
            payload_sink: Sink::new(),
            completed: std::collections::VecDeque::new(),
        }
    }

    /// The orientation currently in effect. [`Version::Unknown`] until the
    /// first inbound header resolves it, or until [`SerialCodec::lock_version`]
    /// is called explicitly.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Locks the codec to `version`. Meant to be called once, when the
    /// control protocol itself reveals a legacy peer (see
    /// [`crate::control::ControlMessage::LegacyConnect`]); the common case
    /// of detecting a legacy peer from its header orientation happens
    /// automatically on the first inbound record.
    pub fn lock_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Feeds inbound bytes into the decoder. `src` may contain any number of
    /// whole or partial records; every record it completes is appended to an
    /// internal queue, drained with [`SerialCodec::next_record`].
    pub fn push(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            match self.state {
                ReadState::Overflow(remaining) => {
                    let skip = remaining.min(src.len());
                    src = &src[skip..];
                    self.state = if remaining == skip {
                        ReadState::Header
                    } else {
                        ReadState::Overflow(remaining - skip)
                    };
                }
                ReadState::Header => {
                    if self.header_sink.fill_from(&mut self.header_buf, &mut src) {
                        self.header_sink.reset(HEADER_SIZE);
                        if self.version == Version::Unknown {
                            self.resolve_version();
                        }
                        let Some(header) = Header::decode(self.version, &self.header_buf) else {
                            tracing::warn!("malformed transport header, resetting decoder");
                            continue;
                        };
                        self.begin_payload(header);
                    }
                }
                ReadState::Payload(header) => {
                    if self.payload_sink.fill_from(&mut self.payload_buf, &mut src) {
                        self.state = ReadState::Header;
                        self.completed.push_back(Record {
                            channel: header.channel,
                            payload: std::mem::take(&mut self.payload_buf),
                        });
                    }
                }
            }
        }
    }

    /// The peer's reply to the legacy probe, under legacy orientation, wraps
    /// `ko:unknown command` (12 bytes) in a channel-0 header; read under the
    /// legacy layout that header's six ASCII bytes are exactly `"001200"`.
    /// A normal peer never produces this sequence as its first header.
    fn resolve_version(&mut self) {
        if &self.header_buf == b"001200" {
            tracing::info!("legacy qemud peer detected via first header");
            self.version = Version::Legacy;
        } else {
            self.version = Version::Normal;
        }
    }

    fn begin_payload(&mut self, header: Header) {
        let length = header.length as usize;
        if length == 0 {
            tracing::warn!(channel = header.channel, "zero-length header, discarding");
            return;
        }
        if length > MAX_SERIAL_PAYLOAD {
            tracing::warn!(
                channel = header.channel,
                length,
                "oversize payload length in header, entering overflow-discard"
            );
            self.state = ReadState::Overflow(length);
            return;
        }
        self.payload_buf.clear();
        self.payload_buf.resize(length, 0);
        self.payload_sink.reset(length);
        self.state = ReadState::Payload(header);
    }

    /// Takes the next fully decoded record, if one has been completed by a
    /// prior [`SerialCodec::push`] call. A single `push` may complete several
    /// records; call this in a loop until it returns `None`.
    pub fn next_record(&mut self) -> Option<Record> {
        self.completed.pop_front()
    }

    /// Encodes `payload` addressed to `channel`, fragmenting it into
    /// [`MAX_SERIAL_PAYLOAD`]-sized records and writing each one to
    /// `transport` in order.
    pub fn encode_into(
        &self,
        channel: u8,
        mut payload: &[u8],
        transport: &mut impl crate::Transport,
    ) -> std::io::Result<()> {
        if payload.is_empty() {
            let header = Header { channel, length: 0 };
            let mut buf = [0u8; HEADER_SIZE];
            header.encode(self.version, &mut buf);
            return transport.write_all(&buf);
        }
        while !payload.is_empty() {
            let chunk_len = payload.len().min(MAX_SERIAL_PAYLOAD);
            let (chunk, rest) = payload.split_at(chunk_len);
            payload = rest;

            let header = Header {
                channel,
                length: chunk_len as u16,
            };
            let mut buf = [0u8; HEADER_SIZE];
            header.encode(self.version, &mut buf);
            transport.write_all(&buf)?;
            transport.write_all(chunk)?;
        }
        Ok(())
    }

    /// Encodes `message` addressed to `channel` with the inner
    /// message-framing layer prepended, then fragments the result the same
    /// way [`SerialCodec::encode_into`] does.
    ///
    /// The logical outgoing stream is the 4-hex-digit frame length followed
    /// by `message`; [`MAX_SERIAL_PAYLOAD`]-sized chunks are cut from that
    /// combined stream, so the frame header only ever lands in the first
    /// transport record and is charged against that record's own budget,
    /// matching the upstream fragmentation rule exactly.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SendError::FrameTooLarge`] if `message` is longer
    /// than [`MAX_FRAME_PAYLOAD`] bytes, since the 4-hex length field cannot
    /// represent anything larger.
    pub fn encode_framed_into(
        &self,
        channel: u8,
        message: &[u8],
        transport: &mut impl crate::Transport,
    ) -> Result<(), crate::MultiplexError> {
        if message.len() > MAX_FRAME_PAYLOAD {
            return Err(crate::SendError::FrameTooLarge {
                len: message.len(),
            }
            .into());
        }

        let mut logical = Vec::with_capacity(LENGTH_DIGITS + message.len());
        let mut frame_header = [0u8; LENGTH_DIGITS];
        write_hex4(&mut frame_header, message.len() as u16);
        logical.extend_from_slice(&frame_header);
        logical.extend_from_slice(message);

        self.encode_into(channel, &logical, transport)?;
        Ok(())
    }

    /// Writes the legacy-peer probe records to `transport`, in wire order.
    pub fn send_legacy_probe(transport: &mut impl crate::Transport) -> std::io::Result<()> {
        for (header, body) in LEGACY_PROBE_SEGMENTS {
            transport.write_all(header)?;
            transport.write_all(body)?;
        }
        Ok(())
    }

    /// How many bytes the transport may hand to the next [`SerialCodec::push`]
    /// call before the codec would need to buffer beyond its current sink.
    ///
    /// This mirrors the upstream `can_read()` query: it reports, in
    /// priority order, the overflow-discard remainder if nonzero, else the
    /// active sink's remaining capacity. A caller that respects this bound
    /// never forces the codec to grow the shared scratch buffer.
    #[must_use]
    pub fn can_read(&self) -> usize {
        match self.state {
            ReadState::Overflow(remaining) => remaining,
            ReadState::Header => self.header_sink.remaining(),
            ReadState::Payload(_) => self.payload_sink.remaining(),
        }
    }
}

impl Default for SerialCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_header_round_trips() {
        let header = Header {
            channel: 0x1a,
            length: 0x2bcd,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(Version::Normal, &mut buf);
        assert_eq!(&buf, b"1a2bcd");
        assert_eq!(Header::decode(Version::Normal, &buf), Some(header));
    }

    #[test]
    fn legacy_header_round_trips() {
        let header = Header {
            channel: 0x1a,
            length: 0x2bcd,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode(Version::Legacy, &mut buf);
        assert_eq!(&buf, b"2bcd1a");
        assert_eq!(Header::decode(Version::Legacy, &buf), Some(header));
    }

    #[test]
    fn decode_rejects_non_hex_bytes() {
        assert_eq!(Header::decode(Version::Normal, b"zz0004"), None);
    }

    #[test]
    fn push_then_drain_yields_one_record() {
        let mut codec = SerialCodec::new();
        codec.push(b"000005hello");
        let record = codec.next_record().expect("record ready");
        assert_eq!(record.channel, 0);
        assert_eq!(record.payload, b"hello");
    }

    #[test]
    fn push_handles_byte_at_a_time_delivery() {
        let mut codec = SerialCodec::new();
        for &byte in b"000003abc" {
            codec.push(&[byte]);
        }
        let record = codec.next_record().expect("record ready");
        assert_eq!(record.payload, b"abc");
    }

    #[test]
    fn push_decodes_back_to_back_records() {
        let mut codec = SerialCodec::new();
        codec.push(b"000002ab000002cd");
        let first = codec.next_record().expect("first record");
        assert_eq!(first.payload, b"ab");
        let second = codec.next_record().expect("second record");
        assert_eq!(second.payload, b"cd");
    }

    #[test]
    fn oversize_header_length_is_discarded() {
        let mut codec = SerialCodec::new();
        // declares a 4001-byte payload, one over MAX_SERIAL_PAYLOAD
        codec.push(b"000fa1");
        assert!(codec.next_record().is_none());
        assert_eq!(codec.can_read(), MAX_SERIAL_PAYLOAD + 1);

        // feed the garbage body in uneven chunks; none of it is mistaken
        // for a new header while overflow-discard is in progress
        let garbage = vec![b'g'; MAX_SERIAL_PAYLOAD + 1];
        codec.push(&garbage[..10]);
        assert!(codec.next_record().is_none());
        codec.push(&garbage[10..]);
        assert!(codec.next_record().is_none());

        codec.push(b"000001x");
        assert_eq!(codec.next_record().unwrap().payload, b"x");
    }

    #[test]
    fn boundary_max_serial_payload_succeeds_4001_overflows() {
        let mut codec = SerialCodec::new();
        let header_at_max = format!("00{MAX_SERIAL_PAYLOAD:04x}");
        codec.push(header_at_max.as_bytes());
        codec.push(&vec![b'a'; MAX_SERIAL_PAYLOAD]);
        let record = codec.next_record().expect("record at exactly the MTU");
        assert_eq!(record.payload.len(), MAX_SERIAL_PAYLOAD);

        let mut codec = SerialCodec::new();
        let header_over_max = format!("00{:04x}", MAX_SERIAL_PAYLOAD + 1);
        codec.push(header_over_max.as_bytes());
        assert!(codec.next_record().is_none());
        assert_eq!(codec.can_read(), MAX_SERIAL_PAYLOAD + 1);
    }

    #[test]
    fn legacy_probe_segments_are_emitted_in_order() {
        let mut out: Vec<u8> = Vec::new();
        SerialCodec::send_legacy_probe(&mut out).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(b"000100X");
        expected.extend_from_slice(b"000b00connect:gsm");
        expected.extend_from_slice(b"000b00connect:gps");
        expected.extend_from_slice(b"000f00connect:control");
        expected.extend_from_slice(b"00c210");
        expected.extend(std::iter::repeat(0u8).take(194));
        assert_eq!(out, expected);
    }

    #[test]
    fn zero_length_header_is_discarded() {
        let mut codec = SerialCodec::new();
        codec.push(b"000000");
        assert!(codec.next_record().is_none());
        codec.push(b"000001x");
        assert_eq!(codec.next_record().unwrap().payload, b"x");
    }

    #[test]
    fn fresh_codec_starts_with_unknown_version() {
        let codec = SerialCodec::new();
        assert_eq!(codec.version(), Version::Unknown);
    }

    #[test]
    fn first_header_resolves_to_normal_by_default() {
        let mut codec = SerialCodec::new();
        codec.push(b"000005hello");
        assert_eq!(codec.version(), Version::Normal);
    }

    #[test]
    fn magic_first_header_resolves_to_legacy() {
        let mut codec = SerialCodec::new();
        codec.push(b"001200");
        assert_eq!(codec.version(), Version::Legacy);
        // under legacy orientation "001200" reads as length=0x0012, channel=0x00
        codec.push(&[b'z'; 0x12]);
        let record = codec.next_record().expect("record ready");
        assert_eq!(record.channel, 0);
        assert_eq!(record.payload.len(), 0x12);
    }

    #[test]
    fn lock_version_overrides_detection_before_first_header() {
        let mut codec = SerialCodec::new();
        codec.lock_version(Version::Legacy);
        codec.push(b"00020cab");
        assert_eq!(codec.version(), Version::Legacy);
        let record = codec.next_record().expect("record ready");
        assert_eq!(record.channel, 0x0c);
        assert_eq!(record.payload, b"ab");
    }

    #[test]
    fn encode_into_fragments_oversize_payload() {
        let codec = SerialCodec::new();
        let payload = vec![b'x'; MAX_SERIAL_PAYLOAD + 1];
        let mut out: Vec<u8> = Vec::new();
        codec.encode_into(0x05, &payload, &mut out).unwrap();

        assert_eq!(&out[0..2], b"05");
        let first_len = read_hex4(&out[2..6]).unwrap() as usize;
        assert_eq!(first_len, MAX_SERIAL_PAYLOAD);

        let second_header_at = HEADER_SIZE + MAX_SERIAL_PAYLOAD;
        assert_eq!(&out[second_header_at..second_header_at + 2], b"05");
        let second_len = read_hex4(&out[second_header_at + 2..second_header_at + 6]).unwrap();
        assert_eq!(second_len, 1);
    }

    #[test]
    fn encode_into_empty_payload_sends_zero_length_header() {
        let codec = SerialCodec::new();
        let mut out: Vec<u8> = Vec::new();
        codec.encode_into(0x07, &[], &mut out).unwrap();
        assert_eq!(out, b"070000");
    }

    #[test]
    fn encode_framed_into_prepends_length_and_fragments_as_one_stream() {
        let codec = SerialCodec::new();
        let message = vec![b'm'; MAX_SERIAL_PAYLOAD]; // logical stream is 4 + MAX bytes
        let mut out: Vec<u8> = Vec::new();
        codec.encode_framed_into(0x02, &message, &mut out).unwrap();

        // first record carries the 4-hex frame header plus the first
        // MAX_SERIAL_PAYLOAD - 4 bytes of the message
        assert_eq!(&out[0..2], b"02");
        let first_len = read_hex4(&out[2..6]).unwrap() as usize;
        assert_eq!(first_len, MAX_SERIAL_PAYLOAD);
        assert_eq!(&out[HEADER_SIZE..HEADER_SIZE + 4], b"0fa0"); // message.len() == 4000 == 0x0fa0

        let second_header_at = HEADER_SIZE + MAX_SERIAL_PAYLOAD;
        assert_eq!(&out[second_header_at..second_header_at + 2], b"02");
        let second_len = read_hex4(&out[second_header_at + 2..second_header_at + 6]).unwrap();
        assert_eq!(second_len, 4);
    }

    #[test]
    fn encode_framed_into_rejects_oversize_message() {
        let codec = SerialCodec::new();
        let message = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let mut out: Vec<u8> = Vec::new();
        let err = codec.encode_framed_into(0x02, &message, &mut out).unwrap_err();
        assert!(matches!(
            err,
            crate::MultiplexError::Send(crate::SendError::FrameTooLarge { len }) if len == MAX_FRAME_PAYLOAD + 1
        ));
    }

    #[test]
    fn framed_round_trip_through_client_reassembly_survives_fragmentation() {
        use crate::client::Client;

        struct Noop;
        impl crate::ClientHandler for Noop {
            fn on_receive(&mut self, _ctx: &mut crate::ClientContext<'_>, _message: &[u8]) {}
        }
        let mut client = Client::new(0x01, Box::new(Noop), true);

        let codec = SerialCodec::new();
        let original = vec![b'z'; MAX_SERIAL_PAYLOAD * 3 + 17];
        let mut wire: Vec<u8> = Vec::new();
        codec.encode_framed_into(0x01, &original, &mut wire).unwrap();

        // decode the wire bytes back into records, as the multiplexer would,
        // then feed each record's payload through the client's reassembler
        let mut decoder = SerialCodec::new();
        decoder.push(&wire);
        let mut reassembled = Vec::new();
        while let Some(record) = decoder.next_record() {
            for message in client.extract_messages(&record.payload) {
                reassembled = message;
            }
        }
        assert_eq!(reassembled, original);
    }
}
