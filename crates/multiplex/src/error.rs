//! Error types returned by the fallible corners of the public API.
//!
//! Most error handling in this crate is "log locally and keep the stream
//! in sync" (malformed headers, oversize payloads, unknown channels)
//! rather than anything a caller can act on; those paths emit a
//! [`tracing`] event and return normally. The handful of calls that *can*
//! report a caller-actionable outcome use [`MultiplexError`].

/// Error returned by [`crate::Multiplexer::send`] and
/// [`crate::Multiplexer::broadcast`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum SendError {
    /// The caller passed an empty message. The wire protocol has no
    /// representation for a zero-length transport record, so upstream
    /// `qemud_serial_send` silently drops these; this crate reports the
    /// condition instead of swallowing it.
    #[error("cannot send an empty message")]
    EmptyMessage,

    /// The caller tried to send a framed message longer than
    /// [`crate::MAX_FRAME_PAYLOAD`], which cannot be represented in the
    /// inner frame's 4-hex-digit length field.
    #[error("framed message of {len} bytes exceeds the {} byte frame length limit", crate::MAX_FRAME_PAYLOAD)]
    FrameTooLarge {
        /// The message length the caller attempted to send.
        len: usize,
    },
}

/// Top-level error type for fallible [`crate::Multiplexer`] operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MultiplexError {
    /// See [`SendError`].
    #[error(transparent)]
    Send(#[from] SendError),

    /// The transport rejected a write. Since the transport is the shared
    /// byte stream every channel multiplexes over, an I/O failure here is
    /// not scoped to one channel; the caller should treat the whole
    /// connection as broken.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}
