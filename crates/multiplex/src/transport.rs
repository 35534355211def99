//! The transport seam: everything this crate needs from the byte-oriented
//! pipe underneath it, plus a minimal in-memory implementation.
//!
//! The real character pipe (an emulated serial link) is an external
//! collaborator — this module only specifies the interface
//! [`SerialCodec`](crate::SerialCodec) needs from it, and ships
//! [`Pipe`]/[`PipeEnd`] as a back-to-back in-memory implementation usable
//! both to wire a client directly to an external byte channel and as test
//! scaffolding.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

/// Everything [`crate::SerialCodec`] needs to push bytes out.
///
/// Reading is not part of this trait: the multiplexer is sans-IO on the
/// inbound side too — whatever owns the event loop calls
/// [`crate::Multiplexer::feed`] with bytes it already read, rather than the
/// multiplexer pulling them itself.
pub trait Transport {
    /// Synchronously pushes `bytes` out. Returns once the transport has
    /// accepted them; the codec never batches or delays sends.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl Transport for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Shared byte queue backing one direction of a [`Pipe`].
type Queue = Rc<RefCell<VecDeque<u8>>>;

/// One endpoint of an in-memory, back-to-back character pipe.
///
/// Two `PipeEnd`s created by [`Pipe::pair`] are connected such that bytes
/// written to one are readable from the other, matching the external
/// `open_pipe() -> (a, b)` collaborator. Because the multiplexer's
/// concurrency model is single-threaded and cooperative, the shared queues
/// use `Rc<RefCell<_>>` rather than thread-safe primitives — there is never
/// more than one logical thread of control touching either end.
#[derive(Debug, Clone)]
pub struct PipeEnd {
    outbox: Queue,
    inbox: Queue,
}

impl PipeEnd {
    /// Bytes currently buffered and available to read from this end.
    #[must_use]
    pub fn readable(&self) -> usize {
        self.inbox.borrow().len()
    }

    /// Drains up to `max` buffered bytes into a freshly allocated `Vec`.
    #[must_use]
    pub fn read(&self, max: usize) -> Vec<u8> {
        let mut inbox = self.inbox.borrow_mut();
        let take = max.min(inbox.len());
        inbox.drain(..take).collect()
    }
}

impl Transport for PipeEnd {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.outbox.borrow_mut().extend(bytes.iter().copied());
        Ok(())
    }
}

/// A back-to-back in-memory character pipe: the emulated-serial-link stand-in.
pub struct Pipe;

impl Pipe {
    /// Creates two connected endpoints; bytes written to one are readable
    /// from the other and vice versa.
    #[must_use]
    pub fn pair() -> (PipeEnd, PipeEnd) {
        let a_to_b = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a = Rc::new(RefCell::new(VecDeque::new()));

        let a = PipeEnd {
            outbox: Rc::clone(&a_to_b),
            inbox: Rc::clone(&b_to_a),
        };
        let b = PipeEnd {
            outbox: b_to_a,
            inbox: a_to_b,
        };
        (a, b)
    }
}
