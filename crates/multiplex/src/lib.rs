//! # Overview
//!
//! `multiplex` implements the host-side half of a framed channel multiplexer
//! that talks to a guest process over a single byte-oriented transport (a
//! character pipe standing in for an emulated serial link). Multiple named
//! host [`Service`]s are exposed to multiple guest clients; each
//! client/service conversation is identified by a small channel id, and all
//! conversations share one full-duplex byte stream.
//!
//! # Design
//!
//! The crate is layered leaves-first:
//!
//! - [`Sink`] is a one-shot fixed-capacity accumulator used to assemble a
//!   header or payload out of an arbitrary chunked byte stream.
//! - [`SerialCodec`] owns the transport endpoint. It decodes inbound bytes
//!   into `(channel, payload)` records and encodes outbound records into
//!   MTU-sized frames, transparently probing for a legacy peer on first
//!   contact.
//! - [`Client`] represents one end of a logical conversation, optionally
//!   performing an additional inner message-framing step over the transport
//!   payload.
//! - [`Service`] is a named registry entry with a connect callback and a
//!   concurrent-client cap.
//! - [`Multiplexer`] is the root: it owns the codec, the channel-indexed
//!   client table, the service registry, and the built-in control client
//!   bound to channel 0.
//!
//! [`Transport`] is the only seam to the outside world: every call that can
//! produce outbound bytes takes one explicitly rather than the multiplexer
//! owning a connection of its own, so whatever event loop owns the real
//! transport drives [`Multiplexer::feed`] on inbound bytes and passes the
//! same transport back in for replies. [`transport::Pipe`] is a minimal
//! in-memory implementation usable both to bridge a service to an external
//! byte channel and as test scaffolding.
//!
//! [`Multiplexer::get_channel`] and [`Multiplexer::bind_channel`] build on
//! that pipe to register a single-client service whose traffic is forwarded
//! verbatim onto a caller-supplied endpoint, for callers that just want a
//! raw byte channel rather than a full [`ClientHandler`]. Per-channel inner
//! message framing is controlled with [`Multiplexer::set_framing`] and
//! inspected with [`Multiplexer::is_framed`].
//!
//! # Invariants
//!
//! - Exactly one of "waiting for a header" / "waiting for a payload" holds
//!   between records.
//! - Channel 0 is reserved for the control client and is never removed from
//!   the multiplexer's client table.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bridge;
mod client;
mod codec;
mod control;
mod error;
mod multiplexer;
mod service;
mod sink;
pub mod transport;

pub use client::{Client, ClientContext, ClientHandler};
pub use codec::{MAX_FRAME_PAYLOAD, MAX_SERIAL_PAYLOAD, SerialCodec, Version};
pub use error::{MultiplexError, SendError};
pub use multiplexer::{ConnectContext, Multiplexer, ServiceId};
pub use service::{Service, ServiceHandler};
pub use sink::Sink;
pub use transport::Transport;
