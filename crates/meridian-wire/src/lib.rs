//! Wire-level framing for the Meridian protocol.
//!
//! This crate has no notion of a connection, a key, or a transport; it
//! only knows how to turn bytes into (and out of) the fixed shapes the
//! protocol defines: the outer `MAC || seqnr || type || body` header, the
//! per-substream `chid || streamid || len` header, and the fixed-size
//! CONTROL record and its command payloads. Encryption, sequencing, and
//! channel bookkeeping live one layer up in `meridian-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod control;
pub mod error;
pub mod frame;
pub mod packer;

pub use control::{ControlCommand, ControlRecord};
pub use error::WireError;
pub use frame::{OuterHeader, PacketType, StreamHeader};
