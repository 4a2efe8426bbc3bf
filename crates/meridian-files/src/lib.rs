//! # Meridian Files
//!
//! Binary-transfer support for Meridian: the blob-out scheduler that
//! drains queued binary transfers onto a [`meridian_core::Connection`]'s
//! outbound arena, and the checksum helpers used to validate chunks and
//! whole files.
//!
//! This crate owns:
//! - [`scheduler`]: the `S.pending` blob-out node queue and its
//!   `append_blob` flush path (rampup-then-MTU chunking, drain modes,
//!   the "hold until peer-acked seqnr" gate, and cancel-on-read-error).
//! - [`hasher`]: BLAKE3 chunk and whole-file checksums, matching the
//!   16-byte truncated digest `BINARYSTREAM`/`CANCELSTREAM` carry and the
//!   32-byte digest the appl package format uses.
//!
//! `meridian-files` does not own substream *assembly* on the receive
//! side — that is [`meridian_core::channel::BlobAssembly`]'s job. This
//! crate is the sending half: turning an enqueued source into framed
//! chunks on the wire.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hasher;
pub mod scheduler;
