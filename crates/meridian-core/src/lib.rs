//! # Meridian Core
//!
//! The per-connection protocol state machine for Meridian: the
//! authenticated, encrypted, multi-channel framing layer that tunnels a
//! display-server session (windows, input, audio, video, and binary
//! transfers) over an arbitrary byte-oriented transport.
//!
//! This crate owns:
//! - [`session::Connection`]: the connection state machine (role,
//!   handshake phase, directional keys, sequence numbers, double-buffered
//!   outbound arena, inbound decoder, channel table, congestion ring).
//! - [`inbound`]: the tagged-state inbound decoder (NoPacket/Control/
//!   Event/Video/Audio/Blob/FirstServer/Broken) that authenticates and
//!   decrypts packets as their bytes arrive.
//! - [`outbound`]: the single chokepoint for framing, encrypting, and
//!   MAC-tagging outbound packets.
//! - [`handshake`]: the two-round ephemeral-then-real X25519 key
//!   exchange orchestration.
//! - [`channel`]: per-channel video/audio/binary/message substream
//!   assembly state, addressed by a fixed 256-entry table.
//! - [`congestion`]: the fixed-size ring of in-flight video stream ids
//!   used for backpressure accounting.
//! - [`error`]: the error taxonomy (fatal / stream / recoverable /
//!   peer-reportable) that mirrors how a caller must react to a failure.
//! - [`video`]: the codec facade between a video substream's wire body
//!   (raw, zstd delta, zstd terminal-cell pack, or externally-decoded
//!   H.264) and a flat pixel buffer.
//! - [`collaborators`]: capability traits (`SinkCallback`, `BinaryHandler`,
//!   `EventSink`, `DiscoveryHandler`, `DirectoryOpenHandler`,
//!   `AuthCompleteHandler`) a caller installs to receive the same
//!   information `poll`/`flush` surface as push-style callbacks instead.
//!   [`handshake::AuthResolver`] is the seventh named collaborator.
//!
//! Binary-transfer scheduling lives in `meridian-files`; appl-directory
//! snapshot management and dynamic-resource mediation live in
//! `meridian-directory`. Both build on the [`session::ConnectionEvent`]s
//! this crate emits and the outbound control records it accepts.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod collaborators;
pub mod congestion;
pub mod error;
pub mod handshake;
pub mod inbound;
pub mod outbound;
pub mod session;
pub mod video;

pub use channel::{Channel, ChannelTable, MAX_CHANNELS};
pub use congestion::CongestionRing;
pub use error::{Error, FatalError, PeerReportableError, RecoverableError, StreamError};
pub use session::{Connection, ConnectionEvent, CONTROL_CHANNEL};
