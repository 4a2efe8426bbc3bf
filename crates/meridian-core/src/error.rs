//! Error taxonomy for the connection state machine.
//!
//! Errors are grouped by blast radius, mirroring how the caller must
//! react to them:
//!
//! - [`Error::Fatal`] — the connection is unusable; the caller must tear
//!   it down. The state machine transitions to `Broken` and every
//!   subsequent call fails the same way.
//! - [`Error::Stream`] — only one substream is affected. The state
//!   machine emits a CANCELSTREAM for it and keeps running.
//! - [`Error::Recoverable`] — the caller should retry the same call
//!   later (e.g. the transport would block, or a callback asked to defer).
//! - [`Error::PeerReportable`] — the peer did something the decoder
//!   couldn't honor (e.g. an unsupported codec); the local encoder should
//!   downgrade and the peer should be told via a DECODE_ERROR control
//!   reply.

use thiserror::Error;

use meridian_wire::WireError;

/// Top-level connection error.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-ending error; the connection must be discarded.
    #[error("fatal connection error: {0}")]
    Fatal(#[from] FatalError),

    /// Error scoped to a single substream; the connection survives.
    #[error("stream error on channel {channel}/{stream_id}: {source}")]
    Stream {
        /// Channel the failing substream belongs to.
        channel: u8,
        /// Id of the failing substream.
        stream_id: u32,
        /// Underlying cause.
        #[source]
        source: StreamError,
    },

    /// Transient condition; retry the call once more data/capacity is available.
    #[error("recoverable: {0}")]
    Recoverable(#[from] RecoverableError),

    /// The peer sent something valid-but-unsupported; report it, don't tear down.
    #[error("peer-reportable: {0}")]
    PeerReportable(#[from] PeerReportableError),
}

/// Errors that make the whole connection unusable.
#[derive(Debug, Error)]
pub enum FatalError {
    /// Outer header failed to parse.
    #[error("wire framing error: {0}")]
    Wire(#[from] WireError),

    /// MAC verification failed on an inbound packet.
    #[error("MAC verification failed at seqnr {seqnr}")]
    AuthenticationFailed {
        /// Sequence number of the offending packet.
        seqnr: u64,
    },

    /// Inbound sequence numbers were not monotonically increasing.
    #[error("sequence number went backwards: expected > {expected}, got {got}")]
    SequenceRegression {
        /// Smallest acceptable next sequence number.
        expected: u64,
        /// Sequence number actually received.
        got: u64,
    },

    /// Handshake failed (key exchange, role mismatch, or malformed HELLO).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Cryptographic primitive failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] meridian_crypto::CryptoError),

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid connection state for this operation")]
    InvalidState,

    /// The connection was already marked broken by an earlier fatal error.
    #[error("connection is broken")]
    AlreadyBroken,
}

/// Errors scoped to a single substream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A binary transfer's bhandler oracle rejected it outright.
    #[error("transfer rejected by application")]
    Rejected,

    /// Declared size and actually received byte count disagree.
    #[error("size mismatch: declared {declared}, received {received}")]
    SizeMismatch {
        /// Size announced in the BINARYSTREAM control record.
        declared: u64,
        /// Bytes actually accumulated before the mismatch was detected.
        received: u64,
    },

    /// A video dirty-rectangle fell outside the channel's display bounds.
    #[error("dirty rectangle out of bounds: region ({x},{y},{w},{h}) vs surface {sw}x{sh}")]
    RegionOutOfBounds {
        /// Region left offset.
        x: u16,
        /// Region top offset.
        y: u16,
        /// Region width.
        w: u16,
        /// Region height.
        h: u16,
        /// Surface width.
        sw: u16,
        /// Surface height.
        sh: u16,
    },

    /// The codec reported it could not decode the data it was given.
    #[error("codec decode error: {0}")]
    DecodeError(String),

    /// A channel id did not name a live channel.
    #[error("unknown channel")]
    UnknownChannel,

    /// A stream id did not name a live substream on its channel.
    #[error("unknown stream")]
    UnknownStream,
}

/// Transient conditions the caller should retry.
#[derive(Debug, Error)]
pub enum RecoverableError {
    /// The transport would block; call again once more bytes are available.
    #[error("would block")]
    WouldBlock,

    /// The call was interrupted before completing; retry it.
    #[error("interrupted")]
    Interrupted,

    /// The application's bhandler asked to defer this decision.
    #[error("application asked to defer")]
    DontWant,

    /// The application's bhandler reported the data is already cached.
    #[error("data already cached by application")]
    Cached,
}

/// Errors the peer should be told about but that do not break the connection.
#[derive(Debug, Error)]
pub enum PeerReportableError {
    /// The peer requested a codec path this build does not support.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A multipart MESSAGE sequence overflowed its maximum assembled size.
    #[error("message assembly overflow")]
    MessageOverflow,

    /// A multipart MESSAGE sequence was abandoned without a terminal part.
    #[error("message sequence not terminated")]
    MessageNotTerminated,
}
