//! Wire-level parsing errors.

use thiserror::Error;

/// Errors produced while parsing or building wire frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the minimum size for this structure.
    #[error("buffer too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum required length.
        expected: usize,
        /// Actual length supplied.
        actual: usize,
    },

    /// The packet type byte did not match any known [`crate::frame::PacketType`].
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// A length field claimed more bytes than the buffer actually holds.
    #[error("declared length {declared} exceeds available {available} bytes")]
    LengthOverflow {
        /// Length claimed by the header.
        declared: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A channel id outside the valid 0..=255 range was referenced structurally
    /// (reserved for future width changes; channel ids are `u8` today).
    #[error("invalid channel id")]
    InvalidChannel,
}
