//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Symmetric encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Symmetric decryption or MAC verification failed.
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Invalid nonce length.
    #[error("invalid nonce length")]
    InvalidNonceLength,

    /// Handshake protocol error.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Random number generation failed.
    #[error("random number generation failed")]
    RandomFailed,

    /// Sequence-number space exhausted; connection needs a rekey.
    #[error("sequence number counter exhausted, rekey required")]
    NonceOverflow,

    /// Ed25519 signature was malformed or did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Ed25519 public key bytes did not decode to a valid curve point.
    #[error("invalid public key")]
    InvalidPublicKey,
}
