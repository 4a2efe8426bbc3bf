//! # Meridian Crypto
//!
//! Cryptographic primitives for the Meridian protocol.
//!
//! This crate provides:
//! - X25519 key exchange with low-order-point rejection
//! - A two-round ephemeral-then-real handshake key schedule
//! - A raw ChaCha20 stream cipher and a separate keyed-hash MAC
//!   (encrypt-then-MAC, not a combined AEAD construction)
//! - BLAKE3 hashing, tree hashing, and HKDF-style key derivation
//! - Ed25519 signatures (appl package signing)
//!
//! Key-at-rest storage and forward-secrecy ratcheting are out of scope
//! for this crate; see the workspace design ledger for why.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | Packet Cipher | ChaCha20 (stream, not AEAD) | 256-bit key |
//! | Packet Authentication | Keyed BLAKE3 | 128-bit (truncated tag) |
//! | Hash / KDF | BLAKE3 / HKDF-BLAKE3 | 128-bit collision |
//! | Signatures | Ed25519 | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cipher;
pub mod constant_time;
pub mod error;
pub mod handshake;
pub mod hash;
pub mod mac;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;
pub use handshake::{HandshakeKeys, Role};

/// X25519 public key size.
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size.
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// ChaCha20 key size.
pub const CIPHER_KEY_SIZE: usize = 32;

/// BLAKE3 output size.
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size.
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size.
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const ED25519_SIGNATURE_SIZE: usize = 64;
