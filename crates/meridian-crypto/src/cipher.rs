//! Raw ChaCha20 stream cipher.
//!
//! The wire protocol does not use a combined AEAD construction: the body
//! is encrypted with a plain stream cipher and authenticated separately
//! with a keyed hash (see [`crate::mac`]) computed over the resulting
//! ciphertext. This module only provides the stream-cipher half.

use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher as _};

use crate::CryptoError;

/// Width of a ChaCha20 key.
pub const KEY_SIZE: usize = 32;

/// Width of the IETF ChaCha20 nonce.
pub const NONCE_SIZE: usize = 12;

/// A ChaCha20 stream cipher bound to one direction's key.
///
/// Encryption and decryption are the same XOR operation; the nonce is
/// derived from the packet's sequence number so that no two packets
/// encrypted under the same key ever reuse a keystream position.
pub struct StreamCipher {
    key: [u8; KEY_SIZE],
}

impl StreamCipher {
    /// Bind a stream cipher to `key`.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Build the per-packet nonce from a monotonic sequence number.
    ///
    /// The sequence number occupies the low 8 bytes; the high 4 bytes are
    /// zero. Since seqnr is strictly increasing for the lifetime of a
    /// connection, the (key, nonce) pair is never reused.
    fn nonce_for(seqnr: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..8].copy_from_slice(&seqnr.to_le_bytes());
        nonce
    }

    /// Apply the keystream for `seqnr` to `buf` in place. Symmetric:
    /// calling this twice with the same `seqnr` on ciphertext recovers
    /// the plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNonceLength`] only in the impossible
    /// case a future change alters [`NONCE_SIZE`] away from 12 bytes.
    pub fn apply(&self, seqnr: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        let nonce = Self::nonce_for(seqnr);
        let mut cipher = ChaCha20::new(&self.key.into(), &nonce.into());
        cipher.apply_keystream(buf);
        Ok(())
    }
}

impl Drop for StreamCipher {
    fn drop(&mut self) {
        self.key.iter_mut().for_each(|b| *b = 0);
    }
}
