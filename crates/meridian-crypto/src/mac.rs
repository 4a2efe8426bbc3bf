//! Keyed-hash message authentication, used in an encrypt-then-MAC
//! construction over the already-encrypted packet body.

use crate::CryptoError;

/// Full-width MAC tag, written into the outer header after the first
/// handshake round.
pub const TAG_SIZE_FULL: usize = 16;

/// Half-width MAC tag used only on the very first client HELLO, where
/// the remaining header bytes instead carry the handshake nonce.
pub const TAG_SIZE_HALF: usize = 8;

/// A keyed BLAKE3 MAC bound to one direction's key.
pub struct Mac {
    key: [u8; 32],
}

impl Mac {
    /// Bind a MAC instance to `key`.
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Compute the full 32-byte keyed hash over `data`.
    fn keyed_hash(&self, data: &[u8]) -> [u8; 32] {
        *blake3::keyed_hash(&self.key, data).as_bytes()
    }

    /// Compute a tag truncated to `tag_len` bytes (16 normally, 8 for the
    /// first client HELLO).
    #[must_use]
    pub fn tag(&self, data: &[u8], tag_len: usize) -> Vec<u8> {
        self.keyed_hash(data)[..tag_len].to_vec()
    }

    /// Verify `tag` against the keyed hash of `data`, in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the tag does not match.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
        let expected = self.keyed_hash(data);
        if crate::constant_time::ct_eq(&expected[..tag.len()], tag) {
            Ok(())
        } else {
            Err(CryptoError::DecryptionFailed)
        }
    }
}

impl Drop for Mac {
    fn drop(&mut self) {
        self.key.iter_mut().for_each(|b| *b = 0);
    }
}
