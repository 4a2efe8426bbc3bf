//! Key schedule for the two-round ephemeral-then-real handshake.
//!
//! Round 1 authenticates an ephemeral key exchange (the shared secret is
//! mixed with an 8-byte nonce carried in the first client HELLO's outer
//! header); round 2 re-keys from a second, "real" key exchange, chained
//! off round 1's output so that compromising a single round's keys alone
//! does not recover the other round's traffic.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::Kdf;

/// Which end of the connection a [`HandshakeKeys`] value was derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connection initiator.
    Client,
    /// The connection acceptor.
    Server,
}

/// The three keys produced by one handshake round: a MAC key shared by
/// both directions, and one stream-cipher key per direction.
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct HandshakeKeys {
    mac_key: [u8; 32],
    client_key: [u8; 32],
    server_key: [u8; 32],
}

impl HandshakeKeys {
    /// Derive round-1 keys from the ephemeral shared secret and the
    /// 8-byte nonce carried alongside the half-length MAC of the first
    /// client HELLO.
    #[must_use]
    pub fn derive_round1(shared_secret: &[u8; 32], nonce: [u8; 8]) -> Self {
        let mut ikm = [0u8; 40];
        ikm[..32].copy_from_slice(shared_secret);
        ikm[32..].copy_from_slice(&nonce);
        Self::derive("meridian-handshake-round1", &ikm)
    }

    /// Derive round-2 ("real") keys from the second key exchange's shared
    /// secret, chained off the round-1 MAC key so the two rounds are
    /// cryptographically bound together.
    #[must_use]
    pub fn derive_round2(shared_secret: &[u8; 32], round1: &HandshakeKeys) -> Self {
        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(shared_secret);
        ikm[32..].copy_from_slice(&round1.mac_key);
        Self::derive("meridian-handshake-round2", &ikm)
    }

    /// Derive the key schedule for the very first client→server packet,
    /// from the pre-shared secret alone (no key exchange has happened
    /// yet). Deterministic given the same PSK, by design: both ends must
    /// be able to compute it before any per-connection randomness has
    /// been exchanged. The nonce carried inside that first packet's body
    /// is only mixed into [`Self::derive_round1`] afterwards, once the
    /// ephemeral exchange's shared secret is available.
    #[must_use]
    pub fn derive_greeting(psk: &[u8]) -> Self {
        Self::derive("meridian-greeting", psk)
    }

    fn derive(context: &'static str, ikm: &[u8]) -> Self {
        let kdf = Kdf::new(context);
        let mut out = [0u8; 96];
        kdf.derive(ikm, &mut out);

        let mut mac_key = [0u8; 32];
        let mut client_key = [0u8; 32];
        let mut server_key = [0u8; 32];
        mac_key.copy_from_slice(&out[0..32]);
        client_key.copy_from_slice(&out[32..64]);
        server_key.copy_from_slice(&out[64..96]);

        Self {
            mac_key,
            client_key,
            server_key,
        }
    }

    /// The MAC key shared by both directions.
    #[must_use]
    pub fn mac_key(&self) -> [u8; 32] {
        self.mac_key
    }

    /// The key used to encrypt outbound packets when acting as `role`.
    ///
    /// The client encrypts with its own key and decrypts with the
    /// server's; the server does the reverse.
    #[must_use]
    pub fn encrypt_key(&self, role: Role) -> [u8; 32] {
        match role {
            Role::Client => self.client_key,
            Role::Server => self.server_key,
        }
    }

    /// The key used to decrypt inbound packets when acting as `role`.
    #[must_use]
    pub fn decrypt_key(&self, role: Role) -> [u8; 32] {
        match role {
            Role::Client => self.server_key,
            Role::Server => self.client_key,
        }
    }
}
