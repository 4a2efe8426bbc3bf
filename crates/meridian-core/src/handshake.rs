//! Two-round ephemeral-then-real X25519 handshake orchestration.
//!
//! Round 1 exchanges ephemeral public keys and derives a transitional key
//! schedule (mac/client/server keys) used only to authenticate round 2.
//! Round 2 exchanges the parties' real, durable public keys and derives the
//! key schedule the connection actually runs on. Client and server each
//! decrypt with the other's directional key, never their own.

use meridian_crypto::handshake::{HandshakeKeys, Role as KeyRole};
use meridian_crypto::x25519::{PrivateKey, PublicKey};
use meridian_wire::control::Role as ConnRole;
use rand_core::OsRng;

use crate::error::FatalError;

/// Which side of the handshake this connection is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Initiates the connection and sends the first HELLO.
    Client,
    /// Accepts the connection and answers the first HELLO.
    Server,
}

impl Side {
    /// The directional key-schedule role this side plays.
    #[must_use]
    pub fn role(self) -> KeyRole {
        match self {
            Side::Client => KeyRole::Client,
            Side::Server => KeyRole::Server,
        }
    }
}

/// Options gating which connection-role pairings are allowed to complete
/// a handshake.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeOptions {
    /// Whether a directory is allowed to peer with another directory.
    /// Every other role pairing the wire names (source↔sink, directory↔
    /// anything but directory, `*`↔probe) is always permitted.
    pub allow_directory_peer: bool,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            allow_directory_peer: false,
        }
    }
}

/// Whether `local` and `peer` may complete a handshake together.
///
/// Source↔sink and directory↔anything-but-directory always succeed.
/// Directory↔directory is gated by [`HandshakeOptions::allow_directory_peer`].
/// A probe on either side is always accepted (the application is expected
/// to close the connection right after authentication). Any other
/// pairing (source↔source, source↔probe's complement already covered,
/// sink↔sink, etc.) is incompatible.
#[must_use]
pub fn roles_compatible(local: ConnRole, peer: ConnRole, options: HandshakeOptions) -> bool {
    use ConnRole::{Directory, Probe, Sink, Source};

    if local == Probe || peer == Probe {
        return true;
    }
    match (local, peer) {
        (Source, Sink) | (Sink, Source) => true,
        (Directory, Directory) => options.allow_directory_peer,
        (Directory, _) | (_, Directory) => true,
        _ => false,
    }
}

/// Looks up a remote identity's session key material, standing in for an
/// out-of-band PSK table, a static-X25519 pinning store, or any other
/// accept/reject-plus-key-schedule authority the embedding application
/// maintains.
///
/// Used only by the single-round handshake flow, where there is no
/// ephemeral exchange to derive a key schedule from — the resolver
/// supplies one directly.
pub trait AuthResolver {
    /// Resolve `remote_identity`'s session key schedule, or `None` to
    /// reject the peer outright.
    fn resolve(&mut self, remote_identity: &PublicKey) -> Option<HandshakeKeys>;
}

/// Handshake progress, tracked independently of the connection's data-plane state.
pub enum Phase {
    /// Client: generated an ephemeral keypair, waiting to send round 1.
    ClientStart {
        /// This connection's ephemeral keypair.
        ephemeral: PrivateKey,
    },
    /// Client: sent round 1, waiting for the server's ephemeral reply.
    ClientAwaitingRound1Reply {
        /// This connection's ephemeral keypair.
        ephemeral: PrivateKey,
        /// This connection's real, durable keypair.
        real: PrivateKey,
    },
    /// Client: round 1 complete, sent round 2, waiting for the server's real key.
    ClientAwaitingRound2Reply {
        /// Key schedule derived from round 1, used to authenticate round 2.
        round1: HandshakeKeys,
        /// This connection's real, durable keypair.
        real: PrivateKey,
    },
    /// Server: waiting for the client's first HELLO (round 1).
    ServerAwaitingRound1 {
        /// This connection's ephemeral keypair, generated lazily on receipt.
        real: PrivateKey,
    },
    /// Server, single-round mode: waiting for the client's one HELLO
    /// carrying its real public key.
    ServerAwaitingSingleRoundHello,
    /// Server: round 1 complete, waiting for the client's real key (round 2).
    ServerAwaitingRound2 {
        /// Key schedule derived from round 1.
        round1: HandshakeKeys,
        /// This connection's ephemeral keypair from round 1.
        ephemeral: PrivateKey,
        /// This connection's real, durable keypair.
        real: PrivateKey,
    },
    /// Handshake complete; `keys` is the schedule the data plane uses.
    Done {
        /// Final key schedule derived from round 2.
        keys: HandshakeKeys,
        /// The peer's real, durable public key, for application-level verification.
        peer_identity: PublicKey,
    },
}

/// Drives one side of the handshake to completion.
pub struct Handshake {
    side: Side,
    phase: Phase,
    local_role: ConnRole,
    peer_role: Option<ConnRole>,
}

impl Handshake {
    /// Start a handshake as the connecting client, two-round (ephemeral
    /// then real) mode.
    #[must_use]
    pub fn start_client(real: PrivateKey, role: ConnRole) -> (Self, PublicKey) {
        let ephemeral = PrivateKey::generate(&mut OsRng);
        let ephemeral_public = ephemeral.public_key();
        (
            Self {
                side: Side::Client,
                phase: Phase::ClientAwaitingRound1Reply { ephemeral, real },
                local_role: role,
                peer_role: None,
            },
            ephemeral_public,
        )
    }

    /// Start a handshake as the accepting server, which speaks only after
    /// receiving the client's round 1 ephemeral key.
    #[must_use]
    pub fn start_server(real: PrivateKey, role: ConnRole) -> Self {
        Self {
            side: Side::Server,
            phase: Phase::ServerAwaitingRound1 { real },
            local_role: role,
            peer_role: None,
        }
    }

    /// Start a handshake as the connecting client, single-round mode: the
    /// peer's real identity is already known, so the session key comes
    /// straight from `resolver` rather than an ephemeral exchange.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::Handshake`] if `resolver` rejects
    /// `server_identity`.
    pub fn start_client_single_round(
        local_identity: PublicKey,
        role: ConnRole,
        server_identity: PublicKey,
        resolver: &mut dyn AuthResolver,
    ) -> Result<(Self, PublicKey), FatalError> {
        let keys = resolver.resolve(&server_identity).ok_or_else(|| {
            FatalError::Handshake("auth resolver rejected peer identity".into())
        })?;
        Ok((
            Self {
                side: Side::Client,
                phase: Phase::Done {
                    keys,
                    peer_identity: server_identity,
                },
                local_role: role,
                peer_role: None,
            },
            local_identity,
        ))
    }

    /// Start a handshake as the accepting server, single-round mode,
    /// waiting for the client's one HELLO.
    #[must_use]
    pub fn start_server_single_round(role: ConnRole) -> Self {
        Self {
            side: Side::Server,
            phase: Phase::ServerAwaitingSingleRoundHello,
            local_role: role,
            peer_role: None,
        }
    }

    /// Server, single-round mode: process the client's one HELLO, asking
    /// `resolver` for the client's session key schedule.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::InvalidState`] if called out of order, or
    /// [`FatalError::Handshake`] if `resolver` rejects `client_identity`.
    pub fn server_accept_single_round_hello(
        &mut self,
        client_identity: PublicKey,
        resolver: &mut dyn AuthResolver,
    ) -> Result<(), FatalError> {
        if !matches!(self.phase, Phase::ServerAwaitingSingleRoundHello) {
            return Err(FatalError::InvalidState);
        }
        let keys = resolver.resolve(&client_identity).ok_or_else(|| {
            FatalError::Handshake("auth resolver rejected peer identity".into())
        })?;
        self.phase = Phase::Done {
            keys,
            peer_identity: client_identity,
        };
        Ok(())
    }

    /// Which side of the handshake this instance is playing.
    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    /// This side's connection role (source/sink/probe/directory).
    #[must_use]
    pub fn local_role(&self) -> ConnRole {
        self.local_role
    }

    /// The peer's connection role, once learned from their HELLO.
    #[must_use]
    pub fn peer_role(&self) -> Option<ConnRole> {
        self.peer_role
    }

    /// Record the peer's connection role, extracted from a received HELLO.
    pub fn note_peer_role(&mut self, role: ConnRole) {
        self.peer_role = Some(role);
    }

    /// Whether the handshake has produced a final key schedule.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done { .. })
    }

    /// The final key schedule, once the handshake has completed.
    #[must_use]
    pub fn keys(&self) -> Option<&HandshakeKeys> {
        match &self.phase {
            Phase::Done { keys, .. } => Some(keys),
            _ => None,
        }
    }

    /// The peer's verified real identity key, once the handshake has completed.
    #[must_use]
    pub fn peer_identity(&self) -> Option<&PublicKey> {
        match &self.phase {
            Phase::Done { peer_identity, .. } => Some(peer_identity),
            _ => None,
        }
    }

    /// The round-1 key schedule, while it is still the live key schedule —
    /// i.e. after this side has computed it but before round 2 completes.
    ///
    /// Both the client's round-2 request and the server's round-2 reply
    /// carry a public key the other side needs in order to derive round 2's
    /// own shared secret, so neither message can be encrypted with round-2
    /// keys. The caller fetches this right after `*_accept_round1*` returns
    /// and uses it to frame that message instead.
    #[must_use]
    pub fn pending_round1_keys(&self) -> Option<&HandshakeKeys> {
        match &self.phase {
            Phase::ClientAwaitingRound2Reply { round1, .. } => Some(round1),
            Phase::ServerAwaitingRound2 { round1, .. } => Some(round1),
            _ => None,
        }
    }

    /// Server: process the client's round 1 ephemeral public key and nonce,
    /// returning this side's ephemeral public key to send back.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::InvalidState`] if called out of order.
    pub fn server_accept_round1(
        &mut self,
        client_ephemeral: &PublicKey,
        nonce: [u8; 8],
    ) -> Result<PublicKey, FatalError> {
        let Phase::ServerAwaitingRound1 { real } = std::mem::replace(
            &mut self.phase,
            Phase::ServerAwaitingRound1 {
                real: PrivateKey::generate(&mut OsRng),
            },
        ) else {
            return Err(FatalError::InvalidState);
        };

        let ephemeral = PrivateKey::generate(&mut OsRng);
        let ephemeral_public = ephemeral.public_key();
        let shared = ephemeral
            .exchange(client_ephemeral)
            .ok_or_else(|| FatalError::Handshake("low-order ephemeral public key".into()))?;
        let round1 = HandshakeKeys::derive_round1(shared.as_bytes(), nonce);

        self.phase = Phase::ServerAwaitingRound2 {
            round1,
            ephemeral,
            real,
        };

        Ok(ephemeral_public)
    }

    /// Client: process the server's round 1 ephemeral reply, returning this
    /// side's real public key to send as round 2.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::InvalidState`] if called out of order.
    pub fn client_accept_round1_reply(
        &mut self,
        server_ephemeral: &PublicKey,
        nonce: [u8; 8],
    ) -> Result<PublicKey, FatalError> {
        let Phase::ClientAwaitingRound1Reply { ephemeral, real } = std::mem::replace(
            &mut self.phase,
            Phase::ClientAwaitingRound1Reply {
                ephemeral: PrivateKey::generate(&mut OsRng),
                real: PrivateKey::generate(&mut OsRng),
            },
        ) else {
            return Err(FatalError::InvalidState);
        };

        let shared = ephemeral
            .exchange(server_ephemeral)
            .ok_or_else(|| FatalError::Handshake("low-order ephemeral public key".into()))?;
        let round1 = HandshakeKeys::derive_round1(shared.as_bytes(), nonce);
        let real_public = real.public_key();

        self.phase = Phase::ClientAwaitingRound2Reply { round1, real };

        Ok(real_public)
    }

    /// Server: process the client's round 2 real public key, returning the
    /// final key schedule and this side's real public key to send back.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::InvalidState`] if called out of order.
    pub fn server_accept_round2(
        &mut self,
        client_real: &PublicKey,
    ) -> Result<PublicKey, FatalError> {
        let Phase::ServerAwaitingRound2 {
            round1,
            ephemeral: _,
            real,
        } = std::mem::replace(
            &mut self.phase,
            Phase::ServerAwaitingRound1 {
                real: PrivateKey::generate(&mut OsRng),
            },
        )
        else {
            return Err(FatalError::InvalidState);
        };

        let shared = real
            .exchange(client_real)
            .ok_or_else(|| FatalError::Handshake("low-order real public key".into()))?;
        let keys = HandshakeKeys::derive_round2(shared.as_bytes(), &round1);
        let real_public = real.public_key();

        self.phase = Phase::Done {
            keys,
            peer_identity: *client_real,
        };

        Ok(real_public)
    }

    /// Client: process the server's round 2 real public key, completing the
    /// handshake with the final key schedule.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::InvalidState`] if called out of order.
    pub fn client_accept_round2_reply(
        &mut self,
        server_real: &PublicKey,
    ) -> Result<(), FatalError> {
        let Phase::ClientAwaitingRound2Reply { round1, real } = std::mem::replace(
            &mut self.phase,
            Phase::ClientAwaitingRound2Reply {
                round1: HandshakeKeys::derive_round1(&[0u8; 32], [0u8; 8]),
                real: PrivateKey::generate(&mut OsRng),
            },
        ) else {
            return Err(FatalError::InvalidState);
        };

        let shared = real
            .exchange(server_real)
            .ok_or_else(|| FatalError::Handshake("low-order real public key".into()))?;
        let keys = HandshakeKeys::derive_round2(shared.as_bytes(), &round1);

        self.phase = Phase::Done {
            keys,
            peer_identity: *server_real,
        };

        Ok(())
    }
}
