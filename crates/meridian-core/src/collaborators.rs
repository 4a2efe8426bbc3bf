//! Capability traits for the external collaborators a caller wires into a
//! [`Connection`](crate::session::Connection) or
//! `meridian-directory::DirectoryManager`.
//!
//! The original library passed these as function pointers plus a `void*`
//! context; here each is a trait whose implementor owns its own state, and
//! installation is an explicit `set_*`/constructor argument rather than a
//! raw pointer registration. [`crate::handshake::AuthResolver`] is the
//! seventh named collaborator — it lives in `handshake` next to the
//! `Handshake` it serves, rather than here.

use meridian_wire::control::{BinaryStream, DirOpen, DirOpened, Role};

use crate::session::ConnectionEvent;

/// Immediate-drain callback a caller can install to receive outbound bytes
/// as they're produced instead of polling [`Connection::flush`](crate::session::Connection::flush).
///
/// Returning `false` asks the caller driving the connection to stop
/// draining further chunks this round (e.g. the underlying transport's
/// write buffer is full).
pub trait SinkCallback: Send {
    /// Hand `data`, tagged with the channel it was queued on, to the sink.
    fn sink(&mut self, channel: u8, data: &[u8]) -> bool;
}

/// A [`BinaryHandler`]'s decision for a newly announced binary substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryDecision {
    /// Let the transfer proceed; chunks will arrive as
    /// [`ConnectionEvent::BlobChunk`](crate::session::ConnectionEvent::BlobChunk).
    Accept,
    /// Reject the transfer outright; the connection cancels it on the
    /// caller's behalf.
    DontWant,
    /// This side already has the bytes cached; cancel the transfer the
    /// same way as `DontWant`; present as a separate variant because the
    /// peer may want to log the two cases differently.
    Cached,
}

/// Accept/reject/cache oracle for incoming binary (blob) substreams.
///
/// Installed on a [`Connection`](crate::session::Connection) via
/// `set_bhandler`; consulted once per `BINARYSTREAM` announcement, before
/// the connection emits [`ConnectionEvent::BinaryStreamAnnounced`].
pub trait BinaryHandler: Send {
    /// Decide whether to accept, reject, or treat as already-cached the
    /// substream `announced` describes.
    fn decide(&mut self, announced: &BinaryStream) -> BinaryDecision;
}

/// Push-style alternative to draining [`Connection::poll`](crate::session::Connection::poll)
/// by hand: receives each decoded event as it is produced.
pub trait EventSink: Send {
    /// Handle one decoded connection event.
    fn on_event(&mut self, event: &ConnectionEvent);
}

/// Notified of a peer's `DIRDISCOVER` petname announcement, after charset
/// sanitization, as a push-style alternative to matching on
/// `DirectoryOutcome::PeerDiscovered`.
pub trait DiscoveryHandler: Send {
    /// `petname` has already passed `sanitize_petname`.
    fn on_discover(&mut self, petname: &str, role: Role, added: bool, pubkey: [u8; 32]);
}

/// Directory role: mediates a peer's `DIROPEN` dynamic-resource request,
/// producing the `DIROPENED` reply to send back.
///
/// Implementations typically look `request.target_pubk` up against
/// whatever this side's directory actually serves, and answer with
/// [`DirOpened::direct`]/[`DirOpened::tunnel`]/[`DirOpened::refused`]/
/// [`DirOpened::unreachable`].
pub trait DirectoryOpenHandler: Send {
    /// Resolve `request` into the reply this side's directory sends back.
    fn directory_open(&mut self, request: &DirOpen) -> DirOpened;
}

/// Fired once per side when the handshake reaches FULL_PK, as a push-style
/// alternative to matching on `ConnectionEvent::HandshakeComplete`.
pub trait AuthCompleteHandler: Send {
    /// `peer_identity` is the peer's verified real public key.
    fn on_auth(&mut self, peer_identity: [u8; 32]);
}
