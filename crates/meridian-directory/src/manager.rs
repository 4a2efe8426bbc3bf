//! Appl-directory snapshot management and dynamic-resource mediation.
//!
//! A directory-role connection maintains a snapshot of appl entries.
//! Clients request a listing with a sentinel `DIRLIST` record; the
//! directory answers with one `DIRLIST` entry per appl and a terminating
//! empty `DIRSTATE`. From then on, whenever the directory's own entry set
//! changes it emits incremental `DIRSTATE`s for whatever was added,
//! updated, or removed. [`Connection`] only frames and authenticates
//! these records — it has no notion of what a "directory" is — so all of
//! that bookkeeping lives here.

use meridian_core::collaborators::{DirectoryOpenHandler, DiscoveryHandler};
use meridian_core::error::{Error as ConnError, FatalError};
use meridian_core::{Connection, ConnectionEvent};
use meridian_crypto::x25519::PrivateKey;
use meridian_wire::control::{
    ControlCommand, DirDiscover, DirEntry, DirOpen, DirOpenMode, DirOpened, Role,
    DIR_ENTRY_DESC_LEN, DIR_ENTRY_NAME_LEN, PETNAME_LEN,
};
use rand_core::OsRng;

/// Sentinel entry id used both for the client's listing request and for
/// the directory's terminating empty `DIRSTATE`. No real entry may use it.
pub const SENTINEL_ID: u16 = u16::MAX;

/// Permission bit a listing request sets to subscribe to future deltas.
const NOTIFY_BIT: u32 = 0x1;

/// Sentinel size value marking a `DIRSTATE` delta as a removal rather
/// than an add/update, keyed by the entry's `id`.
const REMOVED_SIZE: u64 = u64::MAX;

fn pack_fixed(src: &str, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let bytes = src.as_bytes();
    let take = bytes.len().min(len);
    buf[..take].copy_from_slice(&bytes[..take]);
    buf
}

fn unpack_fixed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Sanitize a raw petname to the wire's `[A-Za-z0-9_]{1,16}` charset,
/// rejecting anything empty, oversized, or containing a disallowed byte
/// outright rather than silently stripping characters.
#[must_use]
pub fn sanitize_petname(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.len() > PETNAME_LEN {
        return None;
    }
    if raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Some(raw.to_string())
    } else {
        None
    }
}

/// One appl entry in a directory's snapshot, in owned, string-friendly
/// form (the wire's [`DirEntry`] is the fixed-width on-the-wire twin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplEntry {
    /// Directory-assigned identifier, stable across `DIRSTATE` deltas.
    pub id: u16,
    /// Category bitfield.
    pub category: u32,
    /// Permission bitfield.
    pub permissions: u32,
    /// Truncated content hash.
    pub hash: [u8; 4],
    /// Size of the associated appl package, in bytes.
    pub size: u64,
    /// Display name, at most [`DIR_ENTRY_NAME_LEN`] bytes once encoded.
    pub name: String,
    /// Short human-readable description.
    pub short_desc: String,
    /// Last-modified timestamp (Unix seconds).
    pub timestamp: u64,
}

impl ApplEntry {
    fn to_wire(&self) -> DirEntry {
        let mut name = [0u8; DIR_ENTRY_NAME_LEN];
        name.copy_from_slice(&pack_fixed(&self.name, DIR_ENTRY_NAME_LEN));
        let mut short_desc = [0u8; DIR_ENTRY_DESC_LEN];
        short_desc.copy_from_slice(&pack_fixed(&self.short_desc, DIR_ENTRY_DESC_LEN));
        DirEntry {
            id: self.id,
            category: self.category,
            permissions: self.permissions,
            hash: self.hash,
            size: self.size,
            name,
            short_desc,
            timestamp: self.timestamp,
        }
    }

    fn from_wire(entry: &DirEntry) -> Self {
        Self {
            id: entry.id,
            category: entry.category,
            permissions: entry.permissions,
            hash: entry.hash,
            size: entry.size,
            name: unpack_fixed(&entry.name),
            short_desc: unpack_fixed(&entry.short_desc),
            timestamp: entry.timestamp,
        }
    }

    fn tombstone(id: u16) -> DirEntry {
        DirEntry {
            id,
            category: 0,
            permissions: 0,
            hash: [0; 4],
            size: REMOVED_SIZE,
            name: [0; DIR_ENTRY_NAME_LEN],
            short_desc: [0; DIR_ENTRY_DESC_LEN],
            timestamp: 0,
        }
    }

    fn terminator() -> DirEntry {
        Self::tombstone(SENTINEL_ID)
    }
}

/// One change produced by [`DirectorySnapshot::replace`].
#[derive(Debug, Clone)]
enum Change {
    Upserted(ApplEntry),
    Removed(u16),
}

/// The appl entries a directory currently serves, as a generation-counted
/// snapshot. Modeled as a `Vec` rather than a linked list — Rust gets no
/// benefit from an intrusive list here, and a `Vec` gives the same
/// "replace wholesale, diff against the last snapshot" access pattern for
/// free.
pub struct DirectorySnapshot {
    entries: Vec<ApplEntry>,
    generation: u64,
}

impl Default for DirectorySnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectorySnapshot {
    /// An empty snapshot at generation 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            generation: 0,
        }
    }

    /// Current generation counter, bumped every time [`replace`](Self::replace)
    /// changes the entry set.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The current entries, in no particular order.
    #[must_use]
    pub fn entries(&self) -> &[ApplEntry] {
        &self.entries
    }

    fn replace(&mut self, new_entries: Vec<ApplEntry>) -> Vec<Change> {
        let mut changes = Vec::new();

        for old in &self.entries {
            if !new_entries.iter().any(|e| e.id == old.id) {
                changes.push(Change::Removed(old.id));
            }
        }
        for new in &new_entries {
            match self.entries.iter().find(|e| e.id == new.id) {
                Some(old) if old == new => {}
                _ => changes.push(Change::Upserted(new.clone())),
            }
        }

        if !changes.is_empty() {
            self.generation += 1;
        }
        self.entries = new_entries;
        changes
    }
}

/// A decoded outcome of [`DirectoryManager::handle_event`], translating a
/// raw [`ConnectionEvent`] into directory-level semantics.
#[derive(Debug, Clone)]
pub enum DirectoryOutcome {
    /// The peer asked for a full listing, optionally subscribing to
    /// future deltas.
    ListingRequested {
        /// Whether the peer asked to be notified of future changes.
        notify: bool,
    },
    /// One entry arrived as part of a snapshot or a delta.
    EntryAnnounced(ApplEntry),
    /// An entry was withdrawn.
    EntryRemoved(u16),
    /// The initial full-snapshot transmission finished.
    ListingComplete,
    /// The peer's petname announcement, after charset sanitization.
    PeerDiscovered {
        /// Sanitized petname (`[A-Za-z0-9_]{1,16}`).
        petname: String,
        /// The role the peer announced itself under.
        role: Role,
        /// Whether this is an addition or a withdrawal.
        added: bool,
        /// The announcing peer's real public key.
        pubkey: [u8; 32],
    },
    /// The peer's announced petname failed sanitization and was dropped.
    DiscoveryRejected,
    /// The peer is asking this side's directory to mediate opening a
    /// dynamic resource.
    OpenRequested(DirOpen),
    /// The peer's directory answered this side's pending dynamic-resource
    /// request.
    OpenAnswered {
        /// The connection descriptor (or failure) the directory returned.
        reply: DirOpened,
        /// Public key of the publisher that was originally requested.
        target_pubk: [u8; 32],
    },
}

/// This connection's single in-flight dynamic-resource request, per §3's
/// "pending dynamic-resource request (single slot)" — a connection may
/// have at most one outstanding [`DirOpen`] awaiting its [`DirOpened`].
struct PendingDynamicResource {
    target_pubk: [u8; 32],
    #[allow(dead_code)]
    ephemeral: PrivateKey,
    #[allow(dead_code)]
    prefer_tunnel: bool,
}

/// Owns one connection's directory snapshot and translates the raw
/// control-record traffic `meridian-core` surfaces into directory
/// semantics.
pub struct DirectoryManager {
    snapshot: DirectorySnapshot,
    pending_open: Option<PendingDynamicResource>,
    discovery_handler: Option<Box<dyn DiscoveryHandler>>,
    open_handler: Option<Box<dyn DirectoryOpenHandler>>,
}

impl Default for DirectoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryManager {
    /// A manager with an empty snapshot and no pending request.
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: DirectorySnapshot::new(),
            pending_open: None,
            discovery_handler: None,
            open_handler: None,
        }
    }

    /// Install (or remove, with `None`) the callback notified of every
    /// sanitized `DIRDISCOVER` announcement [`Self::handle_event`] decodes.
    pub fn set_discovery_handler(&mut self, handler: Option<Box<dyn DiscoveryHandler>>) {
        self.discovery_handler = handler;
    }

    /// Install (or remove, with `None`) the mediator consulted by
    /// [`Self::handle_event_and_auto_answer`] to resolve an incoming
    /// `DIROPEN` into a `DIROPENED` reply automatically.
    pub fn set_open_handler(&mut self, handler: Option<Box<dyn DirectoryOpenHandler>>) {
        self.open_handler = handler;
    }

    /// Whether a dynamic-resource request is currently awaiting a reply.
    #[must_use]
    pub fn has_pending_open(&self) -> bool {
        self.pending_open.is_some()
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> &DirectorySnapshot {
        &self.snapshot
    }

    /// Announce this endpoint to the peer under `petname`, in `role`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Fatal`] if the handshake has not completed or
    /// `petname` fails sanitization.
    pub fn announce(
        &self,
        conn: &mut Connection,
        petname: &str,
        role: Role,
        added: bool,
        pubkey: [u8; 32],
    ) -> Result<(), ConnError> {
        let Some(sanitized) = sanitize_petname(petname) else {
            return Err(ConnError::Fatal(FatalError::InvalidState));
        };
        let mut buf = [0u8; PETNAME_LEN];
        buf[..sanitized.len()].copy_from_slice(sanitized.as_bytes());
        let disco = DirDiscover {
            role,
            added,
            petname_len: sanitized.len() as u8,
            petname: buf,
            pubkey,
        };
        conn.send_control(ControlCommand::DirDiscover, &disco.to_bytes())
    }

    /// Client side: ask the peer's directory for a full listing.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Fatal`] if the handshake has not completed.
    pub fn request_listing(&self, conn: &mut Connection, notify: bool) -> Result<(), ConnError> {
        let mut request = ApplEntry::tombstone(SENTINEL_ID);
        request.permissions = if notify { NOTIFY_BIT } else { 0 };
        conn.send_control(ControlCommand::DirList, &request.to_bytes())
    }

    /// Server side: replace the served entry set, emitting `DIRSTATE`
    /// deltas for whatever actually changed relative to the prior
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Fatal`] if the handshake has not completed.
    pub fn publish(
        &mut self,
        conn: &mut Connection,
        entries: Vec<ApplEntry>,
    ) -> Result<(), ConnError> {
        for change in self.snapshot.replace(entries) {
            let wire = match change {
                Change::Upserted(entry) => entry.to_wire(),
                Change::Removed(id) => ApplEntry::tombstone(id),
            };
            conn.send_control(ControlCommand::DirState, &wire.to_bytes())?;
        }
        Ok(())
    }

    /// Server side: answer a listing request with the current snapshot,
    /// one `DIRLIST` record per entry, followed by a terminating empty
    /// `DIRSTATE`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Fatal`] if the handshake has not completed.
    pub fn answer_listing(&self, conn: &mut Connection) -> Result<(), ConnError> {
        for entry in self.snapshot.entries() {
            conn.send_control(ControlCommand::DirList, &entry.to_wire().to_bytes())?;
        }
        conn.send_control(ControlCommand::DirState, &ApplEntry::terminator().to_bytes())
    }

    /// Directory role: answer a [`DirOpen`] mediation request with a
    /// connection descriptor or a failure, built with
    /// [`DirOpened::direct`]/[`DirOpened::tunnel`]/[`DirOpened::refused`]/
    /// [`DirOpened::unreachable`].
    ///
    /// The opaque `authk` a direct descriptor carries is whatever the
    /// caller's own `directory_open` resolution produced (a capability
    /// token, a one-time password); this manager does not mint or
    /// interpret it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Fatal`] if the handshake has not completed.
    pub fn answer_open(&self, conn: &mut Connection, reply: DirOpened) -> Result<(), ConnError> {
        conn.send_control(ControlCommand::DirOpened, &reply.to_bytes())
    }

    /// Sink side: ask the peer's directory to mediate opening a dynamic
    /// resource published at `target_pubk`, preferring a tunnel relay over
    /// a direct connection descriptor if `prefer_tunnel` is set.
    ///
    /// Generates a fresh ephemeral keypair for this request and stores it
    /// as the connection's single pending dynamic-resource request; the
    /// eventual [`DirectoryOutcome::OpenAnswered`] clears it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Fatal`] if the handshake has not completed or
    /// a request is already pending on this connection.
    pub fn request_dynamic_resource(
        &mut self,
        conn: &mut Connection,
        target_pubk: [u8; 32],
        prefer_tunnel: bool,
    ) -> Result<(), ConnError> {
        if self.pending_open.is_some() {
            return Err(ConnError::Fatal(FatalError::InvalidState));
        }

        let ephemeral = PrivateKey::generate(&mut OsRng);
        let open = DirOpen {
            mode: if prefer_tunnel {
                DirOpenMode::PreferTunnel
            } else {
                DirOpenMode::Direct
            },
            target_pubk,
            requester_ephem_pubk: *ephemeral.public_key().as_bytes(),
        };
        conn.send_control(ControlCommand::DirOpen, &open.to_bytes())?;

        self.pending_open = Some(PendingDynamicResource {
            target_pubk,
            ephemeral,
            prefer_tunnel,
        });
        Ok(())
    }

    /// Translate one decoded [`ConnectionEvent`] into directory-level
    /// semantics. Returns `None` for events this manager has no opinion
    /// on (video/audio/message traffic, handshake completion, etc).
    pub fn handle_event(&mut self, event: &ConnectionEvent) -> Option<DirectoryOutcome> {
        match event {
            ConnectionEvent::DirListEntry(entry) if entry.id == SENTINEL_ID => {
                Some(DirectoryOutcome::ListingRequested {
                    notify: entry.permissions & NOTIFY_BIT != 0,
                })
            }
            ConnectionEvent::DirListEntry(entry) => {
                Some(DirectoryOutcome::EntryAnnounced(ApplEntry::from_wire(entry)))
            }
            ConnectionEvent::DirStateEntry(entry) if entry.id == SENTINEL_ID => {
                Some(DirectoryOutcome::ListingComplete)
            }
            ConnectionEvent::DirStateEntry(entry) if entry.size == REMOVED_SIZE => {
                Some(DirectoryOutcome::EntryRemoved(entry.id))
            }
            ConnectionEvent::DirStateEntry(entry) => {
                Some(DirectoryOutcome::EntryAnnounced(ApplEntry::from_wire(entry)))
            }
            ConnectionEvent::DirDiscovered(disco) => {
                let raw = unpack_fixed(&disco.petname[..(disco.petname_len as usize).min(PETNAME_LEN)]);
                match sanitize_petname(&raw) {
                    Some(petname) => {
                        if let Some(handler) = self.discovery_handler.as_deref_mut() {
                            handler.on_discover(&petname, disco.role, disco.added, disco.pubkey);
                        }
                        Some(DirectoryOutcome::PeerDiscovered {
                            petname,
                            role: disco.role,
                            added: disco.added,
                            pubkey: disco.pubkey,
                        })
                    }
                    None => {
                        tracing::warn!(raw = %raw, "dropping DIRDISCOVER with invalid petname");
                        Some(DirectoryOutcome::DiscoveryRejected)
                    }
                }
            }
            ConnectionEvent::DirOpenRequested(open) => Some(DirectoryOutcome::OpenRequested(*open)),
            ConnectionEvent::DirOpened(opened) => match self.pending_open.take() {
                Some(pending) => Some(DirectoryOutcome::OpenAnswered {
                    reply: *opened,
                    target_pubk: pending.target_pubk,
                }),
                None => {
                    tracing::warn!("DIROPENED arrived with no pending dynamic-resource request");
                    None
                }
            },
            _ => None,
        }
    }

    /// Like [`Self::handle_event`], but if the event is an incoming
    /// `DIROPEN` and an open handler is installed, also resolve it and
    /// send the `DIROPENED` reply before returning.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Fatal`] if answering the request fails (the
    /// handshake has not completed).
    pub fn handle_event_and_auto_answer(
        &mut self,
        conn: &mut Connection,
        event: &ConnectionEvent,
    ) -> Result<Option<DirectoryOutcome>, ConnError> {
        let outcome = self.handle_event(event);
        if let Some(DirectoryOutcome::OpenRequested(open)) = &outcome {
            if let Some(handler) = self.open_handler.as_deref_mut() {
                let reply = handler.directory_open(open);
                self.answer_open(conn, reply)?;
            }
        }
        Ok(outcome)
    }
}
