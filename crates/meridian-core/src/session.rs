//! The connection state machine.
//!
//! `Connection` owns everything one endpoint needs to drive a Meridian
//! session end to end: the handshake, the directional cipher/MAC keys
//! currently in force, the double-buffered outbound arena, the inbound
//! decoder, the channel table, and the video congestion ring. Callers
//! push raw transport bytes in with [`Connection::feed`], call
//! [`Connection::poll`] to decode whatever has arrived into a batch of
//! [`ConnectionEvent`]s, and drain anything queued for the wire with
//! [`Connection::flush`].

use meridian_crypto::cipher::StreamCipher;
use meridian_crypto::handshake::HandshakeKeys;
use meridian_crypto::mac::Mac;
use meridian_crypto::x25519::{PrivateKey, PublicKey};
use meridian_wire::control::{
    AudioFrame, BinaryStream, CancelReason, CancelStream, ControlCommand, ControlRecord,
    DirDiscover, DirEntry, DirOpen, DirOpened, HandshakeMode, Hello, Ping, Role, StreamKind,
    VideoFrame, CANCEL_COMMIT,
};
use meridian_wire::frame::{self, PacketType};
use meridian_wire::packer;

use crate::channel::ChannelTable;
use crate::collaborators::{AuthCompleteHandler, BinaryDecision, BinaryHandler, EventSink, SinkCallback};
use crate::congestion::{CongestionRing, DEFAULT_WINDOW};
use crate::error::{Error, FatalError, StreamError};
use crate::handshake::{roles_compatible, AuthResolver, Handshake, HandshakeOptions};
use crate::inbound::{InboundDecoder, FIRST_HELLO_BODY_LEN};
use crate::outbound::Outbound;
use crate::video::{self, ExternalVideoCodec};

/// Protocol major version this build speaks, carried in every HELLO.
pub const PROTOCOL_VMAJOR: u8 = 1;
/// Protocol minor version this build speaks, carried in every HELLO.
pub const PROTOCOL_VMINOR: u8 = 0;

/// Fixed, public framing context for the one single-round HELLO. Single-round
/// mode has no pre-shared secret, so this only gives the packet a cipher/MAC
/// to satisfy the wire format with until the resolver-derived session keys
/// take over; it authenticates nothing by itself.
const SINGLE_ROUND_GREETING_CONTEXT: &[u8] = b"meridian-single-round-hello";

/// Maximum bytes carried in a single VIDEO/AUDIO/BLOB stream-data packet's
/// payload, matching the binary-transfer scheduler's steady-state chunk
/// size. A single [`StreamHeader`](meridian_wire::frame::StreamHeader)
/// length field could address up to 65535 bytes, but chunking at this
/// size keeps any one packet from dominating a transport write.
const VIDEO_CHUNK_SIZE: usize = 1400;

/// Channel implicitly open for the lifetime of every connection, used
/// for multipart MESSAGE assembly and directory control traffic.
pub const CONTROL_CHANNEL: u8 = 0;

/// Bytes of header overhead on every fixed-size EVENT chunk: the target
/// channel, a continuation flag, and the count of significant payload
/// bytes (the rest of a chunk is zero padding, since EVENT packets are a
/// fixed size chosen once at connection setup).
const EVENT_HEADER_SIZE: usize = 1 + 1 + 2;

/// Where a connection stands in the four-message (or single-message)
/// handshake.
enum HandshakeStep {
    /// Server only: waiting for the client's first HELLO.
    AwaitingMsg1,
    /// Client only: msg1 sent, waiting for the server's ephemeral reply.
    AwaitingMsg2,
    /// Server only: msg2 sent, waiting for the client's real key.
    AwaitingMsg3,
    /// Client only: msg3 sent, waiting for the server's real key reply.
    AwaitingMsg4,
    /// Server only, single-round mode: waiting for the client's one HELLO.
    AwaitingSingleRoundHello,
    /// Handshake complete; the data plane is live.
    Done,
}

/// A decoded, dispatched result of [`Connection::poll`].
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The handshake finished; the connection is now in the data plane.
    HandshakeComplete {
        /// The peer's verified real identity key.
        peer_identity: PublicKey,
    },
    /// A complete multipart application message was reassembled.
    Message {
        /// Channel the message was addressed to.
        channel: u8,
        /// The reassembled payload.
        payload: Vec<u8>,
    },
    /// A video substream announced a forthcoming dirty-rectangle update.
    VideoFrameAnnounced(VideoFrame),
    /// A video update finished assembling.
    VideoUpdateComplete {
        /// Channel the substream belongs to.
        channel: u8,
        /// Raw pixel bytes of the completed update.
        data: Vec<u8>,
    },
    /// An audio substream announced a forthcoming PCM chunk.
    AudioFrameAnnounced(AudioFrame),
    /// An audio chunk finished assembling.
    AudioChunkComplete {
        /// Channel the substream belongs to.
        channel: u8,
        /// PCM bytes of the completed chunk.
        data: Vec<u8>,
    },
    /// A binary (blob) substream announced a forthcoming transfer.
    BinaryStreamAnnounced(BinaryStream),
    /// A chunk of an in-progress binary transfer arrived.
    BlobChunk {
        /// Channel the substream belongs to.
        channel: u8,
        /// Stream id of the binary substream.
        stream_id: u32,
        /// The chunk's bytes.
        data: Vec<u8>,
        /// Whether the transfer is now complete (known size reached).
        complete: bool,
    },
    /// The peer cancelled an in-progress substream.
    StreamCancelled {
        /// Channel the substream belonged to.
        channel: u8,
        /// Stream id of the cancelled substream.
        stream_id: u32,
    },
    /// An inbound video update finished assembling but could not be
    /// decoded; a CANCELSTREAM with [`CancelReason::DecodeError`] was sent
    /// to ask the peer to downgrade codecs for subsequent updates.
    VideoDecodeFailed {
        /// Channel the substream belonged to.
        channel: u8,
        /// Stream id of the abandoned substream.
        stream_id: u32,
        /// Why decoding failed.
        reason: String,
    },
    /// A keepalive arrived.
    Ping,
    /// The peer announced one appl-directory entry as part of a full
    /// snapshot (DIRLIST).
    DirListEntry(DirEntry),
    /// The peer announced one appl-directory entry as an incremental
    /// update (DIRSTATE).
    DirStateEntry(DirEntry),
    /// The peer announced itself under a short petname.
    DirDiscovered(DirDiscover),
    /// The peer's directory asked this side to mediate opening a
    /// dynamic resource.
    DirOpenRequested(DirOpen),
    /// The peer's directory answered a prior open request.
    DirOpened(DirOpened),
}

/// Per-connection state machine: handshake orchestration plus the
/// established data plane (channels, congestion, framing).
pub struct Connection {
    handshake: Handshake,
    step: HandshakeStep,
    client_nonce: [u8; 8],
    active: HandshakeKeys,
    outbound: Outbound,
    inbound: InboundDecoder,
    channels: ChannelTable,
    congestion: CongestionRing,
    event_size: usize,
    broken: bool,
    options: HandshakeOptions,
    /// Single-round mode only: resolves the peer's session key schedule
    /// once their real identity arrives.
    auth_resolver: Option<Box<dyn AuthResolver>>,
    /// Accept/reject/cache oracle for incoming binary substreams. Consulted
    /// once per `BINARYSTREAM` announcement; absent, every transfer is
    /// accepted and left to the caller to inspect/cancel by hand.
    bhandler: Option<Box<dyn BinaryHandler>>,
    /// Fired once the handshake reaches FULL_PK, alongside the
    /// `ConnectionEvent::HandshakeComplete` the caller can also match on.
    auth_complete: Option<Box<dyn AuthCompleteHandler>>,
}

impl Connection {
    /// Start a connection as the initiating client. The returned
    /// connection already has the first HELLO queued; call
    /// [`Connection::flush`] to get it onto the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the OS CSPRNG cannot supply the
    /// handshake nonce.
    pub fn new_client(
        psk: &[u8],
        identity: PrivateKey,
        event_size: usize,
        role: Role,
    ) -> Result<Self, Error> {
        Self::new_client_with_options(psk, identity, event_size, role, HandshakeOptions::default())
    }

    /// Like [`Connection::new_client`], with explicit [`HandshakeOptions`]
    /// (e.g. to allow a directory↔directory peering).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the OS CSPRNG cannot supply the
    /// handshake nonce.
    pub fn new_client_with_options(
        psk: &[u8],
        identity: PrivateKey,
        event_size: usize,
        role: Role,
        options: HandshakeOptions,
    ) -> Result<Self, Error> {
        let (handshake, ephemeral_public) = Handshake::start_client(identity, role);
        let greeting = HandshakeKeys::derive_greeting(psk);
        let nonce = meridian_crypto::random::random_8().map_err(FatalError::Crypto)?;

        let mut outbound = Outbound::new(frame::MAC_HALF);
        let cipher = StreamCipher::new(greeting.encrypt_key(handshake.side().role()));
        let mac = Mac::new(greeting.mac_key());
        let mut body = vec![0u8; FIRST_HELLO_BODY_LEN];
        body[..8].copy_from_slice(&nonce);
        body[8..].copy_from_slice(&ephemeral_public.to_bytes());
        outbound.push_raw_control(&cipher, &mac, body);
        outbound.set_mac_len(frame::MAC_FULL);

        let mut channels = ChannelTable::new();
        channels.open(CONTROL_CHANNEL);

        Ok(Self {
            handshake,
            step: HandshakeStep::AwaitingMsg2,
            client_nonce: nonce,
            active: greeting,
            outbound,
            inbound: InboundDecoder::new(frame::MAC_FULL, event_size),
            channels,
            congestion: CongestionRing::new(DEFAULT_WINDOW),
            event_size,
            broken: false,
            options,
            auth_resolver: None,
            bhandler: None,
            auth_complete: None,
        })
    }

    /// Start a connection as the accepting server, waiting for the
    /// client's first HELLO.
    #[must_use]
    pub fn new_server(psk: &[u8], identity: PrivateKey, event_size: usize, role: Role) -> Self {
        Self::new_server_with_options(psk, identity, event_size, role, HandshakeOptions::default())
    }

    /// Like [`Connection::new_server`], with explicit [`HandshakeOptions`]
    /// (e.g. to allow a directory↔directory peering).
    #[must_use]
    pub fn new_server_with_options(
        psk: &[u8],
        identity: PrivateKey,
        event_size: usize,
        role: Role,
        options: HandshakeOptions,
    ) -> Self {
        let handshake = Handshake::start_server(identity, role);
        let greeting = HandshakeKeys::derive_greeting(psk);

        let mut channels = ChannelTable::new();
        channels.open(CONTROL_CHANNEL);

        Self {
            handshake,
            step: HandshakeStep::AwaitingMsg1,
            client_nonce: [0u8; 8],
            active: greeting,
            outbound: Outbound::new(frame::MAC_FULL),
            inbound: InboundDecoder::new(frame::MAC_HALF, event_size),
            channels,
            congestion: CongestionRing::new(DEFAULT_WINDOW),
            event_size,
            broken: false,
            options,
            auth_resolver: None,
            bhandler: None,
            auth_complete: None,
        }
    }

    /// Start a connection as the connecting client, single-round mode:
    /// the peer's real identity is already known (pinned out of band),
    /// so `resolver` supplies the session key schedule directly instead
    /// of an ephemeral exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if `resolver` rejects `server_identity`.
    pub fn new_client_single_round(
        identity: PrivateKey,
        role: Role,
        server_identity: PublicKey,
        resolver: &mut dyn AuthResolver,
        event_size: usize,
    ) -> Result<Self, Error> {
        let local_public = identity.public_key();
        let (handshake, _) = Handshake::start_client_single_round(
            local_public,
            role,
            server_identity,
            resolver,
        )
        .map_err(Error::Fatal)?;
        let keys = handshake
            .keys()
            .cloned()
            .expect("single-round client handshake is Done immediately");

        // The one HELLO packet goes out under a fixed public context, not
        // the resolver-derived session keys: the server cannot derive those
        // until it has read this HELLO's plaintext identity.
        let wire_greeting = HandshakeKeys::derive_greeting(SINGLE_ROUND_GREETING_CONTEXT);
        let mut outbound = Outbound::new(frame::MAC_FULL);
        let (cipher, mac) = {
            let r = handshake.side().role();
            (
                StreamCipher::new(wire_greeting.encrypt_key(r)),
                Mac::new(wire_greeting.mac_key()),
            )
        };
        let hello = Hello {
            vmajor: PROTOCOL_VMAJOR,
            vminor: PROTOCOL_VMINOR,
            mode: HandshakeMode::SingleRound,
            pubkey: *local_public.as_bytes(),
            role,
        };
        let record = ControlRecord::new(ControlCommand::Hello, &hello.to_bytes());
        outbound.push_control(&cipher, &mac, &record);

        let mut channels = ChannelTable::new();
        channels.open(CONTROL_CHANNEL);

        Ok(Self {
            handshake,
            step: HandshakeStep::Done,
            client_nonce: [0u8; 8],
            active: keys,
            outbound,
            inbound: InboundDecoder::new(frame::MAC_FULL, event_size),
            channels,
            congestion: CongestionRing::new(DEFAULT_WINDOW),
            event_size,
            broken: false,
            options: HandshakeOptions::default(),
            auth_resolver: None,
            bhandler: None,
            auth_complete: None,
        })
    }

    /// Start a connection as the accepting server, single-round mode,
    /// asking `resolver` for the client's session key schedule once their
    /// one HELLO arrives.
    #[must_use]
    pub fn new_server_single_round(
        role: Role,
        resolver: Box<dyn AuthResolver>,
        event_size: usize,
    ) -> Self {
        let handshake = Handshake::start_server_single_round(role);

        let mut channels = ChannelTable::new();
        channels.open(CONTROL_CHANNEL);

        Self {
            handshake,
            step: HandshakeStep::AwaitingSingleRoundHello,
            client_nonce: [0u8; 8],
            active: HandshakeKeys::derive_greeting(SINGLE_ROUND_GREETING_CONTEXT),
            outbound: Outbound::new(frame::MAC_FULL),
            inbound: InboundDecoder::new(frame::MAC_FULL, event_size),
            channels,
            congestion: CongestionRing::new(DEFAULT_WINDOW),
            event_size,
            broken: false,
            options: HandshakeOptions::default(),
            auth_resolver: Some(resolver),
            bhandler: None,
            auth_complete: None,
        }
    }

    /// Whether the handshake has completed and the data plane is live.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self.step, HandshakeStep::Done)
    }

    /// The peer's verified real identity key, once established.
    #[must_use]
    pub fn peer_identity(&self) -> Option<&PublicKey> {
        self.handshake.peer_identity()
    }

    /// Install (or remove, with `None`) the accept/reject/cache oracle
    /// consulted once per inbound `BINARYSTREAM` announcement.
    pub fn set_bhandler(&mut self, bhandler: Option<Box<dyn BinaryHandler>>) {
        self.bhandler = bhandler;
    }

    /// Install (or remove, with `None`) the callback fired once this side's
    /// handshake reaches FULL_PK.
    pub fn set_auth_complete_handler(&mut self, handler: Option<Box<dyn AuthCompleteHandler>>) {
        self.auth_complete = handler;
    }

    fn notify_auth_complete(&mut self, peer_identity: PublicKey) {
        if let Some(handler) = self.auth_complete.as_deref_mut() {
            handler.on_auth(*peer_identity.as_bytes());
        }
    }

    /// Number of outstanding (unacknowledged) video updates.
    #[must_use]
    pub fn video_backpressure(&self) -> usize {
        self.congestion.backpressure()
    }

    /// Whether the video congestion window is full; callers should drop
    /// or downgrade the next update rather than send it.
    #[must_use]
    pub fn is_video_saturated(&self) -> bool {
        self.congestion.is_saturated()
    }

    /// Record that the peer has processed video updates up to and
    /// including `stream_id`, sliding the congestion window forward.
    pub fn ack_video(&mut self, stream_id: u32) {
        self.congestion.ack(stream_id);
    }

    /// Open a channel other than [`CONTROL_CHANNEL`] for substream traffic,
    /// e.g. the tunnel channel a directory's `DIROPENED` reply names.
    ///
    /// Both sides are expected to call this with the same `id` once they
    /// have agreed on it out of band (directory mediation, an application
    /// handshake carried over MESSAGE traffic); unlike the primary channel,
    /// no wire record negotiates this — a peer sending VIDEO/AUDIO/BLOB
    /// traffic on a channel the receiver has not opened locally gets
    /// [`crate::error::StreamError::UnknownChannel`].
    pub fn open_channel(&mut self, id: u8) {
        self.channels.open(id);
    }

    /// Close a previously opened channel, dropping all of its in-progress
    /// substream state. A no-op if `id` is already closed.
    pub fn close_channel(&mut self, id: u8) {
        self.channels.close(id);
    }

    /// Whether `id` currently names an open channel.
    #[must_use]
    pub fn is_channel_open(&self, id: u8) -> bool {
        self.channels.is_open(id)
    }

    /// Append freshly received transport bytes for decoding.
    pub fn feed(&mut self, data: &[u8]) {
        self.inbound.feed(data);
    }

    /// Drain whatever has been queued for the wire.
    #[must_use]
    pub fn flush(&mut self) -> Vec<u8> {
        self.outbound.take()
    }

    /// Like [`Connection::flush`], but hand the drained bytes to `sink`
    /// instead of returning them, tagged with `channel` (the caller's own
    /// bookkeeping, not a field the wire bytes carry). Returns whatever
    /// `sink` returned, or `true` if nothing was queued.
    pub fn flush_with_sink(&mut self, channel: u8, sink: &mut dyn SinkCallback) -> bool {
        let data = self.flush();
        if data.is_empty() {
            return true;
        }
        sink.sink(channel, &data)
    }

    fn decrypt_pair(&self) -> (StreamCipher, Mac) {
        let role = self.handshake.side().role();
        (
            StreamCipher::new(self.active.decrypt_key(role)),
            Mac::new(self.active.mac_key()),
        )
    }

    fn encrypt_pair(&self, keys: &HandshakeKeys) -> (StreamCipher, Mac) {
        let role = self.handshake.side().role();
        (
            StreamCipher::new(keys.encrypt_key(role)),
            Mac::new(keys.mac_key()),
        )
    }

    /// Decode and dispatch everything currently buffered, returning the
    /// resulting application-visible events in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake or MAC verification
    /// fails; the connection is marked broken and every subsequent call
    /// fails the same way.
    pub fn poll(&mut self) -> Result<Vec<ConnectionEvent>, Error> {
        if self.broken {
            return Err(Error::Fatal(FatalError::AlreadyBroken));
        }

        let mut events = Vec::new();
        loop {
            let (cipher, mac) = self.decrypt_pair();
            let decoded = match self.inbound.decode(&cipher, &mac) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "connection broken during inbound decode");
                    self.broken = true;
                    return Err(Error::Fatal(err));
                }
            };

            match self.dispatch(decoded.packet_type, decoded.body) {
                Ok(mut produced) => events.append(&mut produced),
                Err(Error::Fatal(err)) => {
                    tracing::warn!(error = %err, "connection broken during dispatch");
                    self.broken = true;
                    return Err(Error::Fatal(err));
                }
                Err(other) => return Err(other),
            }
        }

        Ok(events)
    }

    /// Like [`Connection::poll`], but hand each decoded event to `sink` as
    /// a push-style alternative to matching on the returned `Vec`.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::poll`].
    pub fn poll_into(&mut self, sink: &mut dyn EventSink) -> Result<(), Error> {
        for event in self.poll()? {
            sink.on_event(&event);
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        packet_type: PacketType,
        body: Vec<u8>,
    ) -> Result<Vec<ConnectionEvent>, Error> {
        if !matches!(self.step, HandshakeStep::Done) {
            return self.dispatch_handshake(body).map(|ev| vec![ev]);
        }

        match packet_type {
            PacketType::Control => self.dispatch_control(body),
            PacketType::Event => self.dispatch_event(body),
            PacketType::Video => self.dispatch_video(body),
            PacketType::Audio => self.dispatch_audio(body),
            PacketType::Blob => self.dispatch_blob(body),
        }
    }

    fn dispatch_handshake(&mut self, body: Vec<u8>) -> Result<ConnectionEvent, Error> {
        match self.step {
            HandshakeStep::AwaitingMsg1 => self.accept_msg1(body),
            HandshakeStep::AwaitingMsg2 => self.accept_msg2(body),
            HandshakeStep::AwaitingMsg3 => self.accept_msg3(body),
            HandshakeStep::AwaitingMsg4 => self.accept_msg4(body),
            HandshakeStep::AwaitingSingleRoundHello => self.accept_single_round_hello(body),
            HandshakeStep::Done => unreachable!("dispatch_handshake only runs before Done"),
        }
    }

    fn read_hello(body: &[u8]) -> Result<Hello, Error> {
        let record = ControlRecord::from_bytes(body).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
        if record.command != ControlCommand::Hello {
            return Err(Error::Fatal(FatalError::Handshake(
                "expected HELLO before handshake completed".into(),
            )));
        }
        Hello::from_bytes(&record.payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))
    }

    fn check_peer_role(&mut self, role: Role) -> Result<(), Error> {
        self.handshake.note_peer_role(role);
        if roles_compatible(self.handshake.local_role(), role, self.options) {
            Ok(())
        } else {
            Err(Error::Fatal(FatalError::Handshake(
                "incompatible connection roles".into(),
            )))
        }
    }

    fn outgoing_hello(&self, pubkey: [u8; 32]) -> Hello {
        Hello {
            vmajor: PROTOCOL_VMAJOR,
            vminor: PROTOCOL_VMINOR,
            mode: HandshakeMode::TwoRound,
            pubkey,
            role: self.handshake.local_role(),
        }
    }

    fn accept_msg1(&mut self, body: Vec<u8>) -> Result<ConnectionEvent, Error> {
        if body.len() < FIRST_HELLO_BODY_LEN {
            return Err(Error::Fatal(FatalError::Handshake(
                "short first hello".into(),
            )));
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&body[..8]);
        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&body[8..FIRST_HELLO_BODY_LEN]);
        let client_ephemeral = PublicKey::from_bytes(pubkey);

        let server_ephemeral = self
            .handshake
            .server_accept_round1(&client_ephemeral, nonce)
            .map_err(Error::Fatal)?;
        let round1 = self
            .handshake
            .pending_round1_keys()
            .cloned()
            .expect("round1 keys are available immediately after server_accept_round1");

        // msg2 still goes out under the greeting keys: the client has no
        // way to derive round1 before receiving this message.
        let greeting = self.active.clone();
        let (cipher, mac) = self.encrypt_pair(&greeting);
        let hello = self.outgoing_hello(server_ephemeral.to_bytes());
        let record = ControlRecord::new(ControlCommand::Hello, &hello.to_bytes());
        self.outbound.push_control(&cipher, &mac, &record);

        self.active = round1;
        self.inbound.set_mac_len(frame::MAC_FULL);
        self.step = HandshakeStep::AwaitingMsg3;

        Ok(ConnectionEvent::Ping)
    }

    fn accept_msg2(&mut self, body: Vec<u8>) -> Result<ConnectionEvent, Error> {
        let hello = Self::read_hello(&body)?;
        self.check_peer_role(hello.role)?;
        let server_ephemeral = PublicKey::from_bytes(hello.pubkey);

        let client_real_public = self
            .handshake
            .client_accept_round1_reply(&server_ephemeral, self.client_nonce)
            .map_err(Error::Fatal)?;
        let round1 = self
            .handshake
            .pending_round1_keys()
            .cloned()
            .expect("round1 keys are available immediately after client_accept_round1_reply");

        self.active = round1.clone();

        let (cipher, mac) = self.encrypt_pair(&round1);
        let reply = self.outgoing_hello(client_real_public.to_bytes());
        let record = ControlRecord::new(ControlCommand::Hello, &reply.to_bytes());
        self.outbound.push_control(&cipher, &mac, &record);

        self.step = HandshakeStep::AwaitingMsg4;

        Ok(ConnectionEvent::Ping)
    }

    fn accept_msg3(&mut self, body: Vec<u8>) -> Result<ConnectionEvent, Error> {
        let hello = Self::read_hello(&body)?;
        self.check_peer_role(hello.role)?;
        let client_real = PublicKey::from_bytes(hello.pubkey);
        let round1 = self
            .handshake
            .pending_round1_keys()
            .cloned()
            .expect("round1 keys are still live before server_accept_round2");

        let server_real_public = self
            .handshake
            .server_accept_round2(&client_real)
            .map_err(Error::Fatal)?;

        // msg4 still goes out under round1 keys: the client cannot derive
        // round2 until it has this real public key in hand.
        let (cipher, mac) = self.encrypt_pair(&round1);
        let reply = self.outgoing_hello(server_real_public.to_bytes());
        let record = ControlRecord::new(ControlCommand::Hello, &reply.to_bytes());
        self.outbound.push_control(&cipher, &mac, &record);

        let keys = self
            .handshake
            .keys()
            .cloned()
            .expect("handshake is Done immediately after server_accept_round2");
        self.active = keys;
        self.step = HandshakeStep::Done;

        let peer_identity = *self
            .handshake
            .peer_identity()
            .expect("peer identity is known once the handshake is done");
        tracing::debug!("handshake reached FULL_PK (server side)");
        self.notify_auth_complete(peer_identity);
        Ok(ConnectionEvent::HandshakeComplete { peer_identity })
    }

    fn accept_msg4(&mut self, body: Vec<u8>) -> Result<ConnectionEvent, Error> {
        let hello = Self::read_hello(&body)?;
        let server_real = PublicKey::from_bytes(hello.pubkey);

        self.handshake
            .client_accept_round2_reply(&server_real)
            .map_err(Error::Fatal)?;

        let keys = self
            .handshake
            .keys()
            .cloned()
            .expect("handshake is Done immediately after client_accept_round2_reply");
        self.active = keys;
        self.step = HandshakeStep::Done;

        let peer_identity = *self
            .handshake
            .peer_identity()
            .expect("peer identity is known once the handshake is done");
        tracing::debug!("handshake reached FULL_PK (client side)");
        self.notify_auth_complete(peer_identity);
        Ok(ConnectionEvent::HandshakeComplete { peer_identity })
    }

    fn accept_single_round_hello(&mut self, body: Vec<u8>) -> Result<ConnectionEvent, Error> {
        let hello = Self::read_hello(&body)?;
        self.check_peer_role(hello.role)?;
        let client_identity = PublicKey::from_bytes(hello.pubkey);

        let resolver = self
            .auth_resolver
            .as_deref_mut()
            .expect("single-round server always carries an auth resolver");
        self.handshake
            .server_accept_single_round_hello(client_identity, resolver)
            .map_err(Error::Fatal)?;

        let keys = self
            .handshake
            .keys()
            .cloned()
            .expect("handshake is Done immediately after server_accept_single_round_hello");
        self.active = keys;
        self.step = HandshakeStep::Done;

        let peer_identity = *self
            .handshake
            .peer_identity()
            .expect("peer identity is known once the handshake is done");
        tracing::debug!("handshake reached FULL_PK (server side, single round)");
        self.notify_auth_complete(peer_identity);
        Ok(ConnectionEvent::HandshakeComplete { peer_identity })
    }

    fn dispatch_control(&mut self, body: Vec<u8>) -> Result<Vec<ConnectionEvent>, Error> {
        let record = ControlRecord::from_bytes(&body).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
        let payload = &record.payload[..];

        let event = match record.command {
            ControlCommand::Hello => {
                return Err(Error::Fatal(FatalError::Handshake(
                    "unexpected HELLO after handshake completed".into(),
                )));
            }
            ControlCommand::VideoFrame => {
                let meta = VideoFrame::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                if !meta.region_in_bounds() {
                    return Err(Error::Stream {
                        channel: meta.channel,
                        stream_id: meta.stream_id,
                        source: StreamError::RegionOutOfBounds {
                            x: meta.x,
                            y: meta.y,
                            w: meta.width,
                            h: meta.height,
                            sw: meta.surf_width,
                            sh: meta.surf_height,
                        },
                    });
                }
                let channel = self.channels.get_mut(meta.channel)?;
                channel.open_video(meta);
                ConnectionEvent::VideoFrameAnnounced(meta)
            }
            ControlCommand::AudioFrame => {
                let meta = AudioFrame::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                self.channels.get_mut(meta.channel)?.open_audio(meta);
                ConnectionEvent::AudioFrameAnnounced(meta)
            }
            ControlCommand::BinaryStream => {
                let meta = BinaryStream::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                self.channels.get_mut(meta.channel)?.open_blob_announced(meta);
                if let Some(decision) = self
                    .bhandler
                    .as_deref_mut()
                    .map(|handler| handler.decide(&meta))
                {
                    if decision != BinaryDecision::Accept {
                        self.channels.get_mut(meta.channel)?.close_blob(meta.stream_id);
                        self.cancel_stream(meta.channel, meta.stream_id, StreamKind::Blob)?;
                    }
                }
                ConnectionEvent::BinaryStreamAnnounced(meta)
            }
            ControlCommand::CancelStream => {
                let cancel = CancelStream::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                if cancel.commit == CANCEL_COMMIT {
                    let channel = self.channels.get_mut(cancel.channel)?;
                    match cancel.stream_type {
                        StreamKind::Blob => {
                            channel.close_blob(cancel.stream_id);
                        }
                        StreamKind::Video => {
                            if channel.video_mut().is_some() {
                                channel.take_video();
                            }
                        }
                        StreamKind::Audio => {
                            if channel.audio_mut().is_some() {
                                channel.take_audio();
                            }
                        }
                    }
                }
                ConnectionEvent::StreamCancelled {
                    channel: cancel.channel,
                    stream_id: cancel.stream_id,
                }
            }
            ControlCommand::DirList => {
                let entry = DirEntry::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                ConnectionEvent::DirListEntry(entry)
            }
            ControlCommand::DirState => {
                let entry = DirEntry::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                ConnectionEvent::DirStateEntry(entry)
            }
            ControlCommand::DirDiscover => {
                let disco = DirDiscover::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                ConnectionEvent::DirDiscovered(disco)
            }
            ControlCommand::DirOpen => {
                let open = DirOpen::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                ConnectionEvent::DirOpenRequested(open)
            }
            ControlCommand::DirOpened => {
                let opened = DirOpened::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                ConnectionEvent::DirOpened(opened)
            }
            ControlCommand::Ping => {
                let ping = Ping::from_bytes(payload).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
                self.congestion.ack(ping.acked_stream_id);
                ConnectionEvent::Ping
            }
        };

        Ok(vec![event])
    }

    fn dispatch_event(&mut self, body: Vec<u8>) -> Result<Vec<ConnectionEvent>, Error> {
        if body.len() < EVENT_HEADER_SIZE {
            return Err(Error::Fatal(FatalError::Wire(
                meridian_wire::WireError::TooShort {
                    expected: EVENT_HEADER_SIZE,
                    actual: body.len(),
                },
            )));
        }
        let channel = body[0];
        let more = body[1] != 0;
        let len = packer::get_u16(&body[2..4]) as usize;
        let end = (EVENT_HEADER_SIZE + len).min(body.len());
        let part = &body[EVENT_HEADER_SIZE..end];

        let assembled = self
            .channels
            .get_mut(channel)?
            .message()
            .push(part, more)
            .map_err(Error::PeerReportable)?;

        Ok(match assembled {
            Some(payload) => vec![ConnectionEvent::Message { channel, payload }],
            None => Vec::new(),
        })
    }

    fn dispatch_video(&mut self, body: Vec<u8>) -> Result<Vec<ConnectionEvent>, Error> {
        let (header, chunk) =
            frame::StreamHeader::parse(&body).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;

        let completed = {
            let channel = self.channels.get_mut(header.chid)?;
            let Some(assembly) = channel.video_mut() else {
                return Ok(Vec::new());
            };
            assembly.buffer.extend_from_slice(chunk);
            if assembly.remaining() != 0 {
                return Ok(Vec::new());
            }
            channel.take_video().expect("checked above")
        };

        let meta = completed.meta;
        let previous = self
            .channels
            .get_mut(header.chid)?
            .video_prev()
            .map(<[u8]>::to_vec);

        let decoded = video::decode(
            meta.method,
            meta.format,
            meta.is_keyframe(),
            meta.expsize,
            &completed.buffer,
            previous.as_deref(),
            None,
        );

        match decoded {
            Ok(frame) => {
                if frame.becomes_baseline {
                    self.channels
                        .get_mut(header.chid)?
                        .set_video_prev(frame.pixels.clone());
                }
                Ok(vec![ConnectionEvent::VideoUpdateComplete {
                    channel: header.chid,
                    data: frame.pixels,
                }])
            }
            Err(err) => {
                let active = self.active.clone();
                let (cipher, mac) = self.encrypt_pair(&active);
                let record = ControlRecord::new(
                    ControlCommand::CancelStream,
                    &CancelStream::with_reason(
                        header.chid,
                        meta.stream_id,
                        StreamKind::Video,
                        CancelReason::DecodeError,
                    )
                    .to_bytes(),
                );
                self.outbound.push_control(&cipher, &mac, &record);
                Ok(vec![ConnectionEvent::VideoDecodeFailed {
                    channel: header.chid,
                    stream_id: meta.stream_id,
                    reason: err.to_string(),
                }])
            }
        }
    }

    fn dispatch_audio(&mut self, body: Vec<u8>) -> Result<Vec<ConnectionEvent>, Error> {
        let (header, chunk) =
            frame::StreamHeader::parse(&body).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
        let channel = self.channels.get_mut(header.chid)?;
        let Some(assembly) = channel.audio_mut() else {
            return Ok(Vec::new());
        };
        assembly.buffer.extend_from_slice(chunk);

        if assembly.buffer.len() >= assembly.expected_len() {
            let completed = channel.take_audio().expect("checked above");
            return Ok(vec![ConnectionEvent::AudioChunkComplete {
                channel: header.chid,
                data: completed.buffer,
            }]);
        }

        Ok(Vec::new())
    }

    fn dispatch_blob(&mut self, body: Vec<u8>) -> Result<Vec<ConnectionEvent>, Error> {
        let (header, chunk) =
            frame::StreamHeader::parse(&body).map_err(|e| Error::Fatal(FatalError::Wire(e)))?;
        let channel = self.channels.get_mut(header.chid)?;
        let blob = channel
            .blob_mut(header.stream_id)
            .map_err(|source| Error::Stream {
                channel: header.chid,
                stream_id: header.stream_id,
                source,
            })?;
        blob.received += chunk.len() as u64;
        let complete = blob.is_complete();
        if complete {
            channel.close_blob(header.stream_id);
        }

        Ok(vec![ConnectionEvent::BlobChunk {
            channel: header.chid,
            stream_id: header.stream_id,
            data: chunk.to_vec(),
            complete,
        }])
    }

    /// Queue an application message on `channel`, splitting it across as
    /// many fixed-size EVENT packets as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake has not yet completed.
    pub fn send_message(&mut self, channel: u8, payload: &[u8]) -> Result<(), Error> {
        if !matches!(self.step, HandshakeStep::Done) {
            return Err(Error::Fatal(FatalError::InvalidState));
        }

        let chunk_cap = self.event_size.saturating_sub(EVENT_HEADER_SIZE).max(1);
        let active = self.active.clone();
        let (cipher, mac) = self.encrypt_pair(&active);

        let mut offset = 0;
        loop {
            let remaining = payload.len() - offset;
            let take = remaining.min(chunk_cap);
            let more = offset + take < payload.len();

            let mut body = vec![0u8; self.event_size];
            body[0] = channel;
            body[1] = u8::from(more);
            packer::put_u16(&mut body[2..4], take as u16);
            body[EVENT_HEADER_SIZE..EVENT_HEADER_SIZE + take]
                .copy_from_slice(&payload[offset..offset + take]);

            self.outbound.push_event(&cipher, &mac, &body);
            offset += take;
            if !more {
                break;
            }
        }

        Ok(())
    }

    /// Encode, chunk, and queue a VIDEO announcement plus its pixel
    /// payload, recording the stream id in the congestion ring.
    ///
    /// `meta`'s `insize`/`expsize` fields are ignored on input and
    /// recomputed from the encoded body; only `channel`, `stream_id`,
    /// `method`, `format`, the surface/region geometry, and `flags` need
    /// to be filled in by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake has not yet completed,
    /// [`Error::Stream`] with [`StreamError::RegionOutOfBounds`] if the
    /// dirty rectangle does not fit the declared surface (no bytes are
    /// emitted in that case), or [`Error::Stream`] with
    /// [`StreamError::DecodeError`] if encoding fails.
    pub fn send_video_frame(
        &mut self,
        mut meta: VideoFrame,
        pixels: &[u8],
        external: Option<&mut dyn ExternalVideoCodec>,
    ) -> Result<(), Error> {
        if !matches!(self.step, HandshakeStep::Done) {
            return Err(Error::Fatal(FatalError::InvalidState));
        }
        if !meta.region_in_bounds() {
            return Err(Error::Stream {
                channel: meta.channel,
                stream_id: meta.stream_id,
                source: StreamError::RegionOutOfBounds {
                    x: meta.x,
                    y: meta.y,
                    w: meta.width,
                    h: meta.height,
                    sw: meta.surf_width,
                    sh: meta.surf_height,
                },
            });
        }

        let previous = self
            .channels
            .get_mut(meta.channel)?
            .video_prev_out()
            .map(<[u8]>::to_vec);
        let encoded = video::encode(
            meta.method,
            meta.format,
            meta.width,
            meta.height,
            meta.is_keyframe(),
            pixels,
            previous.as_deref(),
            external,
        )
        .map_err(|e| Error::Stream {
            channel: meta.channel,
            stream_id: meta.stream_id,
            source: StreamError::DecodeError(e.to_string()),
        })?;
        self.channels
            .get_mut(meta.channel)?
            .set_video_prev_out(pixels.to_vec());

        meta.insize = encoded.insize;
        meta.expsize = encoded.expsize;

        let active = self.active.clone();
        let (cipher, mac) = self.encrypt_pair(&active);
        let record = ControlRecord::new(ControlCommand::VideoFrame, &meta.to_bytes());
        self.outbound.push_control(&cipher, &mac, &record);

        for chunk in encoded.body.chunks(VIDEO_CHUNK_SIZE) {
            self.outbound.push_stream_data(
                &cipher,
                &mac,
                PacketType::Video,
                meta.channel,
                meta.stream_id,
                chunk,
            );
        }
        self.congestion.push(meta.stream_id);

        Ok(())
    }

    /// Encode, chunk, and queue an AUDIOFRAME announcement plus its PCM
    /// payload. Unlike video, audio has no codec facade or congestion
    /// tracking; the bytes go out verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake has not yet completed.
    pub fn send_audio_frame(&mut self, meta: AudioFrame, pcm: &[u8]) -> Result<(), Error> {
        if !matches!(self.step, HandshakeStep::Done) {
            return Err(Error::Fatal(FatalError::InvalidState));
        }

        let active = self.active.clone();
        let (cipher, mac) = self.encrypt_pair(&active);
        let record = ControlRecord::new(ControlCommand::AudioFrame, &meta.to_bytes());
        self.outbound.push_control(&cipher, &mac, &record);

        for chunk in pcm.chunks(VIDEO_CHUNK_SIZE) {
            self.outbound.push_stream_data(
                &cipher,
                &mac,
                PacketType::Audio,
                meta.channel,
                meta.stream_id,
                chunk,
            );
        }

        Ok(())
    }

    /// Queue a PING acknowledging video updates processed up to and
    /// including `acked_stream_id`, sliding the peer's congestion window
    /// forward.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake has not yet completed.
    pub fn send_ping(&mut self, acked_stream_id: u32) -> Result<(), Error> {
        self.send_control(ControlCommand::Ping, &Ping { acked_stream_id }.to_bytes())
    }

    /// Queue a BINARYSTREAM announcement for a forthcoming blob transfer.
    ///
    /// Used by the binary-transfer scheduler in `meridian-files` to open a
    /// substream before sending its first chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake has not yet completed.
    pub fn send_binary_stream(&mut self, header: BinaryStream) -> Result<(), Error> {
        if !matches!(self.step, HandshakeStep::Done) {
            return Err(Error::Fatal(FatalError::InvalidState));
        }

        let active = self.active.clone();
        let (cipher, mac) = self.encrypt_pair(&active);
        let record = ControlRecord::new(ControlCommand::BinaryStream, &header.to_bytes());
        self.outbound.push_control(&cipher, &mac, &record);

        Ok(())
    }

    /// Queue one chunk of an announced binary (blob) substream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake has not yet completed.
    pub fn send_blob_chunk(&mut self, channel: u8, stream_id: u32, payload: &[u8]) -> Result<(), Error> {
        if !matches!(self.step, HandshakeStep::Done) {
            return Err(Error::Fatal(FatalError::InvalidState));
        }

        let active = self.active.clone();
        let (cipher, mac) = self.encrypt_pair(&active);
        self.outbound
            .push_stream_data(&cipher, &mac, PacketType::Blob, channel, stream_id, payload);

        Ok(())
    }

    /// Queue a CANCELSTREAM for a substream this side is abandoning,
    /// whether as a sender (source read error) or a receiver (peer already
    /// has the bytes cached).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake has not yet completed.
    pub fn cancel_stream(
        &mut self,
        channel: u8,
        stream_id: u32,
        stream_type: StreamKind,
    ) -> Result<(), Error> {
        if !matches!(self.step, HandshakeStep::Done) {
            return Err(Error::Fatal(FatalError::InvalidState));
        }

        let active = self.active.clone();
        let (cipher, mac) = self.encrypt_pair(&active);
        let record = ControlRecord::new(
            ControlCommand::CancelStream,
            &CancelStream::new(channel, stream_id, stream_type).to_bytes(),
        );
        self.outbound.push_control(&cipher, &mac, &record);

        Ok(())
    }

    /// Queue an arbitrary CONTROL record, identified by its command and raw
    /// payload bytes.
    ///
    /// `meridian-directory` uses this to send `DIRLIST`/`DIRSTATE` entries,
    /// `DIRDISCOVER`, and `DIROPEN`/`DIROPENED` records without
    /// `meridian-core` needing to know anything about directory semantics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if the handshake has not yet completed or
    /// `payload` is larger than a control record can carry.
    pub fn send_control(&mut self, command: ControlCommand, payload: &[u8]) -> Result<(), Error> {
        if !matches!(self.step, HandshakeStep::Done) {
            return Err(Error::Fatal(FatalError::InvalidState));
        }
        if payload.len() > meridian_wire::control::CONTROL_PAYLOAD_SIZE {
            return Err(Error::Fatal(FatalError::InvalidState));
        }

        let active = self.active.clone();
        let (cipher, mac) = self.encrypt_pair(&active);
        let record = ControlRecord::new(command, payload);
        self.outbound.push_control(&cipher, &mac, &record);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_crypto::x25519::PrivateKey;
    use meridian_wire::control::{AudioSampleFormat, PixelFormat, VideoPostprocess};
    use rand_core::OsRng;

    const EVENT_SIZE: usize = 64;

    fn handshaken_pair() -> (Connection, Connection) {
        let psk = b"shared secret";
        let mut client = Connection::new_client(
            psk,
            PrivateKey::generate(&mut OsRng),
            EVENT_SIZE,
            Role::Source,
        )
        .unwrap();
        let mut server = Connection::new_server(
            psk,
            PrivateKey::generate(&mut OsRng),
            EVENT_SIZE,
            Role::Sink,
        );

        loop {
            let to_server = client.flush();
            if !to_server.is_empty() {
                server.feed(&to_server);
                server.poll().unwrap();
            }
            let to_client = server.flush();
            if !to_client.is_empty() {
                client.feed(&to_client);
                client.poll().unwrap();
            }
            if client.is_established() && server.is_established() && to_server.is_empty() && to_client.is_empty() {
                break;
            }
        }

        assert!(client.is_established());
        assert!(server.is_established());
        (client, server)
    }

    #[test]
    fn full_handshake_establishes_both_sides() {
        let (client, server) = handshaken_pair();
        assert_eq!(client.active.mac_key(), server.active.mac_key());
    }

    #[test]
    fn message_roundtrips_across_multiple_event_packets() {
        let (mut client, mut server) = handshaken_pair();
        let payload = vec![0xABu8; EVENT_SIZE * 3];
        client.send_message(CONTROL_CHANNEL, &payload).unwrap();

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();

        let message = events
            .into_iter()
            .find_map(|e| match e {
                ConnectionEvent::Message { channel, payload } if channel == CONTROL_CHANNEL => {
                    Some(payload)
                }
                _ => None,
            })
            .expect("message event");
        assert_eq!(message, payload);
    }

    fn sample_video_meta() -> VideoFrame {
        VideoFrame {
            channel: CONTROL_CHANNEL,
            stream_id: 1,
            method: VideoPostprocess::Raw,
            format: PixelFormat::Rgb8,
            surf_width: 2,
            surf_height: 1,
            width: 2,
            height: 1,
            x: 0,
            y: 0,
            flags: 0x01,
            insize: 0,
            expsize: 0,
            commit: 0,
        }
    }

    #[test]
    fn video_frame_roundtrips_and_tracks_congestion() {
        let (mut client, mut server) = handshaken_pair();
        let meta = sample_video_meta();
        let pixels = vec![7u8; 6];
        client.send_video_frame(meta, &pixels, None).unwrap();
        assert_eq!(client.video_backpressure(), 1);

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();

        let data = events
            .into_iter()
            .find_map(|e| match e {
                ConnectionEvent::VideoUpdateComplete { data, .. } => Some(data),
                _ => None,
            })
            .expect("completed video update");
        assert_eq!(data, pixels);

        client.ack_video(1);
        assert_eq!(client.video_backpressure(), 0);
    }

    #[test]
    fn audio_frame_roundtrips() {
        let (mut client, mut server) = handshaken_pair();
        let meta = AudioFrame {
            channel: CONTROL_CHANNEL,
            stream_id: 9,
            channels: 1,
            format: AudioSampleFormat::S16Le,
            sample_rate: 8000,
            nsamples: 2,
        };
        let active = client.active.clone();
        let (cipher, mac) = client.encrypt_pair(&active);
        let record = ControlRecord::new(ControlCommand::AudioFrame, &meta.to_bytes());
        client.outbound.push_control(&cipher, &mac, &record);
        let pcm = [1u8, 2, 3, 4];
        client
            .outbound
            .push_stream_data(&cipher, &mac, PacketType::Audio, meta.channel, meta.stream_id, &pcm);

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();

        let data = events
            .into_iter()
            .find_map(|e| match e {
                ConnectionEvent::AudioChunkComplete { data, .. } => Some(data),
                _ => None,
            })
            .expect("completed audio chunk");
        assert_eq!(data, pcm);
    }

    #[test]
    fn binary_stream_cancel_clears_assembly() {
        let (mut client, mut server) = handshaken_pair();
        let meta = BinaryStream {
            channel: CONTROL_CHANNEL,
            stream_id: 3,
            size: 100,
            ..Default::default()
        };
        let active = client.active.clone();
        let (cipher, mac) = client.encrypt_pair(&active);
        let record = ControlRecord::new(ControlCommand::BinaryStream, &meta.to_bytes());
        client.outbound.push_control(&cipher, &mac, &record);
        let wire = client.flush();
        server.feed(&wire);
        server.poll().unwrap();
        assert!(server
            .channels
            .get_mut(CONTROL_CHANNEL)
            .unwrap()
            .blob_mut(3)
            .is_ok());

        let cancel = CancelStream::new(CONTROL_CHANNEL, 3, StreamKind::Blob);
        let record = ControlRecord::new(ControlCommand::CancelStream, &cancel.to_bytes());
        client.outbound.push_control(&cipher, &mac, &record);
        let wire = client.flush();
        server.feed(&wire);
        server.poll().unwrap();
        assert!(server
            .channels
            .get_mut(CONTROL_CHANNEL)
            .unwrap()
            .blob_mut(3)
            .is_err());
    }

    #[test]
    fn send_video_frame_rejects_out_of_bounds_region_without_sending() {
        let (mut client, _server) = handshaken_pair();
        let mut meta = sample_video_meta();
        meta.width = 5;
        let pixels = vec![0u8; 6];
        let err = client.send_video_frame(meta, &pixels, None).unwrap_err();
        assert!(matches!(
            err,
            Error::Stream {
                source: StreamError::RegionOutOfBounds { .. },
                ..
            }
        ));
        assert!(client.flush().is_empty());
        assert_eq!(client.video_backpressure(), 0);
    }

    #[test]
    fn delta_zstd_video_frame_roundtrips_and_tracks_baseline() {
        let (mut client, mut server) = handshaken_pair();
        let mut meta = sample_video_meta();
        meta.method = VideoPostprocess::DeltaZstd;
        let keyframe = vec![3u8; 6];
        client.send_video_frame(meta, &keyframe, None).unwrap();

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();
        let data = events
            .into_iter()
            .find_map(|e| match e {
                ConnectionEvent::VideoUpdateComplete { data, .. } => Some(data),
                _ => None,
            })
            .expect("completed keyframe update");
        assert_eq!(data, keyframe);

        meta.flags = 0;
        meta.stream_id = 2;
        let mut delta = keyframe.clone();
        delta[0] ^= 0xFF;
        client.send_video_frame(meta, &delta, None).unwrap();

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();
        let data = events
            .into_iter()
            .find_map(|e| match e {
                ConnectionEvent::VideoUpdateComplete { data, .. } => Some(data),
                _ => None,
            })
            .expect("completed delta update");
        assert_eq!(data, delta);
    }

    #[test]
    fn undecodable_h264_update_triggers_cancel_and_event() {
        let (mut client, mut server) = handshaken_pair();
        let mut meta = sample_video_meta();
        meta.method = VideoPostprocess::H264;
        meta.insize = 4;
        meta.expsize = 4;
        let active = client.active.clone();
        let (cipher, mac) = client.encrypt_pair(&active);
        let record = ControlRecord::new(ControlCommand::VideoFrame, &meta.to_bytes());
        client.outbound.push_control(&cipher, &mac, &record);
        client.outbound.push_stream_data(
            &cipher,
            &mac,
            PacketType::Video,
            meta.channel,
            meta.stream_id,
            &[0u8; 4],
        );

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::VideoDecodeFailed { stream_id, .. } if *stream_id == meta.stream_id
        )));

        let wire = server.flush();
        client.feed(&wire);
        let events = client.poll().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::StreamCancelled { stream_id, .. } if *stream_id == meta.stream_id
        )));
    }

    #[test]
    fn binary_stream_on_unopened_channel_is_rejected_by_receiver() {
        let (mut client, mut server) = handshaken_pair();
        assert!(!server.is_channel_open(1));

        client
            .send_binary_stream(BinaryStream { channel: 1, stream_id: 7, size: 4, ..Default::default() })
            .unwrap();
        let wire = client.flush();
        server.feed(&wire);
        let err = server.poll().unwrap_err();
        assert!(matches!(
            err,
            Error::Stream { channel: 1, source: StreamError::UnknownChannel, .. }
        ));
    }

    #[test]
    fn open_channel_allows_binary_transfer_then_close_channel_rejects_it_again() {
        let (mut client, mut server) = handshaken_pair();
        client.open_channel(1);
        server.open_channel(1);
        assert!(client.is_channel_open(1));
        assert!(server.is_channel_open(1));

        client
            .send_binary_stream(BinaryStream { channel: 1, stream_id: 7, size: 4, ..Default::default() })
            .unwrap();
        client.send_blob_chunk(1, 7, &[1, 2, 3, 4]).unwrap();

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::BlobChunk { channel: 1, stream_id: 7, complete: true, .. }
        )));

        server.close_channel(1);
        assert!(!server.is_channel_open(1));

        client
            .send_binary_stream(BinaryStream { channel: 1, stream_id: 8, size: 4, ..Default::default() })
            .unwrap();
        let wire = client.flush();
        server.feed(&wire);
        let err = server.poll().unwrap_err();
        assert!(matches!(
            err,
            Error::Stream { channel: 1, source: StreamError::UnknownChannel, .. }
        ));
    }

    #[test]
    fn send_audio_frame_roundtrips() {
        let (mut client, mut server) = handshaken_pair();
        let meta = AudioFrame {
            channel: CONTROL_CHANNEL,
            stream_id: 11,
            channels: 1,
            format: AudioSampleFormat::S16Le,
            sample_rate: 8000,
            nsamples: 2,
        };
        let pcm = [5u8, 6, 7, 8];
        client.send_audio_frame(meta, &pcm).unwrap();

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();

        let data = events
            .into_iter()
            .find_map(|e| match e {
                ConnectionEvent::AudioChunkComplete { data, .. } => Some(data),
                _ => None,
            })
            .expect("completed audio chunk");
        assert_eq!(data, pcm);
    }

    #[test]
    fn send_ping_acks_peer_congestion_ring_over_the_wire() {
        let (mut client, mut server) = handshaken_pair();
        let meta = sample_video_meta();
        let pixels = vec![7u8; 6];
        client.send_video_frame(meta, &pixels, None).unwrap();
        assert_eq!(client.video_backpressure(), 1);

        let wire = client.flush();
        server.feed(&wire);
        server.poll().unwrap();

        server.send_ping(meta.stream_id).unwrap();
        let wire = server.flush();
        client.feed(&wire);
        client.poll().unwrap();

        assert_eq!(client.video_backpressure(), 0);
    }

    #[test]
    fn incompatible_roles_fail_two_round_handshake() {
        let psk = b"shared secret";
        let mut client = Connection::new_client(
            psk,
            PrivateKey::generate(&mut OsRng),
            EVENT_SIZE,
            Role::Source,
        )
        .unwrap();
        let mut server = Connection::new_server(
            psk,
            PrivateKey::generate(&mut OsRng),
            EVENT_SIZE,
            Role::Source,
        );

        let to_server = client.flush();
        server.feed(&to_server);
        server.poll().unwrap();

        let to_client = server.flush();
        client.feed(&to_client);
        let err = client.poll().unwrap_err();
        assert!(matches!(err, Error::Fatal(FatalError::Handshake(_))));
    }

    struct FixedResolver {
        keys: HandshakeKeys,
    }

    impl AuthResolver for FixedResolver {
        fn resolve(&mut self, _remote_identity: &PublicKey) -> Option<HandshakeKeys> {
            Some(self.keys.clone())
        }
    }

    #[test]
    fn single_round_handshake_establishes_both_sides() {
        let keys = HandshakeKeys::derive_greeting(b"single-round test secret");
        let server_identity = PrivateKey::generate(&mut OsRng);
        let server_public = server_identity.public_key();
        let client_identity = PrivateKey::generate(&mut OsRng);

        let mut client = Connection::new_client_single_round(
            client_identity,
            Role::Source,
            server_public,
            &mut FixedResolver { keys: keys.clone() },
            EVENT_SIZE,
        )
        .unwrap();
        assert!(client.is_established());

        let mut server =
            Connection::new_server_single_round(Role::Sink, Box::new(FixedResolver { keys }), EVENT_SIZE);
        assert!(!server.is_established());

        let wire = client.flush();
        server.feed(&wire);
        let events = server.poll().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::HandshakeComplete { .. })));
        assert!(server.is_established());
    }

    #[test]
    fn single_round_handshake_rejects_incompatible_roles() {
        let keys = HandshakeKeys::derive_greeting(b"single-round test secret");
        let server_identity = PrivateKey::generate(&mut OsRng);
        let server_public = server_identity.public_key();
        let client_identity = PrivateKey::generate(&mut OsRng);

        let mut client = Connection::new_client_single_round(
            client_identity,
            Role::Sink,
            server_public,
            &mut FixedResolver { keys: keys.clone() },
            EVENT_SIZE,
        )
        .unwrap();
        let mut server =
            Connection::new_server_single_round(Role::Sink, Box::new(FixedResolver { keys }), EVENT_SIZE);

        let wire = client.flush();
        server.feed(&wire);
        let err = server.poll().unwrap_err();
        assert!(matches!(err, Error::Fatal(FatalError::Handshake(_))));
    }

    struct RejectingBhandler;

    impl crate::collaborators::BinaryHandler for RejectingBhandler {
        fn decide(&mut self, _announced: &BinaryStream) -> crate::collaborators::BinaryDecision {
            crate::collaborators::BinaryDecision::DontWant
        }
    }

    #[test]
    fn bhandler_dont_want_auto_cancels_announced_stream() {
        let (mut client, mut server) = handshaken_pair();
        server.set_bhandler(Some(Box::new(RejectingBhandler)));

        client
            .send_binary_stream(BinaryStream {
                channel: CONTROL_CHANNEL,
                stream_id: 9,
                size: 4096,
                ..Default::default()
            })
            .unwrap();
        server.feed(&client.flush());
        server.poll().unwrap();

        assert!(server
            .channels
            .get_mut(CONTROL_CHANNEL)
            .unwrap()
            .blob_mut(9)
            .is_err());

        // The auto-CANCELSTREAM server queued must reach the client.
        client.feed(&server.flush());
        let events = client.poll().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::StreamCancelled { stream_id: 9, .. })));
    }

    struct RecordingAuthComplete {
        seen: std::sync::Arc<std::sync::Mutex<Vec<[u8; 32]>>>,
    }

    impl AuthCompleteHandler for RecordingAuthComplete {
        fn on_auth(&mut self, peer_identity: [u8; 32]) {
            self.seen.lock().unwrap().push(peer_identity);
        }
    }

    #[test]
    fn auth_complete_handler_fires_once_handshake_reaches_full_pk() {
        let psk = b"auth complete handler test";
        let client_identity = PrivateKey::generate(&mut OsRng);
        let server_identity = PrivateKey::generate(&mut OsRng);
        let client_public = client_identity.public_key();

        let mut client =
            Connection::new_client(psk, client_identity, EVENT_SIZE, Role::Source).unwrap();
        let mut server = Connection::new_server(psk, server_identity, EVENT_SIZE, Role::Sink);

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        server.set_auth_complete_handler(Some(Box::new(RecordingAuthComplete {
            seen: seen.clone(),
        })));

        loop {
            let to_server = client.flush();
            if !to_server.is_empty() {
                server.feed(&to_server);
                server.poll().unwrap();
            }
            let to_client = server.flush();
            if !to_client.is_empty() {
                client.feed(&to_client);
                client.poll().unwrap();
            }
            if client.is_established() && server.is_established() && to_server.is_empty() && to_client.is_empty() {
                break;
            }
        }

        assert_eq!(seen.lock().unwrap().as_slice(), [*client_public.as_bytes()]);
    }

    struct CollectingSink {
        chunks: Vec<(u8, Vec<u8>)>,
    }

    impl SinkCallback for CollectingSink {
        fn sink(&mut self, channel: u8, data: &[u8]) -> bool {
            self.chunks.push((channel, data.to_vec()));
            true
        }
    }

    #[test]
    fn flush_with_sink_hands_queued_bytes_to_the_sink() {
        let (mut client, _server) = handshaken_pair();
        client.send_message(CONTROL_CHANNEL, b"hi").unwrap();

        let mut sink = CollectingSink { chunks: Vec::new() };
        assert!(client.flush_with_sink(CONTROL_CHANNEL, &mut sink));
        assert_eq!(sink.chunks.len(), 1);
        assert_eq!(sink.chunks[0].0, CONTROL_CHANNEL);
        assert!(!sink.chunks[0].1.is_empty());
        assert!(client.flush().is_empty());
    }

    struct CollectingEventSink {
        events: Vec<String>,
    }

    impl EventSink for CollectingEventSink {
        fn on_event(&mut self, event: &ConnectionEvent) {
            self.events.push(format!("{event:?}"));
        }
    }

    #[test]
    fn poll_into_pushes_each_decoded_event_to_the_sink() {
        let (mut client, mut server) = handshaken_pair();
        client.send_message(CONTROL_CHANNEL, b"push me").unwrap();
        server.feed(&client.flush());

        let mut sink = CollectingEventSink { events: Vec::new() };
        server.poll_into(&mut sink).unwrap();
        assert!(sink.events.iter().any(|e| e.contains("Message")));
    }
}
