//! Fixed-size CONTROL records.
//!
//! Every CONTROL packet body is exactly [`CONTROL_PACKET_SIZE`] bytes: a
//! one-byte command tag followed by a command-specific, zero-padded
//! payload. Fixing the size means a CONTROL packet never needs a length
//! prefix and the decoder can always read it in one shot once the outer
//! header has been stripped.

use crate::error::WireError;
use crate::frame::CONTROL_PACKET_SIZE;
use crate::packer;

/// Width of the payload following the one-byte command tag.
pub const CONTROL_PAYLOAD_SIZE: usize = CONTROL_PACKET_SIZE - 1;

/// Command tag carried by the first byte of a CONTROL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCommand {
    /// Handshake message (ephemeral or real key exchange round).
    Hello = 0,
    /// Announces an upcoming video substream.
    VideoFrame = 1,
    /// Announces an upcoming audio substream.
    AudioFrame = 2,
    /// Announces an upcoming binary (blob) substream.
    BinaryStream = 3,
    /// Aborts an in-progress substream.
    CancelStream = 4,
    /// Full appl-directory snapshot.
    DirList = 5,
    /// Incremental appl-directory update.
    DirState = 6,
    /// Announces this endpoint under a petname.
    DirDiscover = 7,
    /// Requests a dynamic resource be opened.
    DirOpen = 8,
    /// Answers a [`ControlCommand::DirOpen`] request.
    DirOpened = 9,
    /// Keepalive / liveness probe.
    Ping = 10,
}

impl TryFrom<u8> for ControlCommand {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::VideoFrame),
            2 => Ok(Self::AudioFrame),
            3 => Ok(Self::BinaryStream),
            4 => Ok(Self::CancelStream),
            5 => Ok(Self::DirList),
            6 => Ok(Self::DirState),
            7 => Ok(Self::DirDiscover),
            8 => Ok(Self::DirOpen),
            9 => Ok(Self::DirOpened),
            10 => Ok(Self::Ping),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// A CONTROL record: tag byte plus the fixed payload window.
pub struct ControlRecord {
    /// The command this record carries.
    pub command: ControlCommand,
    /// Raw, zero-padded payload bytes (always [`CONTROL_PAYLOAD_SIZE`] long).
    pub payload: [u8; CONTROL_PAYLOAD_SIZE],
}

impl ControlRecord {
    /// Build a record from a command tag and a payload shorter than
    /// [`CONTROL_PAYLOAD_SIZE`]; the remainder is zero-padded.
    #[must_use]
    pub fn new(command: ControlCommand, body: &[u8]) -> Self {
        let mut payload = [0u8; CONTROL_PAYLOAD_SIZE];
        payload[..body.len()].copy_from_slice(body);
        Self { command, payload }
    }

    /// Serialize into exactly [`CONTROL_PACKET_SIZE`] bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CONTROL_PACKET_SIZE] {
        let mut out = [0u8; CONTROL_PACKET_SIZE];
        out[0] = self.command as u8;
        out[1..].copy_from_slice(&self.payload);
        out
    }

    /// Parse a CONTROL record from an exact [`CONTROL_PACKET_SIZE`]-byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if `data` is not exactly
    /// [`CONTROL_PACKET_SIZE`] bytes, or [`WireError::UnknownPacketType`]
    /// if the tag byte is not a known [`ControlCommand`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != CONTROL_PACKET_SIZE {
            return Err(WireError::TooShort {
                expected: CONTROL_PACKET_SIZE,
                actual: data.len(),
            });
        }
        let command = ControlCommand::try_from(data[0])?;
        let mut payload = [0u8; CONTROL_PAYLOAD_SIZE];
        payload.copy_from_slice(&data[1..]);
        Ok(Self { command, payload })
    }
}

/// Which handshake flow a HELLO is carried under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeMode {
    /// Ephemeral-then-real, four-message exchange (the default).
    TwoRound = 0,
    /// A single HELLO carrying the sender's real key, authenticated by a
    /// peer-side identity resolver rather than an ephemeral exchange.
    SingleRound = 1,
}

impl TryFrom<u8> for HandshakeMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::TwoRound),
            1 => Ok(Self::SingleRound),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Handshake message payload: version, mode, a Curve25519 public key for
/// this round, and the sender's connection role.
///
/// Used for every round of both handshake flows; which round a given
/// HELLO belongs to is tracked by connection state, not the wire payload
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Protocol major version the sender speaks.
    pub vmajor: u8,
    /// Protocol minor version the sender speaks.
    pub vminor: u8,
    /// Which handshake flow this HELLO belongs to.
    pub mode: HandshakeMode,
    /// The sender's public key for this round.
    pub pubkey: [u8; 32],
    /// The sender's connection role (source/sink/probe/directory).
    pub role: Role,
}

impl Hello {
    const LEN: usize = 1 + 1 + 1 + 32 + 1;

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.vmajor;
        buf[1] = self.vminor;
        buf[2] = self.mode as u8;
        buf[3..35].copy_from_slice(&self.pubkey);
        buf[35] = self.role as u8;
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available, or an unknown-tag error if `mode` or `role` is invalid.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&data[3..35]);
        Ok(Self {
            vmajor: data[0],
            vminor: data[1],
            mode: HandshakeMode::try_from(data[2])?,
            pubkey,
            role: Role::try_from(data[35])?,
        })
    }
}

/// Keepalive payload, carrying the newest video stream id this side has
/// finished processing so the peer's congestion ring can slide forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping {
    /// Stream id of the newest video update this side has consumed.
    pub acked_stream_id: u32,
}

impl Ping {
    const LEN: usize = 4;

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        packer::put_u32(&mut buf, self.acked_stream_id);
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            acked_stream_id: packer::get_u32(&data[0..4]),
        })
    }
}

/// Post-processing method applied to a video substream's pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoPostprocess {
    /// Verbatim RGBA/RGB/RGB565 bytes, possibly spanning packet boundaries.
    Raw = 0,
    /// Zstd-compressed keyframe or XOR delta against the previous frame.
    DeltaZstd = 1,
    /// Zstd-compressed verbatim terminal cell buffer.
    TerminalPackZstd = 2,
    /// Externally decoded H.264 access unit.
    H264 = 3,
}

impl TryFrom<u8> for VideoPostprocess {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::DeltaZstd),
            2 => Ok(Self::TerminalPackZstd),
            3 => Ok(Self::H264),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Raw pixel layout, meaningful only when [`VideoPostprocess::Raw`] is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PixelFormat {
    /// 4 bytes per pixel, red-green-blue-alpha.
    Rgba8 = 0,
    /// 3 bytes per pixel, red-green-blue.
    Rgb8 = 1,
    /// 2 bytes per pixel, 5-6-5 packed.
    Rgb565 = 2,
}

impl TryFrom<u8> for PixelFormat {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Rgba8),
            1 => Ok(Self::Rgb8),
            2 => Ok(Self::Rgb565),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Sentinel `commit` value meaning "this update was discarded after a
/// decode failure", mirroring [`CANCEL_COMMIT`] for the video path.
pub const VIDEO_DISCARD_COMMIT: u8 = 255;

/// Announces a video substream and the dirty rectangle it updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrame {
    /// Channel the substream belongs to.
    pub channel: u8,
    /// Stream id, unique within the channel for this substream's lifetime.
    pub stream_id: u32,
    /// How the pixel bytes that follow are encoded.
    pub method: VideoPostprocess,
    /// Pixel layout (only meaningful for [`VideoPostprocess::Raw`]).
    pub format: PixelFormat,
    /// Source surface width, in pixels.
    pub surf_width: u16,
    /// Source surface height, in pixels.
    pub surf_height: u16,
    /// Updated region width, in pixels.
    pub width: u16,
    /// Updated region height, in pixels.
    pub height: u16,
    /// Updated region left offset, in pixels.
    pub x: u16,
    /// Updated region top offset, in pixels.
    pub y: u16,
    /// Bit 0: this update is a keyframe / full commit rather than a delta.
    pub flags: u8,
    /// Compressed (on-the-wire) byte size of the body that follows.
    pub insize: u32,
    /// Expanded (decompressed) byte size the body must produce.
    pub expsize: u32,
    /// Commit marker; [`VIDEO_DISCARD_COMMIT`] if the sender already knows
    /// this update must be discarded.
    pub commit: u8,
}

impl VideoFrame {
    const LEN: usize = 1 + 4 + 1 + 1 + 2 + 2 + 2 + 2 + 2 + 2 + 1 + 4 + 4 + 1;

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.channel;
        packer::put_u32(&mut buf[1..5], self.stream_id);
        buf[5] = self.method as u8;
        buf[6] = self.format as u8;
        packer::put_u16(&mut buf[7..9], self.surf_width);
        packer::put_u16(&mut buf[9..11], self.surf_height);
        packer::put_u16(&mut buf[11..13], self.width);
        packer::put_u16(&mut buf[13..15], self.height);
        packer::put_u16(&mut buf[15..17], self.x);
        packer::put_u16(&mut buf[17..19], self.y);
        buf[19] = self.flags;
        packer::put_u32(&mut buf[20..24], self.insize);
        packer::put_u32(&mut buf[24..28], self.expsize);
        buf[28] = self.commit;
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available, or an unknown-tag error if `method`/`format` are invalid.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            channel: data[0],
            stream_id: packer::get_u32(&data[1..5]),
            method: VideoPostprocess::try_from(data[5])?,
            format: PixelFormat::try_from(data[6])?,
            surf_width: packer::get_u16(&data[7..9]),
            surf_height: packer::get_u16(&data[9..11]),
            width: packer::get_u16(&data[11..13]),
            height: packer::get_u16(&data[13..15]),
            x: packer::get_u16(&data[15..17]),
            y: packer::get_u16(&data[17..19]),
            flags: data[19],
            insize: packer::get_u32(&data[20..24]),
            expsize: packer::get_u32(&data[24..28]),
            commit: data[28],
        })
    }

    /// Whether bit 0 of `flags` (keyframe/full commit) is set.
    #[must_use]
    pub fn is_keyframe(&self) -> bool {
        self.flags & 0x01 != 0
    }

    /// Whether the dirty rectangle `(x, y, width, height)` fits inside the
    /// declared source surface.
    #[must_use]
    pub fn region_in_bounds(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.saturating_add(self.width) <= self.surf_width
            && self.y.saturating_add(self.height) <= self.surf_height
    }
}

/// PCM sample encoding for an audio substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AudioSampleFormat {
    /// Signed 16-bit little-endian PCM.
    S16Le = 0,
    /// 32-bit IEEE-754 float PCM.
    F32Le = 1,
}

impl TryFrom<u8> for AudioSampleFormat {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::S16Le),
            1 => Ok(Self::F32Le),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Announces an audio substream's chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrame {
    /// Channel the substream belongs to.
    pub channel: u8,
    /// Stream id, unique within the channel for this substream's lifetime.
    pub stream_id: u32,
    /// Number of interleaved channels.
    pub channels: u8,
    /// Sample encoding of the PCM data that follows.
    pub format: AudioSampleFormat,
    /// Sample rate, in Hz.
    pub sample_rate: u32,
    /// Number of samples per channel carried by the following data.
    pub nsamples: u16,
}

impl AudioFrame {
    const LEN: usize = 1 + 4 + 1 + 1 + 4 + 2;

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.channel;
        packer::put_u32(&mut buf[1..5], self.stream_id);
        buf[5] = self.channels;
        buf[6] = self.format as u8;
        packer::put_u32(&mut buf[7..11], self.sample_rate);
        packer::put_u16(&mut buf[11..13], self.nsamples);
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available, or an unknown-tag error if `format` is invalid.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            channel: data[0],
            stream_id: packer::get_u32(&data[1..5]),
            channels: data[5],
            format: AudioSampleFormat::try_from(data[6])?,
            sample_rate: packer::get_u32(&data[7..11]),
            nsamples: packer::get_u16(&data[11..13]),
        })
    }
}

/// Announces a binary (blob) substream about to begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinaryStream {
    /// Channel the substream belongs to.
    pub channel: u8,
    /// Stream id, unique within the channel for this substream's lifetime.
    pub stream_id: u32,
    /// Total byte size, or 0 when the size is not known up front (streaming).
    pub size: u64,
    /// Application-level subtype of this transfer (file, clipboard, appl
    /// package, ...); an opaque tag the core does not interpret.
    pub stream_type: u8,
    /// Identifier token echoed back on completion so the sender can match
    /// the acking PING to this transfer.
    pub ident: u32,
    /// Content checksum of the full transfer, letting a receiver that
    /// already holds this data reject it as cached instead of re-reading it.
    pub checksum: [u8; 16],
    /// Whether the body bytes are zstd-compressed on the wire.
    pub compressed: bool,
    /// Optional external identifier correlating this transfer with state
    /// outside this connection; all-zero when unused.
    pub extid: [u8; 16],
}

impl BinaryStream {
    const LEN: usize = 1 + 4 + 8 + 1 + 4 + 16 + 1 + 16;

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.channel;
        packer::put_u32(&mut buf[1..5], self.stream_id);
        packer::put_u64(&mut buf[5..13], self.size);
        buf[13] = self.stream_type;
        packer::put_u32(&mut buf[14..18], self.ident);
        buf[18..34].copy_from_slice(&self.checksum);
        buf[34] = u8::from(self.compressed);
        buf[35..51].copy_from_slice(&self.extid);
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&data[18..34]);
        let mut extid = [0u8; 16];
        extid.copy_from_slice(&data[35..51]);
        Ok(Self {
            channel: data[0],
            stream_id: packer::get_u32(&data[1..5]),
            size: packer::get_u64(&data[5..13]),
            stream_type: data[13],
            ident: packer::get_u32(&data[14..18]),
            checksum,
            compressed: data[34] != 0,
            extid,
        })
    }

    /// Whether this announces a size-unknown streaming transfer.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.size == 0
    }
}

/// Sentinel commit value meaning "substream was cancelled, not completed".
pub const CANCEL_COMMIT: u8 = 255;

/// Which substream kind a [`CancelStream`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    /// A video substream.
    Video = 0,
    /// An audio substream.
    Audio = 1,
    /// A binary (blob) substream.
    Blob = 2,
}

impl TryFrom<u8> for StreamKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Video),
            1 => Ok(Self::Audio),
            2 => Ok(Self::Blob),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Why a substream was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancelReason {
    /// Plain cancellation: the sender gave up, or the receiver already has
    /// the data cached.
    Requested = 0,
    /// The receiver's codec could not decode what it was given; the sender
    /// should downgrade to a fallback codec for subsequent updates.
    DecodeError = 1,
}

impl TryFrom<u8> for CancelReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Requested),
            1 => Ok(Self::DecodeError),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Aborts an in-progress substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelStream {
    /// Channel the substream belongs to.
    pub channel: u8,
    /// Stream id being cancelled.
    pub stream_id: u32,
    /// Which kind of substream this cancel refers to.
    pub stream_type: StreamKind,
    /// Why the substream is being cancelled.
    pub reason: CancelReason,
    /// Commit marker; always [`CANCEL_COMMIT`] for a genuine cancel.
    pub commit: u8,
}

impl CancelStream {
    const LEN: usize = 1 + 4 + 1 + 1 + 1;

    /// Build a cancel record for `channel`/`stream_id` with
    /// [`CancelReason::Requested`] and the standard cancel commit marker.
    #[must_use]
    pub fn new(channel: u8, stream_id: u32, stream_type: StreamKind) -> Self {
        Self::with_reason(channel, stream_id, stream_type, CancelReason::Requested)
    }

    /// Build a cancel record with an explicit [`CancelReason`].
    #[must_use]
    pub fn with_reason(
        channel: u8,
        stream_id: u32,
        stream_type: StreamKind,
        reason: CancelReason,
    ) -> Self {
        Self {
            channel,
            stream_id,
            stream_type,
            reason,
            commit: CANCEL_COMMIT,
        }
    }

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.channel;
        packer::put_u32(&mut buf[1..5], self.stream_id);
        buf[5] = self.reason as u8;
        buf[6] = self.stream_type as u8;
        buf[7] = self.commit;
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available, or an unknown-tag error if `reason`/`stream_type` are
    /// invalid.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            channel: data[0],
            stream_id: packer::get_u32(&data[1..5]),
            reason: CancelReason::try_from(data[5])?,
            stream_type: StreamKind::try_from(data[6])?,
            commit: data[7],
        })
    }
}

/// Maximum length of a directory entry's display name.
pub const DIR_ENTRY_NAME_LEN: usize = 17;

/// Maximum length of a directory entry's short description.
pub const DIR_ENTRY_DESC_LEN: usize = 32;

/// A single entry in the appl directory, as carried by DIRLIST/DIRSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// Directory-assigned identifier, stable across DIRSTATE deltas.
    pub id: u16,
    /// Category bitfield (e.g. game / tool / service).
    pub category: u32,
    /// Permission bitfield the entry requests or grants.
    pub permissions: u32,
    /// Truncated content hash, used to detect changed entries.
    pub hash: [u8; 4],
    /// Size of the associated appl package, in bytes.
    pub size: u64,
    /// Display name, NUL-padded, at most [`DIR_ENTRY_NAME_LEN`] bytes.
    pub name: [u8; DIR_ENTRY_NAME_LEN],
    /// Short human-readable description, NUL-padded.
    pub short_desc: [u8; DIR_ENTRY_DESC_LEN],
    /// Last-modified timestamp (Unix seconds).
    pub timestamp: u64,
}

impl DirEntry {
    const LEN: usize = 2 + 4 + 4 + 4 + 8 + DIR_ENTRY_NAME_LEN + DIR_ENTRY_DESC_LEN + 8;

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::LEN];
        packer::put_u16(&mut buf[0..2], self.id);
        packer::put_u32(&mut buf[2..6], self.category);
        packer::put_u32(&mut buf[6..10], self.permissions);
        buf[10..14].copy_from_slice(&self.hash);
        packer::put_u64(&mut buf[14..22], self.size);
        buf[22..22 + DIR_ENTRY_NAME_LEN].copy_from_slice(&self.name);
        let desc_start = 22 + DIR_ENTRY_NAME_LEN;
        buf[desc_start..desc_start + DIR_ENTRY_DESC_LEN].copy_from_slice(&self.short_desc);
        let ts_start = desc_start + DIR_ENTRY_DESC_LEN;
        packer::put_u64(&mut buf[ts_start..ts_start + 8], self.timestamp);
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut hash = [0u8; 4];
        hash.copy_from_slice(&data[10..14]);
        let mut name = [0u8; DIR_ENTRY_NAME_LEN];
        name.copy_from_slice(&data[22..22 + DIR_ENTRY_NAME_LEN]);
        let desc_start = 22 + DIR_ENTRY_NAME_LEN;
        let mut short_desc = [0u8; DIR_ENTRY_DESC_LEN];
        short_desc.copy_from_slice(&data[desc_start..desc_start + DIR_ENTRY_DESC_LEN]);
        let ts_start = desc_start + DIR_ENTRY_DESC_LEN;
        Ok(Self {
            id: packer::get_u16(&data[0..2]),
            category: packer::get_u32(&data[2..6]),
            permissions: packer::get_u32(&data[6..10]),
            hash,
            size: packer::get_u64(&data[14..22]),
            name,
            short_desc,
            timestamp: packer::get_u64(&data[ts_start..ts_start + 8]),
        })
    }
}

/// Maximum length of a sanitized petname (`[A-Za-z0-9_]{1,16}`).
pub const PETNAME_LEN: usize = 16;

/// A connection's role, carried on the wire both in HELLO (handshake
/// compatibility) and DIRDISCOVER (petname announcements).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    /// Offers appls for others to pull.
    Source = 1,
    /// Consumes appls from a source.
    Sink = 2,
    /// Health/reachability probe only, no appl traffic.
    Probe = 3,
    /// A directory itself, discoverable by other directories.
    Directory = 4,
}

impl TryFrom<u8> for Role {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Source),
            2 => Ok(Self::Sink),
            3 => Ok(Self::Probe),
            4 => Ok(Self::Directory),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Announces this endpoint to its peer under a short, sanitized name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirDiscover {
    /// Role the announcing endpoint plays.
    pub role: Role,
    /// Whether this is an addition (`true`) or a withdrawal (`false`).
    pub added: bool,
    /// Number of significant bytes in `petname` (1..=[`PETNAME_LEN`]).
    pub petname_len: u8,
    /// NUL-padded petname bytes, already restricted to `[A-Za-z0-9_]`.
    pub petname: [u8; PETNAME_LEN],
    /// The announcing endpoint's real, durable public key.
    pub pubkey: [u8; 32],
}

impl DirDiscover {
    const LEN: usize = 1 + 1 + 1 + PETNAME_LEN + 32;

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.role as u8;
        buf[1] = u8::from(self.added);
        buf[2] = self.petname_len;
        buf[3..3 + PETNAME_LEN].copy_from_slice(&self.petname);
        buf[3 + PETNAME_LEN..].copy_from_slice(&self.pubkey);
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available, or an unknown-tag error if `role` is invalid.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut petname = [0u8; PETNAME_LEN];
        petname.copy_from_slice(&data[3..3 + PETNAME_LEN]);
        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&data[3 + PETNAME_LEN..Self::LEN]);
        Ok(Self {
            role: Role::try_from(data[0])?,
            added: data[1] != 0,
            petname_len: data[2],
            petname,
            pubkey,
        })
    }
}

/// Transport a [`DirOpened`] reply describes, or (for the two reserved
/// variants above [`Self::Tunnel`]) a failure outcome in place of a
/// connection descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DirProto {
    /// Connect out over IPv4.
    Ipv4 = 1,
    /// Connect out over IPv6.
    Ipv6 = 2,
    /// Resolve a hostname before connecting.
    Name = 3,
    /// Relay over a directory-mediated tunnel channel; the channel id
    /// rides in the low byte of [`DirOpened::port`].
    Tunnel = 4,
    /// The peer's directory refused the request. Valid only in a
    /// [`DirOpened`] reply.
    Refused = 5,
    /// The requested resource could not be reached. Valid only in a
    /// [`DirOpened`] reply.
    Unreachable = 6,
}

impl TryFrom<u8> for DirProto {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ipv4),
            2 => Ok(Self::Ipv6),
            3 => Ok(Self::Name),
            4 => Ok(Self::Tunnel),
            5 => Ok(Self::Refused),
            6 => Ok(Self::Unreachable),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Width of the host field in a [`DirOpened`] connection descriptor.
pub const DIR_OPENED_HOST_LEN: usize = 46;

/// Width of the opaque auth-token field in a [`DirOpened`] connection
/// descriptor.
pub const DIR_OPENED_AUTHK_LEN: usize = 12;

/// Which kind of dynamic-resource request this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DirOpenMode {
    /// A direct connection is acceptable.
    Direct = 0,
    /// The requester prefers the directory relay the bytes over a tunnel
    /// channel rather than hand back a direct connection descriptor.
    PreferTunnel = 1,
}

impl TryFrom<u8> for DirOpenMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Direct),
            1 => Ok(Self::PreferTunnel),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Requests that the peer's directory mediate opening a dynamic resource
/// published at `target_pubk`.
///
/// There is no `request_id`: a connection tracks at most one pending
/// dynamic-resource request at a time, so the eventual [`DirOpened`]
/// reply is unambiguous without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirOpen {
    /// Whether a direct connection is acceptable or a tunnel is preferred.
    pub mode: DirOpenMode,
    /// Public key of the publisher the requester wants a resource from.
    pub target_pubk: [u8; 32],
    /// The requester's ephemeral public key for this request, used to
    /// derive any tunnel/connection credentials the directory hands back.
    pub requester_ephem_pubk: [u8; 32],
}

impl DirOpen {
    const LEN: usize = 1 + 32 + 32;

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.mode as u8;
        buf[1..33].copy_from_slice(&self.target_pubk);
        buf[33..65].copy_from_slice(&self.requester_ephem_pubk);
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available, or an unknown-tag error if `mode` is invalid.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut target_pubk = [0u8; 32];
        target_pubk.copy_from_slice(&data[1..33]);
        let mut requester_ephem_pubk = [0u8; 32];
        requester_ephem_pubk.copy_from_slice(&data[33..65]);
        Ok(Self {
            mode: DirOpenMode::try_from(data[0])?,
            target_pubk,
            requester_ephem_pubk,
        })
    }
}

/// Answers a [`DirOpen`] request with a connection descriptor (or, via
/// [`DirProto::Refused`]/[`DirProto::Unreachable`], a failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirOpened {
    /// The kind of descriptor this reply carries.
    pub proto: DirProto,
    /// NUL-padded host/address the requester should connect to. Meaningless
    /// for [`DirProto::Tunnel`] and the two failure variants.
    pub host: [u8; DIR_OPENED_HOST_LEN],
    /// Destination port for [`DirProto::Ipv4`]/[`DirProto::Ipv6`]/
    /// [`DirProto::Name`]; for [`DirProto::Tunnel`] the low byte instead
    /// carries the allocated tunnel channel id.
    pub port: u16,
    /// Opaque authentication token the requester presents to the
    /// publisher, meaningless for [`DirProto::Tunnel`] and failures.
    pub authk: [u8; DIR_OPENED_AUTHK_LEN],
    /// The publisher's public key, meaningless for [`DirProto::Tunnel`]
    /// and failures.
    pub pubk: [u8; 32],
}

impl DirOpened {
    const LEN: usize = 1 + DIR_OPENED_HOST_LEN + 2 + DIR_OPENED_AUTHK_LEN + 32;

    /// A reply reporting the directory refused the request.
    #[must_use]
    pub fn refused() -> Self {
        Self {
            proto: DirProto::Refused,
            host: [0; DIR_OPENED_HOST_LEN],
            port: 0,
            authk: [0; DIR_OPENED_AUTHK_LEN],
            pubk: [0; 32],
        }
    }

    /// A reply reporting the requested resource could not be reached.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            proto: DirProto::Unreachable,
            host: [0; DIR_OPENED_HOST_LEN],
            port: 0,
            authk: [0; DIR_OPENED_AUTHK_LEN],
            pubk: [0; 32],
        }
    }

    /// A reply allocating tunnel channel `channel` for this request.
    #[must_use]
    pub fn tunnel(channel: u8) -> Self {
        Self {
            proto: DirProto::Tunnel,
            host: [0; DIR_OPENED_HOST_LEN],
            port: u16::from(channel),
            authk: [0; DIR_OPENED_AUTHK_LEN],
            pubk: [0; 32],
        }
    }

    /// A reply handing back a direct connection descriptor.
    #[must_use]
    pub fn direct(
        proto: DirProto,
        host: [u8; DIR_OPENED_HOST_LEN],
        port: u16,
        authk: [u8; DIR_OPENED_AUTHK_LEN],
        pubk: [u8; 32],
    ) -> Self {
        Self {
            proto,
            host,
            port,
            authk,
            pubk,
        }
    }

    /// Whether this reply is a refusal or unreachable outcome.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.proto, DirProto::Refused | DirProto::Unreachable)
    }

    /// The tunnel channel id this reply allocated, if any.
    #[must_use]
    pub fn tunnel_channel(&self) -> Option<u8> {
        matches!(self.proto, DirProto::Tunnel).then_some(self.port as u8)
    }

    /// Encode into a CONTROL payload.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.proto as u8;
        buf[1..1 + DIR_OPENED_HOST_LEN].copy_from_slice(&self.host);
        let port_start = 1 + DIR_OPENED_HOST_LEN;
        packer::put_u16(&mut buf[port_start..port_start + 2], self.port);
        let authk_start = port_start + 2;
        buf[authk_start..authk_start + DIR_OPENED_AUTHK_LEN].copy_from_slice(&self.authk);
        let pubk_start = authk_start + DIR_OPENED_AUTHK_LEN;
        buf[pubk_start..pubk_start + 32].copy_from_slice(&self.pubk);
        buf
    }

    /// Decode from a CONTROL payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `Self::LEN` bytes are
    /// available, or an unknown-tag error if `proto` is invalid.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < Self::LEN {
            return Err(WireError::TooShort {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut host = [0u8; DIR_OPENED_HOST_LEN];
        host.copy_from_slice(&data[1..1 + DIR_OPENED_HOST_LEN]);
        let port_start = 1 + DIR_OPENED_HOST_LEN;
        let authk_start = port_start + 2;
        let mut authk = [0u8; DIR_OPENED_AUTHK_LEN];
        authk.copy_from_slice(&data[authk_start..authk_start + DIR_OPENED_AUTHK_LEN]);
        let pubk_start = authk_start + DIR_OPENED_AUTHK_LEN;
        let mut pubk = [0u8; 32];
        pubk.copy_from_slice(&data[pubk_start..pubk_start + 32]);
        Ok(Self {
            proto: DirProto::try_from(data[0])?,
            host,
            port: packer::get_u16(&data[port_start..port_start + 2]),
            authk,
            pubk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_record_roundtrip() {
        let body = CancelStream::new(3, 77, StreamKind::Blob).to_bytes();
        let record = ControlRecord::new(ControlCommand::CancelStream, &body);
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), CONTROL_PACKET_SIZE);

        let parsed = ControlRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.command, ControlCommand::CancelStream);
        let cancel = CancelStream::from_bytes(&parsed.payload).unwrap();
        assert_eq!(cancel, CancelStream::new(3, 77, StreamKind::Blob));
        assert_eq!(cancel.commit, CANCEL_COMMIT);
        assert_eq!(cancel.reason, CancelReason::Requested);
    }

    #[test]
    fn cancel_stream_with_reason_roundtrips() {
        let cancel = CancelStream::with_reason(1, 2, StreamKind::Video, CancelReason::DecodeError);
        let parsed = CancelStream::from_bytes(&cancel.to_bytes()).unwrap();
        assert_eq!(parsed, cancel);
        assert_eq!(parsed.reason, CancelReason::DecodeError);
        assert_eq!(parsed.stream_type, StreamKind::Video);
    }

    #[test]
    fn control_record_rejects_wrong_size() {
        let buf = [0u8; 10];
        assert!(matches!(
            ControlRecord::from_bytes(&buf),
            Err(WireError::TooShort { .. })
        ));
    }

    #[test]
    fn hello_roundtrip() {
        let hello = Hello {
            vmajor: 1,
            vminor: 0,
            mode: HandshakeMode::TwoRound,
            pubkey: [7u8; 32],
            role: Role::Sink,
        };
        let bytes = hello.to_bytes();
        assert_eq!(Hello::from_bytes(&bytes).unwrap(), hello);
    }

    #[test]
    fn ping_roundtrip() {
        let ping = Ping { acked_stream_id: 0xDEAD_BEEF };
        assert_eq!(Ping::from_bytes(&ping.to_bytes()).unwrap(), ping);
    }

    #[test]
    fn video_frame_roundtrip_and_keyframe_bit() {
        let vf = VideoFrame {
            channel: 1,
            stream_id: 99,
            method: VideoPostprocess::DeltaZstd,
            format: PixelFormat::Rgba8,
            surf_width: 640,
            surf_height: 480,
            width: 640,
            height: 480,
            x: 10,
            y: 20,
            flags: 0x01,
            insize: 1024,
            expsize: 640 * 480 * 4,
            commit: 0,
        };
        let bytes = vf.to_bytes();
        let parsed = VideoFrame::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, vf);
        assert!(parsed.is_keyframe());
    }

    #[test]
    fn video_frame_region_bounds_checked() {
        let mut vf = VideoFrame {
            channel: 0,
            stream_id: 1,
            method: VideoPostprocess::Raw,
            format: PixelFormat::Rgb8,
            surf_width: 100,
            surf_height: 100,
            width: 50,
            height: 50,
            x: 60,
            y: 0,
            flags: 0,
            insize: 0,
            expsize: 0,
            commit: 0,
        };
        assert!(!vf.region_in_bounds(), "60+50 > 100 must be rejected");
        vf.x = 50;
        assert!(vf.region_in_bounds());
        vf.width = 0;
        assert!(!vf.region_in_bounds(), "zero-area update must be rejected");
    }

    #[test]
    fn audio_frame_roundtrip() {
        let af = AudioFrame {
            channel: 2,
            stream_id: 5,
            channels: 2,
            format: AudioSampleFormat::S16Le,
            sample_rate: 48_000,
            nsamples: 960,
        };
        assert_eq!(AudioFrame::from_bytes(&af.to_bytes()).unwrap(), af);
    }

    #[test]
    fn binary_stream_streaming_flag() {
        let known = BinaryStream {
            channel: 0,
            stream_id: 1,
            size: 4096,
            ..Default::default()
        };
        assert!(!known.is_streaming());
        let streaming = BinaryStream {
            channel: 0,
            stream_id: 2,
            size: 0,
            stream_type: 3,
            ident: 0xCAFE,
            checksum: [0x11; 16],
            compressed: true,
            extid: [0x22; 16],
        };
        assert!(streaming.is_streaming());
        assert_eq!(
            BinaryStream::from_bytes(&streaming.to_bytes()).unwrap(),
            streaming
        );
    }

    #[test]
    fn dir_entry_roundtrip() {
        let mut name = [0u8; DIR_ENTRY_NAME_LEN];
        name[..4].copy_from_slice(b"term");
        let entry = DirEntry {
            id: 12,
            category: 0b0101,
            permissions: 0b1,
            hash: [1, 2, 3, 4],
            size: 123_456,
            name,
            short_desc: [0u8; DIR_ENTRY_DESC_LEN],
            timestamp: 1_700_000_000,
        };
        let bytes = entry.to_bytes();
        assert!(bytes.len() <= CONTROL_PAYLOAD_SIZE);
        assert_eq!(DirEntry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn dir_discover_roundtrip() {
        let mut petname = [0u8; PETNAME_LEN];
        petname[..6].copy_from_slice(b"client");
        let disco = DirDiscover {
            role: Role::Source,
            added: true,
            petname_len: 6,
            petname,
            pubkey: [9u8; 32],
        };
        assert_eq!(DirDiscover::from_bytes(&disco.to_bytes()).unwrap(), disco);
    }

    #[test]
    fn dir_open_and_opened_roundtrip() {
        let open = DirOpen {
            mode: DirOpenMode::PreferTunnel,
            target_pubk: [3u8; 32],
            requester_ephem_pubk: [4u8; 32],
        };
        let bytes = open.to_bytes();
        assert!(bytes.len() <= CONTROL_PAYLOAD_SIZE);
        assert_eq!(DirOpen::from_bytes(&bytes).unwrap(), open);

        let opened = DirOpened::tunnel(9);
        assert!(bytes.len() <= CONTROL_PAYLOAD_SIZE);
        assert_eq!(DirOpened::from_bytes(&opened.to_bytes()).unwrap(), opened);
        assert_eq!(opened.tunnel_channel(), Some(9));

        let refused = DirOpened::refused();
        assert!(refused.is_failure());
        assert_eq!(DirOpened::from_bytes(&refused.to_bytes()).unwrap(), refused);

        let mut host = [0u8; DIR_OPENED_HOST_LEN];
        host[..9].copy_from_slice(b"127.0.0.1");
        let direct = DirOpened::direct(
            DirProto::Ipv4,
            host,
            8080,
            [1u8; DIR_OPENED_AUTHK_LEN],
            [2u8; 32],
        );
        assert!(!direct.is_failure());
        assert_eq!(direct.tunnel_channel(), None);
        assert_eq!(DirOpened::from_bytes(&direct.to_bytes()).unwrap(), direct);
    }
}
