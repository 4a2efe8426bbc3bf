//! Per-channel substream assembly state.
//!
//! A channel multiplexes at most one in-flight video substream, one
//! audio substream, any number of concurrent binary (blob) substreams,
//! and one multipart MESSAGE assembly, per direction. The connection
//! holds a fixed 256-entry table of channels addressed directly by their
//! `u8` id, so open/close/lookup never allocate.

use std::collections::BTreeMap;

use meridian_wire::control::{AudioFrame, BinaryStream, VideoFrame};

use crate::error::{Error, StreamError};

/// Maximum number of channels a connection can multiplex.
pub const MAX_CHANNELS: usize = 256;

/// In-progress inbound video substream assembly.
///
/// The buffer accumulates the on-wire (possibly compressed) bytes, capped
/// at `meta.insize`; decoding into pixels happens once the whole body has
/// arrived, in [`crate::video`].
pub struct VideoAssembly {
    /// Metadata from the VIDEOFRAME control record that opened this substream.
    pub meta: VideoFrame,
    /// Wire bytes accumulated so far for the current update.
    pub buffer: Vec<u8>,
}

impl VideoAssembly {
    /// Number of wire bytes still expected before this update is complete.
    #[must_use]
    pub fn remaining(&self) -> usize {
        (self.meta.insize as usize).saturating_sub(self.buffer.len())
    }
}

/// Number of bytes one raw pixel occupies under `format`.
#[must_use]
pub fn bytes_per_pixel(format: meridian_wire::control::PixelFormat) -> usize {
    use meridian_wire::control::PixelFormat;
    match format {
        PixelFormat::Rgba8 => 4,
        PixelFormat::Rgb8 => 3,
        PixelFormat::Rgb565 => 2,
    }
}

/// In-progress inbound audio substream assembly.
pub struct AudioAssembly {
    /// Metadata from the AUDIOFRAME control record that opened this substream.
    pub meta: AudioFrame,
    /// PCM bytes accumulated so far for the current chunk.
    pub buffer: Vec<u8>,
}

impl AudioAssembly {
    /// Number of bytes expected for a chunk with `meta.nsamples` samples.
    #[must_use]
    pub fn expected_len(&self) -> usize {
        let sample_width = match self.meta.format {
            meridian_wire::control::AudioSampleFormat::S16Le => 2,
            meridian_wire::control::AudioSampleFormat::F32Le => 4,
        };
        self.meta.nsamples as usize * self.meta.channels as usize * sample_width
    }
}

/// In-progress inbound binary (blob) substream assembly.
pub struct BlobAssembly {
    /// Stream id, unique within the channel for this transfer's lifetime.
    pub stream_id: u32,
    /// Declared total size, or 0 if unknown (streaming transfer).
    pub size: u64,
    /// Bytes received so far.
    pub received: u64,
    /// Whether the peer has cancelled this transfer.
    pub cancelled: bool,
    /// Application-level subtype carried by the announcing BINARYSTREAM.
    pub stream_type: u8,
    /// Identifier token to echo back once this transfer completes.
    pub ident: u32,
    /// Content checksum the sender announced for the full transfer.
    pub checksum: [u8; 16],
    /// Whether the body bytes on the wire are zstd-compressed; decompressing
    /// them is the destination descriptor's job, not this assembly's.
    pub compressed: bool,
    /// Optional external identifier from the announcing BINARYSTREAM.
    pub extid: [u8; 16],
}

impl BlobAssembly {
    /// Whether this is a size-unknown streaming transfer.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.size == 0
    }

    /// Whether a known-size transfer has received all its bytes.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.is_streaming() && self.received >= self.size
    }
}

/// Assembly state for a multipart MESSAGE split across several EVENT packets.
#[derive(Default)]
pub struct MessageAssembly {
    buffer: Vec<u8>,
    in_progress: bool,
}

/// Upper bound on a coalesced multipart MESSAGE, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

impl MessageAssembly {
    /// Append one EVENT part. `more` is the packet's continuation bit.
    ///
    /// Returns the complete message once the terminal part arrives.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PeerReportableError::MessageOverflow`] if
    /// accumulating `part` would exceed [`MAX_MESSAGE_SIZE`].
    pub fn push(
        &mut self,
        part: &[u8],
        more: bool,
    ) -> Result<Option<Vec<u8>>, crate::error::PeerReportableError> {
        if self.buffer.len() + part.len() > MAX_MESSAGE_SIZE {
            self.buffer.clear();
            self.in_progress = false;
            return Err(crate::error::PeerReportableError::MessageOverflow);
        }

        self.buffer.extend_from_slice(part);
        self.in_progress = more;

        if more {
            Ok(None)
        } else {
            self.in_progress = false;
            Ok(Some(std::mem::take(&mut self.buffer)))
        }
    }

    /// Whether a continuation is currently pending.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }
}

/// One multiplexed channel's per-direction substream state.
#[derive(Default)]
pub struct Channel {
    video_in: Option<VideoAssembly>,
    /// Last successfully decoded inbound video frame, kept across updates
    /// so a delta-coded method has something to apply its XOR against.
    video_prev: Option<Vec<u8>>,
    /// Last video frame this side sent on this channel, used to compute
    /// the next outbound delta-coded update's XOR baseline.
    video_prev_out: Option<Vec<u8>>,
    audio_in: Option<AudioAssembly>,
    blobs_in: BTreeMap<u32, BlobAssembly>,
    message_in: MessageAssembly,
}

impl Channel {
    /// Begin (or replace) the inbound video assembly for this channel.
    ///
    /// Replacing a still-open assembly discards its partial bytes: the
    /// spec allows at most one in-flight video substream per channel, so a
    /// new VIDEOFRAME implicitly abandons the previous one.
    pub fn open_video(&mut self, meta: VideoFrame) {
        self.video_in = Some(VideoAssembly {
            meta,
            buffer: Vec::new(),
        });
    }

    /// The in-progress inbound video assembly, if any.
    pub fn video_mut(&mut self) -> Option<&mut VideoAssembly> {
        self.video_in.as_mut()
    }

    /// Take ownership of a completed inbound video assembly.
    pub fn take_video(&mut self) -> Option<VideoAssembly> {
        self.video_in.take()
    }

    /// The last successfully decoded inbound video frame, if any.
    #[must_use]
    pub fn video_prev(&self) -> Option<&[u8]> {
        self.video_prev.as_deref()
    }

    /// Record a freshly decoded inbound video frame as the new baseline
    /// for the next delta-coded update.
    pub fn set_video_prev(&mut self, frame: Vec<u8>) {
        self.video_prev = Some(frame);
    }

    /// The last video frame this side sent on this channel, if any.
    #[must_use]
    pub fn video_prev_out(&self) -> Option<&[u8]> {
        self.video_prev_out.as_deref()
    }

    /// Record a freshly sent video frame as the new baseline for the next
    /// outbound delta-coded update.
    pub fn set_video_prev_out(&mut self, frame: Vec<u8>) {
        self.video_prev_out = Some(frame);
    }

    /// Begin (or replace) the inbound audio assembly for this channel.
    pub fn open_audio(&mut self, meta: AudioFrame) {
        self.audio_in = Some(AudioAssembly {
            meta,
            buffer: Vec::new(),
        });
    }

    /// The in-progress inbound audio assembly, if any.
    pub fn audio_mut(&mut self) -> Option<&mut AudioAssembly> {
        self.audio_in.as_mut()
    }

    /// Take ownership of a completed inbound audio assembly.
    pub fn take_audio(&mut self) -> Option<AudioAssembly> {
        self.audio_in.take()
    }

    /// Begin tracking an inbound binary substream with no extra metadata.
    pub fn open_blob(&mut self, stream_id: u32, size: u64) {
        self.open_blob_announced(BinaryStream {
            stream_id,
            size,
            ..Default::default()
        });
    }

    /// Begin tracking an inbound binary substream from its full BINARYSTREAM
    /// announcement, keeping the sender's checksum/ident/compression tag.
    pub fn open_blob_announced(&mut self, meta: BinaryStream) {
        self.blobs_in.insert(
            meta.stream_id,
            BlobAssembly {
                stream_id: meta.stream_id,
                size: meta.size,
                received: 0,
                cancelled: false,
                stream_type: meta.stream_type,
                ident: meta.ident,
                checksum: meta.checksum,
                compressed: meta.compressed,
                extid: meta.extid,
            },
        );
    }

    /// The assembly state for an open inbound binary substream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnknownStream`] if `stream_id` is not open.
    pub fn blob_mut(&mut self, stream_id: u32) -> Result<&mut BlobAssembly, StreamError> {
        self.blobs_in
            .get_mut(&stream_id)
            .ok_or(StreamError::UnknownStream)
    }

    /// Remove and return a binary substream's assembly state (completion
    /// or cancellation).
    pub fn close_blob(&mut self, stream_id: u32) -> Option<BlobAssembly> {
        self.blobs_in.remove(&stream_id)
    }

    /// The multipart MESSAGE assembler for this channel's EVENT substream.
    pub fn message(&mut self) -> &mut MessageAssembly {
        &mut self.message_in
    }
}

/// Fixed-size table of channels, addressed directly by channel id.
pub struct ChannelTable {
    channels: Box<[Option<Channel>; MAX_CHANNELS]>,
}

impl ChannelTable {
    /// Build an empty table with no channels open.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Box::new(std::array::from_fn(|_| None)),
        }
    }

    /// Open `id`, replacing any previous channel with the same id.
    pub fn open(&mut self, id: u8) {
        self.channels[id as usize] = Some(Channel::default());
    }

    /// Close `id`, dropping all of its in-progress substream state.
    pub fn close(&mut self, id: u8) {
        self.channels[id as usize] = None;
    }

    /// Whether `id` currently names an open channel.
    #[must_use]
    pub fn is_open(&self, id: u8) -> bool {
        self.channels[id as usize].is_some()
    }

    /// Mutable access to an open channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stream`] with [`StreamError::UnknownChannel`] if
    /// `id` does not name an open channel.
    pub fn get_mut(&mut self, id: u8) -> Result<&mut Channel, Error> {
        self.channels[id as usize]
            .as_mut()
            .ok_or_else(|| stream_error(id, StreamError::UnknownChannel))
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

fn stream_error(channel: u8, source: StreamError) -> Error {
    Error::Stream {
        channel,
        stream_id: 0,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_wire::control::{AudioSampleFormat, PixelFormat, VideoPostprocess};

    fn sample_video_frame() -> VideoFrame {
        VideoFrame {
            channel: 0,
            stream_id: 1,
            method: VideoPostprocess::Raw,
            format: PixelFormat::Rgba8,
            surf_width: 4,
            surf_height: 2,
            width: 4,
            height: 2,
            x: 0,
            y: 0,
            flags: 0,
            insize: 4 * 2 * 4,
            expsize: 4 * 2 * 4,
            commit: 0,
        }
    }

    #[test]
    fn channel_table_open_close_roundtrip() {
        let mut table = ChannelTable::new();
        assert!(!table.is_open(5));
        table.open(5);
        assert!(table.is_open(5));
        table.get_mut(5).unwrap();
        table.close(5);
        assert!(!table.is_open(5));
        assert!(table.get_mut(5).is_err());
    }

    #[test]
    fn video_assembly_remaining_tracks_buffer() {
        let mut channel = Channel::default();
        channel.open_video(sample_video_frame());
        let assembly = channel.video_mut().unwrap();
        assert_eq!(assembly.remaining(), 4 * 2 * 4);
        assembly.buffer.extend_from_slice(&[0u8; 16]);
        assert_eq!(assembly.remaining(), 16);
    }

    #[test]
    fn video_prev_persists_across_assemblies() {
        let mut channel = Channel::default();
        assert!(channel.video_prev().is_none());
        channel.set_video_prev(vec![1, 2, 3]);
        assert_eq!(channel.video_prev(), Some(&[1u8, 2, 3][..]));
        channel.open_video(sample_video_frame());
        assert_eq!(
            channel.video_prev(),
            Some(&[1u8, 2, 3][..]),
            "opening a new assembly must not clobber the decoded baseline"
        );
    }

    #[test]
    fn video_prev_out_tracks_independently_of_inbound_baseline() {
        let mut channel = Channel::default();
        channel.set_video_prev(vec![1, 2, 3]);
        assert!(channel.video_prev_out().is_none());
        channel.set_video_prev_out(vec![9, 9]);
        assert_eq!(channel.video_prev(), Some(&[1u8, 2, 3][..]));
        assert_eq!(channel.video_prev_out(), Some(&[9u8, 9][..]));
    }

    #[test]
    fn audio_assembly_expected_len() {
        let mut channel = Channel::default();
        channel.open_audio(AudioFrame {
            channel: 0,
            stream_id: 1,
            channels: 2,
            format: AudioSampleFormat::S16Le,
            sample_rate: 48_000,
            nsamples: 10,
        });
        assert_eq!(channel.audio_mut().unwrap().expected_len(), 10 * 2 * 2);
    }

    #[test]
    fn blob_assembly_completion() {
        let mut channel = Channel::default();
        channel.open_blob(9, 10);
        {
            let blob = channel.blob_mut(9).unwrap();
            blob.received = 10;
        }
        assert!(channel.blob_mut(9).unwrap().is_complete());
    }

    #[test]
    fn streaming_blob_never_reports_complete_by_size() {
        let mut channel = Channel::default();
        channel.open_blob(2, 0);
        let blob = channel.blob_mut(2).unwrap();
        blob.received = 999_999;
        assert!(blob.is_streaming());
        assert!(!blob.is_complete());
    }

    #[test]
    fn message_assembly_coalesces_continuation() {
        let mut msg = MessageAssembly::default();
        assert_eq!(msg.push(b"hel", true).unwrap(), None);
        assert!(msg.in_progress());
        assert_eq!(msg.push(b"lo", false).unwrap(), Some(b"hello".to_vec()));
        assert!(!msg.in_progress());
    }

    #[test]
    fn message_assembly_overflow_resets_state() {
        let mut msg = MessageAssembly::default();
        let chunk = vec![0u8; MAX_MESSAGE_SIZE];
        assert!(msg.push(&chunk, true).is_ok());
        assert!(msg.push(&chunk, true).is_err());
        assert!(!msg.in_progress());
    }
}
