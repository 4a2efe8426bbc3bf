//! Video codec facade.
//!
//! Translates between the wire's on-the-wire video body (raw pixels,
//! zstd-compressed deltas, zstd-compressed terminal cell buffers, or an
//! externally decoded H.264 access unit) and a flat pixel/cell buffer the
//! caller's destination surface understands. [`meridian_wire::control::
//! VideoPostprocess`] selects which of these four paths a given substream
//! uses; everything else about framing, chunking, and assembly stays in
//! `session`/`channel`.
//!
//! H.264 decoding is out of this crate's scope (§1 names "the specific
//! video/audio codecs" as an external collaborator); [`ExternalVideoCodec`]
//! is the seam a caller plugs a real decoder into. Without one installed,
//! an H.264 substream always reports [`VideoCodecError::NoExternalCodec`].

use meridian_wire::control::{PixelFormat, VideoPostprocess};

use crate::channel::bytes_per_pixel;

/// Why a video substream's body could not be turned into pixels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VideoCodecError {
    /// The decompressed (or raw) body did not match the announced expanded size.
    #[error("expanded size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        /// Size the VIDEOFRAME header promised.
        expected: usize,
        /// Size actually produced.
        actual: usize,
    },

    /// zstd decompression failed outright.
    #[error("zstd decompression failed: {0}")]
    Decompress(String),

    /// A delta update arrived with no prior keyframe to apply it against.
    #[error("delta update has no previous frame to apply against")]
    NoPreviousFrame,

    /// An H.264 substream arrived but no external decoder is installed.
    #[error("no external video codec installed for H.264")]
    NoExternalCodec,

    /// The installed external codec reported a failure of its own.
    #[error("external codec error: {0}")]
    External(String),
}

/// A pluggable encoder/decoder for [`VideoPostprocess::H264`] (or any other
/// externally-owned codec a deployment wants to add without touching this
/// crate). State — decoder context, reference frames — is owned entirely by
/// the implementation; this crate only ever sees access units in and pixel
/// buffers out.
pub trait ExternalVideoCodec: Send {
    /// Decode one access unit into packed pixels matching the destination
    /// surface's format.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message describing the decode failure.
    fn decode(&mut self, access_unit: &[u8]) -> Result<Vec<u8>, String>;

    /// Encode one update's pixels into an access unit ready to chunk onto
    /// the wire.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message describing the encode failure.
    fn encode(&mut self, pixels: &[u8]) -> Result<Vec<u8>, String>;
}

/// One successfully decoded video update.
pub struct DecodedFrame {
    /// Flat pixel (or, for [`VideoPostprocess::TerminalPackZstd`], cell)
    /// bytes for the dirty rectangle.
    pub pixels: Vec<u8>,
    /// Whether this decode should become the new baseline for the next
    /// delta-coded update on this channel.
    pub becomes_baseline: bool,
}

/// Decode a complete substream body into pixels.
///
/// `previous` is the channel's last decoded frame, required for a non-
/// keyframe [`VideoPostprocess::DeltaZstd`] update.
///
/// # Errors
///
/// See [`VideoCodecError`].
pub fn decode(
    method: VideoPostprocess,
    format: PixelFormat,
    keyframe: bool,
    expsize: u32,
    body: &[u8],
    previous: Option<&[u8]>,
    external: Option<&mut dyn ExternalVideoCodec>,
) -> Result<DecodedFrame, VideoCodecError> {
    match method {
        VideoPostprocess::Raw => {
            let expected = expsize as usize;
            if body.len() != expected {
                return Err(VideoCodecError::SizeMismatch {
                    expected,
                    actual: body.len(),
                });
            }
            Ok(DecodedFrame {
                pixels: body.to_vec(),
                becomes_baseline: true,
            })
        }
        VideoPostprocess::DeltaZstd => {
            let expanded =
                zstd::stream::decode_all(body).map_err(|e| VideoCodecError::Decompress(e.to_string()))?;
            let expected = expsize as usize;
            if expanded.len() != expected {
                return Err(VideoCodecError::SizeMismatch {
                    expected,
                    actual: expanded.len(),
                });
            }
            if keyframe {
                Ok(DecodedFrame {
                    pixels: expanded,
                    becomes_baseline: true,
                })
            } else {
                let base = previous.ok_or(VideoCodecError::NoPreviousFrame)?;
                if base.len() != expanded.len() {
                    return Err(VideoCodecError::SizeMismatch {
                        expected: base.len(),
                        actual: expanded.len(),
                    });
                }
                let mut pixels = expanded;
                for (byte, base_byte) in pixels.iter_mut().zip(base.iter()) {
                    *byte ^= base_byte;
                }
                Ok(DecodedFrame {
                    pixels,
                    becomes_baseline: true,
                })
            }
        }
        VideoPostprocess::TerminalPackZstd => {
            let expanded =
                zstd::stream::decode_all(body).map_err(|e| VideoCodecError::Decompress(e.to_string()))?;
            let expected = expsize as usize;
            if expanded.len() != expected {
                return Err(VideoCodecError::SizeMismatch {
                    expected,
                    actual: expanded.len(),
                });
            }
            Ok(DecodedFrame {
                pixels: expanded,
                becomes_baseline: false,
            })
        }
        VideoPostprocess::H264 => {
            let external = external.ok_or(VideoCodecError::NoExternalCodec)?;
            let pixels = external
                .decode(body)
                .map_err(VideoCodecError::External)?;
            Ok(DecodedFrame {
                pixels,
                becomes_baseline: true,
            })
        }
    }
}

/// One encoded update, ready to be chunked onto the wire.
pub struct EncodedFrame {
    /// On-wire bytes (compressed, for the zstd paths).
    pub body: Vec<u8>,
    /// `insize` for the VIDEOFRAME header: `body.len()`.
    pub insize: u32,
    /// `expsize` for the VIDEOFRAME header: the decompressed size the
    /// receiver must reproduce.
    pub expsize: u32,
}

/// Encode a dirty-rectangle update of `width`x`height` pixels in `format`
/// for transmission.
///
/// `previous` is this side's own record of the last frame it sent on this
/// channel, needed to produce a matching XOR delta for
/// [`VideoPostprocess::DeltaZstd`] non-keyframe updates.
///
/// # Errors
///
/// See [`VideoCodecError`].
pub fn encode(
    method: VideoPostprocess,
    format: PixelFormat,
    width: u16,
    height: u16,
    keyframe: bool,
    pixels: &[u8],
    previous: Option<&[u8]>,
    external: Option<&mut dyn ExternalVideoCodec>,
) -> Result<EncodedFrame, VideoCodecError> {
    let expected = width as usize * height as usize * bytes_per_pixel(format);
    if pixels.len() != expected {
        return Err(VideoCodecError::SizeMismatch {
            expected,
            actual: pixels.len(),
        });
    }

    match method {
        VideoPostprocess::Raw => Ok(EncodedFrame {
            body: pixels.to_vec(),
            insize: pixels.len() as u32,
            expsize: pixels.len() as u32,
        }),
        VideoPostprocess::DeltaZstd => {
            let expsize = pixels.len() as u32;
            let to_compress = if keyframe {
                pixels.to_vec()
            } else {
                let base = previous.ok_or(VideoCodecError::NoPreviousFrame)?;
                if base.len() != pixels.len() {
                    return Err(VideoCodecError::SizeMismatch {
                        expected: pixels.len(),
                        actual: base.len(),
                    });
                }
                pixels
                    .iter()
                    .zip(base.iter())
                    .map(|(a, b)| a ^ b)
                    .collect()
            };
            let body = zstd::stream::encode_all(to_compress.as_slice(), 0)
                .map_err(|e| VideoCodecError::Decompress(e.to_string()))?;
            Ok(EncodedFrame {
                insize: body.len() as u32,
                body,
                expsize,
            })
        }
        VideoPostprocess::TerminalPackZstd => {
            let body = zstd::stream::encode_all(pixels, 0)
                .map_err(|e| VideoCodecError::Decompress(e.to_string()))?;
            Ok(EncodedFrame {
                insize: body.len() as u32,
                expsize: pixels.len() as u32,
                body,
            })
        }
        VideoPostprocess::H264 => {
            let external = external.ok_or(VideoCodecError::NoExternalCodec)?;
            let body = external
                .encode(pixels)
                .map_err(VideoCodecError::External)?;
            Ok(EncodedFrame {
                insize: body.len() as u32,
                expsize: pixels.len() as u32,
                body,
            })
        }
    }
}
