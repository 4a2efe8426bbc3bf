//! Outer packet framing.
//!
//! Every on-wire packet is:
//!
//! ```text
//! MAC(n) || seqnr(8) || type(1) || body
//! ```
//!
//! `n` is [`MAC_FULL`] (16) bytes except for the very first client→server
//! HELLO, which uses [`MAC_HALF`] (8) bytes and places an 8-byte nonce
//! where the remaining MAC bytes would otherwise be. The body is always
//! stream-cipher encrypted; the MAC covers the ciphertext. This module
//! only describes the shape of the header and the per-kind data-stream
//! sub-header — authentication and decryption live in `meridian-crypto`
//! and `meridian-core`.

use crate::error::WireError;
use crate::packer;

/// Full MAC length used after the handshake completes.
pub const MAC_FULL: usize = 16;

/// Half MAC length used only for the very first client HELLO; the other
/// 8 bytes of that slot carry the handshake nonce instead.
pub const MAC_HALF: usize = 8;

/// Width of the sequence number field.
pub const SEQNR_SIZE: usize = 8;

/// Width of the packet type field.
pub const TYPE_SIZE: usize = 1;

/// Fixed size of a CONTROL packet body.
pub const CONTROL_PACKET_SIZE: usize = 128;

/// Size of the per-stream sub-header on VIDEO/AUDIO/BLOB bodies:
/// `chid(1) · streamid(4) · len(2)`.
pub const STREAM_HEADER_SIZE: usize = 7;

/// Outer packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Fixed 128-byte control record.
    Control = 1,
    /// Variable-size application event, size fixed at init.
    Event = 2,
    /// Video substream chunk.
    Video = 3,
    /// Audio substream chunk.
    Audio = 4,
    /// Binary (blob) substream chunk.
    Blob = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Control),
            2 => Ok(Self::Event),
            3 => Ok(Self::Video),
            4 => Ok(Self::Audio),
            5 => Ok(Self::Blob),
            other => Err(WireError::UnknownPacketType(other)),
        }
    }
}

/// Total outer header length for a given MAC width.
#[must_use]
pub fn header_len(mac_len: usize) -> usize {
    mac_len + SEQNR_SIZE + TYPE_SIZE
}

/// A parsed outer header, still borrowing the source buffer.
#[derive(Debug)]
pub struct OuterHeader<'a> {
    mac: &'a [u8],
    seqnr: u64,
    packet_type: PacketType,
}

impl<'a> OuterHeader<'a> {
    /// Parse the outer header from `data`, given the expected MAC width.
    ///
    /// Returns the header and the remainder of `data` following it (the
    /// still-encrypted body).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `header_len(mac_len)`
    /// bytes are available, or [`WireError::UnknownPacketType`] if the type
    /// byte does not match a known [`PacketType`].
    pub fn parse(data: &'a [u8], mac_len: usize) -> Result<(Self, &'a [u8]), WireError> {
        let needed = header_len(mac_len);
        if data.len() < needed {
            return Err(WireError::TooShort {
                expected: needed,
                actual: data.len(),
            });
        }

        let mac = &data[0..mac_len];
        let seqnr = packer::get_u64(&data[mac_len..mac_len + SEQNR_SIZE]);
        let packet_type = PacketType::try_from(data[mac_len + SEQNR_SIZE])?;

        Ok((
            Self {
                mac,
                seqnr,
                packet_type,
            },
            &data[needed..],
        ))
    }

    /// The captured MAC bytes (not yet verified by this layer).
    #[must_use]
    pub fn mac(&self) -> &'a [u8] {
        self.mac
    }

    /// The packet's sequence number.
    #[must_use]
    pub fn seqnr(&self) -> u64 {
        self.seqnr
    }

    /// The packet's type tag.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }
}

/// Write the outer header (everything but the MAC bytes, which are filled
/// in once the ciphertext and keyed hash are known) into `buf`.
///
/// `buf` must be at least `header_len(mac_len)` bytes. Returns the offset
/// of the first body byte.
pub fn write_header(buf: &mut [u8], mac_len: usize, seqnr: u64, packet_type: PacketType) -> usize {
    packer::put_u64(&mut buf[mac_len..mac_len + SEQNR_SIZE], seqnr);
    buf[mac_len + SEQNR_SIZE] = packet_type as u8;
    header_len(mac_len)
}

/// Per-stream sub-header carried at the start of VIDEO/AUDIO/BLOB bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Channel this chunk belongs to.
    pub chid: u8,
    /// Stream id within the channel.
    pub stream_id: u32,
    /// Number of body bytes following the header.
    pub len: u16,
}

impl StreamHeader {
    /// Parse a stream sub-header from the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than [`STREAM_HEADER_SIZE`]
    /// bytes are available, or [`WireError::LengthOverflow`] if the declared
    /// length exceeds the bytes remaining after the header.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if data.len() < STREAM_HEADER_SIZE {
            return Err(WireError::TooShort {
                expected: STREAM_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let chid = data[0];
        let stream_id = packer::get_u32(&data[1..5]);
        let len = packer::get_u16(&data[5..7]);
        let rest = &data[STREAM_HEADER_SIZE..];

        if rest.len() < len as usize {
            return Err(WireError::LengthOverflow {
                declared: len as usize,
                available: rest.len(),
            });
        }

        Ok((
            Self {
                chid,
                stream_id,
                len,
            },
            rest,
        ))
    }

    /// Serialize the sub-header into `buf[0..STREAM_HEADER_SIZE]`.
    pub fn write(&self, buf: &mut [u8]) {
        buf[0] = self.chid;
        packer::put_u32(&mut buf[1..5], self.stream_id);
        packer::put_u16(&mut buf[5..7], self.len);
    }
}
