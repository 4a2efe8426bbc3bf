//! Inbound packet decoding.
//!
//! Bytes arrive from the transport as an undifferentiated stream; this
//! module reassembles them into framed, authenticated, decrypted
//! packets. CONTROL bodies are always [`CONTROL_PACKET_SIZE`] bytes and
//! EVENT bodies are a fixed size configured once at connection setup, so
//! both have a known total length the moment the outer header is
//! parsed. VIDEO/AUDIO/BLOB bodies carry their length inside the
//! encrypted [`StreamHeader`] sub-header instead; since the stream
//! cipher's keystream at a given seqnr is a plain XOR independent of how
//! much of the body is ultimately decrypted, that sub-header's first
//! [`STREAM_HEADER_SIZE`] bytes can be decrypted on their own to learn
//! the length before the rest of the packet has even arrived. That peek
//! is not itself authenticated — the full packet is still MAC-verified
//! before any of its contents are handed to the caller.

use std::collections::VecDeque;

use meridian_crypto::cipher::StreamCipher;
use meridian_crypto::mac::Mac;
use meridian_wire::control::CONTROL_PACKET_SIZE;
use meridian_wire::frame::{self, OuterHeader, PacketType, STREAM_HEADER_SIZE};
use meridian_wire::packer;

use crate::error::FatalError;

/// Soft bound on how much undecoded data is kept buffered. A single
/// packet is bounded by the stream sub-header's `u16` length field, so
/// this is a sanity ceiling rather than something normal traffic can hit.
pub const INBOUND_BUFFER_CAP: usize = 128 * 1024;

/// Body size of the very first client→server packet: an 8-byte nonce
/// followed by a 32-byte X25519 public key.
pub const FIRST_HELLO_BODY_LEN: usize = 8 + 32;

/// One fully authenticated, decrypted inbound packet.
pub struct DecodedPacket {
    /// The packet's sequence number.
    pub seqnr: u64,
    /// The packet's type tag.
    pub packet_type: PacketType,
    /// Decrypted body bytes (still including the stream sub-header for
    /// VIDEO/AUDIO/BLOB packets — the caller strips it).
    pub body: Vec<u8>,
}

/// Reassembles and decodes packets out of a raw inbound byte stream.
pub struct InboundDecoder {
    buffer: VecDeque<u8>,
    mac_len: usize,
    event_size: usize,
    last_seqnr: Option<u64>,
}

impl InboundDecoder {
    /// Build a decoder. `mac_len` is 8 only for a server decoder's very
    /// first packet (the client's HELLO); every other packet in both
    /// directions uses the full 16-byte MAC. `event_size` is this
    /// connection's fixed EVENT packet body size.
    #[must_use]
    pub fn new(mac_len: usize, event_size: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            mac_len,
            event_size,
            last_seqnr: None,
        }
    }

    /// Switch to the full 16-byte MAC, once the handshake's first packet
    /// has been processed.
    pub fn set_mac_len(&mut self, mac_len: usize) {
        self.mac_len = mac_len;
    }

    /// Append newly received transport bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend(data.iter().copied());
    }

    /// Whether there are no buffered bytes left to decode.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Attempt to decode one packet from the buffered bytes.
    ///
    /// Returns `Ok(None)` when not enough data has arrived yet — this is
    /// the normal "wait for more bytes" condition, not an error. Callers
    /// should loop calling this after every [`Self::feed`] until it
    /// returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::Wire`] if the outer header is malformed,
    /// [`FatalError::SequenceRegression`] if the sequence number did not
    /// move forward, [`FatalError::AuthenticationFailed`] if the MAC
    /// does not verify, or [`FatalError::Crypto`] if decryption fails.
    pub fn decode(
        &mut self,
        cipher: &StreamCipher,
        mac: &Mac,
    ) -> Result<Option<DecodedPacket>, FatalError> {
        let header_len = frame::header_len(self.mac_len);
        if self.buffer.len() < header_len {
            return Ok(None);
        }

        let contiguous = self.buffer.make_contiguous();
        let (header, _) = match OuterHeader::parse(contiguous, self.mac_len) {
            Ok(parsed) => parsed,
            Err(err) => return Err(FatalError::Wire(err)),
        };
        let seqnr = header.seqnr();
        let packet_type = header.packet_type();

        if let Some(last) = self.last_seqnr {
            if seqnr <= last {
                return Err(FatalError::SequenceRegression {
                    expected: last,
                    got: seqnr,
                });
            }
        }

        let body_len = match packet_type {
            // A half-width MAC only ever appears on the very first
            // client->server packet, whose body is the short nonce+pubkey
            // greeting rather than a full-width control record.
            PacketType::Control if self.mac_len == frame::MAC_HALF => Some(FIRST_HELLO_BODY_LEN),
            PacketType::Control => Some(CONTROL_PACKET_SIZE),
            PacketType::Event => Some(self.event_size),
            PacketType::Video | PacketType::Audio | PacketType::Blob => {
                let available_body = contiguous.len() - header_len;
                if available_body < STREAM_HEADER_SIZE {
                    None
                } else {
                    let mut peek = [0u8; STREAM_HEADER_SIZE];
                    peek.copy_from_slice(&contiguous[header_len..header_len + STREAM_HEADER_SIZE]);
                    cipher
                        .apply(seqnr, &mut peek)
                        .map_err(FatalError::Crypto)?;
                    let declared = packer::get_u16(&peek[5..7]) as usize;
                    Some(STREAM_HEADER_SIZE + declared)
                }
            }
        };

        let Some(body_len) = body_len else {
            return Ok(None);
        };

        let total_len = header_len + body_len;
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let packet: Vec<u8> = self.buffer.iter().take(total_len).copied().collect();
        self.buffer.drain(0..total_len);

        mac.verify(&packet[self.mac_len..], header.mac())
            .map_err(|_| FatalError::AuthenticationFailed { seqnr })?;

        let mut body = packet[header_len..].to_vec();
        cipher.apply(seqnr, &mut body).map_err(FatalError::Crypto)?;

        self.last_seqnr = Some(seqnr);

        Ok(Some(DecodedPacket {
            seqnr,
            packet_type,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Outbound;
    use meridian_wire::control::{ControlCommand, ControlRecord};

    fn keys() -> (StreamCipher, Mac) {
        (StreamCipher::new([9u8; 32]), Mac::new([4u8; 32]))
    }

    #[test]
    fn decodes_a_control_packet_once_fully_buffered() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(16);
        let record = ControlRecord::new(ControlCommand::Ping, &[]);
        out.push_control(&cipher, &mac, &record);
        let wire = out.take();

        let mut decoder = InboundDecoder::new(16, 256);
        assert!(decoder.decode(&cipher, &mac).unwrap().is_none());

        decoder.feed(&wire);
        let packet = decoder.decode(&cipher, &mac).unwrap().unwrap();
        assert_eq!(packet.seqnr, 0);
        assert_eq!(packet.packet_type, PacketType::Control);
        assert_eq!(packet.body.len(), CONTROL_PACKET_SIZE);
        assert!(decoder.decode(&cipher, &mac).unwrap().is_none());
    }

    #[test]
    fn decodes_byte_at_a_time() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(16);
        out.push_event(&cipher, &mac, b"hello there");
        let wire = out.take();

        let mut decoder = InboundDecoder::new(16, b"hello there".len());
        for (i, byte) in wire.iter().enumerate() {
            decoder.feed(std::slice::from_ref(byte));
            let decoded = decoder.decode(&cipher, &mac).unwrap();
            if i + 1 < wire.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded.unwrap().body, b"hello there");
            }
        }
    }

    #[test]
    fn decodes_stream_data_packet_whose_length_is_learned_by_peeking() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(16);
        out.push_stream_data(&cipher, &mac, PacketType::Video, 3, 77, b"pixels!!");
        let wire = out.take();

        let mut decoder = InboundDecoder::new(16, 64);
        decoder.feed(&wire);
        let packet = decoder.decode(&cipher, &mac).unwrap().unwrap();
        assert_eq!(packet.packet_type, PacketType::Video);
        let (header, body) = frame::StreamHeader::parse(&packet.body).unwrap();
        assert_eq!(header.chid, 3);
        assert_eq!(header.stream_id, 77);
        assert_eq!(body, b"pixels!!");
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(16);
        out.push_event(&cipher, &mac, b"payload");
        let mut wire = out.take();
        wire[0] ^= 0xFF;

        let mut decoder = InboundDecoder::new(16, 7);
        decoder.feed(&wire);
        assert!(matches!(
            decoder.decode(&cipher, &mac),
            Err(FatalError::AuthenticationFailed { .. })
        ));
    }

    #[test]
    fn replayed_seqnr_is_a_regression() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(16);
        out.push_event(&cipher, &mac, b"one");
        let first = out.take();
        out.push_event(&cipher, &mac, b"two");
        let second = out.take();

        let mut decoder = InboundDecoder::new(16, 3);
        decoder.feed(&first);
        decoder.decode(&cipher, &mac).unwrap().unwrap();

        // Replay the first packet again instead of delivering the second.
        decoder.feed(&first);
        assert!(matches!(
            decoder.decode(&cipher, &mac),
            Err(FatalError::SequenceRegression { .. })
        ));

        let _ = second;
    }

    #[test]
    fn decodes_the_first_hello_greeting_body() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(8);
        let mut body = vec![0u8; FIRST_HELLO_BODY_LEN];
        body[..8].copy_from_slice(&[0x11u8; 8]);
        body[8..].copy_from_slice(&[0x22u8; 32]);
        out.push_raw_control(&cipher, &mac, body.clone());
        let wire = out.take();

        let mut decoder = InboundDecoder::new(8, 64);
        decoder.feed(&wire);
        let decoded = decoder.decode(&cipher, &mac).unwrap().unwrap();
        assert_eq!(decoded.packet_type, PacketType::Control);
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn half_mac_decoder_switches_after_first_packet() {
        let cipher = StreamCipher::new([1u8; 32]);
        let mac = Mac::new([2u8; 32]);

        let mut out = Outbound::new(8);
        out.push_event(&cipher, &mac, b"greeting");
        let first = out.take();
        out.set_mac_len(16);
        out.push_event(&cipher, &mac, b"real traffic");
        let second = out.take();

        let mut decoder = InboundDecoder::new(8, 64);
        decoder.feed(&first);
        let decoded_first = decoder.decode(&cipher, &mac).unwrap().unwrap();
        assert_eq!(decoded_first.body, b"greeting");

        decoder.set_mac_len(16);
        decoder.feed(&second);
        let decoded_second = decoder.decode(&cipher, &mac).unwrap().unwrap();
        assert_eq!(decoded_second.body, b"real traffic");
    }
}
