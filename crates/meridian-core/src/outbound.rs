//! Outbound packet assembly.
//!
//! Encoding a packet means: frame it, encrypt the body with the
//! direction's stream cipher, tag the ciphertext with the direction's MAC
//! key, and append the result to an arena the caller drains with
//! [`Outbound::take`]. Two arenas are kept so a caller can keep appending
//! packets produced while handling one `flush()` without the next
//! `flush()` racing against it.

use meridian_crypto::cipher::StreamCipher;
use meridian_crypto::mac::Mac;
use meridian_wire::control::{ControlRecord, CONTROL_PAYLOAD_SIZE};
use meridian_wire::frame::{self, PacketType, StreamHeader};

/// Accumulates encrypted, authenticated outbound packets between flushes.
pub struct Outbound {
    buffers: [Vec<u8>; 2],
    active: usize,
    seqnr: u64,
    mac_len: usize,
}

impl Outbound {
    /// Build an empty outbound arena. `mac_len` is 16 once the handshake
    /// has completed, or 8 while framing the very first client HELLO.
    #[must_use]
    pub fn new(mac_len: usize) -> Self {
        Self {
            buffers: [Vec::new(), Vec::new()],
            active: 0,
            seqnr: 0,
            mac_len,
        }
    }

    /// Switch to the full 16-byte MAC, once the handshake has completed.
    pub fn set_mac_len(&mut self, mac_len: usize) {
        self.mac_len = mac_len;
    }

    /// The sequence number the next appended packet will carry.
    #[must_use]
    pub fn next_seqnr(&self) -> u64 {
        self.seqnr
    }

    fn buf(&mut self) -> &mut Vec<u8> {
        &mut self.buffers[self.active]
    }

    fn append_packet(&mut self, cipher: &StreamCipher, mac: &Mac, packet_type: PacketType, mut body: Vec<u8>) {
        let seqnr = self.seqnr;
        self.seqnr += 1;

        cipher.apply(seqnr, &mut body).expect("nonce derivation cannot fail for a u64 seqnr");

        let header_len = frame::header_len(self.mac_len);
        let mut packet = vec![0u8; header_len + body.len()];
        frame::write_header(&mut packet, self.mac_len, seqnr, packet_type);
        packet[header_len..].copy_from_slice(&body);

        let tag = mac.tag(&packet[self.mac_len..], self.mac_len);
        packet[..self.mac_len].copy_from_slice(&tag);

        self.buf().extend_from_slice(&packet);
    }

    /// Append a CONTROL packet carrying one fixed-size control record.
    pub fn push_control(&mut self, cipher: &StreamCipher, mac: &Mac, record: &ControlRecord) {
        let body = record.to_bytes().to_vec();
        self.append_packet(cipher, mac, PacketType::Control, body);
    }

    /// Append a CONTROL packet with the pre-formed HELLO nonce+pubkey body,
    /// used only for the unauthenticated first client->server packet.
    pub fn push_raw_control(&mut self, cipher: &StreamCipher, mac: &Mac, body: Vec<u8>) {
        self.append_packet(cipher, mac, PacketType::Control, body);
    }

    /// Append an EVENT packet carrying one opaque application payload.
    pub fn push_event(&mut self, cipher: &StreamCipher, mac: &Mac, payload: &[u8]) {
        self.append_packet(cipher, mac, PacketType::Event, payload.to_vec());
    }

    /// Append a VIDEO/AUDIO/BLOB substream data packet.
    pub fn push_stream_data(
        &mut self,
        cipher: &StreamCipher,
        mac: &Mac,
        packet_type: PacketType,
        chid: u8,
        stream_id: u32,
        payload: &[u8],
    ) {
        debug_assert!(matches!(
            packet_type,
            PacketType::Video | PacketType::Audio | PacketType::Blob
        ));

        let header = StreamHeader {
            chid,
            stream_id,
            len: u16::try_from(payload.len()).unwrap_or(u16::MAX),
        };

        let mut body = vec![0u8; frame::STREAM_HEADER_SIZE + payload.len()];
        header.write(&mut body);
        body[frame::STREAM_HEADER_SIZE..].copy_from_slice(payload);

        self.append_packet(cipher, mac, packet_type, body);
    }

    /// Drain the currently active arena and swap to the other one.
    #[must_use]
    pub fn take(&mut self) -> Vec<u8> {
        let drained = std::mem::take(&mut self.buffers[self.active]);
        self.active ^= 1;
        drained
    }

    /// Whether there is anything queued to flush.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers[self.active].is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_wire::control::ControlCommand;

    fn keys() -> (StreamCipher, Mac) {
        (StreamCipher::new([1u8; 32]), Mac::new([2u8; 32]))
    }

    #[test]
    fn push_and_take_produces_nonempty_framed_bytes() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(16);
        let record = ControlRecord::new(ControlCommand::Ping, &[]);
        out.push_control(&cipher, &mac, &record);
        assert!(!out.is_empty());

        let flushed = out.take();
        assert_eq!(flushed.len(), frame::header_len(16) + 1 + CONTROL_PAYLOAD_SIZE);
        assert!(out.is_empty());
    }

    #[test]
    fn seqnr_increments_per_packet() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(16);
        assert_eq!(out.next_seqnr(), 0);
        out.push_event(&cipher, &mac, b"hi");
        assert_eq!(out.next_seqnr(), 1);
        out.push_event(&cipher, &mac, b"there");
        assert_eq!(out.next_seqnr(), 2);
    }

    #[test]
    fn double_buffer_swaps_on_take() {
        let (cipher, mac) = keys();
        let mut out = Outbound::new(16);
        out.push_event(&cipher, &mac, b"one");
        let first = out.take();
        out.push_event(&cipher, &mac, b"two");
        let second = out.take();
        assert_ne!(first.len(), 0);
        assert_ne!(second.len(), 0);
    }
}
