//! Binary-transfer scheduler.
//!
//! Binary (blob) transfers are queued as nodes in a FIFO outbound list.
//! The flush path, [`BlobScheduler::append_blob`], drains at most one node
//! per call: a node's first chunk is capped at [`RAMPUP_CAP`] bytes to give
//! the peer time to [`CancelStream`](meridian_wire::control::CancelStream)
//! a transfer it already has cached, and every chunk after that is capped
//! at the scheduler's MTU-sized limit. Known-size transfers emit
//! `remaining`-decreasing chunks until zero; streaming transfers (size 0)
//! emit chunks until their source reports EOF. A source read error
//! cancels and unlinks the node immediately.

use std::collections::VecDeque;
use std::io::{self, Read};

use meridian_core::error::Error as ConnError;
use meridian_core::Connection;
use meridian_wire::control::BinaryStream;

/// Cap on a blob node's first emitted chunk, giving the peer a chance to
/// cancel a transfer it already has cached. The spec marks this value as
/// indicative, not normative; callers that need a different rampup window
/// build a [`BlobScheduler`] with [`BlobScheduler::with_caps`].
pub const RAMPUP_CAP: usize = 16 * 1024;

/// Default MTU-sized cap applied to every chunk after a node's rampup
/// chunk, chosen to clear a standard Ethernet MTU once outer framing and
/// the stream sub-header are accounted for.
pub const DEFAULT_MTU_CAP: usize = 1400;

/// How many nodes a single [`BlobScheduler::append_blob`] call may drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Drain nothing this call.
    NoBlob,
    /// Only drain a node addressed to `channel`, if one is queued.
    ChannelOnly(u8),
    /// Drain whichever eligible node is earliest in the queue.
    All,
}

/// Where a blob node reads its outgoing bytes from.
///
/// Implementations report the same `WouldBlock`/`Interrupted` semantics as
/// [`std::io::Read::read`]; the scheduler retries those by leaving the node
/// queued, and treats every other error as a transfer-ending I/O failure.
pub trait BlobSource: Send {
    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl BlobSource for std::fs::File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }
}

/// An in-memory blob source for transfers built from an already-resident
/// buffer rather than a file descriptor.
pub struct MemorySource {
    data: Vec<u8>,
    offset: usize,
}

impl MemorySource {
    /// Wrap `data` as a blob source that yields it once, front to back.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }
}

impl BlobSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.data.len() - self.offset;
        let take = remaining.min(buf.len());
        buf[..take].copy_from_slice(&self.data[self.offset..self.offset + take]);
        self.offset += take;
        Ok(take)
    }
}

struct PendingBlob {
    stream_id: u32,
    channel: u8,
    source: Box<dyn BlobSource>,
    /// Total size, or 0 for a streaming (unknown-length) transfer.
    total: u64,
    remaining: u64,
    header_sent: bool,
    /// "Do not start before acked sequence N" gate; `None` if ungated.
    ready_at_seqnr: Option<u64>,
}

/// Result of one [`BlobScheduler::append_blob`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// No eligible node was drained this call.
    Idle,
    /// A chunk (and, if this was the node's first chunk, its BINARYSTREAM
    /// header) was sent.
    Sent {
        /// Channel the substream belongs to.
        channel: u8,
        /// Stream id of the drained node.
        stream_id: u32,
        /// Number of payload bytes sent in this chunk.
        bytes: usize,
        /// Whether the transfer is now complete (known size reached, or
        /// the streaming source hit EOF).
        complete: bool,
    },
    /// The drained node's source errored; its substream was cancelled and
    /// the node was unlinked.
    Cancelled {
        /// Channel the cancelled substream belonged to.
        channel: u8,
        /// Stream id of the cancelled substream.
        stream_id: u32,
    },
}

/// Queues and drains binary-transfer substreams for one connection.
pub struct BlobScheduler {
    pending: VecDeque<PendingBlob>,
    next_stream_id: u32,
    rampup_cap: usize,
    mtu_cap: usize,
}

impl Default for BlobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobScheduler {
    /// Build an empty scheduler using the default rampup and MTU caps.
    #[must_use]
    pub fn new() -> Self {
        Self::with_caps(RAMPUP_CAP, DEFAULT_MTU_CAP)
    }

    /// Build an empty scheduler with non-default caps, e.g. to match a
    /// transport whose MTU differs from the usual Ethernet path.
    #[must_use]
    pub fn with_caps(rampup_cap: usize, mtu_cap: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            next_stream_id: 0,
            rampup_cap,
            mtu_cap,
        }
    }

    /// Queue a binary transfer on `channel`, reading from `source`.
    ///
    /// `total` is the known size, or 0 for a streaming transfer of
    /// unknown length. `ready_at_seqnr`, if set, holds the node back from
    /// [`append_blob`](Self::append_blob) until the caller reports that
    /// outbound sequence number as acked.
    ///
    /// Returns the stream id assigned to the new node.
    pub fn enqueue(
        &mut self,
        channel: u8,
        source: Box<dyn BlobSource>,
        total: u64,
        ready_at_seqnr: Option<u64>,
    ) -> u32 {
        let stream_id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1);
        self.pending.push_back(PendingBlob {
            stream_id,
            channel,
            source,
            total,
            remaining: total,
            header_sent: false,
            ready_at_seqnr,
        });
        stream_id
    }

    /// Whether any node is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of nodes currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Cancel and unlink a queued node by stream id, without sending a
    /// CANCELSTREAM (the caller is abandoning a transfer this side has not
    /// announced, or has already told the peer about by other means).
    ///
    /// Returns `true` if a node was removed.
    pub fn forget(&mut self, stream_id: u32) -> bool {
        let before = self.pending.len();
        self.pending.retain(|node| node.stream_id != stream_id);
        self.pending.len() != before
    }

    fn eligible_index(&self, mode: DrainMode, acked_seqnr: u64) -> Option<usize> {
        match mode {
            DrainMode::NoBlob => None,
            DrainMode::All => self
                .pending
                .iter()
                .position(|node| node.ready_at_seqnr.is_none_or(|gate| gate <= acked_seqnr)),
            DrainMode::ChannelOnly(channel) => self.pending.iter().position(|node| {
                node.channel == channel && node.ready_at_seqnr.is_none_or(|gate| gate <= acked_seqnr)
            }),
        }
    }

    /// Drain at most one queued node into `conn`'s outbound arena,
    /// honoring `mode` and the caller-reported `acked_seqnr` used to
    /// evaluate each node's optional hold gate.
    ///
    /// # Errors
    ///
    /// Returns whatever [`Connection::send_binary_stream`],
    /// [`Connection::send_blob_chunk`], or [`Connection::cancel_stream`]
    /// returns, which is only possible if the handshake has not completed.
    pub fn append_blob(
        &mut self,
        conn: &mut Connection,
        mode: DrainMode,
        acked_seqnr: u64,
    ) -> Result<AppendOutcome, ConnError> {
        let Some(index) = self.eligible_index(mode, acked_seqnr) else {
            return Ok(AppendOutcome::Idle);
        };

        let cap = if self.pending[index].header_sent {
            self.mtu_cap
        } else {
            self.rampup_cap
        };

        let mut chunk = vec![0u8; cap];
        let read_result = {
            let node = &mut self.pending[index];
            let want = if node.total == 0 {
                cap
            } else {
                cap.min(node.remaining as usize)
            };
            node.source.read(&mut chunk[..want])
        };

        let node = &self.pending[index];
        let (channel, stream_id) = (node.channel, node.stream_id);

        match read_result {
            Ok(0) if self.pending[index].total == 0 => {
                // Streaming source hit EOF: the transfer is complete with
                // no further bytes to send.
                self.pending.remove(index);
                Ok(AppendOutcome::Sent {
                    channel,
                    stream_id,
                    bytes: 0,
                    complete: true,
                })
            }
            Ok(n) => {
                chunk.truncate(n);
                if !self.pending[index].header_sent {
                    conn.send_binary_stream(BinaryStream {
                        channel,
                        stream_id,
                        size: self.pending[index].total,
                        ..Default::default()
                    })?;
                    self.pending[index].header_sent = true;
                }
                conn.send_blob_chunk(channel, stream_id, &chunk)?;

                let complete = if self.pending[index].total == 0 {
                    false
                } else {
                    self.pending[index].remaining -= n as u64;
                    self.pending[index].remaining == 0
                };

                if complete {
                    self.pending.remove(index);
                }

                Ok(AppendOutcome::Sent {
                    channel,
                    stream_id,
                    bytes: n,
                    complete,
                })
            }
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) =>
            {
                // Transient: leave the node queued for the next call.
                Ok(AppendOutcome::Idle)
            }
            Err(err) => {
                tracing::warn!(%channel, stream_id, error = %err, "blob source read failed, cancelling stream");
                self.pending.remove(index);
                conn.cancel_stream(channel, stream_id, meridian_wire::control::StreamKind::Blob)?;
                Ok(AppendOutcome::Cancelled { channel, stream_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_crypto::x25519::PrivateKey;
    use meridian_wire::control::Role;
    use rand_core::OsRng;

    fn handshaken_pair() -> (Connection, Connection) {
        let psk = b"scheduler test psk";
        let mut client = Connection::new_client(psk, PrivateKey::generate(&mut OsRng), 64, Role::Sink).unwrap();
        let mut server = Connection::new_server(psk, PrivateKey::generate(&mut OsRng), 64, Role::Source);

        server.feed(&client.flush());
        server.poll().unwrap();
        client.feed(&server.flush());
        client.poll().unwrap();
        server.feed(&client.flush());
        server.poll().unwrap();
        client.feed(&server.flush());
        client.poll().unwrap();

        assert!(client.is_established());
        assert!(server.is_established());
        (client, server)
    }

    #[test]
    fn known_size_transfer_drains_to_completion() {
        let (mut client, mut server) = handshaken_pair();
        let mut scheduler = BlobScheduler::new();
        let payload = vec![0x42u8; 5000];
        let stream_id = scheduler.enqueue(3, Box::new(MemorySource::new(payload.clone())), 5000, None);

        let mut received: Vec<u8> = Vec::new();
        let mut done = false;
        while !done {
            let outcome = scheduler.append_blob(&mut client, DrainMode::All, 0).unwrap();
            match outcome {
                AppendOutcome::Idle => break,
                AppendOutcome::Cancelled { .. } => panic!("unexpected cancel"),
                AppendOutcome::Sent { complete, .. } => {
                    server.feed(&client.flush());
                    for event in server.poll().unwrap() {
                        if let meridian_core::ConnectionEvent::BlobChunk {
                            stream_id: sid,
                            data,
                            complete: c,
                            ..
                        } = event
                        {
                            assert_eq!(sid, stream_id);
                            received.extend_from_slice(&data);
                            done = c;
                        }
                    }
                    if complete {
                        break;
                    }
                }
            }
        }

        assert_eq!(received, payload);
    }

    #[test]
    fn first_chunk_never_exceeds_rampup_cap() {
        let (mut client, _server) = handshaken_pair();
        let mut scheduler = BlobScheduler::with_caps(1024, 4096);
        scheduler.enqueue(0, Box::new(MemorySource::new(vec![1u8; 100_000])), 100_000, None);

        let outcome = scheduler.append_blob(&mut client, DrainMode::All, 0).unwrap();
        match outcome {
            AppendOutcome::Sent { bytes, complete, .. } => {
                assert!(bytes <= 1024);
                assert!(!complete);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn channel_only_mode_skips_other_channels() {
        let (mut client, _server) = handshaken_pair();
        let mut scheduler = BlobScheduler::new();
        scheduler.enqueue(1, Box::new(MemorySource::new(vec![9u8; 16])), 16, None);

        let outcome = scheduler
            .append_blob(&mut client, DrainMode::ChannelOnly(2), 0)
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Idle);
    }

    #[test]
    fn hold_gate_blocks_until_acked_seqnr_reached() {
        let (mut client, _server) = handshaken_pair();
        let mut scheduler = BlobScheduler::new();
        scheduler.enqueue(0, Box::new(MemorySource::new(vec![1u8; 16])), 16, Some(5));

        assert_eq!(
            scheduler.append_blob(&mut client, DrainMode::All, 4).unwrap(),
            AppendOutcome::Idle
        );
        match scheduler.append_blob(&mut client, DrainMode::All, 5).unwrap() {
            AppendOutcome::Sent { .. } => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    struct ErroringSource;

    impl BlobSource for ErroringSource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk fell off"))
        }
    }

    #[test]
    fn source_read_error_cancels_and_unlinks_node() {
        let (mut client, mut server) = handshaken_pair();
        let mut scheduler = BlobScheduler::new();
        let stream_id = scheduler.enqueue(0, Box::new(ErroringSource), 16, None);

        let outcome = scheduler.append_blob(&mut client, DrainMode::All, 0).unwrap();
        assert_eq!(
            outcome,
            AppendOutcome::Cancelled { channel: 0, stream_id }
        );
        assert!(scheduler.is_empty());

        server.feed(&client.flush());
        let events = server.poll().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, meridian_core::ConnectionEvent::StreamCancelled { stream_id: sid, .. } if *sid == stream_id)));
    }

    #[test]
    fn forget_removes_node_without_sending_cancel() {
        let mut scheduler = BlobScheduler::new();
        let stream_id = scheduler.enqueue(0, Box::new(MemorySource::new(vec![1u8; 4])), 4, None);
        assert!(scheduler.forget(stream_id));
        assert!(scheduler.is_empty());
        assert!(!scheduler.forget(stream_id));
    }
}
