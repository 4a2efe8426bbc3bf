//! End-to-end scenarios driving two [`Connection`]s directly against each
//! other, covering the protocol's concrete worked examples: handshake
//! framing, a single video update, a cancelled binary transfer, multipart
//! message coalescing, congestion-window bookkeeping, and a
//! directory-mediated tunnel splice.

use meridian_core::error::{Error, StreamError};
use meridian_core::inbound::FIRST_HELLO_BODY_LEN;
use meridian_core::{Connection, ConnectionEvent, CONTROL_CHANNEL};
use meridian_directory::manager::{DirectoryManager, DirectoryOutcome};
use meridian_files::scheduler::{AppendOutcome, BlobScheduler, DrainMode, MemorySource, RAMPUP_CAP};
use meridian_wire::control::{
    BinaryStream, DirOpenMode, DirOpened, PixelFormat, StreamKind, VideoFrame, VideoPostprocess,
};
use meridian_wire::frame::{self, OuterHeader, PacketType};

use meridian_tests::fixtures::two_node::TwoNodeFixture;

/// Walk a flushed byte stream and report each outer packet's type, given
/// the MAC width and EVENT size in effect for that stream.
fn packet_types(mut data: &[u8], mac_len: usize, event_size: usize) -> Vec<PacketType> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let (header, rest) = OuterHeader::parse(data, mac_len).expect("well-formed packet");
        let packet_type = header.packet_type();
        let consumed = match packet_type {
            PacketType::Control => frame::CONTROL_PACKET_SIZE,
            PacketType::Event => event_size,
            PacketType::Video | PacketType::Audio | PacketType::Blob => {
                let (stream_header, _) = frame::StreamHeader::parse(rest).expect("stream sub-header");
                frame::STREAM_HEADER_SIZE + stream_header.len as usize
            }
        };
        out.push(packet_type);
        data = &rest[consumed..];
    }
    out
}

fn keyframe_meta(channel: u8, stream_id: u32, width: u16, height: u16) -> VideoFrame {
    VideoFrame {
        channel,
        stream_id,
        method: VideoPostprocess::Raw,
        format: PixelFormat::Rgb8,
        surf_width: width,
        surf_height: height,
        width,
        height,
        x: 0,
        y: 0,
        flags: 0x01,
        insize: 0,
        expsize: 0,
        commit: 0,
    }
}

#[test]
fn scenario_1_two_round_handshake_uses_half_mac_only_for_first_hello() {
    let mut fixture = TwoNodeFixture::new();

    let first_hello = fixture.client.flush();
    assert_eq!(
        first_hello.len(),
        frame::header_len(frame::MAC_HALF) + FIRST_HELLO_BODY_LEN,
        "first client->server HELLO must use the 8-byte half-MAC form"
    );
    OuterHeader::parse(&first_hello, frame::MAC_HALF).expect("half-MAC header parses");

    fixture.server.feed(&first_hello);
    fixture.server.poll().unwrap();

    // Every packet from here on (both directions) uses the full 16-byte MAC.
    loop {
        let to_client = fixture.server.flush();
        if to_client.is_empty() {
            break;
        }
        OuterHeader::parse(&to_client, frame::MAC_FULL).expect("server replies use full MAC");
        fixture.client.feed(&to_client);
        fixture.client.poll().unwrap();

        let to_server = fixture.client.flush();
        if to_server.is_empty() {
            continue;
        }
        OuterHeader::parse(&to_server, frame::MAC_FULL).expect("client's later HELLOs use full MAC");
        fixture.server.feed(&to_server);
        fixture.server.poll().unwrap();
    }

    assert!(fixture.client.is_established());
    assert!(fixture.server.is_established());
    assert_eq!(fixture.client.peer_identity(), Some(&fixture.server_identity));
    assert_eq!(fixture.server.peer_identity(), Some(&fixture.client_identity));
}

#[test]
fn scenario_2_single_video_frame_roundtrips_byte_identical() {
    let mut fixture = TwoNodeFixture::new();
    fixture.handshake();

    let pixels: Vec<u8> = (0..8 * 8 * 3).map(|i| (i % 256) as u8).collect();
    let meta = keyframe_meta(CONTROL_CHANNEL, 1, 8, 8);
    fixture.client.send_video_frame(meta, &pixels, None).unwrap();

    let wire = fixture.client.flush();
    let kinds = packet_types(&wire, frame::MAC_FULL, meridian_tests::fixtures::two_node::EVENT_SIZE);
    assert_eq!(
        kinds,
        vec![PacketType::Control, PacketType::Video],
        "one CONTROL announcement plus ceil((8*8*3)/MTU) == 1 VIDEO packet"
    );

    fixture.server.feed(&wire);
    let events = fixture.server.poll().unwrap();

    assert!(events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::VideoFrameAnnounced(m) if m.stream_id == 1)));
    let data = events
        .into_iter()
        .find_map(|e| match e {
            ConnectionEvent::VideoUpdateComplete { channel, data } if channel == CONTROL_CHANNEL => Some(data),
            _ => None,
        })
        .expect("video update completed");
    assert_eq!(data, pixels);
}

#[test]
fn scenario_3_binary_transfer_cancelled_before_exceeding_rampup_cap() {
    let mut fixture = TwoNodeFixture::new();
    fixture.handshake();

    let mut scheduler = BlobScheduler::new();
    let payload = vec![0x7Au8; 1024 * 1024];
    let stream_id = scheduler.enqueue(CONTROL_CHANNEL, Box::new(MemorySource::new(payload)), 1024 * 1024, None);

    let outcome = scheduler
        .append_blob(&mut fixture.client, DrainMode::All, 0)
        .unwrap();
    let bytes_sent = match outcome {
        AppendOutcome::Sent { bytes, complete, .. } => {
            assert!(!complete);
            bytes
        }
        other => panic!("expected a rampup-capped chunk, got {other:?}"),
    };
    assert!(bytes_sent <= RAMPUP_CAP);

    fixture.server.feed(&fixture.client.flush());
    let server_events = fixture.server.poll().unwrap();
    assert!(server_events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::BinaryStreamAnnounced(h) if h.stream_id == stream_id)));

    // The receiver's bhandler already has this blob cached: cancel rather
    // than accept any more of the transfer.
    fixture
        .server
        .cancel_stream(CONTROL_CHANNEL, stream_id, StreamKind::Blob)
        .unwrap();

    fixture.client.feed(&fixture.server.flush());
    let client_events = fixture.client.poll().unwrap();
    assert!(client_events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::StreamCancelled { stream_id: sid, .. } if *sid == stream_id)));

    assert!(scheduler.forget(stream_id));
    assert!(scheduler.is_empty());
}

#[test]
fn scenario_3b_file_backed_blob_source_streams_from_disk() {
    use std::io::Write;

    let mut fixture = TwoNodeFixture::new();
    fixture.handshake();

    let payload = vec![0x42u8; 4096];
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&payload).unwrap();
    tmp.flush().unwrap();
    let source = std::fs::File::open(tmp.path()).unwrap();

    let mut scheduler = BlobScheduler::new();
    let stream_id = scheduler.enqueue(CONTROL_CHANNEL, Box::new(source), payload.len() as u64, None);

    loop {
        match scheduler
            .append_blob(&mut fixture.client, DrainMode::All, 0)
            .unwrap()
        {
            AppendOutcome::Sent { complete, .. } => {
                if complete {
                    break;
                }
            }
            AppendOutcome::Idle => break,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fixture.server.feed(&fixture.client.flush());
    let server_events = fixture.server.poll().unwrap();
    let chunks: Vec<u8> = server_events
        .into_iter()
        .filter_map(|e| match e {
            ConnectionEvent::BlobChunk { stream_id: sid, data, .. } if sid == stream_id => Some(data),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(chunks, payload);
}

#[test]
fn scenario_4_multipart_message_coalesces_into_one_payload() {
    let mut fixture = TwoNodeFixture::with_event_size(16);
    fixture.handshake();

    // chunk_cap = event_size - header(4) = 12; 12 + 12 + 5 = 3 parts, the
    // first two carrying the continuation bit and the third clearing it.
    let payload: Vec<u8> = (0..29u32).map(|i| i as u8).collect();
    fixture.client.send_message(CONTROL_CHANNEL, &payload).unwrap();

    let wire = fixture.client.flush();
    let kinds = packet_types(&wire, frame::MAC_FULL, 16);
    assert_eq!(kinds, vec![PacketType::Event; 3]);

    fixture.server.feed(&wire);
    let events = fixture.server.poll().unwrap();
    let messages: Vec<_> = events
        .into_iter()
        .filter(|e| matches!(e, ConnectionEvent::Message { .. }))
        .collect();
    assert_eq!(messages.len(), 1, "three parts must coalesce into exactly one message");
    match &messages[0] {
        ConnectionEvent::Message { channel, payload: got } => {
            assert_eq!(*channel, CONTROL_CHANNEL);
            assert_eq!(got, &payload);
        }
        _ => unreachable!(),
    }
}

#[test]
fn scenario_4b_oversized_multipart_sequence_is_rejected_as_overflow() {
    let mut fixture = TwoNodeFixture::with_event_size(64);
    fixture.handshake();

    // A payload larger than MAX_MESSAGE_SIZE chunks into many EVENT parts;
    // the assembly on the receiving side must reject it once the
    // accumulated buffer would exceed the limit, rather than reassembling
    // an unbounded message.
    let payload = vec![0u8; (1 << 20) + 1];
    fixture.client.send_message(CONTROL_CHANNEL, &payload).unwrap();

    fixture.server.feed(&fixture.client.flush());
    let err = fixture.server.poll().unwrap_err();
    assert!(matches!(
        err,
        Error::PeerReportable(meridian_core::error::PeerReportableError::MessageOverflow)
    ));
}

#[test]
fn scenario_5_congestion_window_saturates_then_slides_on_ack() {
    let mut fixture = TwoNodeFixture::new();
    fixture.handshake();

    let pixel = vec![0u8; 3];
    for stream_id in 0..10u32 {
        fixture
            .client
            .send_video_frame(keyframe_meta(CONTROL_CHANNEL, stream_id, 1, 1), &pixel, None)
            .unwrap();
    }

    assert_eq!(fixture.client.video_backpressure(), 8);
    assert!(fixture.client.is_video_saturated());

    // Ring now holds stream ids [2..=9]; the 5th entry (1-indexed) is id 6.
    fixture.client.ack_video(6);
    assert_eq!(fixture.client.video_backpressure(), 3);
    assert!(!fixture.client.is_video_saturated());
}

#[test]
fn scenario_6_directory_mediated_tunnel_splices_blob_then_releases_channel() {
    let mut fixture = TwoNodeFixture::new();
    fixture.handshake();

    let mut client_dir = DirectoryManager::new();
    let mut server_dir = DirectoryManager::new();

    let target_pubk = [7u8; 32];
    client_dir
        .request_dynamic_resource(&mut fixture.client, target_pubk, true)
        .unwrap();
    assert!(client_dir.has_pending_open());

    let (_, server_events) = fixture.pump();
    let open_request = server_events
        .iter()
        .find_map(|e| match server_dir.handle_event(e) {
            Some(DirectoryOutcome::OpenRequested(open)) => Some(open),
            _ => None,
        })
        .expect("server observed the DIROPEN request");
    assert_eq!(open_request.target_pubk, target_pubk);
    assert_eq!(open_request.mode, DirOpenMode::PreferTunnel);

    let tunnel_channel = 1u8;
    fixture.server.open_channel(tunnel_channel);
    server_dir
        .answer_open(&mut fixture.server, DirOpened::tunnel(tunnel_channel))
        .unwrap();

    let (client_events, _) = fixture.pump();
    let opened = client_events
        .iter()
        .find_map(|e| match client_dir.handle_event(e) {
            Some(DirectoryOutcome::OpenAnswered { reply, target_pubk: got }) => {
                assert_eq!(got, target_pubk);
                Some(reply)
            }
            _ => None,
        })
        .expect("client observed the DIROPENED reply");
    assert_eq!(opened.tunnel_channel(), Some(tunnel_channel));
    assert!(!client_dir.has_pending_open());
    fixture.client.open_channel(tunnel_channel);

    // Splice a byte stream over BLOB packets on the negotiated channel.
    let payload = b"spliced tunnel payload".to_vec();
    fixture
        .client
        .send_binary_stream(BinaryStream {
            channel: tunnel_channel,
            stream_id: 7,
            size: payload.len() as u64,
            ..Default::default()
        })
        .unwrap();
    fixture
        .client
        .send_blob_chunk(tunnel_channel, 7, &payload)
        .unwrap();

    let (_, server_events) = fixture.pump();
    assert!(server_events.iter().any(|e| matches!(
        e,
        ConnectionEvent::BlobChunk { channel, stream_id: 7, complete: true, .. } if *channel == tunnel_channel
    )));

    // Closing the tunnel releases channel state on both sides; any further
    // traffic on it is rejected as an unknown channel.
    fixture.client.close_channel(tunnel_channel);
    fixture.server.close_channel(tunnel_channel);
    assert!(!fixture.client.is_channel_open(tunnel_channel));
    assert!(!fixture.server.is_channel_open(tunnel_channel));

    fixture
        .client
        .send_blob_chunk(tunnel_channel, 7, b"late bytes")
        .unwrap();
    fixture.server.feed(&fixture.client.flush());
    let err = fixture.server.poll().unwrap_err();
    assert!(matches!(
        err,
        Error::Stream { channel, source: StreamError::UnknownChannel, .. } if channel == tunnel_channel
    ));
}
