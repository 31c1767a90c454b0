//! End-to-end pipeline tests: real sockets, real worker threads, the same
//! wiring the daemon uses.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use pacelink_relay::block::{Block, Params};
use pacelink_relay::clock::MediaClock;
use pacelink_relay::control::TokenBucketPacer;
use pacelink_relay::convert::TypeConverter;
use pacelink_relay::msg::{Msg, MsgKind, MsgQueue};
use pacelink_relay::net::UdpAdapter;
use pacelink_relay::relay::PacedRelay;
use pacelink_wire::rtp::RtpHeader;
use pacelink_wire::token;

fn params(pairs: &[(&str, String)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect::<HashMap<_, _>>()
}

fn rtp_packet(ssrc: u32, seq: u16, marker: bool, payload: &[u8]) -> Bytes {
    let hdr = RtpHeader {
        version: 2,
        padding: false,
        extension: false,
        csrc_count: 0,
        marker,
        payload_type: 96,
        sequence: seq,
        timestamp: 1000 + u32::from(seq),
        ssrc,
    };
    let mut raw = BytesMut::new();
    hdr.encode(&mut raw);
    raw.extend_from_slice(payload);
    raw.freeze()
}

fn recv_soon(queue: &MsgQueue) -> Option<pacelink_relay::msg::SharedMsg> {
    (0..20).find_map(|_| queue.recv_timeout())
}

/// The daemon's media chain: UDP ingress → Raw→RtpPacket tag → paced relay
/// → egress socket. Datagrams put in one end come out the other, paced,
/// intact and in order.
#[test]
fn media_chain_end_to_end() {
    let far_end = UdpSocket::bind("127.0.0.1:0").unwrap();
    far_end
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let far_addr = far_end.local_addr().unwrap();

    let mut ingress = UdpAdapter::new("it-media-ingress");
    ingress
        .init(&params(&[
            ("local_addr", "127.0.0.1".to_string()),
            ("local_port", "0".to_string()),
        ]))
        .unwrap();

    let mut tag = TypeConverter::new("it-media-tag", MsgKind::Raw, MsgKind::RtpPacket).unwrap();
    tag.init(&Params::new()).unwrap();

    let mut relay = PacedRelay::new(
        "it-relay",
        Box::new(TokenBucketPacer::new()),
        MediaClock::new(),
    );
    relay
        .init(&params(&[
            ("local_addr", "127.0.0.1".to_string()),
            ("local_port", "0".to_string()),
            ("remote_addr", "127.0.0.1".to_string()),
            ("remote_port", far_addr.port().to_string()),
            ("min_bitrate", "1000000".to_string()),
            ("max_bitrate", "30000000".to_string()),
            ("start_bitrate", "10000000".to_string()),
        ]))
        .unwrap();

    ingress.register(MsgKind::Raw, tag.queue());
    tag.register(MsgKind::RtpPacket, relay.queue());

    relay.start();
    tag.start();
    ingress.start();

    let ingress_addr = ingress.local_addr().unwrap();
    let game_server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sent: Vec<Bytes> = (1..=5u16)
        .map(|seq| rtp_packet(100, seq, seq == 5, b"frame-slice"))
        .collect();
    for pkt in &sent {
        game_server.send_to(pkt, ingress_addr).unwrap();
    }

    let mut buf = [0u8; 2048];
    for expected in &sent {
        let n = far_end.recv(&mut buf).expect("relayed packet");
        assert_eq!(&buf[..n], &expected[..], "payload must cross unmodified");
    }

    ingress.stop();
    tag.stop();
    relay.stop();
}

/// Fan-out FIFO across chained blocks: every registered queue sees the
/// same messages in forward order.
#[test]
fn fan_out_fifo_to_three_queues() {
    let mut tag = TypeConverter::new("it-fanout", MsgKind::Raw, MsgKind::RtpPacket).unwrap();
    tag.init(&Params::new()).unwrap();

    let queues: Vec<_> = (0..3).map(|_| MsgQueue::bounded(16)).collect();
    for q in &queues {
        tag.register(MsgKind::RtpPacket, q.clone());
    }
    tag.start();

    let inbox = tag.queue();
    for seq in 1..=3u16 {
        inbox.push(Msg::raw(rtp_packet(7, seq, false, b"x")));
    }

    for q in &queues {
        for seq in 1..=3u16 {
            let msg = recv_soon(q).expect("fanned-out message");
            let (hdr, _) = RtpHeader::parse(&msg.payload).unwrap();
            assert_eq!(hdr.sequence, seq);
        }
    }

    tag.stop();
}

/// The reaper evicts a stream that has gone quiet with an empty queue.
#[test]
fn idle_stream_is_reaped() {
    let far_end = UdpSocket::bind("127.0.0.1:0").unwrap();
    let far_addr = far_end.local_addr().unwrap();

    let mut relay = PacedRelay::new(
        "it-reap",
        Box::new(TokenBucketPacer::new()),
        MediaClock::new(),
    );
    relay
        .init(&params(&[
            ("local_addr", "127.0.0.1".to_string()),
            ("local_port", "0".to_string()),
            ("remote_addr", "127.0.0.1".to_string()),
            ("remote_port", far_addr.port().to_string()),
        ]))
        .unwrap();
    relay.start();

    relay
        .queue()
        .push(Msg::new(MsgKind::RtpPacket, rtp_packet(100, 1, true, b"x")));

    // The stream appears...
    let shared = relay.shared();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !shared.lock().unwrap().table.contains(100) {
        assert!(std::time::Instant::now() < deadline, "stream never appeared");
        std::thread::sleep(Duration::from_millis(10));
    }

    // ...and after a second of silence (queue long since drained) it goes.
    let deadline = std::time::Instant::now() + Duration::from_secs(4);
    while shared.lock().unwrap().table.contains(100) {
        assert!(std::time::Instant::now() < deadline, "stream never evicted");
        std::thread::sleep(Duration::from_millis(50));
    }

    relay.stop();
}

/// Feedback through the relay surfaces control tokens on the command path:
/// RTCP in → BitrateRequest → converter → JSON token out.
#[test]
fn feedback_to_control_token() {
    let mut relay = PacedRelay::new(
        "it-feedback",
        Box::new(TokenBucketPacer::new()),
        MediaClock::new(),
    );
    relay
        .init(&params(&[
            ("local_addr", "127.0.0.1".to_string()),
            ("local_port", "0".to_string()),
            ("remote_addr", "127.0.0.1".to_string()),
            ("remote_port", "9".to_string()),
            ("start_bitrate", "2000000".to_string()),
        ]))
        .unwrap();

    let mut tokens =
        TypeConverter::new("it-bitrate-token", MsgKind::BitrateRequest, MsgKind::Raw).unwrap();
    tokens.init(&Params::new()).unwrap();

    let command_out = MsgQueue::bounded(8);
    relay.register(MsgKind::BitrateRequest, tokens.queue());
    tokens.register(MsgKind::Raw, command_out.clone());

    relay.start();
    tokens.start();

    // Stream must exist before feedback is accepted.
    relay
        .queue()
        .push(Msg::new(MsgKind::RtpPacket, rtp_packet(100, 1, false, b"x")));

    let mut rtcp = BytesMut::new();
    rtcp.extend_from_slice(&[0x80, 205, 0x00, 0x01]);
    rtcp.extend_from_slice(&100u32.to_be_bytes());
    relay
        .queue()
        .push(Msg::new(MsgKind::RtcpPacket, rtcp.freeze()));

    let msg = recv_soon(&command_out).expect("control token");
    assert_eq!(msg.kind, MsgKind::Raw);
    let parsed = token::parse_token(&msg.payload).expect("valid token");
    assert_eq!(parsed.v, 2_000_000, "start bitrate echoed as the target");

    relay.stop();
    tokens.stop();
}
