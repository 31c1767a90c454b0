//! # Pacelink Relay Daemon
//!
//! Wires the relay-side pipeline: media RTP from the game server into the
//! congestion-paced relay toward the remote client, RTCP and input-stream
//! passthrough pairs, and the TCP command channel carrying bitrate /
//! keyframe requests back to the encoder.
//!
//! ```bash
//! # Relay between a local game server and a remote client
//! pacelink-relay --client 203.0.113.7
//!
//! # Self-test: synthesize RTP traffic instead of relaying ingress media
//! pacelink-relay --client 127.0.0.1 --self-test
//! ```

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use pacelink_relay::block::{Block, Params};
use pacelink_relay::clock::MediaClock;
use pacelink_relay::control::TokenBucketPacer;
use pacelink_relay::convert::TypeConverter;
use pacelink_relay::gen::RtpSource;
use pacelink_relay::msg::MsgKind;
use pacelink_relay::net::{TcpClientAdapter, TcpServerAdapter, UdpAdapter};
use pacelink_relay::relay::PacedRelay;

#[derive(Parser, Debug)]
#[command(name = "pacelink-relay", about = "Congestion-paced media relay")]
struct Args {
    /// Game-server address (media and command origin)
    #[arg(long, default_value = "127.0.0.1")]
    game_server: IpAddr,

    /// Remote client address
    #[arg(long)]
    client: IpAddr,

    /// Local address for game-server-facing sockets
    #[arg(long, default_value = "127.0.0.1")]
    game_server_bind: IpAddr,

    /// Local address for client-facing sockets
    #[arg(long, default_value = "0.0.0.0")]
    client_bind: IpAddr,

    /// Minimum media bitrate, bits per second
    #[arg(long, default_value_t = 500_000)]
    min_bitrate: u64,

    /// Maximum media bitrate, bits per second
    #[arg(long, default_value_t = 30_000_000)]
    max_bitrate: u64,

    /// Initial media bitrate, bits per second
    #[arg(long, default_value_t = 10_000_000)]
    start_bitrate: u64,

    /// Generate synthetic RTP traffic instead of relaying ingress media
    #[arg(long)]
    self_test: bool,
}

fn params(pairs: &[(&str, String)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect::<HashMap<_, _>>()
}

fn endpoint(local: IpAddr, local_port: u16, remote: IpAddr, remote_port: u16) -> Params {
    params(&[
        ("local_addr", local.to_string()),
        ("local_port", local_port.to_string()),
        ("remote_addr", remote.to_string()),
        ("remote_port", remote_port.to_string()),
    ])
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let args = Args::parse();
    tracing::info!(
        game_server = %args.game_server,
        client = %args.client,
        min_bitrate = args.min_bitrate,
        max_bitrate = args.max_bitrate,
        start_bitrate = args.start_bitrate,
        self_test = args.self_test,
        "pacelink-relay starting"
    );

    let clock = MediaClock::new();

    // ── Media chain ─────────────────────────────────────────────
    // game server → udp ingress → raw→rtp tag → paced relay → client
    let mut media_ingress = UdpAdapter::new("media-rtp-ingress");
    media_ingress.init(&endpoint(args.game_server_bind, 10002, args.game_server, 0))?;

    let mut media_tag = TypeConverter::new("media-rtp-tag", MsgKind::Raw, MsgKind::RtpPacket)?;
    media_tag.init(&Params::new())?;

    let mut relay = PacedRelay::new("paced-relay", Box::new(TokenBucketPacer::new()), clock.clone());
    let mut relay_params = endpoint(args.client_bind, 30002, args.client, 30002);
    relay_params.insert("min_bitrate".into(), args.min_bitrate.to_string());
    relay_params.insert("max_bitrate".into(), args.max_bitrate.to_string());
    relay_params.insert("start_bitrate".into(), args.start_bitrate.to_string());
    relay.init(&relay_params)?;

    media_ingress.register(MsgKind::Raw, media_tag.queue());
    media_tag.register(MsgKind::RtpPacket, relay.queue());

    // ── Media RTCP passthrough ──────────────────────────────────
    let mut rtcp_server_side = UdpAdapter::new("media-rtcp-server-side");
    rtcp_server_side.init(&endpoint(args.game_server_bind, 10003, args.game_server, 0))?;
    let mut rtcp_client_side = UdpAdapter::new("media-rtcp-client-side");
    rtcp_client_side.init(&endpoint(args.client_bind, 30003, args.client, 30003))?;
    rtcp_server_side.register(MsgKind::Raw, rtcp_client_side.queue());
    rtcp_client_side.register(MsgKind::Raw, rtcp_server_side.queue());

    // ── Input-stream passthrough ────────────────────────────────
    let mut input_server_side = UdpAdapter::new("input-server-side");
    input_server_side.init(&endpoint(args.game_server_bind, 19999, args.game_server, 9999))?;
    let mut input_client_side = UdpAdapter::new("input-client-side");
    input_client_side.init(&endpoint(args.client_bind, 29999, args.client, 29999))?;
    input_server_side.register(MsgKind::Raw, input_client_side.queue());
    input_client_side.register(MsgKind::Raw, input_server_side.queue());

    // ── Command chain ───────────────────────────────────────────
    // client commands in over TCP, encoder control out to the game server
    let mut command_server = TcpServerAdapter::new("command-server");
    command_server.init(&params(&[
        ("local_addr", args.client_bind.to_string()),
        ("local_port", "29998".to_string()),
    ]))?;

    let mut command_client = TcpClientAdapter::new("command-client");
    command_client.init(&params(&[
        ("remote_addr", args.game_server.to_string()),
        ("remote_port", "9998".to_string()),
    ]))?;

    let mut bitrate_tokens =
        TypeConverter::new("bitrate-token", MsgKind::BitrateRequest, MsgKind::Raw)?;
    bitrate_tokens.init(&Params::new())?;
    let mut keyframe_tokens =
        TypeConverter::new("keyframe-token", MsgKind::IframeRequest, MsgKind::Raw)?;
    keyframe_tokens.init(&Params::new())?;

    command_server.register(MsgKind::Raw, command_client.queue());
    command_client.register(MsgKind::Raw, command_server.queue());
    relay.register(MsgKind::BitrateRequest, bitrate_tokens.queue());
    relay.register(MsgKind::IframeRequest, keyframe_tokens.queue());
    bitrate_tokens.register(MsgKind::Raw, command_client.queue());
    keyframe_tokens.register(MsgKind::Raw, command_client.queue());

    // ── Optional synthetic source ───────────────────────────────
    let mut generator = args
        .self_test
        .then(|| -> anyhow::Result<RtpSource> {
            let mut generator = RtpSource::new("test-source", clock.clone());
            generator.init(&params(&[
                ("type", "video".to_string()),
                ("bitrate", args.start_bitrate.to_string()),
                ("framerate", "50".to_string()),
                ("ssrc", "100".to_string()),
            ]))?;
            generator.register(MsgKind::RtpPacket, relay.queue());
            relay.register(MsgKind::BitrateRequest, generator.queue());
            Ok(generator)
        })
        .transpose()?;

    // ── Start, in dependency order ──────────────────────────────
    let mut blocks: Vec<&mut dyn Block> = vec![
        &mut relay,
        &mut media_tag,
        &mut media_ingress,
        &mut rtcp_server_side,
        &mut rtcp_client_side,
        &mut input_server_side,
        &mut input_client_side,
        &mut bitrate_tokens,
        &mut keyframe_tokens,
        &mut command_client,
        &mut command_server,
    ];
    if let Some(generator) = generator.as_mut() {
        blocks.push(generator);
    }

    for block in blocks.iter_mut() {
        block.start();
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    for block in blocks.iter_mut().rev() {
        block.stop();
    }

    tracing::info!("all done");
    Ok(())
}
