//! # RTP Traffic Source
//!
//! Synthesizes RTP packets at a configured bitrate and framerate — a
//! stand-in for the encoder when exercising the paced path without a real
//! media producer. Each frame's byte budget is split into MTU-sized
//! packets with the marker set on the last one, and a listener worker
//! retunes the rate when a BitrateRequest arrives.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use quanta::Instant;
use rand::RngExt;

use crate::block::{parse_or, parse_params, Block, BlockCore, BlockError, Params};
use crate::clock::{q16_to_secs, MediaClock, Q16_ONE_SECOND};
use crate::fabric::{Sink, Source};
use crate::msg::{Msg, MsgKind, MsgQueue};
use pacelink_wire::rtp::RtpHeader;

/// Payload bytes per generated packet (header excluded).
const MAX_PAYLOAD: usize = 1396;

/// Bounded slice for inter-frame sleeps so stop stays responsive.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Audio,
    Video,
}

/// Synthetic RTP source block.
pub struct RtpSource {
    core: BlockCore,
    sink: Sink,
    source: Source,
    clock: MediaClock,
    kind: MediaKind,
    /// Bits per second; shared so the listener can retune it live.
    bitrate: Arc<AtomicU64>,
    framerate: f64,
    clock_freq: u32,
    ssrc: u32,
    seq: Arc<AtomicU32>,
}

impl RtpSource {
    pub fn new(name: &str, clock: MediaClock) -> Self {
        RtpSource {
            core: BlockCore::new(name),
            sink: Sink::new(),
            source: Source::new(),
            clock,
            kind: MediaKind::Video,
            bitrate: Arc::new(AtomicU64::new(0)),
            framerate: 0.0,
            clock_freq: 0,
            ssrc: 0,
            seq: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn queue(&self) -> MsgQueue {
        self.sink.queue()
    }

    pub fn register(&self, kind: MsgKind, queue: MsgQueue) -> bool {
        self.source.register(kind, queue)
    }

    pub fn unregister(&self, kind: MsgKind, queue: &MsgQueue) -> bool {
        self.source.unregister(kind, queue)
    }
}

impl Block for RtpSource {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, params: &Params) -> Result<(), BlockError> {
        self.core.guard_reinit()?;

        let name = self.core.name().to_string();
        let mut kind = None;
        let mut bitrate = 0u64;
        let mut framerate = 0.0f64;
        let mut clock_freq = 0u32;
        let mut ssrc = 0u32;
        parse_params(&name, params, |key, value| match key {
            "type" => {
                kind = match value.to_ascii_lowercase().as_str() {
                    "audio" | "a" => Some(MediaKind::Audio),
                    "video" | "v" => Some(MediaKind::Video),
                    _ => None,
                };
                true
            }
            "bitrate" => {
                bitrate = parse_or(&name, key, value, bitrate);
                true
            }
            "framerate" => {
                framerate = parse_or(&name, key, value, framerate);
                true
            }
            "clock_freq" => {
                clock_freq = parse_or(&name, key, value, clock_freq);
                true
            }
            "ssrc" => {
                ssrc = parse_or(&name, key, value, ssrc);
                true
            }
            _ => false,
        });

        self.kind = kind.unwrap_or_else(|| {
            tracing::info!(block = %name, "type not defined, set to video");
            MediaKind::Video
        });
        if bitrate == 0 {
            bitrate = 1_000_000;
            tracing::info!(block = %name, bitrate, "bitrate not defined");
        }
        if framerate == 0.0 {
            framerate = 50.0;
            tracing::info!(block = %name, framerate, "framerate not defined");
        }
        if clock_freq == 0 {
            clock_freq = match self.kind {
                MediaKind::Video => 90_000,
                MediaKind::Audio => 48_000,
            };
            tracing::info!(block = %name, clock_freq, "clock frequency not defined");
        }
        if ssrc == 0 {
            ssrc = rand::rng().random();
        }

        self.bitrate.store(bitrate, Ordering::Relaxed);
        self.framerate = framerate;
        self.clock_freq = clock_freq;
        self.ssrc = ssrc;
        self.seq.store(0, Ordering::Relaxed);

        tracing::info!(
            block = %name,
            bitrate,
            framerate,
            ssrc,
            clock_freq,
            "generator initialized"
        );
        self.core.mark_initialized();
        Ok(())
    }

    fn start(&mut self) {
        if !self.core.begin_start() {
            return;
        }

        // Packet generator.
        {
            let stop = self.core.stop_flag();
            let source = self.source.clone();
            let clock = self.clock.clone();
            let bitrate = self.bitrate.clone();
            let seq = self.seq.clone();
            let framerate = self.framerate;
            let clock_freq = self.clock_freq;
            let kind = self.kind;
            let ssrc = self.ssrc;
            self.core.spawn("gen", move || {
                let frame_interval = Duration::from_secs_f64(1.0 / framerate);
                while !stop.load(Ordering::Relaxed) {
                    let frame_start = Instant::now();
                    let now = clock.now_q16();
                    let media_ts = (q16_to_secs(now) * f64::from(clock_freq)) as u32;
                    let mut budget =
                        (bitrate.load(Ordering::Relaxed) as f64 / (8.0 * framerate)) as usize;

                    while budget > 0 {
                        let payload_len = budget.min(MAX_PAYLOAD);
                        budget -= payload_len;

                        let hdr = RtpHeader {
                            version: 2,
                            padding: false,
                            extension: false,
                            csrc_count: 0,
                            marker: budget == 0,
                            payload_type: match kind {
                                MediaKind::Video => 96,
                                MediaKind::Audio => 97,
                            },
                            sequence: seq.fetch_add(1, Ordering::Relaxed) as u16,
                            timestamp: media_ts,
                            ssrc,
                        };
                        let mut pkt = BytesMut::with_capacity(12 + payload_len);
                        hdr.encode(&mut pkt);
                        pkt.put_bytes(0, payload_len);
                        source.forward(Msg::with_extra(
                            MsgKind::RtpPacket,
                            pkt.freeze(),
                            u64::from(now),
                        ));
                    }

                    // Sleep out the frame interval in bounded slices.
                    loop {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        let elapsed = Instant::now() - frame_start;
                        if elapsed >= frame_interval {
                            break;
                        }
                        std::thread::sleep((frame_interval - elapsed).min(SLEEP_SLICE));
                    }
                }
            });
        }

        // Listener: bitrate retune requests.
        let stop = self.core.stop_flag();
        let sink = self.sink.clone();
        let clock = self.clock.clone();
        let bitrate = self.bitrate.clone();
        let name = self.core.name().to_string();
        self.core.spawn("listen", move || {
            let mut last_log = 0u32;
            while !stop.load(Ordering::Relaxed) {
                if let Some(msg) = sink.recv_timeout() {
                    match msg.kind {
                        MsgKind::BitrateRequest => {
                            bitrate.store(msg.extra, Ordering::Relaxed);
                        }
                        other => {
                            tracing::debug!(block = %name, kind = ?other, "unexpected message kind");
                        }
                    }
                }

                let now = clock.now_q16();
                if now.wrapping_sub(last_log) > 2 * Q16_ONE_SECOND {
                    tracing::info!(block = %name, bitrate = bitrate.load(Ordering::Relaxed), "current bitrate");
                    last_log = now;
                }
            }
        });
    }

    fn stop(&mut self) {
        self.core.stop();
    }
}
