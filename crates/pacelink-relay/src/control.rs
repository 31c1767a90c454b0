//! # Rate-Controller Interface
//!
//! The relay core never does its own pacing math: every transmit is gated
//! by an external congestion-control engine behind [`RateController`].
//! Timestamps are Q16.16 seconds from the pipeline's [`MediaClock`]
//! (`crate::clock`).
//!
//! [`TokenBucketPacer`] is the minimal bundled implementation — a plain
//! token bucket at the stream's target rate, enough to run the daemon end
//! to end. It makes no claim of fidelity to any congestion-control
//! algorithm.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::clock::Q16_ONE_SECOND;

// ─── Bounds ─────────────────────────────────────────────────────────────────

/// Hard floor for a stream's minimum bitrate.
pub const BITRATE_FLOOR_BPS: f64 = 64e3;

/// Hard ceiling for a stream's maximum bitrate.
pub const BITRATE_CEIL_BPS: f64 = 100e6;

/// Per-stream bitrate envelope, in bits per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamBounds {
    pub min_bps: f64,
    pub start_bps: f64,
    pub max_bps: f64,
}

impl StreamBounds {
    pub fn new(min_bps: f64, start_bps: f64, max_bps: f64) -> Self {
        StreamBounds {
            min_bps,
            start_bps,
            max_bps,
        }
    }

    /// Clamp into the supported envelope and restore min ≤ start ≤ max.
    pub fn clamped(self) -> Self {
        let max_bps = self.max_bps.min(BITRATE_CEIL_BPS);
        let min_bps = self.min_bps.max(BITRATE_FLOOR_BPS).min(max_bps);
        let max_bps = max_bps.max(min_bps);
        let start_bps = self.start_bps.clamp(min_bps, max_bps);
        StreamBounds {
            min_bps,
            start_bps,
            max_bps,
        }
    }
}

impl Default for StreamBounds {
    fn default() -> Self {
        StreamBounds {
            min_bps: 1e6,
            start_bps: 1e6,
            max_bps: 30e6,
        }
    }
}

// ─── Admission ──────────────────────────────────────────────────────────────

/// The controller's answer to "may this stream transmit right now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Transmit immediately.
    Grant,
    /// Not yet; ask again on a later tick.
    Defer,
}

impl Admission {
    pub fn is_grant(self) -> bool {
        self == Admission::Grant
    }
}

// ─── Controller interface ───────────────────────────────────────────────────

/// Congestion-control engine consumed by the relay. All calls happen under
/// the stream-table lock, so implementations need no internal locking; they
/// must never block.
pub trait RateController: Send {
    /// Announce a new stream with its bitrate envelope.
    fn register_stream(&mut self, ssrc: u32, bounds: StreamBounds);

    /// Drop a stream evicted from the table.
    fn unregister_stream(&mut self, ssrc: u32);

    /// May `ssrc` transmit at `now`?
    fn query_admission(&mut self, now: u32, ssrc: u32) -> Admission;

    /// Report a completed transmission; returns the next admission
    /// decision for the same stream.
    fn on_transmitted(&mut self, now: u32, ssrc: u32, size: usize, seq: u16, marker: bool)
        -> Admission;

    /// A new media packet arrived for `ssrc` (marker set on frame end).
    fn on_media_frame(&mut self, now: u32, ssrc: u32, size: usize, marker: bool);

    /// Raw feedback bytes arrived from the far end.
    fn on_feedback_bytes(&mut self, now: u32, feedback: &[u8]);

    /// Produce feedback bytes to send to the far end, if any are due.
    /// `marker` signals a frame boundary, the natural flush point.
    fn build_feedback(&mut self, now: u32, marker: bool) -> Option<Bytes>;

    /// Current target media rate for `ssrc`, in bytes per second.
    /// Zero or negative means "no rate available — request a keyframe".
    fn target_bitrate(&mut self, ssrc: u32) -> f64;

    /// One-line statistics summary for periodic logging.
    fn statistics(&mut self, now: u32) -> String;
}

// ─── Token-bucket pacer ─────────────────────────────────────────────────────

/// Credit window the bucket may accumulate, as a fraction of a second.
const BURST_WINDOW: f64 = 0.05;

/// Bucket floor so a fresh or starved stream can always send one packet.
const MIN_BURST_BYTES: f64 = 3_000.0;

#[derive(Debug)]
struct Bucket {
    /// Current target in bits per second.
    target_bps: f64,
    /// Spendable bytes.
    credit: f64,
    last_refill: Option<u32>,
    sent_packets: u64,
    sent_bytes: u64,
}

impl Bucket {
    fn new(bounds: StreamBounds) -> Self {
        Bucket {
            target_bps: bounds.start_bps,
            credit: MIN_BURST_BYTES,
            last_refill: None,
            sent_packets: 0,
            sent_bytes: 0,
        }
    }

    fn burst_cap(&self) -> f64 {
        (self.target_bps / 8.0 * BURST_WINDOW).max(MIN_BURST_BYTES)
    }

    fn refill(&mut self, now: u32) {
        if let Some(last) = self.last_refill {
            let elapsed = f64::from(now.wrapping_sub(last)) / f64::from(Q16_ONE_SECOND);
            self.credit = (self.credit + elapsed * self.target_bps / 8.0).min(self.burst_cap());
        }
        self.last_refill = Some(now);
    }

    fn admission(&self) -> Admission {
        if self.credit > 0.0 {
            Admission::Grant
        } else {
            Admission::Defer
        }
    }
}

/// Fixed-envelope admission gate: each stream spends byte credit that
/// refills at its target rate.
#[derive(Debug, Default)]
pub struct TokenBucketPacer {
    streams: HashMap<u32, Bucket>,
    /// SSRC of the most recently observed media packet; echoed in
    /// synthesized feedback.
    feedback_ssrc: Option<u32>,
    frames_seen: u64,
    feedback_packets: u64,
}

impl TokenBucketPacer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateController for TokenBucketPacer {
    fn register_stream(&mut self, ssrc: u32, bounds: StreamBounds) {
        let bounds = bounds.clamped();
        tracing::info!(
            ssrc,
            min_bps = bounds.min_bps,
            start_bps = bounds.start_bps,
            max_bps = bounds.max_bps,
            "pacer stream registered"
        );
        self.streams.insert(ssrc, Bucket::new(bounds));
    }

    fn unregister_stream(&mut self, ssrc: u32) {
        self.streams.remove(&ssrc);
    }

    fn query_admission(&mut self, now: u32, ssrc: u32) -> Admission {
        match self.streams.get_mut(&ssrc) {
            Some(bucket) => {
                bucket.refill(now);
                bucket.admission()
            }
            None => Admission::Defer,
        }
    }

    fn on_transmitted(
        &mut self,
        now: u32,
        ssrc: u32,
        size: usize,
        _seq: u16,
        _marker: bool,
    ) -> Admission {
        match self.streams.get_mut(&ssrc) {
            Some(bucket) => {
                bucket.refill(now);
                bucket.credit -= size as f64;
                bucket.sent_packets += 1;
                bucket.sent_bytes += size as u64;
                bucket.admission()
            }
            None => Admission::Defer,
        }
    }

    fn on_media_frame(&mut self, _now: u32, ssrc: u32, _size: usize, marker: bool) {
        self.feedback_ssrc = Some(ssrc);
        if marker {
            self.frames_seen += 1;
        }
    }

    fn on_feedback_bytes(&mut self, _now: u32, feedback: &[u8]) {
        self.feedback_packets += 1;
        if let Some(hdr) = pacelink_wire::rtp::RtcpHeader::parse(feedback) {
            tracing::debug!(ssrc = hdr.ssrc, packet_type = hdr.packet_type, "feedback received");
        }
    }

    fn build_feedback(&mut self, _now: u32, marker: bool) -> Option<Bytes> {
        if !marker {
            return None;
        }
        let ssrc = self.feedback_ssrc?;
        // Minimal RTCP transport-feedback shell: V=2, PT=205, length 1
        // (one 32-bit word past the first).
        let mut pkt = BytesMut::with_capacity(8);
        pkt.put_u8(0x80);
        pkt.put_u8(205);
        pkt.put_u16(1);
        pkt.put_u32(ssrc);
        Some(pkt.freeze())
    }

    fn target_bitrate(&mut self, ssrc: u32) -> f64 {
        self.streams
            .get(&ssrc)
            .map_or(0.0, |bucket| bucket.target_bps / 8.0)
    }

    fn statistics(&mut self, _now: u32) -> String {
        let sent: u64 = self.streams.values().map(|b| b.sent_packets).sum();
        let bytes: u64 = self.streams.values().map(|b| b.sent_bytes).sum();
        format!(
            "streams={} sent_packets={} sent_bytes={} frames_seen={} feedback_packets={}",
            self.streams.len(),
            sent,
            bytes,
            self.frames_seen,
            self.feedback_packets
        )
    }
}
