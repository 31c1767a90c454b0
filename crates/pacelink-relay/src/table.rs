//! # Stream Table
//!
//! Per-SSRC state for everything the relay is currently carrying: arrival
//! tracking for the reaper and a FIFO outbound queue for the transmit
//! scheduler. Ingest, reap and drain all run under one coarse lock owned
//! by the relay block — entries are created, mutated and evicted while it
//! is held, and none of these paths performs blocking I/O.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use pacelink_wire::rtp::RtpHeader;

use crate::clock::Q16_ONE_SECOND;
use crate::control::{RateController, StreamBounds};

/// Idle time after which an empty stream is evicted (Q16.16 seconds).
pub const STREAM_IDLE_Q16: u32 = Q16_ONE_SECOND;

// ─── Queued packet ──────────────────────────────────────────────────────────

/// One RTP packet waiting for admission.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    /// Full packet bytes, header included.
    pub payload: Bytes,
    pub seq: u16,
    pub marker: bool,
    /// Enqueue stamp, Q16.16.
    pub queued_at: u32,
}

// ─── Stream entry ───────────────────────────────────────────────────────────

/// State for one SSRC.
#[derive(Debug)]
pub struct StreamEntry {
    pub last_seq: u16,
    /// Last packet arrival, Q16.16.
    pub last_arrival: u32,
    queue: VecDeque<QueuedPacket>,
}

impl StreamEntry {
    fn new(seq: u16, now: u32) -> Self {
        StreamEntry {
            last_seq: seq,
            last_arrival: now,
            queue: VecDeque::new(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

// ─── Counters ───────────────────────────────────────────────────────────────

/// Monitoring counters, logged with the periodic statistics line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableStats {
    pub packets_in: u64,
    pub packets_out: u64,
    /// Wraparound-aware sequence discontinuities (monitoring only).
    pub sequence_gaps: u64,
    pub streams_evicted: u64,
}

// ─── Table ──────────────────────────────────────────────────────────────────

/// The per-SSRC state table.
#[derive(Debug)]
pub struct StreamTable {
    entries: HashMap<u32, StreamEntry>,
    bounds: StreamBounds,
    stats: TableStats,
}

impl StreamTable {
    pub fn new(bounds: StreamBounds) -> Self {
        StreamTable {
            entries: HashMap::new(),
            bounds: bounds.clamped(),
            stats: TableStats::default(),
        }
    }

    /// Replace the envelope used when registering new streams.
    pub fn set_bounds(&mut self, bounds: StreamBounds) {
        self.bounds = bounds.clamped();
    }

    /// Queue an RTP packet for its stream, creating (and registering with
    /// the controller) the stream on first sight, and report the new media
    /// frame to the controller.
    pub fn ingest(
        &mut self,
        ctl: &mut dyn RateController,
        now: u32,
        hdr: &RtpHeader,
        packet: Bytes,
    ) {
        let size = packet.len();
        let entry = match self.entries.entry(hdr.ssrc) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                let delta = hdr.sequence.wrapping_sub(entry.last_seq);
                if delta != 1 {
                    // Monitoring signal only; the packet is accepted as-is.
                    self.stats.sequence_gaps += 1;
                    tracing::debug!(
                        ssrc = hdr.ssrc,
                        last_seq = entry.last_seq,
                        seq = hdr.sequence,
                        "sequence discontinuity"
                    );
                }
                entry
            }
            Entry::Vacant(vacant) => {
                tracing::info!(ssrc = hdr.ssrc, "new stream");
                ctl.register_stream(hdr.ssrc, self.bounds);
                vacant.insert(StreamEntry::new(hdr.sequence, now))
            }
        };

        entry.queue.push_back(QueuedPacket {
            payload: packet,
            seq: hdr.sequence,
            marker: hdr.marker,
            queued_at: now,
        });
        entry.last_seq = hdr.sequence;
        entry.last_arrival = now;
        self.stats.packets_in += 1;

        ctl.on_media_frame(now, hdr.ssrc, size, hdr.marker);
    }

    /// Evict streams idle longer than [`STREAM_IDLE_Q16`] whose queues are
    /// empty, releasing their controller registrations. Returns how many
    /// went.
    pub fn reap(&mut self, ctl: &mut dyn RateController, now: u32) -> usize {
        let mut evicted = 0;
        self.entries.retain(|ssrc, entry| {
            let idle = now.wrapping_sub(entry.last_arrival) > STREAM_IDLE_Q16;
            if idle && entry.queue.is_empty() {
                tracing::info!(ssrc, "stream idle, evicting");
                ctl.unregister_stream(*ssrc);
                evicted += 1;
                false
            } else {
                true
            }
        });
        self.stats.streams_evicted += evicted as u64;
        evicted
    }

    /// Pop the oldest queued packet for `ssrc`.
    pub fn pop(&mut self, ssrc: u32) -> Option<QueuedPacket> {
        let pkt = self.entries.get_mut(&ssrc)?.queue.pop_front();
        if pkt.is_some() {
            self.stats.packets_out += 1;
        }
        pkt
    }

    /// Active SSRCs, in table-iteration order (the scheduler's scan order;
    /// no fairness beyond that is promised).
    pub fn ssrcs(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn entry(&self, ssrc: u32) -> Option<&StreamEntry> {
        self.entries.get(&ssrc)
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        self.entries.contains_key(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> TableStats {
        self.stats
    }
}
