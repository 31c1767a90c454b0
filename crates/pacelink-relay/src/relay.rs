//! # Paced Relay Block
//!
//! The heart of the pipeline: owns the egress UDP socket, the per-SSRC
//! stream table and the rate controller, and runs four workers —
//!
//! - **ingest** (main loop): RtpPacket messages from the sink into the
//!   table, RtcpPacket messages into the feedback path;
//! - **pace**: the short-tick transmit scheduler draining admitted packets
//!   onto the socket;
//! - **feedback**: RTCP datagrams arriving on the egress socket, fed to
//!   the controller and surfaced as BitrateRequest / IframeRequest
//!   messages;
//! - **reap**: the idle-stream sweep.
//!
//! Table and controller share one coarse mutex; every worker takes it
//! briefly, and the only I/O under it is the pace tick's send on a
//! connected datagram socket, which cannot block. Messages are forwarded
//! only after the lock is dropped, so the table lock never nests with the
//! fan-out registry lock.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use pacelink_wire::rtp::{RtcpHeader, RtpHeader, RTCP_MIN_HEADER};

use crate::block::{parse_or, parse_params, Block, BlockCore, BlockError, Params};
use crate::clock::{MediaClock, Q16_ONE_SECOND};
use crate::control::{RateController, StreamBounds};
use crate::fabric::{Sink, Source};
use crate::msg::{Msg, MsgKind, MsgQueue, SharedMsg};
use crate::scheduler::drain_streams;
use crate::table::StreamTable;

/// Scheduler tick — short on purpose: scheduling jitter is bought with CPU.
const PACE_TICK: Duration = Duration::from_micros(10);

/// Reaper sweep period (checked on a bounded 100 ms poll).
const REAP_PERIOD_Q16: u32 = Q16_ONE_SECOND / 2;

/// Interval between statistics log lines.
const STATS_PERIOD_Q16: u32 = 2 * Q16_ONE_SECOND;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const UDP_BUFFER_SIZE: usize = 65536;

/// Table + controller behind the one coarse lock shared by ingest, reap
/// and drain.
pub struct RelayShared {
    pub table: StreamTable,
    pub controller: Box<dyn RateController>,
}

/// The congestion-paced relay block.
pub struct PacedRelay {
    core: BlockCore,
    sink: Sink,
    source: Source,
    clock: MediaClock,
    socket: Option<Arc<UdpSocket>>,
    shared: Arc<Mutex<RelayShared>>,
}

impl PacedRelay {
    pub fn new(name: &str, controller: Box<dyn RateController>, clock: MediaClock) -> Self {
        PacedRelay {
            core: BlockCore::new(name),
            sink: Sink::new(),
            source: Source::new(),
            clock,
            socket: None,
            shared: Arc::new(Mutex::new(RelayShared {
                table: StreamTable::new(StreamBounds::default()),
                controller,
            })),
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

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()?.local_addr().ok()
    }

    /// Shared table/controller handle, for inspection in tests.
    pub fn shared(&self) -> Arc<Mutex<RelayShared>> {
        self.shared.clone()
    }
}

fn lock_shared(shared: &Mutex<RelayShared>) -> MutexGuard<'_, RelayShared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Feed feedback bytes to the controller and decide what, if anything, to
/// tell the encoder. Returns the message to forward — the caller forwards
/// it after dropping the table lock.
fn feedback_decision(
    shared: &Mutex<RelayShared>,
    now: u32,
    data: &[u8],
    last_stats: &mut u32,
) -> Option<SharedMsg> {
    let hdr = RtcpHeader::parse(data)?;

    let mut guard = lock_shared(shared);
    if !guard.table.contains(hdr.ssrc) {
        return None;
    }

    guard.controller.on_feedback_bytes(now, data);
    let target_bytes_per_sec = guard.controller.target_bitrate(hdr.ssrc);

    let stats_due = now.wrapping_sub(*last_stats) > STATS_PERIOD_Q16;
    let stats = stats_due.then(|| {
        *last_stats = now;
        let table = guard.table.stats();
        (guard.controller.statistics(now), table)
    });
    drop(guard);

    if let Some((line, table)) = stats {
        tracing::info!(
            packets_in = table.packets_in,
            packets_out = table.packets_out,
            sequence_gaps = table.sequence_gaps,
            evicted = table.streams_evicted,
            "{line}"
        );
    }

    if target_bytes_per_sec > 0.0 {
        let bits_per_sec = (target_bytes_per_sec * 8.0) as u64;
        Some(Msg::with_extra(
            MsgKind::BitrateRequest,
            Bytes::new(),
            bits_per_sec,
        ))
    } else {
        Some(Msg::new(MsgKind::IframeRequest, Bytes::new()))
    }
}

impl Block for PacedRelay {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, params: &Params) -> Result<(), BlockError> {
        self.core.guard_reinit()?;

        let name = self.core.name().to_string();
        let mut local_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut local_port = 0u16;
        let mut remote_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut remote_port = 0u16;
        let defaults = StreamBounds::default();
        let mut min_bitrate = defaults.min_bps;
        let mut start_bitrate = 0.0;
        let mut max_bitrate = defaults.max_bps;
        parse_params(&name, params, |key, value| match key {
            "local_addr" => {
                local_ip = parse_or(&name, key, value, local_ip);
                true
            }
            "local_port" => {
                local_port = parse_or(&name, key, value, local_port);
                true
            }
            "remote_addr" => {
                remote_ip = parse_or(&name, key, value, remote_ip);
                true
            }
            "remote_port" => {
                remote_port = parse_or(&name, key, value, remote_port);
                true
            }
            "min_bitrate" => {
                min_bitrate = parse_or(&name, key, value, min_bitrate);
                true
            }
            "start_bitrate" => {
                start_bitrate = parse_or(&name, key, value, start_bitrate);
                true
            }
            "max_bitrate" => {
                max_bitrate = parse_or(&name, key, value, max_bitrate);
                true
            }
            _ => false,
        });
        if start_bitrate == 0.0 {
            start_bitrate = min_bitrate;
        }

        let bounds = StreamBounds::new(min_bitrate, start_bitrate, max_bitrate).clamped();
        lock_shared(&self.shared).table.set_bounds(bounds);
        tracing::info!(
            block = %name,
            min_bps = bounds.min_bps,
            start_bps = bounds.start_bps,
            max_bps = bounds.max_bps,
            "bitrate envelope"
        );

        self.socket = match UdpSocket::bind((local_ip, local_port)) {
            Ok(socket) => {
                if let Err(e) = socket.set_read_timeout(Some(READ_TIMEOUT)) {
                    tracing::error!(block = %name, error = %e, "failed to set socket timeout");
                }
                let remote = SocketAddr::new(remote_ip, remote_port);
                if let Err(e) = socket.connect(remote) {
                    tracing::error!(block = %name, %remote, error = %e, "failed to connect socket");
                }
                tracing::info!(
                    block = %name,
                    local = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                    %remote,
                    "egress socket ready"
                );
                Some(Arc::new(socket))
            }
            Err(e) => {
                tracing::error!(block = %name, error = %e, "failed to bind socket");
                None
            }
        };

        self.core.mark_initialized();
        Ok(())
    }

    fn start(&mut self) {
        if !self.core.begin_start() {
            return;
        }

        // Ingest: typed messages from the fabric.
        {
            let stop = self.core.stop_flag();
            let sink = self.sink.clone();
            let source = self.source.clone();
            let shared = self.shared.clone();
            let clock = self.clock.clone();
            let name = self.core.name().to_string();
            self.core.spawn("ingest", move || {
                let mut last_stats = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    let Some(msg) = sink.recv_timeout() else {
                        continue;
                    };
                    match msg.kind {
                        MsgKind::RtpPacket => {
                            let Some((hdr, _)) = RtpHeader::parse(&msg.payload) else {
                                tracing::debug!(block = %name, len = msg.len(), "malformed rtp packet dropped");
                                continue;
                            };
                            let now = clock.now_q16();
                            let mut guard = lock_shared(&shared);
                            let RelayShared { table, controller } = &mut *guard;
                            table.ingest(controller.as_mut(), now, &hdr, msg.payload.clone());
                        }
                        MsgKind::RtcpPacket => {
                            if msg.len() < RTCP_MIN_HEADER {
                                tracing::debug!(block = %name, len = msg.len(), "undersized rtcp packet dropped");
                                continue;
                            }
                            let now = clock.now_q16();
                            if let Some(out) =
                                feedback_decision(&shared, now, &msg.payload, &mut last_stats)
                            {
                                source.forward(out);
                            }
                        }
                        other => {
                            tracing::debug!(block = %name, kind = ?other, "unexpected message kind");
                        }
                    }
                }
            });
        }

        // Pace: the transmit scheduler tick.
        {
            let stop = self.core.stop_flag();
            let shared = self.shared.clone();
            let socket = self.socket.clone();
            let clock = self.clock.clone();
            self.core.spawn("pace", move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Some(socket) = socket.as_deref() {
                        let now = clock.now_q16();
                        let mut guard = lock_shared(&shared);
                        let RelayShared { table, controller } = &mut *guard;
                        drain_streams(table, controller.as_mut(), now, &mut |pkt| {
                            socket.send(&pkt.payload)
                        });
                    }
                    std::thread::sleep(PACE_TICK);
                }
            });
        }

        // Feedback: RTCP coming back on the egress socket.
        {
            let stop = self.core.stop_flag();
            let shared = self.shared.clone();
            let socket = self.socket.clone();
            let source = self.source.clone();
            let clock = self.clock.clone();
            let name = self.core.name().to_string();
            self.core.spawn("feedback", move || {
                let mut buf = vec![0u8; UDP_BUFFER_SIZE];
                let mut last_stats = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    let Some(socket) = socket.as_deref() else {
                        std::thread::sleep(READ_TIMEOUT);
                        continue;
                    };
                    match socket.recv(&mut buf) {
                        Ok(n) if n >= RTCP_MIN_HEADER => {
                            let now = clock.now_q16();
                            if let Some(out) =
                                feedback_decision(&shared, now, &buf[..n], &mut last_stats)
                            {
                                source.forward(out);
                            }
                        }
                        Ok(n) => {
                            if n > 0 {
                                tracing::debug!(block = %name, len = n, "undersized feedback dropped");
                            }
                        }
                        Err(e) if crate::net::is_transient(&e) => {}
                        Err(e) => {
                            tracing::error!(block = %name, error = %e, "error while reading socket");
                        }
                    }
                }
            });
        }

        // Reap: evict idle streams.
        let stop = self.core.stop_flag();
        let shared = self.shared.clone();
        let clock = self.clock.clone();
        self.core.spawn("reap", move || {
            let mut last_sweep = clock.now_q16();
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(READ_TIMEOUT);
                let now = clock.now_q16();
                if now.wrapping_sub(last_sweep) < REAP_PERIOD_Q16 {
                    continue;
                }
                last_sweep = now;
                let mut guard = lock_shared(&shared);
                let RelayShared { table, controller } = &mut *guard;
                table.reap(controller.as_mut(), now);
            }
        });
    }

    fn stop(&mut self) {
        self.core.stop();
    }
}
