//! # Transmit Scheduler
//!
//! The egress drainer: a mechanical loop that pops admitted packets from
//! per-stream FIFO queues and hands them to the egress writer. All pacing
//! authority lives in the rate controller — the scheduler never transmits
//! without a grant and never retries a failed write (real-time media
//! treats it as loss).
//!
//! The caller runs [`drain_streams`] on a short tick while holding the
//! table lock; the writer must therefore never block (a UDP send on a
//! connected socket, or a test capture buffer).

use std::io;

use crate::control::RateController;
use crate::table::{QueuedPacket, StreamTable};

/// One scheduling pass over every active stream.
///
/// Per stream: ask for admission, then while granted and packets remain,
/// pop the oldest, write it, and report the transmission — the report's
/// return value is the next admission decision. A write failure is logged
/// and the packet counts as lost.
///
/// Returns the number of packets handed to the writer.
pub fn drain_streams(
    table: &mut StreamTable,
    ctl: &mut dyn RateController,
    now: u32,
    write: &mut dyn FnMut(&QueuedPacket) -> io::Result<usize>,
) -> usize {
    let mut drained = 0;

    for ssrc in table.ssrcs() {
        let mut admission = ctl.query_admission(now, ssrc);
        while admission.is_grant() {
            let Some(pkt) = table.pop(ssrc) else {
                break;
            };

            if let Err(e) = write(&pkt) {
                tracing::warn!(ssrc, seq = pkt.seq, error = %e, "egress write failed, packet lost");
            }

            drained += 1;
            admission = ctl.on_transmitted(now, ssrc, pkt.payload.len(), pkt.seq, pkt.marker);
        }
    }

    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Admission, StreamBounds};
    use bytes::{Bytes, BytesMut};
    use pacelink_wire::rtp::RtpHeader;

    /// Stub whose answers come from a script; checks the grant-precedes-
    /// transmit contract.
    struct ScriptedController {
        admissions: Vec<Admission>,
        next: usize,
        transmitted: Vec<(u32, u16, bool)>,
    }

    impl ScriptedController {
        fn always_grant() -> Self {
            ScriptedController {
                admissions: Vec::new(),
                next: 0,
                transmitted: Vec::new(),
            }
        }

        fn scripted(admissions: Vec<Admission>) -> Self {
            ScriptedController {
                admissions,
                next: 0,
                transmitted: Vec::new(),
            }
        }

        fn decide(&mut self) -> Admission {
            if self.admissions.is_empty() {
                return Admission::Grant;
            }
            let a = self
                .admissions
                .get(self.next)
                .copied()
                .unwrap_or(Admission::Defer);
            self.next += 1;
            a
        }
    }

    impl RateController for ScriptedController {
        fn register_stream(&mut self, _ssrc: u32, _bounds: StreamBounds) {}
        fn unregister_stream(&mut self, _ssrc: u32) {}
        fn query_admission(&mut self, _now: u32, _ssrc: u32) -> Admission {
            self.decide()
        }
        fn on_transmitted(
            &mut self,
            _now: u32,
            ssrc: u32,
            _size: usize,
            seq: u16,
            marker: bool,
        ) -> Admission {
            self.transmitted.push((ssrc, seq, marker));
            self.decide()
        }
        fn on_media_frame(&mut self, _now: u32, _ssrc: u32, _size: usize, _marker: bool) {}
        fn on_feedback_bytes(&mut self, _now: u32, _feedback: &[u8]) {}
        fn build_feedback(&mut self, _now: u32, _marker: bool) -> Option<Bytes> {
            None
        }
        fn target_bitrate(&mut self, _ssrc: u32) -> f64 {
            0.0
        }
        fn statistics(&mut self, _now: u32) -> String {
            String::new()
        }
    }

    fn fill(table: &mut StreamTable, ctl: &mut dyn RateController, ssrc: u32, seqs: &[u16]) {
        for &seq in seqs {
            let hdr = RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: seq == *seqs.last().unwrap(),
                payload_type: 96,
                sequence: seq,
                timestamp: 0,
                ssrc,
            };
            let mut raw = BytesMut::new();
            hdr.encode(&mut raw);
            raw.extend_from_slice(b"media");
            table.ingest(ctl, 0, &hdr, raw.freeze());
        }
    }

    #[test]
    fn scenario_b_always_grant_drains_in_order() {
        let mut table = StreamTable::new(StreamBounds::default());
        let mut ctl = ScriptedController::always_grant();
        fill(&mut table, &mut ctl, 100, &[1, 2, 3, 4, 5]);

        let mut wire = Vec::new();
        let drained = drain_streams(&mut table, &mut ctl, 0, &mut |pkt| {
            wire.push(pkt.seq);
            Ok(pkt.payload.len())
        });

        assert_eq!(drained, 5);
        assert_eq!(wire, [1, 2, 3, 4, 5]);
        assert_eq!(table.entry(100).unwrap().queue_len(), 0);
        // every transmit was reported, none twice
        let seqs: Vec<u16> = ctl.transmitted.iter().map(|t| t.1).collect();
        assert_eq!(seqs, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn no_transmit_without_grant() {
        let mut table = StreamTable::new(StreamBounds::default());
        let mut ctl = ScriptedController::scripted(vec![Admission::Defer]);
        fill(&mut table, &mut ctl, 100, &[1, 2, 3]);

        let mut writes = 0;
        let drained = drain_streams(&mut table, &mut ctl, 0, &mut |_| {
            writes += 1;
            Ok(0)
        });

        assert_eq!(drained, 0);
        assert_eq!(writes, 0);
        assert_eq!(table.entry(100).unwrap().queue_len(), 3);
    }

    #[test]
    fn defer_mid_stream_stops_the_tick() {
        let mut table = StreamTable::new(StreamBounds::default());
        // grant the query and the first report, then defer
        let mut ctl = ScriptedController::scripted(vec![
            Admission::Grant,
            Admission::Grant,
            Admission::Defer,
        ]);
        fill(&mut table, &mut ctl, 100, &[1, 2, 3, 4]);

        let mut wire = Vec::new();
        drain_streams(&mut table, &mut ctl, 0, &mut |pkt| {
            wire.push(pkt.seq);
            Ok(0)
        });

        assert_eq!(wire, [1, 2]);
        assert_eq!(table.entry(100).unwrap().queue_len(), 2);
    }

    #[test]
    fn write_failure_is_loss_not_retry() {
        let mut table = StreamTable::new(StreamBounds::default());
        let mut ctl = ScriptedController::always_grant();
        fill(&mut table, &mut ctl, 100, &[1, 2]);

        let mut attempts = Vec::new();
        drain_streams(&mut table, &mut ctl, 0, &mut |pkt| {
            attempts.push(pkt.seq);
            Err(io::Error::new(io::ErrorKind::Other, "cable unplugged"))
        });

        // both packets attempted exactly once, queue empty, both reported
        assert_eq!(attempts, [1, 2]);
        assert_eq!(table.entry(100).unwrap().queue_len(), 0);
        assert_eq!(ctl.transmitted.len(), 2);
    }

    #[test]
    fn drains_every_stream_in_the_table() {
        let mut table = StreamTable::new(StreamBounds::default());
        let mut ctl = ScriptedController::always_grant();
        fill(&mut table, &mut ctl, 1, &[10]);
        fill(&mut table, &mut ctl, 2, &[20]);

        let mut wire = Vec::new();
        let drained = drain_streams(&mut table, &mut ctl, 0, &mut |pkt| {
            wire.push(pkt.seq);
            Ok(0)
        });

        assert_eq!(drained, 2);
        wire.sort_unstable();
        assert_eq!(wire, [10, 20]);
    }
}
