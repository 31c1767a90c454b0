//! # Messages and Queues
//!
//! [`Msg`] is the unit exchanged between blocks: a typed, immutable byte
//! buffer shared as `Arc<Msg>` — observed by any number of consumers,
//! written by exactly one producer, released when the last holder drops it.
//!
//! [`MsgQueue`] is a bounded MPMC channel handle with an identity, so the
//! fan-out registry can treat queues as set members: clones of one queue
//! compare equal, independently created queues never do.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};

/// Default per-block queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// How long consumers wait on an empty queue before re-checking the stop
/// flag.
pub const QUEUE_WAIT: Duration = Duration::from_millis(100);

// ─── Message ────────────────────────────────────────────────────────────────

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    /// Opaque wire bytes, as read from or destined for a socket.
    Raw,
    /// A complete RTP packet (header + payload).
    RtpPacket,
    /// A complete RTCP packet.
    RtcpPacket,
    /// A bitrate target for the encoder; the value rides in `extra`.
    BitrateRequest,
    /// A keyframe request toward the encoder.
    IframeRequest,
}

/// An immutable, shared message.
#[derive(Debug, Clone)]
pub struct Msg {
    pub kind: MsgKind,
    /// Payload bytes; never mutated after construction.
    pub payload: Bytes,
    /// Opaque 64-bit tag (capture timestamp, bitrate value, …).
    pub extra: u64,
}

/// The form messages travel in.
pub type SharedMsg = Arc<Msg>;

impl Msg {
    pub fn new(kind: MsgKind, payload: Bytes) -> SharedMsg {
        Arc::new(Msg {
            kind,
            payload,
            extra: 0,
        })
    }

    pub fn with_extra(kind: MsgKind, payload: Bytes, extra: u64) -> SharedMsg {
        Arc::new(Msg {
            kind,
            payload,
            extra,
        })
    }

    pub fn raw(payload: Bytes) -> SharedMsg {
        Msg::new(MsgKind::Raw, payload)
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ─── Queue ──────────────────────────────────────────────────────────────────

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one bounded message queue.
#[derive(Debug, Clone)]
pub struct MsgQueue {
    id: u64,
    tx: Sender<SharedMsg>,
    rx: Receiver<SharedMsg>,
}

impl MsgQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        MsgQueue {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            rx,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::bounded(DEFAULT_QUEUE_CAPACITY)
    }

    /// Queue identity — shared by all clones of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue without blocking. Returns `false` when the queue is full
    /// (the message is dropped; bounded queues never stall a producer).
    pub fn push(&self, msg: SharedMsg) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Dequeue, waiting at most [`QUEUE_WAIT`].
    pub fn recv_timeout(&self) -> Option<SharedMsg> {
        self.rx.recv_timeout(QUEUE_WAIT).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl PartialEq for MsgQueue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MsgQueue {}
