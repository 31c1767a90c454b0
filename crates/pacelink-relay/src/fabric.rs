//! # Sink / Source Capabilities
//!
//! Every active block composes a [`Sink`] (its own bounded inbox) and a
//! [`Source`] (a registry fanning messages out by kind). The registry
//! holds queue handles only — it does not own the queues, and a block that
//! goes away simply leaves dead handles that fail to enqueue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::msg::{MsgKind, MsgQueue, SharedMsg, DEFAULT_QUEUE_CAPACITY};

// ─── Sink ───────────────────────────────────────────────────────────────────

/// The receiving capability: one owned bounded queue.
#[derive(Debug, Clone)]
pub struct Sink {
    queue: MsgQueue,
}

impl Sink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Sink {
            queue: MsgQueue::bounded(capacity),
        }
    }

    /// Handle producers push into; hand this to upstream `Source`s.
    pub fn queue(&self) -> MsgQueue {
        self.queue.clone()
    }

    /// Dequeue with the standard bounded wait.
    pub fn recv_timeout(&self) -> Option<SharedMsg> {
        self.queue.recv_timeout()
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Source ─────────────────────────────────────────────────────────────────

/// The sending capability: message kind → subscriber queues.
///
/// Cheap to clone — all clones share one registry, so a block can hand a
/// copy to each of its worker threads.
#[derive(Debug, Clone, Default)]
pub struct Source {
    routes: Arc<Mutex<HashMap<MsgKind, Vec<MsgQueue>>>>,
}

impl Source {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `queue` to messages of `kind`. Idempotent; returns whether
    /// the subscriber set changed.
    pub fn register(&self, kind: MsgKind, queue: MsgQueue) -> bool {
        let mut routes = lock_routes(&self.routes);
        let subscribers = routes.entry(kind).or_default();
        if subscribers.contains(&queue) {
            return false;
        }
        subscribers.push(queue);
        true
    }

    /// Remove `queue` from the subscribers of `kind`. Returns whether the
    /// set changed.
    pub fn unregister(&self, kind: MsgKind, queue: &MsgQueue) -> bool {
        let mut routes = lock_routes(&self.routes);
        match routes.get_mut(&kind) {
            Some(subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|q| q != queue);
                subscribers.len() != before
            }
            None => false,
        }
    }

    /// Fan `msg` out to every queue registered for its kind, in
    /// registration order. With no subscribers the message is dropped.
    pub fn forward(&self, msg: SharedMsg) {
        let routes = lock_routes(&self.routes);
        if let Some(subscribers) = routes.get(&msg.kind) {
            for queue in subscribers {
                if !queue.push(msg.clone()) {
                    tracing::debug!(kind = ?msg.kind, queue = queue.id(), "subscriber queue full, message dropped");
                }
            }
        }
    }

    /// Number of subscribers currently registered for `kind`.
    pub fn subscriber_count(&self, kind: MsgKind) -> usize {
        lock_routes(&self.routes)
            .get(&kind)
            .map_or(0, |subscribers| subscribers.len())
    }
}

fn lock_routes(
    routes: &Mutex<HashMap<MsgKind, Vec<MsgQueue>>>,
) -> std::sync::MutexGuard<'_, HashMap<MsgKind, Vec<MsgQueue>>> {
    routes.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Msg;
    use bytes::Bytes;

    #[test]
    fn register_is_idempotent() {
        let source = Source::new();
        let q = MsgQueue::bounded(4);
        assert!(source.register(MsgKind::Raw, q.clone()));
        assert!(!source.register(MsgKind::Raw, q.clone()));
        assert_eq!(source.subscriber_count(MsgKind::Raw), 1);

        assert!(source.unregister(MsgKind::Raw, &q));
        assert!(!source.unregister(MsgKind::Raw, &q));
        assert_eq!(source.subscriber_count(MsgKind::Raw), 0);
    }

    #[test]
    fn forward_reaches_every_subscriber_in_order() {
        let source = Source::new();
        let queues: Vec<_> = (0..3).map(|_| MsgQueue::bounded(8)).collect();
        for q in &queues {
            source.register(MsgKind::Raw, q.clone());
        }

        for i in 1..=3u8 {
            source.forward(Msg::raw(Bytes::copy_from_slice(&[i])));
        }

        for q in &queues {
            for i in 1..=3u8 {
                assert_eq!(q.recv_timeout().unwrap().payload[0], i);
            }
        }
    }

    #[test]
    fn forward_honors_kind() {
        let source = Source::new();
        let raw = MsgQueue::bounded(4);
        let rtp = MsgQueue::bounded(4);
        source.register(MsgKind::Raw, raw.clone());
        source.register(MsgKind::RtpPacket, rtp.clone());

        source.forward(Msg::new(MsgKind::RtpPacket, Bytes::from_static(b"p")));
        assert!(raw.recv_timeout().is_none());
        assert!(rtp.recv_timeout().is_some());
    }

    #[test]
    fn forward_without_subscribers_is_silent() {
        let source = Source::new();
        source.forward(Msg::raw(Bytes::from_static(b"nobody home")));
    }

    #[test]
    fn shared_payload_not_copied() {
        let source = Source::new();
        let a = MsgQueue::bounded(4);
        let b = MsgQueue::bounded(4);
        source.register(MsgKind::Raw, a.clone());
        source.register(MsgKind::Raw, b.clone());

        source.forward(Msg::raw(Bytes::from_static(b"shared")));
        let from_a = a.recv_timeout().unwrap();
        let from_b = b.recv_timeout().unwrap();
        assert!(Arc::ptr_eq(&from_a, &from_b));
    }
}
