//! # Block Lifecycle
//!
//! A block is an active pipeline component: it composes a sink, a source
//! and one or more worker threads behind an init/start/stop lifecycle.
//!
//! ```text
//!   Uninitialized ──init──▶ Initialized ──start──▶ Running ──stop──▶ Initialized
//! ```
//!
//! [`BlockCore`] carries the shared plumbing: the name, the lifecycle
//! state, the stop flag every worker polls, and the join handles `stop`
//! waits on. Concrete blocks hold it as a field — composition, not
//! inheritance.

use std::collections::HashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::msg::MsgKind;

/// Flat string-keyed block configuration.
pub type Params = HashMap<String, String>;

/// Errors a block can raise at configuration time. Runtime I/O errors are
/// handled inside the owning worker and never cross the block boundary.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("`{0}` is running; stop it before re-initializing")]
    AlreadyRunning(String),
    #[error("unsupported message conversion {0:?} -> {1:?}")]
    UnsupportedConversion(MsgKind, MsgKind),
}

/// The lifecycle every pipeline component implements.
pub trait Block {
    fn name(&self) -> &str;

    /// Parse configuration and transition to Initialized. Rejected with
    /// [`BlockError::AlreadyRunning`] while workers are live.
    fn init(&mut self, params: &Params) -> Result<(), BlockError>;

    /// Clear the stop flag and spawn the worker thread(s). A no-op with a
    /// diagnostic when not initialized or already running.
    fn start(&mut self);

    /// Set the stop flag and join every owned worker. A no-op with a
    /// diagnostic when not running.
    fn stop(&mut self);
}

// ─── BlockCore ──────────────────────────────────────────────────────────────

/// Shared lifecycle state for a block.
#[derive(Debug)]
pub struct BlockCore {
    name: String,
    initialized: bool,
    /// True while stopped; cleared by `start`, set by `stop`.
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl BlockCore {
    pub fn new(name: impl Into<String>) -> Self {
        BlockCore {
            name: name.into(),
            initialized: false,
            stop: Arc::new(AtomicBool::new(true)),
            workers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
    }

    /// The flag workers poll; true means "wind down".
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Guard for `init`: re-configuration requires a stopped block.
    pub fn guard_reinit(&self) -> Result<(), BlockError> {
        if self.is_running() {
            tracing::warn!(block = %self.name, "re-init rejected while running");
            return Err(BlockError::AlreadyRunning(self.name.clone()));
        }
        Ok(())
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// Check preconditions for `start` and clear the stop flag. Returns
    /// whether workers should be spawned.
    pub fn begin_start(&mut self) -> bool {
        if !self.initialized {
            tracing::warn!(block = %self.name, "start ignored, not initialized");
            return false;
        }
        if self.is_running() {
            tracing::warn!(block = %self.name, "start ignored, already running");
            return false;
        }
        self.stop.store(false, Ordering::Release);
        true
    }

    /// Spawn a named worker owned by this block.
    pub fn spawn<F>(&mut self, role: &str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, role))
            .spawn(f)
            .expect("failed to spawn block worker");
        self.workers.push(handle);
    }

    /// Raise the stop flag. Returns whether the block was running (and so
    /// whether a join is owed).
    pub fn request_stop(&self) -> bool {
        if !self.is_running() {
            tracing::warn!(block = %self.name, "stop ignored, not running");
            return false;
        }
        self.stop.store(true, Ordering::Release);
        true
    }

    /// Wait for every worker to observe the flag and exit.
    pub fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// `request_stop` + `join_workers`; what a plain block's `stop` does.
    pub fn stop(&mut self) {
        if self.request_stop() {
            self.join_workers();
        }
    }
}

// ─── Configuration helpers ──────────────────────────────────────────────────

/// Walk a parameter map, logging every pair at debug. `apply` returns
/// whether it recognized the key; unrecognized keys are logged and ignored.
pub fn parse_params(name: &str, params: &Params, mut apply: impl FnMut(&str, &str) -> bool) {
    for (key, value) in params {
        tracing::debug!(block = %name, key = %key, value = %value, "config");
        if !apply(key, value) {
            tracing::warn!(block = %name, key = %key, "unknown configuration key");
        }
    }
}

/// Parse a numeric or address value, falling back on parse failure.
pub fn parse_or<T>(name: &str, key: &str, value: &str, fallback: T) -> T
where
    T: FromStr + Copy + Debug,
{
    match value.parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::error!(block = %name, key = %key, value = %value, ?fallback, "unparsable value, using fallback");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Echo {
        core: BlockCore,
        loops: Arc<AtomicUsize>,
    }

    impl Echo {
        fn new() -> Self {
            Echo {
                core: BlockCore::new("echo"),
                loops: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Block for Echo {
        fn name(&self) -> &str {
            self.core.name()
        }

        fn init(&mut self, _params: &Params) -> Result<(), BlockError> {
            self.core.guard_reinit()?;
            self.core.mark_initialized();
            Ok(())
        }

        fn start(&mut self) {
            if !self.core.begin_start() {
                return;
            }
            let stop = self.core.stop_flag();
            let loops = self.loops.clone();
            self.core.spawn("main", move || {
                while !stop.load(Ordering::Relaxed) {
                    loops.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }

        fn stop(&mut self) {
            self.core.stop();
        }
    }

    #[test]
    fn lifecycle_round_trip() {
        let mut block = Echo::new();
        block.init(&Params::new()).unwrap();
        block.start();
        assert!(block.core.is_running());

        thread::sleep(Duration::from_millis(20));
        block.stop();
        assert!(!block.core.is_running());
        assert!(block.loops.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn start_requires_init() {
        let mut block = Echo::new();
        block.start();
        assert!(!block.core.is_running());
    }

    #[test]
    fn reinit_while_running_rejected() {
        let mut block = Echo::new();
        block.init(&Params::new()).unwrap();
        block.start();
        assert!(matches!(
            block.init(&Params::new()),
            Err(BlockError::AlreadyRunning(_))
        ));
        block.stop();
        // stopped again — re-init allowed
        block.init(&Params::new()).unwrap();
    }

    #[test]
    fn redundant_transitions_are_noops() {
        let mut block = Echo::new();
        block.init(&Params::new()).unwrap();
        block.stop(); // not running
        block.start();
        block.start(); // already running
        block.stop();
        block.stop(); // already stopped
    }

    #[test]
    fn parse_or_falls_back() {
        assert_eq!(parse_or::<u16>("t", "port", "8080", 0), 8080);
        assert_eq!(parse_or::<u16>("t", "port", "not a port", 9), 9);
    }

    #[test]
    fn unknown_keys_reported_to_apply() {
        let mut params = Params::new();
        params.insert("known".into(), "1".into());
        params.insert("mystery".into(), "2".into());

        let mut seen = Vec::new();
        parse_params("t", &params, |key, _| {
            seen.push(key.to_string());
            key == "known"
        });
        seen.sort();
        assert_eq!(seen, ["known", "mystery"]);
    }
}
