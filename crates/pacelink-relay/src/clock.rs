//! # Media Clock
//!
//! Fixed-point timestamps for the rate-controller interface: 32-bit Q16.16
//! seconds since the clock's origin (the "NTP short" format), wrapping
//! every ~18.2 hours. A single [`MediaClock`] value is cloned into every
//! component that stamps packets, so the whole pipeline shares one origin
//! and tests can substitute a deterministic mock.

use std::sync::Arc;
use std::time::Duration;

use quanta::{Clock, Instant, Mock};

/// One second in Q16.16 units.
pub const Q16_ONE_SECOND: u32 = 1 << 16;

/// Shared monotonic clock producing Q16.16 stamps.
#[derive(Debug, Clone)]
pub struct MediaClock {
    clock: Clock,
    origin: Instant,
}

impl MediaClock {
    pub fn new() -> Self {
        Self::from_clock(Clock::new())
    }

    /// A mocked clock for deterministic tests; advance it with
    /// [`Mock::increment`].
    pub fn mock() -> (Self, Arc<Mock>) {
        let (clock, mock) = Clock::mock();
        (Self::from_clock(clock), mock)
    }

    fn from_clock(clock: Clock) -> Self {
        let origin = clock.now();
        MediaClock { clock, origin }
    }

    /// Current time in Q16.16 seconds since the origin. Wrapping is
    /// intentional — matches the 32-bit stamp the controller consumes.
    pub fn now_q16(&self) -> u32 {
        let elapsed = self.clock.now() - self.origin;
        (duration_to_q16(elapsed) & 0xFFFF_FFFF) as u32
    }

    /// Elapsed wall time since the origin.
    pub fn elapsed(&self) -> Duration {
        self.clock.now() - self.origin
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_to_q16(d: Duration) -> u64 {
    (d.as_secs() << 16) | (u64::from(d.subsec_nanos()) << 16) / 1_000_000_000
}

/// Q16.16 stamp to floating-point seconds, for log output.
pub fn q16_to_secs(stamp: u32) -> f64 {
    f64::from(stamp) / f64::from(Q16_ONE_SECOND)
}
