//! The worker's monotonic millisecond clock.
//!
//! `now_ms` is a monotonic function of the real clock: wall time drives it,
//! but backwards jumps and large forward jumps (suspend, manual clock
//! changes) are absorbed into an internal offset so that tick arithmetic
//! stays smooth. The clock must be updated once after every poller wait,
//! passing the timeout the poll was given, and never less often than twice
//! per [`MAX_DELAY_MS`](crate::ticks::MAX_DELAY_MS).

use crate::ticks::{Tick, MAX_DELAY_MS};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic millisecond clock with wall-jump correction.
#[derive(Debug)]
pub struct Clock {
    /// Corrected wall date, in ms since the epoch.
    now: u64,
    /// Signed correction applied to the system date.
    offset: i64,
    /// Current tick value (`now` truncated to 32 bits).
    now_ms: Tick,
    /// Instant of the last update, for elapsed-time measurements.
    last_update: Instant,
}

fn system_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

impl Clock {
    /// Creates a clock anchored at the current system date.
    #[must_use]
    pub fn new() -> Self {
        let now = system_ms();
        Self {
            now,
            offset: 0,
            now_ms: now as Tick,
            last_update: Instant::now(),
        }
    }

    /// The current tick.
    #[must_use]
    pub const fn now_ms(&self) -> Tick {
        self.now_ms
    }

    /// Time elapsed since the previous update.
    #[must_use]
    pub fn since_update(&self) -> Duration {
        self.last_update.elapsed()
    }

    /// Re-reads the system date after a poll that was given `max_wait` ms
    /// and returned with `interrupted` set when it did not run to its
    /// timeout. Forward jumps beyond `max_wait + MAX_DELAY_MS` and any
    /// backward jump re-anchor the offset: an interrupted poll is assumed
    /// to have consumed no time, a full one exactly its timeout.
    pub fn update(&mut self, max_wait: u32, interrupted: bool) {
        let date = system_ms();
        let adjusted = date.wrapping_add(self.offset as u64);

        let ok = adjusted >= self.now
            && adjusted <= self.now + u64::from(max_wait) + u64::from(MAX_DELAY_MS);
        let adjusted = if ok {
            adjusted
        } else {
            let fixed = self.now + if interrupted { 0 } else { u64::from(max_wait) };
            self.offset = fixed.wrapping_sub(date) as i64;
            fixed
        };

        self.now = adjusted;
        self.now_ms = adjusted as Tick;
        self.last_update = Instant::now();
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
