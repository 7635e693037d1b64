//! Monotonic time source
//!
//! The manager never reads the wall clock directly: throttling and the
//! bounded waits go through [`Clock`] so tests can drive time by hand.

use std::time::{Duration, Instant};

/// Monotonic clock with a blocking sleep
pub trait Clock {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

/// Real time, backed by [`Instant`] and [`std::thread::sleep`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Repeatedly sleep in `step` increments until `done` holds or `limit` elapses
///
/// Returns whether `done` was observed before the limit.
pub fn wait_until(
    clock: &dyn Clock,
    limit: Duration,
    step: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let started = clock.now();
    loop {
        if done() {
            return true;
        }
        if clock.now().duration_since(started) >= limit {
            return false;
        }
        clock.sleep(step);
    }
}
