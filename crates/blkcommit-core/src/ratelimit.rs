//! Short-horizon rate limiter governing the commit loop's I/O pacing.
//!
//! This is a direct port of `block/commit.c`'s `RateLimit`: fixed 100ms
//! accounting windows, with a "first request in a window always proceeds"
//! escape hatch so a single oversized request can't stall forever.

use std::time::{Duration, Instant};

/// Width of a single accounting window.
const SLICE: Duration = Duration::from_millis(100);

/// Converts a target bytes/second budget into per-call sleep hints.
///
/// [`RateLimiter::calculate_delay`] is not a sleep: it is a hint. A caller
/// that receives a positive delay must retry the *same* call after waiting;
/// the bytes are not accounted until a call returns [`Duration::ZERO`].
#[derive(Debug)]
pub struct RateLimiter {
    slice_quota: u64,
    window_deadline: Instant,
    dispatched: u64,
}

impl RateLimiter {
    /// A limiter with no quota configured (`set_speed` must be called before use).
    pub fn new() -> Self {
        Self {
            slice_quota: 0,
            window_deadline: Instant::now(),
            dispatched: 0,
        }
    }

    /// Set the target rate in bytes/second. A rate of `0` means "unlimited";
    /// callers are expected to bypass the limiter entirely in that case.
    pub fn set_speed(&mut self, bytes_per_sec: u64) {
        self.slice_quota = bytes_per_sec / (Duration::from_secs(1).as_millis() as u64 / SLICE.as_millis() as u64);
    }

    /// Ask to dispatch `n` bytes now.
    ///
    /// Returns `Duration::ZERO` if `n` bytes are accounted and the caller may
    /// proceed immediately, or a positive delay after which the same call
    /// should be retried (nothing is accounted in that case).
    pub fn calculate_delay(&mut self, n: u64) -> Duration {
        let now = Instant::now();

        if now >= self.window_deadline {
            self.window_deadline = now + SLICE;
            self.dispatched = 0;
        }

        if self.dispatched == 0 || self.dispatched + n <= self.slice_quota {
            self.dispatched += n;
            Duration::ZERO
        } else {
            self.dispatched = n;
            self.window_deadline.saturating_duration_since(now)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
