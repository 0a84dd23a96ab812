//! Admission-control rate limiters.
//!
//! Two limiters with different jobs:
//! - [`SlidingWindowLimiter`] bounds how fast producers may create
//!   notifications through the service.
//! - [`TokenBucket`] smooths outbound sends per provider, with burst
//!   capacity.
//!
//! Both are serialized by a single mutex and compute from elapsed clock
//! time rather than ticks, so they stay correct under coarse schedulers.

use crate::clock::{Clock, MonotonicClock};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sliding-window counter: at most `max_events` admissions in any trailing
/// `window`.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max_events: usize,
    events: Mutex<VecDeque<u64>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_events: usize) -> Self {
        Self::with_clock(window, max_events, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(window: Duration, max_events: usize, clock: Arc<dyn Clock>) -> Self {
        Self { window, max_events, events: Mutex::new(VecDeque::new()), clock }
    }

    /// Admits and records the event, or rejects without side effects.
    pub fn allow(&self) -> bool {
        let now = self.clock.now_millis();
        let horizon = now.saturating_sub(self.window.as_millis() as u64);
        let mut events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while events.front().is_some_and(|&at| at <= horizon) {
            events.pop_front();
        }
        if events.len() < self.max_events {
            events.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&self) {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

/// Token bucket refilled continuously at `requests_per_minute / 60` tokens
/// per second, capped at `burst`.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    pub fn new(requests_per_minute: f64, burst: u32) -> Self {
        Self::with_clock(requests_per_minute, burst, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(requests_per_minute: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec: (requests_per_minute / 60.0).max(0.0),
            burst,
            // A fresh bucket starts full so the first burst goes through.
            state: Mutex::new(BucketState { tokens: burst, last_refill_millis: clock.now_millis() }),
            clock,
        }
    }

    /// Consumes one token without blocking; false when the bucket is empty.
    pub fn allow(&self) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed_secs = now.saturating_sub(state.last_refill_millis) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed_secs * self.rate_per_sec).min(self.burst);
        state.last_refill_millis = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn window_admits_up_to_max_then_rejects() {
        let clock = Arc::new(ManualClock::new());
        let limiter =
            SlidingWindowLimiter::with_clock(Duration::from_secs(60), 3, clock.clone());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn window_frees_capacity_as_events_age_out() {
        let clock = Arc::new(ManualClock::new());
        let limiter =
            SlidingWindowLimiter::with_clock(Duration::from_secs(60), 2, clock.clone());
        assert!(limiter.allow());
        clock.advance(Duration::from_secs(30));
        assert!(limiter.allow());
        assert!(!limiter.allow());

        // First event falls out of the window, second is still inside.
        clock.advance(Duration::from_secs(31));
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn reset_clears_the_window() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.allow());
        assert!(!limiter.allow());
        limiter.reset();
        assert!(limiter.allow());
    }

    #[test]
    fn bucket_starts_full_and_drains() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(60.0, 3, clock);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn bucket_refills_from_elapsed_time() {
        let clock = Arc::new(ManualClock::new());
        // 60 rpm = 1 token per second.
        let bucket = TokenBucket::with_clock(60.0, 2, clock.clone());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());

        clock.advance(Duration::from_millis(1500));
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn bucket_refill_caps_at_burst() {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::with_clock(600.0, 2, clock.clone());
        clock.advance(Duration::from_secs(3600));
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }
}
