//! Per-provider circuit breaker with lock-free atomics.
//!
//! State machine: `Closed → Open` after `max_failures` consecutive
//! failures; `Open → HalfOpen` once `open_timeout` elapses; `HalfOpen`
//! admits a bounded number of concurrent probes, each of which must
//! complete before the breaker transitions again. A probe success that
//! returns the in-flight count to zero closes the breaker; any probe
//! failure reopens it.

use crate::clock::{Clock, MonotonicClock};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check.
///
/// The two refusals are distinct so the health checker can treat both as
/// "gated, not the provider's fault".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the call. `probe` marks a half-open trial call, which
    /// the caller must conclude with `on_success`, `on_failure`, or
    /// `forfeit`.
    Granted { probe: bool },
    /// The breaker is open and the cooldown has not elapsed.
    CircuitOpen,
    /// Half-open and all probe slots are taken.
    TooManyProbes,
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }

    pub fn is_gated(&self) -> bool {
        matches!(self, Admission::CircuitOpen | Admission::TooManyProbes)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Granted { .. } => "granted",
            Admission::CircuitOpen => "circuit-open",
            Admission::TooManyProbes => "too-many-probes",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub max_failures: usize,
    pub open_timeout: Duration,
    pub half_open_max_probes: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: crate::config::defaults::BREAKER_MAX_FAILURES,
            open_timeout: crate::config::defaults::BREAKER_OPEN_TIMEOUT,
            half_open_max_probes: crate::config::defaults::BREAKER_HALF_OPEN_MAX_PROBES,
        }
    }
}

struct BreakerState {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_in_flight: AtomicUsize,
    half_open_successes: AtomicUsize,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.current_state())
            .field("consecutive_failures", &self.consecutive_failures())
            .field("settings", &self.settings)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self::with_clock(settings, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_in_flight: AtomicUsize::new(0),
                half_open_successes: AtomicUsize::new(0),
            }),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    pub fn current_state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn consecutive_failures(&self) -> usize {
        self.state.consecutive_failures.load(Ordering::Acquire)
    }

    /// Admission check. Does not invoke anything; callers granted a probe
    /// slot must conclude it.
    pub fn allow(&self) -> Admission {
        loop {
            match self.state.state.load(Ordering::Acquire) {
                STATE_CLOSED => return Admission::Granted { probe: false },
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    if elapsed < self.settings.open_timeout.as_millis() as u64 {
                        return Admission::CircuitOpen;
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // We won the race and become the first probe.
                            self.state.half_open_in_flight.store(1, Ordering::Release);
                            self.state.half_open_successes.store(0, Ordering::Release);
                            tracing::info!("circuit breaker -> half-open");
                            return Admission::Granted { probe: true };
                        }
                        // Someone else transitioned; re-evaluate.
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let in_flight =
                        self.state.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    if in_flight >= self.settings.half_open_max_probes {
                        self.state.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
                        return Admission::TooManyProbes;
                    }
                    tracing::debug!(
                        in_flight = in_flight + 1,
                        max = self.settings.half_open_max_probes,
                        "circuit breaker: half-open probe admitted"
                    );
                    return Admission::Granted { probe: true };
                }
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    pub fn on_success(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.state.consecutive_failures.store(0, Ordering::Release);
            }
            STATE_HALF_OPEN => {
                self.state.half_open_successes.fetch_add(1, Ordering::AcqRel);
                let remaining = self.decrement_in_flight();
                if remaining == 0
                    && self.state.half_open_successes.load(Ordering::Acquire) > 0
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.consecutive_failures.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("circuit breaker -> closed");
                }
            }
            _ => {}
        }
    }

    pub fn on_failure(&self) {
        match self.state.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let failures =
                    self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.settings.max_failures
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.stamp_opened();
                    tracing::warn!(
                        failures,
                        threshold = self.settings.max_failures,
                        "circuit breaker -> open"
                    );
                }
            }
            STATE_HALF_OPEN => {
                self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel);
                self.decrement_in_flight();
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.stamp_opened();
                    tracing::warn!("circuit breaker: probe failed -> open");
                }
            }
            _ => {}
        }
    }

    /// Releases a granted probe slot without recording an outcome. Used
    /// when a later admission stage (rate limit, queue) skips the call.
    pub fn forfeit(&self) {
        if self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
            self.decrement_in_flight();
        }
    }

    fn decrement_in_flight(&self) -> usize {
        // Saturating: a stale completion from before a state change must
        // not underflow the probe count.
        let mut current = self.state.half_open_in_flight.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return 0;
            }
            match self.state.half_open_in_flight.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => current = observed,
            }
        }
    }

    fn stamp_opened(&self) {
        self.state
            .opened_at_millis
            .store(self.clock.now_millis(), Ordering::Release);
    }
}
