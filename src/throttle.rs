//! Per-resource alert throttling.
//!
//! Resource monitors fire repeatedly while a condition persists; the
//! throttle keeps one alert per `(resource, severity)` pair per window.

use crate::clock::{Clock, MonotonicClock};
use crate::config::defaults;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks the last alert time per `(resource, severity)` pair, with
/// optional per-resource window overrides.
#[derive(Debug)]
pub struct AlertThrottle {
    window: Duration,
    overrides: HashMap<String, Duration>,
    last_alert: Mutex<HashMap<(String, String), u64>>,
    clock: Arc<dyn Clock>,
}

impl AlertThrottle {
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { window, overrides: HashMap::new(), last_alert: Mutex::new(HashMap::new()), clock }
    }

    /// Longer or shorter window for one resource type.
    pub fn with_override(mut self, resource: impl Into<String>, window: Duration) -> Self {
        self.overrides.insert(resource.into(), window);
        self
    }

    /// Checks the window and stamps the alert time in one step. Returns
    /// false while the window for this pair has not elapsed.
    pub fn should_alert(&self, resource: &str, severity: &str) -> bool {
        let window = self.overrides.get(resource).copied().unwrap_or(self.window);
        let now = self.clock.now_millis();
        let mut last_alert =
            self.last_alert.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = (resource.to_string(), severity.to_string());
        match last_alert.get(&key) {
            Some(&at) if now.saturating_sub(at) < window.as_millis() as u64 => false,
            _ => {
                last_alert.insert(key, now);
                true
            }
        }
    }

    pub fn reset(&self) {
        self.last_alert.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }
}

impl Default for AlertThrottle {
    fn default() -> Self {
        Self::new(defaults::THROTTLE_WINDOW)
    }
}
