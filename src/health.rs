//! Periodic provider health probing.
//!
//! Each tick the checker calls `validate_config` on every registered
//! provider under a per-probe timeout. When a breaker is registered for
//! the provider and refuses admission, the probe is recorded as gated:
//! attempts advance, but `healthy` and the failure counters do not —
//! a broken-but-isolated provider is not the provider's fault.

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitState};
use crate::config::{ConfigError, HealthCheckerConfig};
use crate::provider::Provider;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Rolling health record for one provider. Mutated only by the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: usize,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub error_message: String,
    pub breaker_state: Option<CircuitState>,
}

impl ProviderHealth {
    fn new(name: String) -> Self {
        Self {
            name,
            healthy: true,
            consecutive_failures: 0,
            total_attempts: 0,
            total_successes: 0,
            total_failures: 0,
            last_success_time: None,
            last_failure_time: None,
            error_message: String::new(),
            breaker_state: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSummary {
    pub total_providers: usize,
    pub healthy_providers: usize,
    pub open_circuits: usize,
    pub overall_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
}

struct HealthTarget {
    provider: Arc<dyn Provider>,
    breaker: Option<CircuitBreaker>,
}

#[derive(Default)]
struct HealthState {
    targets: Mutex<Vec<HealthTarget>>,
    records: Mutex<HashMap<String, ProviderHealth>>,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

/// Background prober over registered providers.
pub struct HealthChecker {
    config: HealthCheckerConfig,
    state: Arc<HealthState>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(HealthState::default()),
            token: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Registers a provider, optionally paired with its breaker. Creates
    /// the health record immediately.
    pub fn register(&self, provider: Arc<dyn Provider>, breaker: Option<CircuitBreaker>) {
        let name = provider.name().to_string();
        self.state
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.clone())
            .or_insert_with(|| ProviderHealth::new(name));
        self.state
            .targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(HealthTarget { provider, breaker });
    }

    /// Launches the ticker loop. No-op when disabled; idempotent.
    pub fn start(&self) {
        if !self.config.enabled {
            return;
        }
        let mut handle = self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if handle.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        let config = self.config;
        let token = self.token.clone();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            // Skip the immediate tick; the first probe runs one interval in.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => state.run_pass(&config).await,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Runs one probe pass over every registered provider.
    pub async fn check_now(&self) {
        self.state.run_pass(&self.config).await;
    }

    pub fn provider_health(&self, name: &str) -> Option<ProviderHealth> {
        self.state
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn all_health(&self) -> Vec<ProviderHealth> {
        self.state
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// True when every provider is either healthy or isolated behind an
    /// open breaker.
    pub fn is_healthy(&self) -> bool {
        self.state
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .all(|r| r.healthy || r.breaker_state == Some(CircuitState::Open))
    }

    pub fn health_summary(&self) -> HealthSummary {
        let records =
            self.state.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let healthy_providers = records.values().filter(|r| r.healthy).count();
        let open_circuits = records
            .values()
            .filter(|r| r.breaker_state == Some(CircuitState::Open))
            .count();
        let overall_healthy = records
            .values()
            .all(|r| r.healthy || r.breaker_state == Some(CircuitState::Open));
        HealthSummary {
            total_providers: records.len(),
            healthy_providers,
            open_circuits,
            overall_healthy,
            last_check: *self
                .state
                .last_check
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

impl HealthState {
    async fn run_pass(&self, config: &HealthCheckerConfig) {
        let targets: Vec<(Arc<dyn Provider>, Option<CircuitBreaker>)> = {
            let targets = self.targets.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            targets
                .iter()
                .map(|t| (Arc::clone(&t.provider), t.breaker.clone()))
                .collect()
        };
        for (provider, breaker) in targets {
            self.probe(config, provider, breaker).await;
        }
        *self.last_check.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(Utc::now());
    }

    async fn probe(
        &self,
        config: &HealthCheckerConfig,
        provider: Arc<dyn Provider>,
        breaker: Option<CircuitBreaker>,
    ) {
        let name = provider.name().to_string();

        let mut half_open_probe = false;
        if let Some(breaker) = &breaker {
            match breaker.allow() {
                Admission::Granted { probe } => half_open_probe = probe,
                gated => {
                    tracing::debug!(
                        provider = %name,
                        reason = gated.as_str(),
                        "health probe gated by breaker"
                    );
                    self.record(&name, |record| {
                        record.total_attempts += 1;
                        record.breaker_state = Some(breaker.current_state());
                    });
                    return;
                }
            }
        }

        let outcome = tokio::time::timeout(config.timeout(), provider.validate_config()).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("health probe timed out after {:?}", config.timeout())),
        };

        if let Some(breaker) = &breaker {
            // A consumed half-open slot must be concluded. Closed-state
            // probes leave the breaker alone: it tracks send outcomes, and
            // a passing validate must not erase a send-failure streak.
            if half_open_probe {
                if failure.is_none() {
                    breaker.on_success();
                } else {
                    breaker.on_failure();
                }
            }
        }

        let breaker_state = breaker.as_ref().map(CircuitBreaker::current_state);
        let now = Utc::now();
        match failure {
            None => self.record(&name, |record| {
                record.healthy = true;
                record.consecutive_failures = 0;
                record.total_attempts += 1;
                record.total_successes += 1;
                record.last_success_time = Some(now);
                record.error_message.clear();
                record.breaker_state = breaker_state;
            }),
            Some(message) => {
                tracing::warn!(provider = %name, error = %message, "health probe failed");
                self.record(&name, |record| {
                    record.healthy = false;
                    record.consecutive_failures += 1;
                    record.total_attempts += 1;
                    record.total_failures += 1;
                    record.last_failure_time = Some(now);
                    record.error_message = message;
                    record.breaker_state = breaker_state;
                });
            }
        }
    }

    fn record<F: FnOnce(&mut ProviderHealth)>(&self, name: &str, mutate: F) {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(record) = records.get_mut(name) {
            mutate(record);
        }
    }
}
