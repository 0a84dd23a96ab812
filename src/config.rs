//! Configuration surface for the service, dispatcher, providers, and
//! health checker.
//!
//! Durations are carried as `_ms`/`_secs` integer fields so config files
//! stay plain; accessor methods return `Duration`.

use crate::filter::ProviderFilter;
use crate::notification::{NotificationPriority, NotificationType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Pipeline-wide default constants.
pub mod defaults {
    use std::time::Duration;

    pub const MAX_NOTIFICATIONS: usize = 1000;
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
    pub const RATE_LIMIT_MAX_EVENTS: usize = 100;
    pub const CHANNEL_BUFFER: usize = 10;

    pub const DETECTION_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);
    pub const ALERT_EXPIRY: Duration = Duration::from_secs(30 * 60);
    pub const QUICK_EXPIRY: Duration = Duration::from_secs(5 * 60);

    pub const MAX_RETRIES: usize = 3;
    pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
    pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
    pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);
    pub const CONCURRENCY_FLOOR: usize = 100;
    pub const JOBS_PER_PROVIDER: usize = 20;

    pub const RATE_LIMIT_RPM: f64 = 60.0;
    pub const RATE_LIMIT_BURST: u32 = 10;

    pub const BREAKER_MAX_FAILURES: usize = 5;
    pub const BREAKER_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
    pub const BREAKER_HALF_OPEN_MAX_PROBES: usize = 3;

    pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
    pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

    pub const THROTTLE_WINDOW: Duration = Duration::from_secs(5 * 60);
    pub const BATCH_SIZE: usize = 10;
    pub const BATCH_TIMEOUT: Duration = Duration::from_millis(100);
    pub const MESSAGE_TRUNCATE: usize = 500;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("provider name must not be empty")]
    EmptyProviderName,

    #[error("duplicate provider name: {0:?}")]
    DuplicateProviderName(String),

    #[error("{field} must be at least {minimum:?}")]
    BelowMinimum { field: &'static str, minimum: Duration },

    #[error("health check timeout must be shorter than its interval")]
    TimeoutExceedsInterval,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Notification service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub max_notifications: usize,
    pub cleanup_interval_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_events: usize,
    pub channel_buffer: usize,
    pub debug: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_notifications: defaults::MAX_NOTIFICATIONS,
            cleanup_interval_secs: defaults::CLEANUP_INTERVAL.as_secs(),
            rate_limit_window_secs: defaults::RATE_LIMIT_WINDOW.as_secs(),
            rate_limit_max_events: defaults::RATE_LIMIT_MAX_EVENTS,
            channel_buffer: defaults::CHANNEL_BUFFER,
            debug: false,
        }
    }
}

impl ServiceConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_notifications == 0 {
            return Err(ConfigError::Zero { field: "max_notifications" });
        }
        if self.rate_limit_max_events == 0 {
            return Err(ConfigError::Zero { field: "rate_limit_max_events" });
        }
        if self.channel_buffer == 0 {
            return Err(ConfigError::Zero { field: "channel_buffer" });
        }
        Ok(())
    }
}

/// Dispatcher settings, including its providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    pub max_retries: usize,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub default_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    /// `0` means auto: `max(100, 20 × provider count)`.
    pub max_concurrent_jobs: usize,
    pub providers: Vec<ProviderConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: defaults::MAX_RETRIES,
            base_retry_delay_ms: defaults::BASE_RETRY_DELAY.as_millis() as u64,
            max_retry_delay_ms: defaults::MAX_RETRY_DELAY.as_millis() as u64,
            default_timeout_ms: defaults::SEND_TIMEOUT.as_millis() as u64,
            acquire_timeout_ms: defaults::ACQUIRE_TIMEOUT.as_millis() as u64,
            max_concurrent_jobs: 0,
            providers: Vec::new(),
        }
    }
}

impl DispatcherConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Effective global concurrency bound.
    pub fn concurrency_limit(&self) -> usize {
        if self.max_concurrent_jobs > 0 {
            self.max_concurrent_jobs
        } else {
            defaults::CONCURRENCY_FLOOR
                .max(defaults::JOBS_PER_PROVIDER * self.providers.len())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_retry_delay_ms == 0 {
            return Err(ConfigError::Zero { field: "base_retry_delay_ms" });
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "default_timeout_ms" });
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProviderName(provider.name.clone()));
            }
        }
        Ok(())
    }
}

/// One push provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Empty means all types.
    #[serde(default)]
    pub supported_types: Vec<NotificationType>,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub rate_limit: TokenBucketConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    /// Present for webhook-backed providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            supported_types: Vec::new(),
            filter: FilterConfig::default(),
            rate_limit: TokenBucketConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            webhook: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyProviderName);
        }
        self.filter.validate()?;
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

/// Declarative include-list filter, as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub types: Vec<String>,
    pub priorities: Vec<String>,
    pub components: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for t in &self.types {
            t.parse::<NotificationType>().map_err(|e| ConfigError::Invalid {
                field: "filter.types",
                reason: e.to_string(),
            })?;
        }
        for p in &self.priorities {
            p.parse::<NotificationPriority>().map_err(|e| ConfigError::Invalid {
                field: "filter.priorities",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Builds the runtime filter. Call [`FilterConfig::validate`] first;
    /// unparsable entries are dropped here.
    pub fn build(&self) -> ProviderFilter {
        ProviderFilter {
            types: self.types.iter().filter_map(|t| t.parse().ok()).collect(),
            priorities: self.priorities.iter().filter_map(|p| p.parse().ok()).collect(),
            components: self.components.clone(),
            metadata_filters: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    pub requests_per_minute: f64,
    pub burst: u32,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: defaults::RATE_LIMIT_RPM,
            burst: defaults::RATE_LIMIT_BURST,
        }
    }
}

impl TokenBucketConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_per_minute <= 0.0 {
            return Err(ConfigError::Zero { field: "rate_limit.requests_per_minute" });
        }
        if self.burst == 0 {
            return Err(ConfigError::Zero { field: "rate_limit.burst" });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub max_failures: usize,
    pub open_timeout_ms: u64,
    pub half_open_max_probes: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: defaults::BREAKER_MAX_FAILURES,
            open_timeout_ms: defaults::BREAKER_OPEN_TIMEOUT.as_millis() as u64,
            half_open_max_probes: defaults::BREAKER_HALF_OPEN_MAX_PROBES,
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failures == 0 {
            return Err(ConfigError::Zero { field: "circuit_breaker.max_failures" });
        }
        if self.half_open_max_probes == 0 {
            return Err(ConfigError::Zero { field: "circuit_breaker.half_open_max_probes" });
        }
        Ok(())
    }

    pub fn settings(&self) -> crate::circuit_breaker::BreakerSettings {
        crate::circuit_breaker::BreakerSettings {
            max_failures: self.max_failures,
            open_timeout: self.open_timeout(),
            half_open_max_probes: self.half_open_max_probes,
        }
    }
}

/// Webhook transport settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub endpoints: Vec<EndpointConfig>,
    /// Optional handlebars template for the request body; must render
    /// valid JSON. When absent the default payload shape is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl EndpointConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Endpoint authentication. Secret-bearing fields are references resolved
/// through a [`crate::webhook::SecretResolver`] at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: SecretRef,
    },
    Basic {
        username: String,
        password: SecretRef,
    },
    Custom {
        header: String,
        value: SecretRef,
    },
}

/// Where a credential comes from: an environment variable, a file, or an
/// inline literal. Exactly one should be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretRef {
    pub env: Option<String>,
    pub file: Option<String>,
    pub value: Option<String>,
}

impl SecretRef {
    pub fn literal(value: impl Into<String>) -> Self {
        Self { env: None, file: None, value: Some(value.into()) }
    }

    pub fn from_env(name: impl Into<String>) -> Self {
        Self { env: Some(name.into()), file: None, value: None }
    }
}

/// Health checker settings. Both durations must be at least one second
/// and the probe timeout must be shorter than the interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: defaults::HEALTH_CHECK_INTERVAL.as_secs(),
            timeout_secs: defaults::HEALTH_CHECK_TIMEOUT.as_secs(),
        }
    }
}

impl HealthCheckerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs < 1 {
            return Err(ConfigError::BelowMinimum {
                field: "health.interval",
                minimum: Duration::from_secs(1),
            });
        }
        if self.timeout_secs < 1 {
            return Err(ConfigError::BelowMinimum {
                field: "health.timeout",
                minimum: Duration::from_secs(1),
            });
        }
        if self.timeout_secs >= self.interval_secs {
            return Err(ConfigError::TimeoutExceedsInterval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ServiceConfig::default().validate().unwrap();
        DispatcherConfig::default().validate().unwrap();
        HealthCheckerConfig::default().validate().unwrap();
    }

    #[test]
    fn concurrency_limit_auto_scales_with_providers() {
        let mut config = DispatcherConfig::default();
        assert_eq!(config.concurrency_limit(), 100);

        config.providers = (0..6).map(|i| ProviderConfig::new(format!("p{i}"))).collect();
        assert_eq!(config.concurrency_limit(), 120);

        config.max_concurrent_jobs = 3;
        assert_eq!(config.concurrency_limit(), 3);
    }

    #[test]
    fn duplicate_provider_names_rejected() {
        let config = DispatcherConfig {
            providers: vec![ProviderConfig::new("hook"), ProviderConfig::new("hook")],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateProviderName("hook".into()))
        );
    }

    #[test]
    fn empty_provider_name_rejected() {
        let config = DispatcherConfig {
            providers: vec![ProviderConfig::new("  ")],
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EmptyProviderName));
    }

    #[test]
    fn health_config_bounds() {
        let bad = HealthCheckerConfig { enabled: true, interval_secs: 0, timeout_secs: 1 };
        assert!(bad.validate().is_err());

        let inverted = HealthCheckerConfig { enabled: true, interval_secs: 5, timeout_secs: 5 };
        assert_eq!(inverted.validate(), Err(ConfigError::TimeoutExceedsInterval));

        let ok = HealthCheckerConfig { enabled: true, interval_secs: 60, timeout_secs: 10 };
        ok.validate().unwrap();
    }

    #[test]
    fn filter_config_rejects_unknown_enums() {
        let config = FilterConfig { types: vec!["toast".into()], ..Default::default() };
        assert!(config.validate().is_err());

        let config = FilterConfig { priorities: vec!["urgent".into()], ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn filter_config_builds_runtime_filter() {
        let config = FilterConfig {
            types: vec!["error".into(), "warning".into()],
            priorities: vec!["critical".into()],
            components: vec!["db".into()],
            metadata: HashMap::from([("confidence".to_string(), ">0.5".to_string())]),
        };
        let filter = config.build();
        assert_eq!(filter.types.len(), 2);
        assert_eq!(filter.priorities, vec![NotificationPriority::Critical]);
        assert_eq!(filter.components, vec!["db".to_string()]);
        assert_eq!(filter.metadata_filters.len(), 1);
    }

    #[test]
    fn provider_config_round_trips_through_json() {
        let config = ProviderConfig {
            webhook: Some(WebhookConfig {
                endpoints: vec![EndpointConfig {
                    url: "https://example.test/hook".into(),
                    method: Some("PUT".into()),
                    headers: HashMap::new(),
                    timeout_ms: Some(2500),
                    auth: AuthConfig::Bearer { token: SecretRef::from_env("HOOK_TOKEN") },
                }],
                template: None,
            }),
            ..ProviderConfig::new("ops")
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ProviderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "ops");
        let webhook = back.webhook.unwrap();
        assert_eq!(webhook.endpoints[0].timeout(), Some(Duration::from_millis(2500)));
    }
}
