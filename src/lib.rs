#![forbid(unsafe_code)]

//! # towncrier 📯
//!
//! An in-process notification delivery pipeline: producers create
//! notifications through a central [`NotificationService`], subscribers
//! receive them over bounded channels, and a [`PushDispatcher`] forwards
//! a filtered subset to external providers (HTTP webhooks out of the
//! box) with per-provider fault isolation.
//!
//! ## Features
//!
//! - **Bounded store** with timestamp eviction and expiry sweeping
//! - **Subscriber fan-out** over bounded channels that never block producers
//! - **Per-provider circuit breakers** with half-open probe recovery
//! - **Token-bucket rate limiting** per provider, sliding-window limiting
//!   at creation
//! - **Retry with exponential backoff and ±25% jitter**, clock and sleeper
//!   injectable for deterministic tests
//! - **Global concurrency semaphore** released on every path, panics
//!   included
//! - **Health probing** that never blames a provider for its own breaker
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use towncrier::{
//!     DispatcherConfig, EndpointConfig, EnvSecretResolver, NotificationPriority,
//!     NotificationService, NotificationType, ProviderConfig, PushDispatcher, TracingSink,
//!     WebhookConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = NotificationService::new(Default::default())?;
//!     service.start();
//!
//!     let mut provider = ProviderConfig::new("ops-webhook");
//!     provider.webhook = Some(WebhookConfig {
//!         endpoints: vec![EndpointConfig {
//!             url: "https://hooks.example.com/notify".into(),
//!             method: None,
//!             headers: Default::default(),
//!             timeout_ms: None,
//!             auth: Default::default(),
//!         }],
//!         template: None,
//!     });
//!     let config = DispatcherConfig { providers: vec![provider], ..Default::default() };
//!     let dispatcher =
//!         PushDispatcher::from_config(config, &EnvSecretResolver, Arc::new(TracingSink))?;
//!     dispatcher.start(&service);
//!
//!     service.create(
//!         NotificationType::Warning,
//!         NotificationPriority::High,
//!         "disk almost full",
//!         "/var is at 93%",
//!     )?;
//!
//!     dispatcher.shutdown().await;
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod circuit_breaker;
mod clock;
mod config;
mod dispatcher;
mod error_events;
mod filter;
mod health;
mod jitter;
mod notification;
mod provider;
mod rate_limit;
mod retry;
mod service;
mod sleeper;
mod store;
mod telemetry;
mod throttle;
mod webhook;

// Re-exports
pub use backoff::ExponentialBackoff;
pub use circuit_breaker::{Admission, BreakerSettings, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    defaults, AuthConfig, BreakerConfig, ConfigError, DispatcherConfig, EndpointConfig,
    FilterConfig, HealthCheckerConfig, ProviderConfig, SecretRef, ServiceConfig,
    TokenBucketConfig, WebhookConfig,
};
pub use dispatcher::PushDispatcher;
pub use error_events::{priority_for, ErrorEvent, ErrorEventBus, ErrorHook, NotificationHook};
pub use filter::{FilterReason, FilterVerdict, ProviderFilter};
pub use health::{HealthChecker, HealthSummary, ProviderHealth};
pub use jitter::Jitter;
pub use notification::{
    reserved, Notification, NotificationPriority, NotificationStatus, NotificationType,
    UnknownVariant, Value,
};
pub use provider::{Provider, ProviderError};
pub use rate_limit::{SlidingWindowLimiter, TokenBucket};
pub use retry::{RetryError, RetryPolicy};
pub use service::{NotificationService, ServiceError, Subscription};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{ListFilter, NotificationStore, StoreError};
pub use telemetry::{
    BufferSink, DispatchEvent, DropReason, FailureKind, NullSink, TelemetrySink, TracingSink,
};
pub use throttle::AlertThrottle;
pub use webhook::{EnvSecretResolver, SecretResolver, WebhookProvider};

pub mod prelude;
