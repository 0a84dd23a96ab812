//! Convenient re-exports for common towncrier types.
pub use crate::{
    circuit_breaker::{Admission, BreakerSettings, CircuitBreaker, CircuitState},
    config::{
        DispatcherConfig, HealthCheckerConfig, ProviderConfig, ServiceConfig, WebhookConfig,
    },
    dispatcher::PushDispatcher,
    error_events::{ErrorEvent, ErrorEventBus, NotificationHook},
    filter::{FilterReason, ProviderFilter},
    health::{HealthChecker, ProviderHealth},
    notification::{
        Notification, NotificationPriority, NotificationStatus, NotificationType, Value,
    },
    provider::{Provider, ProviderError},
    service::{NotificationService, ServiceError, Subscription},
    store::ListFilter,
    telemetry::{BufferSink, DispatchEvent, TelemetrySink, TracingSink},
    webhook::{EnvSecretResolver, SecretResolver, WebhookProvider},
};
