//! Push dispatch: fans notifications out to providers under admission
//! control, a global concurrency bound, and retrying sends.
//!
//! The dispatcher subscribes to the service and runs one consumer loop.
//! For each notification, providers are visited in configuration order:
//! filter, breaker admission, token bucket, then a bounded wait for a
//! global concurrency permit. The send itself runs in a worker task so a
//! slow provider never blocks the consumer; the permit travels into the
//! worker and is released on every exit path, panics included.

use crate::backoff::ExponentialBackoff;
use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::config::{ConfigError, DispatcherConfig, ProviderConfig};
use crate::filter::ProviderFilter;
use crate::jitter::Jitter;
use crate::notification::Notification;
use crate::provider::{Provider, ProviderError};
use crate::retry::RetryPolicy;
use crate::service::NotificationService;
use crate::sleeper::Sleeper;
use crate::telemetry::{DispatchEvent, DropReason, FailureKind, TelemetrySink, TracingSink};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

struct ProviderRuntime {
    provider: Arc<dyn Provider>,
    config: ProviderConfig,
    filter: ProviderFilter,
    breaker: CircuitBreaker,
    bucket: crate::rate_limit::TokenBucket,
}

impl ProviderRuntime {
    fn supports(&self, notification: &Notification) -> bool {
        let config_allows = self.config.supported_types.is_empty()
            || self.config.supported_types.contains(&notification.kind);
        config_allows && self.provider.supports_type(notification.kind)
    }
}

struct DispatcherInner {
    runtimes: Vec<ProviderRuntime>,
    semaphore: Arc<Semaphore>,
    telemetry: Arc<dyn TelemetrySink>,
    retry: RetryPolicy,
    send_timeout: Duration,
    acquire_timeout: Duration,
}

/// Dispatches notifications from a [`NotificationService`] to providers.
pub struct PushDispatcher {
    config: DispatcherConfig,
    inner: Arc<DispatcherInner>,
    token: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl PushDispatcher {
    /// Builds a dispatcher over pre-constructed provider instances.
    ///
    /// Every provider must have a matching entry (by name) in
    /// `config.providers`, which supplies its filter, breaker, and token
    /// bucket; providers are visited in configuration order.
    pub fn new(
        config: DispatcherConfig,
        providers: Vec<Arc<dyn Provider>>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut by_name: std::collections::HashMap<&str, Arc<dyn Provider>> = providers
            .iter()
            .map(|p| (p.name(), Arc::clone(p)))
            .collect();
        let mut runtimes = Vec::with_capacity(config.providers.len());
        for provider_config in &config.providers {
            let provider = by_name.remove(provider_config.name.as_str()).ok_or_else(|| {
                ConfigError::Invalid {
                    field: "providers",
                    reason: format!("no provider instance named {:?}", provider_config.name),
                }
            })?;
            runtimes.push(ProviderRuntime {
                filter: provider_config.filter.build(),
                breaker: CircuitBreaker::new(provider_config.circuit_breaker.settings()),
                bucket: crate::rate_limit::TokenBucket::new(
                    provider_config.rate_limit.requests_per_minute,
                    provider_config.rate_limit.burst,
                ),
                config: provider_config.clone(),
                provider,
            });
        }
        if let Some(orphan) = by_name.keys().next() {
            return Err(ConfigError::Invalid {
                field: "providers",
                reason: format!("provider {orphan:?} has no configuration entry"),
            });
        }

        let retry = RetryPolicy::new(
            config.max_retries,
            ExponentialBackoff::new(config.base_retry_delay(), config.max_retry_delay()),
            Jitter::proportional(),
        );
        let inner = Arc::new(DispatcherInner {
            semaphore: Arc::new(Semaphore::new(config.concurrency_limit())),
            telemetry,
            retry,
            send_timeout: config.default_timeout(),
            acquire_timeout: config.acquire_timeout(),
            runtimes,
        });
        Ok(Self {
            config,
            inner,
            token: CancellationToken::new(),
            consumer: Mutex::new(None),
        })
    }

    /// Builds webhook providers straight from configuration.
    pub fn from_config(
        config: DispatcherConfig,
        resolver: &dyn crate::webhook::SecretResolver,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, ConfigError> {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::with_capacity(config.providers.len());
        for provider_config in &config.providers {
            let provider = crate::webhook::WebhookProvider::from_config(provider_config, resolver)?;
            providers.push(Arc::new(provider));
        }
        Self::new(config, providers, telemetry)
    }

    /// Swaps the retry sleeper; tests inject tracking or instant sleepers.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_sleeper must be called before start");
        inner.retry = inner.retry.clone().with_sleeper(sleeper);
        self
    }

    /// Default tracing-backed telemetry.
    pub fn with_default_telemetry(
        config: DispatcherConfig,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Result<Self, ConfigError> {
        Self::new(config, providers, Arc::new(TracingSink))
    }

    /// Breaker for a provider, mostly for health-checker registration.
    pub fn breaker_for(&self, name: &str) -> Option<CircuitBreaker> {
        self.inner
            .runtimes
            .iter()
            .find(|r| r.provider.name() == name)
            .map(|r| r.breaker.clone())
    }

    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.inner.runtimes.iter().map(|r| Arc::clone(&r.provider)).collect()
    }

    /// Subscribes to the service and launches the consumer loop.
    /// Idempotent; a disabled dispatcher never starts.
    pub fn start(&self, service: &Arc<NotificationService>) {
        if !self.config.enabled {
            tracing::info!("push dispatcher disabled by configuration");
            return;
        }
        let mut consumer =
            self.consumer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if consumer.is_some() {
            return;
        }
        let mut subscription = service.subscribe();
        let inner = Arc::clone(&self.inner);
        let token = self.token.clone();
        *consumer = Some(tokio::spawn(async move {
            let mut workers: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = subscription.receiver.recv() => match received {
                        Some(notification) => {
                            Arc::clone(&inner)
                                .dispatch(Arc::new(notification), &token, &mut workers)
                                .await;
                        }
                        None => break,
                    },
                    Some(_) = workers.join_next(), if !workers.is_empty() => {}
                }
            }
            // Drain in-flight workers before reporting shutdown complete.
            while workers.join_next().await.is_some() {}
            tracing::debug!("push dispatcher consumer stopped");
        }));
    }

    /// Cancels the consumer and all in-flight dispatch tasks, then waits
    /// for the drain.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handle = self
            .consumer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl DispatcherInner {
    /// Runs the per-provider admission pipeline for one notification.
    async fn dispatch(
        self: Arc<Self>,
        notification: Arc<Notification>,
        token: &CancellationToken,
        workers: &mut JoinSet<()>,
    ) {
        for runtime in &self.runtimes {
            if !runtime.provider.is_enabled() {
                continue;
            }
            let provider_name = runtime.provider.name().to_string();

            if !runtime.supports(&notification) {
                self.telemetry.emit(&DispatchEvent::Filtered {
                    provider: provider_name,
                    notification: notification.id.clone(),
                    reason: crate::filter::FilterReason::TypeMismatch,
                });
                continue;
            }

            let verdict = runtime.filter.evaluate(&notification);
            if !verdict.matched {
                self.telemetry.emit(&DispatchEvent::Filtered {
                    provider: provider_name,
                    notification: notification.id.clone(),
                    reason: verdict.reason,
                });
                continue;
            }

            let admission = runtime.breaker.allow();
            let probe = match admission {
                Admission::Granted { probe } => probe,
                gated => {
                    self.telemetry.emit(&DispatchEvent::Skipped {
                        provider: provider_name,
                        notification: notification.id.clone(),
                        admission: gated,
                    });
                    continue;
                }
            };

            if !runtime.bucket.allow() {
                if probe {
                    runtime.breaker.forfeit();
                }
                self.telemetry.emit(&DispatchEvent::RateLimited {
                    provider: provider_name,
                    notification: notification.id.clone(),
                });
                continue;
            }

            let acquired = tokio::time::timeout(
                self.acquire_timeout,
                Arc::clone(&self.semaphore).acquire_owned(),
            )
            .await;
            let permit = match acquired {
                Ok(Ok(permit)) => permit,
                // Closed semaphore only happens on teardown.
                Ok(Err(_)) => return,
                Err(_) => {
                    if probe {
                        runtime.breaker.forfeit();
                    }
                    self.telemetry.emit(&DispatchEvent::Dropped {
                        provider: provider_name,
                        notification: notification.id.clone(),
                        reason: DropReason::QueueFull,
                    });
                    continue;
                }
            };

            let this = Arc::clone(&self);
            let provider = Arc::clone(&runtime.provider);
            let breaker = runtime.breaker.clone();
            let notification = Arc::clone(&notification);
            let token = token.clone();
            workers.spawn(async move {
                // Permit lives on the task's stack: released when the task
                // finishes, whether the send succeeded, failed, or panicked.
                let _permit = permit;
                let outcome = AssertUnwindSafe(this.send_with_retry(
                    &provider,
                    &breaker,
                    &notification,
                    &token,
                ))
                .catch_unwind()
                .await;
                if outcome.is_err() {
                    breaker.on_failure();
                    this.telemetry.emit(&DispatchEvent::Failed {
                        provider: provider.name().to_string(),
                        notification: notification.id.clone(),
                        kind: FailureKind::Provider,
                        attempts: 0,
                        error: "dispatch task panicked".to_string(),
                    });
                }
            });
        }
    }

    async fn send_with_retry(
        &self,
        provider: &Arc<dyn Provider>,
        breaker: &CircuitBreaker,
        notification: &Arc<Notification>,
        token: &CancellationToken,
    ) {
        let provider_name = provider.name().to_string();
        let started = Instant::now();
        let send_timeout = self.send_timeout;

        let result = self
            .retry
            .execute(
                token,
                || {
                    let provider = Arc::clone(provider);
                    let notification = Arc::clone(notification);
                    let token = token.clone();
                    async move {
                        tokio::select! {
                            _ = token.cancelled() => Err(ProviderError::Cancelled),
                            outcome = tokio::time::timeout(send_timeout, provider.send(&notification)) => {
                                match outcome {
                                    Ok(result) => result,
                                    Err(_) => Err(ProviderError::Timeout(send_timeout)),
                                }
                            }
                        }
                    }
                },
                |attempt, delay| {
                    self.telemetry.emit(&DispatchEvent::Attempt {
                        provider: provider_name.clone(),
                        notification: notification.id.clone(),
                        attempt,
                        delay,
                    });
                },
            )
            .await;

        match result {
            Ok(((), attempts)) => {
                breaker.on_success();
                self.telemetry.emit(&DispatchEvent::Delivered {
                    provider: provider_name,
                    notification: notification.id.clone(),
                    attempts,
                    elapsed: started.elapsed(),
                });
            }
            Err(error) => {
                if error.counts_against_breaker() {
                    breaker.on_failure();
                } else {
                    // Cancellation concludes a probe without blame.
                    breaker.forfeit();
                }
                let kind = error
                    .source_error()
                    .map(FailureKind::classify)
                    .unwrap_or(FailureKind::Cancelled);
                self.telemetry.emit(&DispatchEvent::Failed {
                    provider: provider_name,
                    notification: notification.id.clone(),
                    kind,
                    attempts: error.attempts(),
                    error: error.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, TokenBucketConfig};
    use crate::notification::{NotificationPriority, NotificationType};
    use crate::sleeper::InstantSleeper;
    use crate::telemetry::BufferSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingProvider {
        name: String,
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl RecordingProvider {
        fn new(name: &str, fail_first: usize) -> Arc<Self> {
            Arc::new(Self { name: name.to_string(), calls: AtomicUsize::new(0), fail_first })
        }
    }

    #[async_trait]
    impl Provider for RecordingProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn validate_config(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn send(&self, _notification: &Notification) -> Result<(), ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(ProviderError::transport("transient"))
            } else {
                Ok(())
            }
        }
    }

    fn dispatcher_config(provider: ProviderConfig) -> DispatcherConfig {
        DispatcherConfig {
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            providers: vec![provider],
            ..Default::default()
        }
    }

    async fn run_one(
        dispatcher: &PushDispatcher,
        service: &Arc<NotificationService>,
        notification: Notification,
    ) {
        dispatcher.start(service);
        service.create_with_metadata(notification).unwrap();
        // Give the consumer a moment, then drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn delivers_matching_notification() {
        let provider = RecordingProvider::new("hook", 0);
        let sink = BufferSink::new();
        let dispatcher = PushDispatcher::new(
            dispatcher_config(ProviderConfig::new("hook")),
            vec![provider.clone() as Arc<dyn Provider>],
            Arc::new(sink.clone()),
        )
        .unwrap()
        .with_sleeper(InstantSleeper);
        let service = NotificationService::new(Default::default()).unwrap();

        let n = Notification::new(
            NotificationType::Info,
            NotificationPriority::Medium,
            "t",
            "m",
        );
        run_one(&dispatcher, &service, n).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let events = sink.snapshot();
        assert!(events
            .iter()
            .any(|e| matches!(e, DispatchEvent::Delivered { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn filtered_notification_never_reaches_provider() {
        let provider = RecordingProvider::new("hook", 0);
        let sink = BufferSink::new();
        let mut config = ProviderConfig::new("hook");
        config.filter.priorities = vec!["critical".into()];
        let dispatcher = PushDispatcher::new(
            dispatcher_config(config),
            vec![provider.clone() as Arc<dyn Provider>],
            Arc::new(sink.clone()),
        )
        .unwrap();
        let service = NotificationService::new(Default::default()).unwrap();

        let n = Notification::new(
            NotificationType::Info,
            NotificationPriority::Low,
            "t",
            "m",
        );
        run_one(&dispatcher, &service, n).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(sink
            .snapshot()
            .iter()
            .any(|e| matches!(e, DispatchEvent::Filtered { .. })));
    }

    #[tokio::test]
    async fn retries_then_succeeds_and_closes_breaker() {
        let provider = RecordingProvider::new("hook", 2);
        let sink = BufferSink::new();
        let dispatcher = PushDispatcher::new(
            dispatcher_config(ProviderConfig::new("hook")),
            vec![provider.clone() as Arc<dyn Provider>],
            Arc::new(sink.clone()),
        )
        .unwrap()
        .with_sleeper(InstantSleeper);
        let breaker = dispatcher.breaker_for("hook").unwrap();
        let service = NotificationService::new(Default::default()).unwrap();

        let n = Notification::new(
            NotificationType::Info,
            NotificationPriority::Medium,
            "t",
            "m",
        );
        run_one(&dispatcher, &service, n).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(
            breaker.current_state(),
            crate::circuit_breaker::CircuitState::Closed
        );
        let events = sink.snapshot();
        let attempts = events
            .iter()
            .filter(|e| matches!(e, DispatchEvent::Attempt { .. }))
            .count();
        assert_eq!(attempts, 2);
        assert!(events
            .iter()
            .any(|e| matches!(e, DispatchEvent::Delivered { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn empty_token_bucket_skips_without_retry() {
        let provider = RecordingProvider::new("hook", 0);
        let sink = BufferSink::new();
        let mut config = ProviderConfig::new("hook");
        config.rate_limit = TokenBucketConfig { requests_per_minute: 0.001, burst: 1 };
        let dispatcher = PushDispatcher::new(
            dispatcher_config(config),
            vec![provider.clone() as Arc<dyn Provider>],
            Arc::new(sink.clone()),
        )
        .unwrap();
        let service = NotificationService::new(Default::default()).unwrap();
        dispatcher.start(&service);

        for _ in 0..2 {
            service
                .create(NotificationType::Info, NotificationPriority::Low, "t", "m")
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.shutdown().await;

        // Burst of one: the first went through, the second was shed.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(sink
            .snapshot()
            .iter()
            .any(|e| matches!(e, DispatchEvent::RateLimited { .. })));
    }

    #[tokio::test]
    async fn open_breaker_skips_provider_without_calls() {
        let provider = RecordingProvider::new("hook", 0);
        let sink = BufferSink::new();
        let mut config = ProviderConfig::new("hook");
        config.circuit_breaker = BreakerConfig {
            max_failures: 1,
            open_timeout_ms: 3_600_000,
            half_open_max_probes: 1,
        };
        let dispatcher = PushDispatcher::new(
            dispatcher_config(config),
            vec![provider.clone() as Arc<dyn Provider>],
            Arc::new(sink.clone()),
        )
        .unwrap();
        dispatcher.breaker_for("hook").unwrap().on_failure();
        let service = NotificationService::new(Default::default()).unwrap();

        let n = Notification::new(
            NotificationType::Info,
            NotificationPriority::Medium,
            "t",
            "m",
        );
        run_one(&dispatcher, &service, n).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(sink.snapshot().iter().any(|e| matches!(
            e,
            DispatchEvent::Skipped { admission: Admission::CircuitOpen, .. }
        )));
    }

    #[tokio::test]
    async fn non_retryable_failure_records_single_attempt() {
        struct PermanentFailure;

        #[async_trait]
        impl Provider for PermanentFailure {
            fn name(&self) -> &str {
                "hook"
            }

            async fn validate_config(&self) -> Result<(), ProviderError> {
                Ok(())
            }

            async fn send(&self, _notification: &Notification) -> Result<(), ProviderError> {
                Err(ProviderError::permanent("payload rejected"))
            }
        }

        let sink = BufferSink::new();
        let dispatcher = PushDispatcher::new(
            dispatcher_config(ProviderConfig::new("hook")),
            vec![Arc::new(PermanentFailure) as Arc<dyn Provider>],
            Arc::new(sink.clone()),
        )
        .unwrap();
        let breaker = dispatcher.breaker_for("hook").unwrap();
        let service = NotificationService::new(Default::default()).unwrap();

        let n = Notification::new(
            NotificationType::Info,
            NotificationPriority::Medium,
            "t",
            "m",
        );
        run_one(&dispatcher, &service, n).await;

        assert_eq!(breaker.consecutive_failures(), 1);
        assert!(sink.snapshot().iter().any(|e| matches!(
            e,
            DispatchEvent::Failed { attempts: 1, kind: FailureKind::Provider, .. }
        )));
    }

    #[tokio::test]
    async fn disabled_dispatcher_never_starts() {
        let provider = RecordingProvider::new("hook", 0);
        let sink = BufferSink::new();
        let mut config = ProviderConfig::new("hook");
        config.enabled = true;
        let mut dispatcher_cfg = dispatcher_config(config);
        dispatcher_cfg.enabled = false;
        let dispatcher = PushDispatcher::new(
            dispatcher_cfg,
            vec![provider.clone() as Arc<dyn Provider>],
            Arc::new(sink.clone()),
        )
        .unwrap();
        let service = NotificationService::new(Default::default()).unwrap();

        let n = Notification::new(
            NotificationType::Info,
            NotificationPriority::Medium,
            "t",
            "m",
        );
        run_one(&dispatcher, &service, n).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(sink.snapshot().is_empty());
    }

    #[tokio::test]
    async fn unknown_provider_instance_is_a_config_error() {
        let provider = RecordingProvider::new("other", 0);
        let result = PushDispatcher::new(
            dispatcher_config(ProviderConfig::new("hook")),
            vec![provider as Arc<dyn Provider>],
            Arc::new(BufferSink::new()),
        );
        assert!(result.is_err());
    }
}
