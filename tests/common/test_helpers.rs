use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use towncrier::{Notification, Provider, ProviderError};

type Script = dyn Fn(usize) -> Result<(), ProviderError> + Send + Sync;

/// Provider whose outcome is scripted by call index (0-based), with an
/// optional artificial send latency and in-flight tracking.
pub struct ScriptedProvider {
    name: String,
    script: Box<Script>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new<F>(name: &str, script: F) -> Arc<Self>
    where
        F: Fn(usize) -> Result<(), ProviderError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            script: Box::new(script),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn with_latency<F>(name: &str, latency: Duration, script: F) -> Arc<Self>
    where
        F: Fn(usize) -> Result<(), ProviderError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            script: Box::new(script),
            latency,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Always succeeds.
    pub fn reliable(name: &str) -> Arc<Self> {
        Self::new(name, |_| Ok(()))
    }

    /// Fails the first `n` calls with a retryable error, then succeeds.
    pub fn flaky(name: &str, n: usize) -> Arc<Self> {
        Self::new(name, move |call| {
            if call < n {
                Err(ProviderError::transport("transient failure"))
            } else {
                Ok(())
            }
        })
    }

    /// Fails every call with a non-retryable error.
    pub fn broken(name: &str) -> Arc<Self> {
        Self::new(name, |_| Err(ProviderError::permanent("permanently broken")))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn send(&self, _notification: &Notification) -> Result<(), ProviderError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.script)(call);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
