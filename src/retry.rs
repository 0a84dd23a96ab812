//! Retry controller for provider sends.
//!
//! An error is retried unless it is a cancellation, a provider error with
//! `retryable == false`, or the attempt budget is spent. Between attempts
//! the policy sleeps for the jittered exponential backoff through an
//! injected [`Sleeper`], so tests never wait on real time.

use crate::backoff::ExponentialBackoff;
use crate::jitter::Jitter;
use crate::provider::ProviderError;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError {
    #[error("non-retryable failure on attempt {attempts}: {source}")]
    NonRetryable {
        attempts: usize,
        source: ProviderError,
    },

    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        source: ProviderError,
    },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: usize },
}

impl RetryError {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::NonRetryable { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn source_error(&self) -> Option<&ProviderError> {
        match self {
            RetryError::NonRetryable { source, .. } | RetryError::Exhausted { source, .. } => {
                Some(source)
            }
            RetryError::Cancelled { .. } => None,
        }
    }

    /// Cancellations are reported but never held against the provider.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, RetryError::Cancelled { .. })
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff: ExponentialBackoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, backoff: ExponentialBackoff, jitter: Jitter) -> Self {
        Self { max_retries, backoff, jitter, sleeper: Arc::new(TokioSleeper) }
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Runs `operation` until success, a terminal error, or cancellation.
    ///
    /// `on_backoff(attempt, delay)` fires before each sleep; the
    /// dispatcher uses it to emit attempt telemetry. On success the value
    /// is returned with the number of attempts it took.
    pub async fn execute<T, Fut, Op, Obs>(
        &self,
        cancel: &CancellationToken,
        mut operation: Op,
        mut on_backoff: Obs,
    ) -> Result<(T, usize), RetryError>
    where
        T: Send,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
        Op: FnMut() -> Fut + Send,
        Obs: FnMut(usize, Duration) + Send,
    {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let error = match operation().await {
                Ok(value) => return Ok((value, attempt)),
                Err(ProviderError::Cancelled) => {
                    return Err(RetryError::Cancelled { attempts: attempt })
                }
                Err(e) if !e.is_retryable() => {
                    return Err(RetryError::NonRetryable { attempts: attempt, source: e })
                }
                Err(e) => e,
            };

            if attempt > self.max_retries {
                return Err(RetryError::Exhausted { attempts: attempt, source: error });
            }

            let delay = self.backoff.clamp(self.jitter.apply(self.backoff.delay(attempt)));
            on_backoff(attempt, delay);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1)),
            Jitter::None,
        )
        .with_sleeper(InstantSleeper)
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let calls = AtomicUsize::new(0);
        let result = policy(3)
            .execute(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ProviderError>(7) }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(result.unwrap(), (7, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicUsize::new(0);
        let result = policy(3)
            .execute(
                &CancellationToken::new(),
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ProviderError::transport("flaky"))
                        } else {
                            Ok(())
                        }
                    }
                },
                |_, _| {},
            )
            .await;
        let (_, attempts) = result.unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries_plus_initial_attempt() {
        let calls = AtomicUsize::new(0);
        let result = policy(3)
            .execute(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ProviderError::transport("down")) }
                },
                |_, _| {},
            )
            .await;
        match result.unwrap_err() {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_stops_immediately() {
        let calls = AtomicUsize::new(0);
        let result = policy(5)
            .execute(
                &CancellationToken::new(),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ProviderError::permanent("bad payload")) }
                },
                |_, _| {},
            )
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::NonRetryable { attempts: 1, .. }));
        assert!(err.counts_against_breaker());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_from_send_is_not_a_breaker_failure() {
        let result = policy(5)
            .execute(
                &CancellationToken::new(),
                || async { Err::<(), _>(ProviderError::Cancelled) },
                |_, _| {},
            )
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Cancelled { attempts: 1 }));
        assert!(!err.counts_against_breaker());
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let result = policy(5)
            .execute(
                &cancel,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, ProviderError>(()) }
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(result.unwrap_err(), RetryError::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_between_attempts_stops_the_loop() {
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        // The real TokioSleeper parks on the backoff; cancelling mid-sleep
        // must win the select.
        let policy = RetryPolicy::new(
            5,
            ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(30)),
            Jitter::None,
        );
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let result = policy
            .execute(
                &cancel,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ProviderError::transport("flaky")) }
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(result.unwrap_err(), RetryError::Cancelled { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_delays_double_and_stay_in_bounds() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::new(
            3,
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(250)),
            Jitter::None,
        )
        .with_sleeper(sleeper.clone());

        let _ = policy
            .execute(
                &CancellationToken::new(),
                || async { Err::<(), _>(ProviderError::transport("down")) },
                |_, _| {},
            )
            .await;

        // 100ms, 200ms, then capped at 250ms.
        assert_eq!(
            sleeper.calls(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(250),
            ]
        );
    }

    #[tokio::test]
    async fn observer_sees_each_backoff() {
        let observed = std::sync::Mutex::new(Vec::new());
        let _ = policy(2)
            .execute(
                &CancellationToken::new(),
                || async { Err::<(), _>(ProviderError::transport("down")) },
                |attempt, delay| observed.lock().unwrap().push((attempt, delay)),
            )
            .await;
        let observed = observed.into_inner().unwrap();
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[0].0, 1);
        assert_eq!(observed[1].0, 2);
    }
}
