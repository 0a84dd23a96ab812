use crate::circuit_breaker::Admission;
use crate::filter::FilterReason;
use crate::provider::ProviderError;
use std::fmt;
use std::time::Duration;

/// Why a notification was dropped before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No concurrency permit became available within the bounded wait.
    QueueFull,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::QueueFull => f.write_str("queue-full"),
        }
    }
}

/// Coarse failure classification, for telemetry only. Retry decisions use
/// [`ProviderError::is_retryable`], never this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    None,
    Timeout,
    Cancelled,
    Network,
    Validation,
    Permission,
    NotFound,
    Provider,
}

impl FailureKind {
    /// Variant identity first, then case-insensitive substring matching
    /// over the error text.
    pub fn classify(error: &ProviderError) -> Self {
        match error {
            ProviderError::Timeout(_) => return FailureKind::Timeout,
            ProviderError::Cancelled => return FailureKind::Cancelled,
            ProviderError::Validation(_) => return FailureKind::Validation,
            _ => {}
        }
        let text = error.to_string().to_lowercase();
        if text.contains("timeout") || text.contains("timed out") || text.contains("deadline") {
            FailureKind::Timeout
        } else if text.contains("cancel") {
            FailureKind::Cancelled
        } else if text.contains("connection")
            || text.contains("network")
            || text.contains("dns")
            || text.contains("refused")
        {
            FailureKind::Network
        } else if text.contains("validat") || text.contains("invalid") {
            FailureKind::Validation
        } else if text.contains("unauthorized")
            || text.contains("forbidden")
            || text.contains("permission")
        {
            FailureKind::Permission
        } else if text.contains("not found") {
            FailureKind::NotFound
        } else {
            FailureKind::Provider
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::None => "none",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Network => "network",
            FailureKind::Validation => "validation",
            FailureKind::Permission => "permission",
            FailureKind::NotFound => "not_found",
            FailureKind::Provider => "provider_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured event per dispatcher decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// The provider's filter rejected the notification.
    Filtered {
        provider: String,
        notification: String,
        reason: FilterReason,
    },
    /// The provider's token bucket was empty.
    RateLimited {
        provider: String,
        notification: String,
    },
    /// The breaker refused admission; not a provider failure.
    Skipped {
        provider: String,
        notification: String,
        admission: Admission,
    },
    /// Dropped before dispatch.
    Dropped {
        provider: String,
        notification: String,
        reason: DropReason,
    },
    /// A retry is about to sleep and go again.
    Attempt {
        provider: String,
        notification: String,
        attempt: usize,
        delay: Duration,
    },
    Delivered {
        provider: String,
        notification: String,
        attempts: usize,
        elapsed: Duration,
    },
    Failed {
        provider: String,
        notification: String,
        kind: FailureKind,
        attempts: usize,
        error: String,
    },
}

impl DispatchEvent {
    pub fn provider(&self) -> &str {
        match self {
            DispatchEvent::Filtered { provider, .. }
            | DispatchEvent::RateLimited { provider, .. }
            | DispatchEvent::Skipped { provider, .. }
            | DispatchEvent::Dropped { provider, .. }
            | DispatchEvent::Attempt { provider, .. }
            | DispatchEvent::Delivered { provider, .. }
            | DispatchEvent::Failed { provider, .. } => provider,
        }
    }
}

// Display spells out the decision so a line-oriented sink is readable on
// its own.
impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::Filtered { provider, notification, reason } => {
                write!(f, "filtered(provider={provider}, id={notification}, reason={reason})")
            }
            DispatchEvent::RateLimited { provider, notification } => {
                write!(f, "rate-limited(provider={provider}, id={notification})")
            }
            DispatchEvent::Skipped { provider, notification, admission } => write!(
                f,
                "skipped(provider={provider}, id={notification}, reason={})",
                admission.as_str()
            ),
            DispatchEvent::Dropped { provider, notification, reason } => {
                write!(f, "dropped(provider={provider}, id={notification}, reason={reason})")
            }
            DispatchEvent::Attempt { provider, notification, attempt, delay } => write!(
                f,
                "attempt(provider={provider}, id={notification}, attempt={attempt}, delay={delay:?})"
            ),
            DispatchEvent::Delivered { provider, notification, attempts, elapsed } => write!(
                f,
                "delivered(provider={provider}, id={notification}, attempts={attempts}, elapsed={elapsed:?})"
            ),
            DispatchEvent::Failed { provider, notification, kind, attempts, error } => write!(
                f,
                "failed(provider={provider}, id={notification}, kind={kind}, attempts={attempts}, error={error})"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uses_variant_identity_first() {
        assert_eq!(
            FailureKind::classify(&ProviderError::Timeout(Duration::from_secs(1))),
            FailureKind::Timeout
        );
        assert_eq!(FailureKind::classify(&ProviderError::Cancelled), FailureKind::Cancelled);
        assert_eq!(
            FailureKind::classify(&ProviderError::Validation("x".into())),
            FailureKind::Validation
        );
    }

    #[test]
    fn classify_falls_back_to_substrings() {
        let net = ProviderError::transport("Connection refused by peer");
        assert_eq!(FailureKind::classify(&net), FailureKind::Network);

        let perm = ProviderError::Http { status: 403, body: "Forbidden".into() };
        assert_eq!(FailureKind::classify(&perm), FailureKind::Permission);

        let missing = ProviderError::Http { status: 404, body: "not found".into() };
        assert_eq!(FailureKind::classify(&missing), FailureKind::NotFound);

        let opaque = ProviderError::transport("something exploded");
        assert_eq!(FailureKind::classify(&opaque), FailureKind::Provider);
    }

    #[test]
    fn display_is_line_oriented() {
        let event = DispatchEvent::Delivered {
            provider: "hook".into(),
            notification: "n-1".into(),
            attempts: 2,
            elapsed: Duration::from_millis(40),
        };
        let line = event.to_string();
        assert!(line.contains("delivered"));
        assert!(line.contains("hook"));
        assert!(line.contains("attempts=2"));
    }
}
