//! The push-provider contract.
//!
//! A provider is a destination backend capable of delivering a
//! notification outside the process. The dispatcher owns provider
//! instances together with their breakers and token buckets; nothing else
//! mutates provider state.

use crate::notification::{Notification, NotificationType};
use async_trait::async_trait;
use std::time::Duration;

/// Typed failure from a provider. Retryability is explicit: the dispatch
/// retry loop trusts [`ProviderError::is_retryable`] rather than guessing
/// from message text.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("send cancelled")]
    Cancelled,

    #[error("invalid provider configuration: {0}")]
    Validation(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{message}")]
    Transport { message: String, retryable: bool },
}

impl ProviderError {
    pub fn transport(message: impl Into<String>) -> Self {
        ProviderError::Transport { message: message.into(), retryable: true }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Transport { message: message.into(), retryable: false }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout(_) => true,
            ProviderError::Cancelled => false,
            ProviderError::Validation(_) => false,
            // Server-side and throttling statuses are worth retrying;
            // other client errors are not.
            ProviderError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            ProviderError::Transport { retryable, .. } => *retryable,
        }
    }
}

/// Capability set a push backend must supply.
///
/// `validate_config` must be idempotent and cheap; the health checker
/// calls it on every probe. `send` must honor cancellation and deadlines
/// imposed by the caller.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Non-empty name, unique within a dispatcher.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    fn supports_type(&self, _kind: NotificationType) -> bool {
        true
    }

    async fn validate_config(&self) -> Result<(), ProviderError>;

    async fn send(&self, notification: &Notification) -> Result<(), ProviderError>;
}
