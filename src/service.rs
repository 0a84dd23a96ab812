//! The notification service: rate-limited creation, bounded storage,
//! and subscriber fan-out.

use crate::config::{defaults, ConfigError, ServiceConfig};
use crate::error_events::ErrorEvent;
use crate::notification::{
    Notification, NotificationPriority, NotificationType,
};
use crate::rate_limit::SlidingWindowLimiter;
use crate::store::{ListFilter, NotificationStore, StoreError};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("notification creation rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Handle returned by [`NotificationService::subscribe`].
///
/// The service never closes the channel; shutdown is observed through
/// `token`. Dropping the subscription closes the receiver and the entry
/// is garbage-collected on the next broadcast.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Notification>,
    pub token: CancellationToken,
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::Sender<Notification>,
    token: CancellationToken,
}

/// Central notification pipeline entry point.
///
/// Owns its store, sliding-window limiter, and subscriber registry.
/// All operations are safe for concurrent callers; `create*` never
/// suspends.
pub struct NotificationService {
    config: ServiceConfig,
    store: Arc<NotificationStore>,
    limiter: SlidingWindowLimiter,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    next_subscriber_id: AtomicU64,
    root: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationService {
    pub fn new(config: ServiceConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self {
            store: Arc::new(NotificationStore::new(config.max_notifications)),
            limiter: SlidingWindowLimiter::new(
                config.rate_limit_window(),
                config.rate_limit_max_events,
            ),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
            root: CancellationToken::new(),
            sweeper: Mutex::new(None),
            config,
        }))
    }

    /// Launches the background expiry sweeper. Idempotent.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if sweeper.is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        let token = self.root.clone();
        let period = self.config.cleanup_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.delete_expired(Utc::now());
                        if removed > 0 {
                            tracing::debug!(removed, "expired notifications swept");
                        }
                    }
                }
            }
        }));
    }

    /// Cancels the sweeper and every subscriber scope, then returns.
    pub async fn stop(&self) {
        self.root.cancel();
        {
            let mut subscribers =
                self.subscribers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            for entry in subscribers.drain(..) {
                entry.token.cancel();
            }
        }
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn create(
        &self,
        kind: NotificationType,
        priority: NotificationPriority,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Notification, ServiceError> {
        self.create_with_component(kind, priority, title, message, "")
    }

    pub fn create_with_component(
        &self,
        kind: NotificationType,
        priority: NotificationPriority,
        title: impl Into<String>,
        message: impl Into<String>,
        component: impl Into<String>,
    ) -> Result<Notification, ServiceError> {
        let notification =
            Notification::new(kind, priority, title, message).with_component(component);
        self.admit_and_publish(notification.clone())?;
        Ok(notification)
    }

    /// Full-fidelity path: stores and broadcasts a caller-built
    /// notification, preserving its metadata and expiry. Used for toasts
    /// and template-enriched notifications.
    pub fn create_with_metadata(&self, notification: Notification) -> Result<(), ServiceError> {
        self.admit_and_publish(notification)
    }

    /// Maps a structured error event to an `error` notification with a
    /// priority derived from its category (explicit hints win).
    pub fn create_error_notification(
        &self,
        event: &ErrorEvent,
    ) -> Result<Notification, ServiceError> {
        let priority = event.priority();
        let title = match priority {
            NotificationPriority::Critical => "Critical System Error",
            NotificationPriority::High => "System Error",
            NotificationPriority::Medium => "System Warning",
            NotificationPriority::Low => "System Notice",
        };
        let message: String =
            event.message.chars().take(defaults::MESSAGE_TRUNCATE).collect();
        let notification = Notification::new(NotificationType::Error, priority, title, message)
            .with_component(event.component.clone())
            .with_expiry(defaults::ALERT_EXPIRY);
        self.admit_and_publish(notification.clone())?;
        Ok(notification)
    }

    fn admit_and_publish(&self, notification: Notification) -> Result<(), ServiceError> {
        if !self.limiter.allow() {
            tracing::debug!("notification creation rate limited");
            return Err(ServiceError::RateLimited);
        }
        self.store.save(notification.clone())?;
        self.broadcast(&notification);
        Ok(())
    }

    /// Offers the notification to each live subscriber without blocking.
    /// Full channels are skipped for this notification; cancelled or
    /// closed subscribers are garbage-collected.
    fn broadcast(&self, notification: &Notification) {
        let mut subscribers =
            self.subscribers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|entry| {
            if entry.token.is_cancelled() {
                return false;
            }
            match entry.tx.try_send(notification.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        subscriber = entry.id,
                        notification = %notification.id,
                        "subscriber channel full, skipping"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.config.channel_buffer);
        let token = self.root.child_token();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SubscriberEntry { id, tx, token: token.clone() });
        Subscription { id, receiver, token }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers =
            self.subscribers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(index) = subscribers.iter().position(|entry| entry.id == id) {
            let entry = subscribers.swap_remove(index);
            entry.token.cancel();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &ListFilter) -> Vec<Notification> {
        self.store.list(filter)
    }

    pub fn mark_read(&self, id: &str) -> Result<(), ServiceError> {
        self.store.update(id, Notification::mark_read)?;
        Ok(())
    }

    pub fn mark_acknowledged(&self, id: &str) -> Result<(), ServiceError> {
        self.store.update(id, Notification::mark_acknowledged)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), ServiceError> {
        self.store.delete(id)?;
        Ok(())
    }

    pub fn unread_count(&self) -> usize {
        self.store.unread_count()
    }
}
