//! Bounded in-memory notification store.

use crate::notification::{
    Notification, NotificationPriority, NotificationStatus, NotificationType,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("notification id must not be empty")]
    EmptyId,

    #[error("no notification with id {0:?}")]
    NotFound(String),
}

/// Query filter for [`NotificationStore::list`]. Empty dimensions accept
/// everything; `limit == 0` means unlimited.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub types: Vec<NotificationType>,
    pub priorities: Vec<NotificationPriority>,
    pub statuses: Vec<NotificationStatus>,
    pub component: Option<String>,
    pub limit: usize,
}

impl ListFilter {
    fn accepts(&self, n: &Notification) -> bool {
        if !self.types.is_empty() && !self.types.contains(&n.kind) {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&n.priority) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&n.status) {
            return false;
        }
        if let Some(component) = &self.component {
            if component != &n.component {
                return false;
            }
        }
        true
    }
}

/// Fixed-capacity `id → Notification` mapping. When full, `save` evicts
/// the oldest entry by timestamp (ties broken by id so eviction is
/// deterministic within a run).
#[derive(Debug)]
pub struct NotificationStore {
    capacity: usize,
    entries: Mutex<HashMap<String, Notification>>,
}

impl NotificationStore {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: Mutex::new(HashMap::new()) }
    }

    pub fn save(&self, notification: Notification) -> Result<(), StoreError> {
        if notification.id.is_empty() {
            return Err(StoreError::EmptyId);
        }
        let mut entries = self.lock();
        if !entries.contains_key(&notification.id) && entries.len() >= self.capacity {
            let oldest = entries
                .values()
                .min_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
                .map(|n| n.id.clone());
            if let Some(id) = oldest {
                tracing::debug!(evicted = %id, "store full, evicting oldest notification");
                entries.remove(&id);
            }
        }
        entries.insert(notification.id.clone(), notification);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Notification> {
        self.lock().get(id).cloned()
    }

    /// Applies `mutate` to the stored entry.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Notification, StoreError>
    where
        F: FnOnce(&mut Notification),
    {
        let mut entries = self.lock();
        let entry = entries.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutate(entry);
        Ok(entry.clone())
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Removes entries whose expiry has passed; returns how many.
    pub fn delete_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, n| !n.is_expired(now));
        before - entries.len()
    }

    /// Matching entries, newest first. Toasts are never listed; they are
    /// broadcast-only.
    pub fn list(&self, filter: &ListFilter) -> Vec<Notification> {
        let entries = self.lock();
        let mut matched: Vec<Notification> = entries
            .values()
            .filter(|n| !n.is_toast() && filter.accepts(n))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        if filter.limit > 0 {
            matched.truncate(filter.limit);
        }
        matched
    }

    pub fn unread_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|n| !n.is_toast() && n.status == NotificationStatus::Unread)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Notification>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
