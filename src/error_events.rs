//! Bridge from the error subsystem into notifications.
//!
//! Components publish [`ErrorEvent`]s to an explicit [`ErrorEventBus`]
//! instead of a process-global callback list. The notification hook
//! derives a priority from the error category, drops events below its
//! configured threshold, and creates an error notification for the rest.

use crate::notification::NotificationPriority;
use crate::service::NotificationService;
use std::sync::{Arc, RwLock};

/// A structured error raised somewhere in the host application.
///
/// `category` is an open set; unknown categories map to medium priority.
/// A recognized `priority_hint` overrides the category table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub component: String,
    pub category: String,
    pub message: String,
    pub priority_hint: String,
}

impl ErrorEvent {
    pub fn new(
        component: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            category: category.into(),
            message: message.into(),
            priority_hint: String::new(),
        }
    }

    pub fn with_priority_hint(mut self, hint: impl Into<String>) -> Self {
        self.priority_hint = hint.into();
        self
    }

    pub fn priority(&self) -> NotificationPriority {
        priority_for(&self.category, &self.priority_hint)
    }
}

/// Category → priority table. An explicit, recognized hint always wins.
pub fn priority_for(category: &str, hint: &str) -> NotificationPriority {
    if !hint.is_empty() {
        if let Ok(priority) = hint.parse::<NotificationPriority>() {
            return priority;
        }
    }
    match category {
        "model-init" | "model-load" | "database" | "audio-analysis" | "worker" => {
            NotificationPriority::Critical
        }
        "system" | "configuration" | "image-provider" | "mqtt-connection" | "mqtt-auth"
        | "job-queue" | "buffer" | "command-execution" => NotificationPriority::High,
        "network" | "rtsp" | "file-io" | "audio" | "audio-source" | "threshold"
        | "species-tracking" | "cancellation" | "broadcast" | "integration" => {
            NotificationPriority::Medium
        }
        "validation" | "timeout" | "retry" | "sound-level" | "event-tracking" => {
            NotificationPriority::Low
        }
        _ => NotificationPriority::Medium,
    }
}

/// Receives every published error event.
pub trait ErrorHook: Send + Sync {
    fn on_error(&self, event: &ErrorEvent);
}

/// Explicit publisher for error events.
#[derive(Default)]
pub struct ErrorEventBus {
    hooks: RwLock<Vec<Arc<dyn ErrorHook>>>,
}

impl ErrorEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, hook: Arc<dyn ErrorHook>) {
        self.hooks.write().unwrap_or_else(|poisoned| poisoned.into_inner()).push(hook);
    }

    pub fn publish(&self, event: &ErrorEvent) {
        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for hook in hooks {
            hook.on_error(event);
        }
    }
}

/// Hook that turns error events into notifications.
///
/// Events whose derived priority sits below `min_priority` are dropped
/// before reaching the service. The default keeps medium and above;
/// stricter deployments pass [`NotificationPriority::High`] to also drop
/// medium.
pub struct NotificationHook {
    service: Arc<NotificationService>,
    min_priority: NotificationPriority,
}

impl NotificationHook {
    pub fn new(service: Arc<NotificationService>) -> Self {
        Self { service, min_priority: NotificationPriority::Medium }
    }

    pub fn with_min_priority(mut self, min_priority: NotificationPriority) -> Self {
        self.min_priority = min_priority;
        self
    }
}

impl ErrorHook for NotificationHook {
    fn on_error(&self, event: &ErrorEvent) {
        if event.priority() < self.min_priority {
            tracing::debug!(
                category = %event.category,
                priority = %event.priority(),
                "error event below notification threshold, dropped"
            );
            return;
        }
        if let Err(e) = self.service.create_error_notification(event) {
            tracing::warn!(error = %e, "failed to create error notification");
        }
    }
}
