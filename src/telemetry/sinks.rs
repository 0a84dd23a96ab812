use super::events::DispatchEvent;
use std::sync::{Arc, Mutex};

/// Receives dispatch events. Implementations must be non-blocking; the
/// dispatcher calls `emit` inline on its hot path.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &DispatchEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &DispatchEvent) {}
}

/// Logs events through `tracing`, mapping severity to the event kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Filtered { .. }
            | DispatchEvent::RateLimited { .. }
            | DispatchEvent::Skipped { .. }
            | DispatchEvent::Attempt { .. } => {
                tracing::debug!(provider = event.provider(), "{event}");
            }
            DispatchEvent::Dropped { .. } => {
                tracing::warn!(provider = event.provider(), "{event}");
            }
            DispatchEvent::Delivered { .. } => {
                tracing::debug!(provider = event.provider(), "{event}");
            }
            DispatchEvent::Failed { .. } => {
                tracing::error!(provider = event.provider(), "{event}");
            }
        }
    }
}

/// Captures events in memory; used by tests to assert on dispatcher
/// behavior.
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    events: Arc<Mutex<Vec<DispatchEvent>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }
}

impl TelemetrySink for BufferSink {
    fn emit(&self, event: &DispatchEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
