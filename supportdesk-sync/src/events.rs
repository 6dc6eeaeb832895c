use crate::types::{SyncReport, SyncStatus};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SyncStarted,
    SyncCompleted { report: SyncReport },
    /// The pass stopped on an error other than a rejected push; `report`
    /// covers the work done before it.
    SyncFailed { error: String, report: SyncReport },
    StatusChanged { status: SyncStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Fan-out of sync lifecycle events.
///
/// Callback handlers run synchronously in registration order; a handler that
/// panics is logged and skipped, the others still run. Async consumers can
/// take a broadcast receiver instead.
pub struct EventBus {
    handlers: Mutex<Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            channel,
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.channel.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        // snapshot so handlers may (un)subscribe without deadlocking
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!("[SYNC] event handler panicked on {:?}", event_name(&event));
            }
        }
        let _ = self.channel.send(event);
    }
}

fn event_name(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::SyncStarted => "SyncStarted",
        SyncEvent::SyncCompleted { .. } => "SyncCompleted",
        SyncEvent::SyncFailed { .. } => "SyncFailed",
        SyncEvent::StatusChanged { .. } => "StatusChanged",
    }
}
