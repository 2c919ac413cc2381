use super::types::{EventKind, EventPayload, EventSequence, UploadEvent};
use crate::logging::log_error;
use chrono::Utc;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<UploadEvent>;
pub type EventSender = broadcast::Sender<UploadEvent>;

type Listener = Arc<dyn Fn(&UploadEvent) + Send + Sync + 'static>;

/// Handle returned by `on`/`on_any`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    kind: Option<EventKind>,
    listener: Listener,
}

/// Event bus for lifecycle and progress events.
///
/// Listeners registered with `on` run synchronously on the emitting task;
/// async consumers can `subscribe` to the broadcast channel instead.
#[derive(Clone)]
pub struct EventBus {
    sender: EventSender,
    sequence: Arc<AtomicU64>,
    next_subscription: Arc<AtomicU64>,
    listeners: Arc<RwLock<Vec<Registration>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sequence", &self.sequence)
            .field("listeners", &self.listener_count())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(1)),
            next_subscription: Arc::new(AtomicU64::new(1)),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a listener for one event kind
    pub fn on<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(listener))
    }

    /// Register a listener for every event
    pub fn on_any<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Registration { id, kind, listener });
        }
        id
    }

    /// Unregister a listener. Returns false if the handle was unknown.
    pub fn off(&self, id: SubscriptionId) -> bool {
        match self.listeners.write() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|registration| registration.id != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    /// Publish an event (returns sequence number)
    pub fn emit(&self, payload: EventPayload) -> EventSequence {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = UploadEvent {
            sequence,
            timestamp: Utc::now(),
            payload,
        };
        let kind = event.kind();

        // Snapshot so listeners may call on/off without deadlocking
        let matching: Vec<Listener> = match self.listeners.read() {
            Ok(listeners) => listeners
                .iter()
                .filter(|registration| registration.kind.is_none_or(|k| k == kind))
                .map(|registration| Arc::clone(&registration.listener))
                .collect(),
            Err(_) => Vec::new(),
        };

        for listener in matching {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log_error("events", &format!("Listener for {} panicked: {}", kind, reason));
            }
        }

        // No receivers is not an error
        let _ = self.sender.send(event);
        sequence
    }

    /// Subscribe to all events as an async stream
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
}
