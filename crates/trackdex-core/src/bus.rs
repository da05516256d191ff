//! Minimal event-bus collaborator.
//!
//! The engine only needs three capabilities from the surrounding system's
//! pub-sub: register a listener, unregister it, and publish an event. The
//! background rebuild registers a transient mutation tracker here; edit
//! handlers publish [`RecordEvent`]s as they write to the store.
//!
//! Registration hands back a [`Subscription`]: dropping it unregisters the
//! listener, so no exit path of the rebuild can leak one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::record::RecordId;

/// A change to a record, as announced by whoever performed it.
///
/// Everything except `Deleted` counts as an update for index purposes; the
/// variants exist so publishers can say what actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordEvent {
    /// Field-level edit.
    Updated { id: RecordId },
    /// Comment added/edited/removed.
    CommentChanged { id: RecordId },
    /// Worklog entry changed.
    WorklogChanged { id: RecordId },
    /// Workflow state transition.
    Transitioned { id: RecordId },
    /// Record removed from the store.
    Deleted { id: RecordId },
}

impl RecordEvent {
    /// The record the event concerns.
    pub fn record_id(&self) -> RecordId {
        match self {
            Self::Updated { id }
            | Self::CommentChanged { id }
            | Self::WorklogChanged { id }
            | Self::Transitioned { id }
            | Self::Deleted { id } => *id,
        }
    }

    /// Whether this event means the record is gone.
    pub fn is_deletion(&self) -> bool {
        matches!(self, Self::Deleted { .. })
    }
}

/// Receives published [`RecordEvent`]s. Implementations must tolerate being
/// called from any thread.
pub trait RecordEventListener: Send + Sync {
    fn on_event(&self, event: &RecordEvent);
}

/// Register/unregister/publish, nothing more.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(u64, Arc<dyn RecordEventListener>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn register(self: &Arc<Self>, listener: Arc<dyn RecordEventListener>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        Subscription {
            bus: Arc::clone(self),
            id,
        }
    }

    /// Deliver an event to every registered listener, in registration order.
    pub fn publish(&self, event: &RecordEvent) {
        let listeners = self.listeners.read();
        for (_, listener) in listeners.iter() {
            listener.on_event(event);
        }
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn unregister(&self, id: u64) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }
}

/// RAII handle for a registered listener.
pub struct Subscription {
    bus: Arc<EventBus>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(self.id);
    }
}
