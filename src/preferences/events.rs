//! Change events and listener registry
//!
//! A panicking listener is caught and logged; the remaining listeners still
//! receive the event.

use crate::sync::{ConflictInfo, PreferenceValue, SyncError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Where a change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreferenceEvent {
    Changed {
        key: String,
        old: Option<PreferenceValue>,
        new: PreferenceValue,
        origin: ChangeOrigin,
    },
    Reset,
    /// A cycle began; `keys` are the local edits it carries
    SyncStarted {
        keys: Vec<String>,
    },
    SyncCompleted {
        pushed: bool,
        conflict: Option<ConflictInfo>,
    },
    SyncFailed {
        error: SyncError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type Listener = Arc<dyn Fn(&PreferenceEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventBus {
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &PreferenceEvent) {
        // Listeners may (un)subscribe from inside the callback
        let snapshot: Vec<(SubscriptionId, Listener)> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (id, listener) in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::error!("Preference listener {:?} panicked on {:?}", id, event);
            }
        }
    }

    pub fn emit_all(&self, events: &[PreferenceEvent]) {
        for event in events {
            self.emit(event);
        }
    }
}
