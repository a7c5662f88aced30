//! Offline Queue Module - Durable FIFO of preference mutations
//!
//! Every local mutation is recorded here first and removed only once the
//! server has acknowledged the state that includes it.
//!
//! Features:
//! - Persisted through the Local Store on every change
//! - Replay strictly in enqueue order
//! - Actions that can never validate are dropped instead of blocking the queue
//! - A failed commit keeps every replayed action queued, in order

use super::manager::SyncError;
use super::models::{PreferenceValue, ValidationError};
use crate::store::{LocalStore, OFFLINE_QUEUE_KEY};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

// ============================================================================
// Data Types
// ============================================================================

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Set,
    Reset,
}

/// A mutation waiting for server acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
    pub id: u64,

    #[serde(rename = "type")]
    pub action_type: ActionType,

    /// Changed values for `set`, empty for `reset`
    #[serde(default)]
    pub payload: BTreeMap<String, PreferenceValue>,

    pub enqueued_at: DateTime<Utc>,
}

/// Receiver of replayed actions
///
/// `replay` is called once per action in order, then `commit` once for the
/// whole batch.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    fn replay(&self, action: &OfflineAction) -> Result<(), ValidationError>;

    async fn commit(&self) -> Result<(), SyncError>;
}

/// Result of a drain
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    /// Actions replayed and acknowledged by the server
    pub processed: usize,

    /// Actions dropped because their payload can never validate
    pub rejected: usize,

    /// Queue length after the drain
    pub remaining: usize,

    /// Terminal commit failure, if any
    pub error: Option<SyncError>,
}

impl DrainReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending_count: usize,
    pub set_count: usize,
    pub reset_count: usize,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueState {
    next_id: u64,
    actions: Vec<OfflineAction>,
}

// ============================================================================
// Offline Queue
// ============================================================================

pub struct OfflineQueue {
    store: LocalStore,
    state: Mutex<QueueState>,
}

impl OfflineQueue {
    /// Open the queue, restoring actions left by a previous run
    pub fn new(store: LocalStore) -> Self {
        let mut state: QueueState = store.get(OFFLINE_QUEUE_KEY).unwrap_or_default();

        // Ids must stay unique even if the counter was lost
        let max_id = state.actions.iter().map(|a| a.id).max().unwrap_or(0);
        state.next_id = state.next_id.max(max_id + 1);

        if !state.actions.is_empty() {
            log::info!("Restored {} queued preference action(s)", state.actions.len());
        }

        Self {
            store,
            state: Mutex::new(state),
        }
    }

    /// Append a `set` action stamped with the mutation time `at`
    pub fn enqueue_set(
        &self,
        payload: BTreeMap<String, PreferenceValue>,
        at: DateTime<Utc>,
    ) -> OfflineAction {
        self.enqueue(ActionType::Set, payload, at)
    }

    /// Append a `reset` action stamped with the mutation time `at`
    pub fn enqueue_reset(&self, at: DateTime<Utc>) -> OfflineAction {
        self.enqueue(ActionType::Reset, BTreeMap::new(), at)
    }

    fn enqueue(
        &self,
        action_type: ActionType,
        payload: BTreeMap<String, PreferenceValue>,
        enqueued_at: DateTime<Utc>,
    ) -> OfflineAction {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let action = OfflineAction {
            id: state.next_id,
            action_type,
            payload,
            enqueued_at,
        };
        state.next_id += 1;
        state.actions.push(action.clone());
        self.persist(&state);

        log::debug!("Queued {:?} action {} ({} pending)", action_type, action.id, state.actions.len());
        action
    }

    /// Replay queued actions into `target` and commit them as one batch
    pub async fn drain<T: ReplayTarget + ?Sized>(&self, target: &T) -> DrainReport {
        let snapshot = self.pending();

        let mut replayed = HashSet::new();
        let mut rejected = HashSet::new();
        for action in &snapshot {
            match target.replay(action) {
                Ok(()) => {
                    replayed.insert(action.id);
                }
                Err(e) => {
                    log::warn!("Dropping queued action {} that can never apply: {}", action.id, e);
                    rejected.insert(action.id);
                }
            }
        }

        let result = target.commit().await;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.actions.len();
        state.actions.retain(|a| {
            !rejected.contains(&a.id) && !(result.is_ok() && replayed.contains(&a.id))
        });
        if state.actions.len() != before {
            self.persist(&state);
        }

        let remaining = state.actions.len();
        match result {
            Ok(()) => {
                if !replayed.is_empty() {
                    log::info!("Drained {} queued action(s), {} remaining", replayed.len(), remaining);
                }
                DrainReport {
                    processed: replayed.len(),
                    rejected: rejected.len(),
                    remaining,
                    error: None,
                }
            }
            Err(e) => {
                log::warn!("Queue drain failed, {} action(s) kept: {}", remaining, e);
                DrainReport {
                    processed: 0,
                    rejected: rejected.len(),
                    remaining,
                    error: Some(e),
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queued actions in replay order
    pub fn pending(&self) -> Vec<OfflineAction> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).actions.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let count = |t: ActionType| state.actions.iter().filter(|a| a.action_type == t).count();

        QueueStats {
            pending_count: state.actions.len(),
            set_count: count(ActionType::Set),
            reset_count: count(ActionType::Reset),
            oldest_enqueued_at: state.actions.first().map(|a| a.enqueued_at),
        }
    }

    /// Drop every queued action
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let cleared = state.actions.len();
        state.actions.clear();
        self.persist(&state);

        if cleared > 0 {
            log::info!("Cleared {} queued action(s)", cleared);
        }
        cleared
    }

    fn persist(&self, state: &QueueState) {
        if !self.store.set(OFFLINE_QUEUE_KEY, state) {
            log::warn!("Offline queue kept in memory only ({} action(s))", state.actions.len());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
