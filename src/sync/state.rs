//! Per-key sync state machine
//!
//! `Unsynced -> Syncing -> Synced -> Unsynced`
//!
//! Every edit bumps the key's revision. A push ticket remembers the revision
//! it carried, so an edit made while the push is in flight sends the key back
//! to `Unsynced` and the older acknowledgment cannot mark it `Synced`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySyncState {
    /// Changed locally, not yet sent
    Unsynced,
    /// Included in the push currently in flight
    Syncing,
    /// Server holds the current value
    Synced,
}

#[derive(Debug, Clone, Copy)]
struct KeyEntry {
    state: KeySyncState,
    revision: u64,
}

/// Keys (and their revisions) carried by one push
#[derive(Debug, Clone, Default)]
pub struct PushTicket {
    keys: Vec<(String, u64)>,
}

impl PushTicket {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(key, _)| key.as_str())
    }
}

#[derive(Debug, Default)]
pub struct SyncTracker {
    entries: HashMap<String, KeyEntry>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys never edited locally count as synced
    pub fn state(&self, key: &str) -> KeySyncState {
        self.entries
            .get(key)
            .map(|e| e.state)
            .unwrap_or(KeySyncState::Synced)
    }

    pub fn is_unsynced(&self, key: &str) -> bool {
        self.state(key) == KeySyncState::Unsynced
    }

    /// Record a local edit
    pub fn mark_unsynced<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            let entry = self.entries.entry(key.into()).or_insert(KeyEntry {
                state: KeySyncState::Synced,
                revision: 0,
            });
            entry.state = KeySyncState::Unsynced;
            entry.revision += 1;
        }
    }

    /// Move every unsynced key into `Syncing`
    pub fn begin(&mut self) -> PushTicket {
        let mut keys = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            if entry.state == KeySyncState::Unsynced {
                entry.state = KeySyncState::Syncing;
                keys.push((key.clone(), entry.revision));
            }
        }
        keys.sort();
        PushTicket { keys }
    }

    /// Server acknowledged the push. Keys edited since `begin` stay unsynced.
    pub fn acknowledge(&mut self, ticket: &PushTicket) {
        for (key, revision) in &ticket.keys {
            if let Some(entry) = self.entries.get_mut(key) {
                if entry.revision == *revision && entry.state == KeySyncState::Syncing {
                    entry.state = KeySyncState::Synced;
                }
            }
        }
    }

    /// Push failed; carried keys go back to `Unsynced`
    pub fn fail(&mut self, ticket: &PushTicket) {
        for (key, revision) in &ticket.keys {
            if let Some(entry) = self.entries.get_mut(key) {
                if entry.revision == *revision && entry.state == KeySyncState::Syncing {
                    entry.state = KeySyncState::Unsynced;
                }
            }
        }
    }
}
