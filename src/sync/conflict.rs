//! Conflict Resolution - merge-then-LWW for preference sets
//!
//! Both devices may edit preferences between syncs. Resolution starts from
//! the older record and overlays only the fields the newer record changed
//! since the last common base:
//! - records differing only in timestamp resolve to the newer one
//! - disjoint edits are unioned
//! - a field edited on both sides takes the newer value
//! - a field missing from the newer record is never dropped
//!
//! Resolution is deterministic and needs no user input. A `ConflictResolver`
//! hook can override the outcome when both sides edited the same field.

use super::models::{PreferenceSet, SyncRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which side's timestamp won
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    Remote,
}

/// Conflict diagnostics, logged and handed to the optional resolver hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub local_device: String,
    pub remote_device: String,
    pub local_updated_at: DateTime<Utc>,
    pub remote_updated_at: DateTime<Utc>,

    /// Fields changed locally since the base
    pub local_changes: Vec<String>,

    /// Fields changed remotely since the base
    pub remote_changes: Vec<String>,

    /// Fields changed on both sides (resolved by timestamp)
    pub overlapping: Vec<String>,

    pub winner: Side,
}

impl ConflictInfo {
    pub fn has_overlap(&self) -> bool {
        !self.overlapping.is_empty()
    }
}

/// Outcome of a resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub preferences: PreferenceSet,
    pub conflict: Option<ConflictInfo>,
}

/// Optional interactive resolution hook
///
/// Consulted only when both sides changed at least one common field.
/// Returning `None` keeps the default merge.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        conflict: &ConflictInfo,
        local: &PreferenceSet,
        remote: &PreferenceSet,
    ) -> Option<PreferenceSet>;
}

/// Resolve `local` against `remote`, using `base` (the last set both sides
/// agreed on) to tell which fields each side actually changed.
///
/// Without a base every differing field counts as changed on both sides,
/// which degrades to whole-record last-writer-wins. On equal timestamps the
/// remote record is treated as newer so every device converges on the
/// server's copy.
pub fn resolve_conflict(
    base: Option<&PreferenceSet>,
    local: &SyncRecord,
    remote: &SyncRecord,
) -> Resolution {
    let local_prefs = &local.preferences;
    let remote_prefs = &remote.preferences;

    let winner = if remote_prefs.last_modified() >= local_prefs.last_modified() {
        Side::Remote
    } else {
        Side::Local
    };
    let (older, newer) = match winner {
        Side::Remote => (local_prefs, remote_prefs),
        Side::Local => (remote_prefs, local_prefs),
    };

    let reference = base.unwrap_or(older);
    let newer_changes: BTreeSet<String> = reference
        .changed_keys(newer)
        .into_iter()
        .filter(|key| newer.get(key).is_some())
        .collect();

    let mut merged = older.clone();
    for key in &newer_changes {
        if let Some(value) = newer.get(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    // The older record may be partial; keys only the newer side holds carry over
    for (key, value) in newer.values() {
        if merged.get(key).is_none() {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged.set_last_modified(local_prefs.last_modified().max(remote_prefs.last_modified()));

    let conflict = describe_conflict(base, local, remote, winner);
    if let Some(info) = &conflict {
        log::info!(
            "Preference conflict between {} and {}: local {:?}, remote {:?}, overlapping {:?}, {:?} wins",
            info.local_device,
            info.remote_device,
            info.local_changes,
            info.remote_changes,
            info.overlapping,
            info.winner
        );
    }

    Resolution {
        preferences: merged,
        conflict,
    }
}

fn describe_conflict(
    base: Option<&PreferenceSet>,
    local: &SyncRecord,
    remote: &SyncRecord,
    winner: Side,
) -> Option<ConflictInfo> {
    if local.preferences.same_values(&remote.preferences) {
        return None;
    }

    let (local_changes, remote_changes) = match base {
        Some(base) => (
            base.changed_keys(&local.preferences),
            base.changed_keys(&remote.preferences),
        ),
        None => {
            let differing = local.preferences.changed_keys(&remote.preferences);
            (differing.clone(), differing)
        }
    };

    // One-sided edits are a plain fast-forward, not a conflict
    if local_changes.is_empty() || remote_changes.is_empty() {
        return None;
    }

    let overlapping = local_changes
        .intersection(&remote_changes)
        .filter(|key| local.preferences.get(key) != remote.preferences.get(key))
        .cloned()
        .collect();

    Some(ConflictInfo {
        local_device: local.device_id.clone(),
        remote_device: remote.device_id.clone(),
        local_updated_at: local.preferences.last_modified(),
        remote_updated_at: remote.preferences.last_modified(),
        local_changes: local_changes.into_iter().collect(),
        remote_changes: remote_changes.into_iter().collect(),
        overlapping,
        winner,
    })
}

// ============================================================================
// Tests
// ============================================================================
