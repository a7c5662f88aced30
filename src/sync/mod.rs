//! Sync Module - Cross-Device Preference Synchronization
//!
//! Keeps the user's visualizer preferences consistent across devices:
//! - Preference data model and validation rules
//! - REST transport (`GET`/`PUT /api/user/preferences`)
//! - Conflict resolution (merge-then-LWW per field)
//! - Retry with exponential backoff and request timeouts
//! - Durable offline queue replayed on reconnect
//!
//! Architecture:
//! - Local edits are authoritative until a newer remote record wins
//! - At most one push in flight per client
//! - Conflicts are resolved deterministically, never surfaced as errors

pub mod api;
pub mod conflict;
pub mod manager;
pub mod models;
pub mod network;
pub mod queue;
pub mod retry;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use api::{PreferencesRemote, PushAck, SyncApiClient, SyncApiError, API_BASE_URL};
pub use conflict::{resolve_conflict, ConflictInfo, ConflictResolver, Resolution, Side};
pub use manager::{SyncError, SyncManager, SyncOutcome};
pub use models::{
    keys, known_keys, validate_entry, DeviceIdentity, Platform, PreferenceSet, PreferenceValue,
    SyncRecord, ValidationError,
};
pub use network::{NetworkMonitor, NetworkStatus};
pub use queue::{ActionType, DrainReport, OfflineAction, OfflineQueue, QueueStats, ReplayTarget};
pub use retry::RetryPolicy;
pub use state::{KeySyncState, PushTicket, SyncTracker};
