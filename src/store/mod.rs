//! Local Store - durable key-value persistence
//!
//! Thin typed layer over a `KeyValueBackend`. The public surface never
//! returns errors: missing or corrupt entries read as `None`, failed writes
//! are logged and reported as `false`. Callers must not assume a write
//! landed; everything here is re-derived from the server on the next sync.
//!
//! Backends:
//! - `Database` (SQLite `kv_store` table behind an r2d2 pool)
//! - `MemoryBackend` (process memory, optional byte quota)

use crate::db::{Database, DbError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// ============================================================================
// Well-known keys
// ============================================================================

pub const PREFERENCES_KEY: &str = "preferences";
pub const PREFERENCES_BASE_KEY: &str = "preferences_base";
pub const OFFLINE_QUEUE_KEY: &str = "offline_queue";
pub const DEVICE_KEY: &str = "device_id";

// ============================================================================
// Backend trait
// ============================================================================

/// Raw string storage used by `LocalStore`
pub trait KeyValueBackend: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

impl KeyValueBackend for Database {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_value(key)?)
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Ok(self.set_value(key, value)?)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.remove_value(key)?)
    }
}

/// In-memory backend
///
/// With a quota set, a write that would push the total size (keys plus
/// values, in bytes) past the limit fails with `QuotaExceeded`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }
}

impl KeyValueBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(StoreError::QuotaExceeded);
            }
        }

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(key).is_some())
    }
}

// ============================================================================
// Local Store
// ============================================================================

/// Typed, non-failing key-value store shared by the queue and the manager
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl LocalStore {
    pub fn new(backend: impl KeyValueBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Store backed by process memory
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Read and decode `key`. Missing, unreadable and corrupt entries are `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.read(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Local store read of '{}' failed: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Discarding corrupt local store entry '{}': {}", key, e);
                None
            }
        }
    }

    /// Encode and persist `value` under `key`. Returns `false` on failure.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to encode local store entry '{}': {}", key, e);
                return false;
            }
        };

        match self.backend.write(key, &json) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Local store write of '{}' failed: {}", key, e);
                false
            }
        }
    }

    /// Remove `key`. Returns `true` only if an entry was deleted.
    pub fn remove(&self, key: &str) -> bool {
        match self.backend.delete(key) {
            Ok(existed) => existed,
            Err(e) => {
                log::warn!("Local store delete of '{}' failed: {}", key, e);
                false
            }
        }
    }
}

impl From<Database> for LocalStore {
    fn from(db: Database) -> Self {
        Self::new(db)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Database error: {0}")]
    Database(DbError),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::QuotaExceeded => StoreError::QuotaExceeded,
            other => StoreError::Database(other),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
