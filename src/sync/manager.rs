//! Sync Manager - Reconciles local and server preference records
//!
//! Coordinates between the remote endpoint and the conflict resolver.
//! Handles:
//! - Push (validated, retried, time-bounded)
//! - Pull (404 = no server record yet)
//! - Conflict resolution (merge-then-LWW, optional resolver hook)
//! - Full reconciliation: pull, resolve, push only what the server lacks
//!
//! The manager never touches UI state. It returns resolved records and the
//! preferences façade decides how to apply them.

use super::api::{PreferencesRemote, PushAck, SyncApiError};
use super::conflict::{self, ConflictInfo, ConflictResolver, Resolution};
use super::models::{PreferenceSet, SyncRecord, ValidationError};
use super::retry::RetryPolicy;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Sync manager - talks to the server on behalf of the preferences façade
#[derive(Clone)]
pub struct SyncManager {
    remote: Arc<dyn PreferencesRemote>,
    retry: RetryPolicy,
    request_timeout: Duration,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl SyncManager {
    /// Create new sync manager with the default retry policy and timeout
    pub fn new(remote: Arc<dyn PreferencesRemote>) -> Self {
        Self {
            remote,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            resolver: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Install an interactive resolution hook for overlapping edits
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    // ========================================================================
    // Remote Operations
    // ========================================================================

    /// Send `record` to the server
    ///
    /// Malformed payloads fail with `Validation` before any network call.
    pub async fn push(&self, record: &SyncRecord) -> Result<PushAck, SyncError> {
        record.preferences.validate()?;

        log::debug!("Pushing preferences (lastModified {})", record.timestamp);
        let ack = self
            .retry
            .run("preferences push", || self.bounded(self.remote.store(record)))
            .await?;

        log::info!("Preferences pushed, server timestamp {}", ack.timestamp);
        Ok(ack)
    }

    /// Fetch the server's current record
    pub async fn pull(&self) -> Result<Option<SyncRecord>, SyncError> {
        let record = self
            .retry
            .run("preferences pull", || self.bounded(self.remote.fetch()))
            .await?;

        match &record {
            Some(r) => log::debug!(
                "Pulled preferences from {} (lastModified {})",
                r.device_id,
                r.preferences.last_modified()
            ),
            None => log::info!("Server has no preferences yet"),
        }
        Ok(record)
    }

    /// Apply the request timeout; elapsed calls become network errors
    async fn bounded<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncApiError>>,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::from(SyncApiError::Timeout)),
        }
    }

    // ========================================================================
    // Conflict Resolution
    // ========================================================================

    /// Resolve `local` against `remote` relative to the last synced `base`
    pub fn resolve_conflict(
        &self,
        base: Option<&PreferenceSet>,
        local: &SyncRecord,
        remote: &SyncRecord,
    ) -> Resolution {
        let resolution = conflict::resolve_conflict(base, local, remote);

        let (Some(resolver), Some(info)) = (&self.resolver, &resolution.conflict) else {
            return resolution;
        };
        if !info.has_overlap() {
            return resolution;
        }

        match resolver.resolve(info, &local.preferences, &remote.preferences) {
            Some(mut chosen) => match chosen.validate() {
                Ok(()) => {
                    log::info!("Conflict on {:?} settled by resolver hook", info.overlapping);
                    chosen.set_last_modified(resolution.preferences.last_modified());
                    Resolution {
                        preferences: chosen,
                        conflict: resolution.conflict,
                    }
                }
                Err(e) => {
                    log::warn!("Ignoring invalid resolver choice: {}", e);
                    resolution
                }
            },
            None => resolution,
        }
    }

    /// Pull, resolve, and push whatever the server is missing
    ///
    /// Nothing is pushed when the resolved values already match the server,
    /// so repeating a sync with unchanged data has no effect server-side.
    pub async fn synchronize(
        &self,
        local: &SyncRecord,
        base: Option<&PreferenceSet>,
    ) -> Result<SyncOutcome, SyncError> {
        let remote = self.pull().await?;

        let (resolved, conflict) = match remote {
            None => (local.preferences.clone(), None),
            Some(remote) => {
                let resolution = self.resolve_conflict(base, local, &remote);
                if resolution.preferences.same_values(&remote.preferences) {
                    log::debug!("Server already has the resolved preferences, skipping push");
                    return Ok(SyncOutcome {
                        preferences: resolution.preferences,
                        pushed: false,
                        conflict: resolution.conflict,
                    });
                }
                (resolution.preferences, resolution.conflict)
            }
        };

        let record = SyncRecord::new(resolved, local.device_id.clone());
        self.push(&record).await?;

        Ok(SyncOutcome {
            preferences: record.preferences,
            pushed: true,
            conflict,
        })
    }
}

/// Result of a reconciliation
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Preferences now held by the server
    pub preferences: PreferenceSet,

    pub pushed: bool,

    pub conflict: Option<ConflictInfo>,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Client is offline")]
    Offline,

    #[error("Unexpected response: {0}")]
    Unexpected(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },
}

impl SyncError {
    /// Network and server failures are worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Server(_))
    }
}

impl From<SyncApiError> for SyncError {
    fn from(e: SyncApiError) -> Self {
        match e {
            SyncApiError::Network(msg) => SyncError::Network(msg),
            SyncApiError::Timeout => SyncError::Network("request timed out".to_string()),
            SyncApiError::Server { status, message } => {
                SyncError::Server(format!("{}: {}", status, message))
            }
            SyncApiError::RateLimited => SyncError::Server("rate limit exceeded".to_string()),
            SyncApiError::InvalidResponse => {
                SyncError::Server("invalid response from server".to_string())
            }
            SyncApiError::Validation(msg) => SyncError::Validation(msg),
            SyncApiError::Unauthorized => SyncError::Unauthorized,
            SyncApiError::UnexpectedStatus { status, message } => {
                SyncError::Unexpected(format!("{}: {}", status, message))
            }
            SyncApiError::InvalidUrl(msg) => SyncError::Unexpected(msg),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(e: ValidationError) -> Self {
        SyncError::Validation(e.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
