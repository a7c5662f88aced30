//! In-memory server used by the sync tests

use super::api::{PreferencesRemote, PushAck, SyncApiError};
use super::models::SyncRecord;
use super::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

pub(crate) fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_attempts,
    }
}

/// Holds `store` calls until released; `entered` fires when one arrives
pub(crate) struct StoreGate {
    permits: Semaphore,
    pub entered: Notify,
}

impl StoreGate {
    pub fn release(&self, calls: usize) {
        self.permits.add_permits(calls);
    }
}

#[derive(Default)]
pub(crate) struct MockRemote {
    record: Mutex<Option<SyncRecord>>,
    fetch_failures: Mutex<VecDeque<SyncApiError>>,
    store_failures: Mutex<VecDeque<SyncApiError>>,
    pushed: Mutex<Vec<SyncRecord>>,
    fetches: AtomicUsize,
    stores: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    gate: Mutex<Option<Arc<StoreGate>>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: SyncRecord) -> Self {
        let remote = Self::new();
        *remote.record.lock().unwrap() = Some(record);
        remote
    }

    pub fn replace_record(&self, record: SyncRecord) {
        *self.record.lock().unwrap() = Some(record);
    }

    pub fn fail_next_fetch(&self, error: SyncApiError) {
        self.fetch_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_next_store(&self, error: SyncApiError) {
        self.store_failures.lock().unwrap().push_back(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Block every following `store` until the gate is released
    pub fn gate_stores(&self) -> Arc<StoreGate> {
        let gate = Arc::new(StoreGate {
            permits: Semaphore::new(0),
            entered: Notify::new(),
        });
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn current(&self) -> Option<SyncRecord> {
        self.record.lock().unwrap().clone()
    }

    pub fn pushed(&self) -> Vec<SyncRecord> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreferencesRemote for MockRemote {
    async fn fetch(&self) -> Result<Option<SyncRecord>, SyncApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.fetch_failures.lock().unwrap().pop_front();
        match failure {
            Some(e) => Err(e),
            None => Ok(self.current()),
        }
    }

    async fn store(&self, record: &SyncRecord) -> Result<PushAck, SyncApiError> {
        self.stores.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.permits.acquire().await.unwrap().forget();
        }

        let failure = self.store_failures.lock().unwrap().pop_front();
        if let Some(e) = failure {
            return Err(e);
        }

        *self.record.lock().unwrap() = Some(record.clone());
        self.pushed.lock().unwrap().push(record.clone());
        Ok(PushAck {
            success: true,
            timestamp: record.timestamp,
        })
    }
}
