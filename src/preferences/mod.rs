//! Preferences Manager - user-facing façade over the sync engine
//!
//! Owns the in-memory Preference Set and is the only writer of the saved
//! preferences and the last synced base. Responsibilities:
//! - Synchronous reads and validated writes
//! - Recording every mutation in the offline queue
//! - Coalescing sync requests so at most one cycle is in flight
//! - Per-key sync state (`Unsynced` / `Syncing` / `Synced`)
//! - Change notifications and UI control projection
//! - Background watcher: drain on reconnect, optional server polling

mod controls;
mod events;

pub use controls::ControlSurface;
pub use events::{ChangeOrigin, Listener, PreferenceEvent, SubscriptionId};

use crate::notify::{LogNotifier, Notifier, SyncNotice};
use crate::store::{LocalStore, PREFERENCES_BASE_KEY, PREFERENCES_KEY};
use crate::sync::{
    known_keys, validate_entry, ActionType, DeviceIdentity, DrainReport, KeySyncState,
    NetworkMonitor, NetworkStatus, OfflineAction, OfflineQueue, PreferenceSet, PreferenceValue,
    PushTicket, QueueStats, ReplayTarget, SyncError, SyncManager, SyncRecord, SyncTracker,
    ValidationError,
};
use async_trait::async_trait;
use events::EventBus;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PreferencesOptions {
    /// Start a sync cycle after every local edit while online
    pub auto_sync: bool,

    /// Pull from the server periodically while the watcher runs
    pub poll_interval: Option<Duration>,
}

impl Default for PreferencesOptions {
    fn default() -> Self {
        Self {
            auto_sync: true,
            poll_interval: None,
        }
    }
}

// ============================================================================
// Preferences Manager
// ============================================================================

/// Cheap to clone; all clones share one state
#[derive(Clone)]
pub struct PreferencesManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: LocalStore,
    queue: OfflineQueue,
    sync: SyncManager,
    network: NetworkMonitor,
    device: DeviceIdentity,
    options: PreferencesOptions,
    notifier: RwLock<Arc<dyn Notifier>>,
    events: EventBus,
    cache: Mutex<Cache>,
    push: Mutex<PushState>,
    idle: watch::Sender<bool>,
    last_report: Mutex<Option<DrainReport>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct Cache {
    prefs: PreferenceSet,
    /// Last set acknowledged by the server
    base: Option<PreferenceSet>,
    tracker: SyncTracker,
}

#[derive(Default)]
struct PushState {
    in_flight: bool,
    /// A cycle was requested while one was running
    pending: bool,
}

impl PreferencesManager {
    /// Load saved preferences and restore sync state left by a previous run
    pub fn new(
        store: LocalStore,
        queue: OfflineQueue,
        sync: SyncManager,
        network: NetworkMonitor,
        device: DeviceIdentity,
        options: PreferencesOptions,
    ) -> Self {
        let prefs = load_preferences(&store);
        let base = store.get::<PreferenceSet>(PREFERENCES_BASE_KEY);

        let mut tracker = SyncTracker::new();
        for action in queue.pending() {
            match action.action_type {
                ActionType::Set => tracker.mark_unsynced(action.payload.keys().cloned()),
                ActionType::Reset => tracker.mark_unsynced(known_keys()),
            }
        }

        log::info!(
            "Preferences loaded for device {} ({} queued action(s), auto sync {})",
            device.device_id,
            queue.len(),
            if options.auto_sync { "on" } else { "off" }
        );

        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                store,
                queue,
                sync,
                network,
                device,
                options,
                notifier: RwLock::new(Arc::new(LogNotifier)),
                events: EventBus::default(),
                cache: Mutex::new(Cache {
                    prefs,
                    base,
                    tracker,
                }),
                push: Mutex::new(PushState::default()),
                idle,
                last_report: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Replace the notifier used for terminal sync failures
    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.inner.notifier.write().unwrap_or_else(|e| e.into_inner()) = notifier;
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, key: &str) -> Option<PreferenceValue> {
        self.inner.lock_cache().prefs.get(key).cloned()
    }

    pub fn get_all(&self) -> PreferenceSet {
        self.inner.lock_cache().prefs.clone()
    }

    pub fn key_state(&self, key: &str) -> KeySyncState {
        self.inner.lock_cache().tracker.state(key)
    }

    pub fn pending_actions(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.inner.device
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Set one preference. Returns `false` when the value was already set.
    pub fn set(&self, key: &str, value: impl Into<PreferenceValue>) -> Result<bool, ValidationError> {
        let changed = self.set_many(BTreeMap::from([(key.to_string(), value.into())]))?;
        Ok(changed > 0)
    }

    /// Set several preferences at once
    ///
    /// Either every value is valid and applied, or nothing changes. Returns
    /// the number of keys whose value actually changed.
    pub fn set_many(&self, values: BTreeMap<String, PreferenceValue>) -> Result<usize, ValidationError> {
        for (key, value) in &values {
            validate_entry(key, value)?;
        }

        let events = {
            let mut cache = self.inner.lock_cache();
            let changed: BTreeMap<String, PreferenceValue> = values
                .into_iter()
                .filter(|(key, value)| cache.prefs.get(key) != Some(value))
                .collect();
            if changed.is_empty() {
                return Ok(0);
            }

            let mut events = Vec::with_capacity(changed.len());
            for (key, value) in &changed {
                let old = cache.prefs.insert(key.clone(), value.clone());
                events.push(PreferenceEvent::Changed {
                    key: key.clone(),
                    old,
                    new: value.clone(),
                    origin: ChangeOrigin::Local,
                });
            }

            let at = cache.prefs.touch();
            cache.tracker.mark_unsynced(changed.keys().cloned());
            self.inner.persist_preferences(&cache.prefs);
            self.inner.queue.enqueue_set(changed, at);
            events
        };

        let count = events.len();
        self.inner.events.emit_all(&events);
        self.request_sync();
        Ok(count)
    }

    /// Restore every known preference to its default. Returns the number of keys changed.
    pub fn reset_to_defaults(&self) -> usize {
        let events = {
            let mut cache = self.inner.lock_cache();
            let defaults = PreferenceSet::defaults();

            let mut events = vec![PreferenceEvent::Reset];
            let mut changed = Vec::new();
            for key in known_keys() {
                let Some(default) = defaults.get(key) else { continue };
                if cache.prefs.get(key) == Some(default) {
                    continue;
                }
                let old = cache.prefs.insert(key, default.clone());
                changed.push(key);
                events.push(PreferenceEvent::Changed {
                    key: key.to_string(),
                    old,
                    new: default.clone(),
                    origin: ChangeOrigin::Local,
                });
            }
            if changed.is_empty() {
                return 0;
            }

            let at = cache.prefs.touch();
            cache.tracker.mark_unsynced(changed);
            self.inner.persist_preferences(&cache.prefs);
            self.inner.queue.enqueue_reset(at);
            events
        };

        log::info!("Preferences reset to defaults");
        let count = events.len() - 1;
        self.inner.events.emit_all(&events);
        self.request_sync();
        count
    }

    // ========================================================================
    // UI Controls
    // ========================================================================

    /// Push current values into `surface`. Returns the number of controls updated.
    pub fn apply_to_controls(&self, surface: &mut dyn ControlSurface) -> usize {
        let prefs = self.get_all();
        known_keys()
            .filter_map(|key| prefs.get(key).map(|value| (key, value)))
            .filter(|(key, value)| surface.apply(key, value))
            .count()
    }

    /// Read every known control from `surface` and store the values
    pub fn capture_from_controls(&self, surface: &dyn ControlSurface) -> Result<usize, ValidationError> {
        let values = known_keys()
            .filter_map(|key| surface.read(key).map(|value| (key.to_string(), value)))
            .collect();
        self.set_many(values)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&PreferenceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    // ========================================================================
    // Sync Cycles
    // ========================================================================

    /// Run a sync cycle now and report its outcome
    ///
    /// If a cycle is already running, one follow-up cycle is requested and
    /// its outcome returned.
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        if !self.inner.network.is_online() {
            return Err(SyncError::Offline);
        }

        let report = if self.inner.try_begin_cycle() {
            self.run_cycles().await
        } else {
            self.wait_until_idle().await;
            self.inner
                .last_report()
                .ok_or_else(|| SyncError::Unexpected("sync finished without a report".to_string()))?
        };

        match report.error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Wait until no sync cycle is running or requested
    pub async fn wait_until_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    fn request_sync(&self) {
        if !self.inner.options.auto_sync {
            return;
        }
        if !self.inner.network.is_online() {
            log::debug!("Offline, change kept in queue");
            return;
        }
        self.spawn_cycle();
    }

    fn spawn_cycle(&self) {
        if !self.inner.try_begin_cycle() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move {
                    this.run_cycles().await;
                });
            }
            Err(_) => {
                log::warn!("No async runtime available, sync deferred until the next trigger");
                self.inner.end_cycle(None);
            }
        }
    }

    /// Drain the queue until no further cycle has been requested
    async fn run_cycles(&self) -> DrainReport {
        loop {
            let report = self.inner.queue.drain(self.inner.as_ref()).await;
            self.inner.report_failure(&report);

            if !self.inner.end_cycle(Some(&report)) {
                return report;
            }
            log::debug!("Running coalesced follow-up sync");
        }
    }

    // ========================================================================
    // Background Watcher
    // ========================================================================

    /// Start the background watcher
    ///
    /// Drains the queue whenever connectivity is restored and, if configured,
    /// polls the server. Also runs one cycle right away to recover actions
    /// left by an unclean shutdown.
    pub fn start(&self) -> bool {
        let mut watcher = self.inner.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watcher.as_ref().is_some_and(|h| !h.is_finished()) {
            log::warn!("Preference sync watcher already running");
            return false;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::error!("Cannot start preference sync watcher outside an async runtime");
                return false;
            }
        };

        let rx = self.inner.network.subscribe();
        let poll = self.inner.options.poll_interval;
        *watcher = Some(handle.spawn(watch_loop(Arc::downgrade(&self.inner), rx, poll)));
        drop(watcher);

        match poll {
            Some(interval) => log::info!("Preference sync watcher started (poll every {:?})", interval),
            None => log::info!("Preference sync watcher started"),
        }

        if self.inner.network.is_online() {
            self.spawn_cycle();
        }
        true
    }

    /// Stop the background watcher. A cycle already running completes.
    pub fn stop(&self) -> bool {
        let handle = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match handle {
            Some(handle) => {
                handle.abort();
                log::info!("Preference sync watcher stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

enum Wake {
    Network(NetworkStatus),
    Poll,
}

/// Watcher loop (runs in spawned task); ends when the manager is dropped
async fn watch_loop(
    inner: Weak<Inner>,
    mut network: watch::Receiver<NetworkStatus>,
    poll: Option<Duration>,
) {
    let mut ticker = poll.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let wake = tokio::select! {
            changed = network.changed() => match changed {
                Ok(()) => Wake::Network(*network.borrow_and_update()),
                Err(_) => break,
            },
            _ = next_tick(&mut ticker) => Wake::Poll,
        };

        let Some(inner) = inner.upgrade() else { break };
        let manager = PreferencesManager { inner };

        match wake {
            Wake::Network(NetworkStatus::Online) => {
                log::info!(
                    "Connectivity restored, draining {} queued action(s)",
                    manager.pending_actions()
                );
                manager.spawn_cycle();
            }
            Wake::Network(NetworkStatus::Offline) => {
                log::info!("Connectivity lost, changes will be queued");
            }
            Wake::Poll => {
                if manager.inner.network.is_online() {
                    log::debug!("Polling server for preference changes");
                    manager.spawn_cycle();
                }
            }
        }
    }

    log::debug!("Preference sync watcher exited");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// ============================================================================
// Shared State
// ============================================================================

impl Inner {
    fn lock_cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist_preferences(&self, prefs: &PreferenceSet) {
        if !self.store.set(PREFERENCES_KEY, prefs) {
            log::warn!("Preferences kept in memory only; local storage unavailable");
        }
    }

    fn try_begin_cycle(&self) -> bool {
        let mut push = self.push.lock().unwrap_or_else(|e| e.into_inner());
        if push.in_flight {
            push.pending = true;
            return false;
        }
        push.in_flight = true;
        self.idle.send_replace(false);
        true
    }

    /// Finish a cycle. Returns `true` if a follow-up cycle must run.
    fn end_cycle(&self, report: Option<&DrainReport>) -> bool {
        let mut push = self.push.lock().unwrap_or_else(|e| e.into_inner());
        if push.pending && report.is_some() {
            push.pending = false;
            return true;
        }

        if let Some(report) = report {
            *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        }
        push.in_flight = false;
        push.pending = false;
        self.idle.send_replace(true);
        false
    }

    fn last_report(&self) -> Option<DrainReport> {
        self.last_report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn report_failure(&self, report: &DrainReport) {
        match &report.error {
            None => {}
            Some(SyncError::Offline) => {
                log::debug!("Sync skipped while offline ({} action(s) queued)", report.remaining);
            }
            Some(error) => {
                log::warn!("Preference sync failed: {}", error);
                let notifier = self.notifier.read().unwrap_or_else(|e| e.into_inner()).clone();
                notifier.notify(&SyncNotice::sync_failed(error));
                self.events.emit(&PreferenceEvent::SyncFailed {
                    error: error.clone(),
                });
            }
        }
    }

    /// Merge the server-acknowledged set into the cache
    ///
    /// Keys edited locally since the push began keep their local value.
    fn apply_resolved(&self, resolved: &PreferenceSet, ticket: &PushTicket) -> Vec<PreferenceEvent> {
        let mut cache = self.lock_cache();
        let mut events = Vec::new();

        for (key, value) in resolved.values() {
            if cache.tracker.is_unsynced(key) || cache.prefs.get(key) == Some(value) {
                continue;
            }
            match validate_entry(key, value) {
                Ok(()) | Err(ValidationError::UnknownKey(_)) => {}
                Err(e) => {
                    log::warn!("Ignoring invalid server value: {}", e);
                    continue;
                }
            }

            let old = cache.prefs.insert(key.clone(), value.clone());
            events.push(PreferenceEvent::Changed {
                key: key.clone(),
                old,
                new: value.clone(),
                origin: ChangeOrigin::Remote,
            });
        }

        let last_modified = cache.prefs.last_modified().max(resolved.last_modified());
        cache.prefs.set_last_modified(last_modified);
        cache.tracker.acknowledge(ticket);
        cache.base = Some(resolved.clone());

        self.persist_preferences(&cache.prefs);
        if !self.store.set(PREFERENCES_BASE_KEY, resolved) {
            log::warn!("Sync base kept in memory only");
        }
        events
    }
}

#[async_trait]
impl ReplayTarget for Inner {
    fn replay(&self, action: &OfflineAction) -> Result<(), ValidationError> {
        for (key, value) in &action.payload {
            validate_entry(key, value)?;
        }

        let mut cache = self.lock_cache();
        if action.enqueued_at <= cache.prefs.last_modified() {
            return Ok(());
        }

        // The queue outlived the saved preferences (failed write or crash)
        log::info!("Re-applying queued action {} missing from saved preferences", action.id);
        match action.action_type {
            ActionType::Set => {
                for (key, value) in &action.payload {
                    cache.prefs.insert(key.clone(), value.clone());
                }
                cache.tracker.mark_unsynced(action.payload.keys().cloned());
            }
            ActionType::Reset => {
                let defaults = PreferenceSet::defaults();
                for key in known_keys() {
                    if let Some(default) = defaults.get(key) {
                        cache.prefs.insert(key, default.clone());
                    }
                }
                cache.tracker.mark_unsynced(known_keys());
            }
        }
        cache.prefs.set_last_modified(action.enqueued_at);
        self.persist_preferences(&cache.prefs);
        Ok(())
    }

    async fn commit(&self) -> Result<(), SyncError> {
        if !self.network.is_online() {
            return Err(SyncError::Offline);
        }

        let (record, base, ticket) = {
            let mut cache = self.lock_cache();
            let ticket = cache.tracker.begin();
            let record = SyncRecord::new(cache.prefs.clone(), self.device.device_id.clone());
            (record, cache.base.clone(), ticket)
        };

        if ticket.is_empty() {
            log::debug!("Sync started with no local edits, checking the server");
        }
        self.events.emit(&PreferenceEvent::SyncStarted {
            keys: ticket.keys().map(str::to_string).collect(),
        });
        match self.sync.synchronize(&record, base.as_ref()).await {
            Ok(outcome) => {
                let changes = self.apply_resolved(&outcome.preferences, &ticket);
                if !changes.is_empty() {
                    log::info!("Applied {} preference change(s) from the server", changes.len());
                }
                self.events.emit_all(&changes);
                self.events.emit(&PreferenceEvent::SyncCompleted {
                    pushed: outcome.pushed,
                    conflict: outcome.conflict,
                });
                Ok(())
            }
            Err(e) => {
                self.lock_cache().tracker.fail(&ticket);
                Err(e)
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let watcher = self.watcher.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
    }
}

/// Saved preferences with defaults filled in and invalid values replaced
fn load_preferences(store: &LocalStore) -> PreferenceSet {
    let Some(mut prefs) = store.get::<PreferenceSet>(PREFERENCES_KEY) else {
        log::info!("No saved preferences, using defaults");
        return PreferenceSet::defaults();
    };

    prefs.fill_defaults();
    let defaults = PreferenceSet::defaults();
    for key in known_keys() {
        let invalid = prefs
            .get(key)
            .is_some_and(|value| validate_entry(key, value).is_err());
        if invalid {
            log::warn!("Saved preference '{}' is invalid, restoring default", key);
            if let Some(default) = defaults.get(key) {
                prefs.insert(key, default.clone());
            }
        }
    }
    prefs
}

// ============================================================================
// Tests
// ============================================================================
