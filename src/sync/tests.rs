//! Integration Tests for Sync Module
//!
//! End-to-end flows through the preferences façade:
//! - Push coalescing (at most one push in flight)
//! - Offline edits drained on reconnect
//! - Cross-device merges through a shared server
//! - Failure, recovery and storage-quota scenarios

#[cfg(test)]
mod integration_tests {
    use super::super::testing::{fast_retry, MockRemote};
    use super::super::*;
    use crate::notify::{Notifier, SyncNotice};
    use crate::preferences::{ChangeOrigin, PreferenceEvent, PreferencesManager, PreferencesOptions};
    use crate::store::{LocalStore, MemoryBackend};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn device(
        remote: &Arc<MockRemote>,
        store: LocalStore,
        status: NetworkStatus,
        options: PreferencesOptions,
    ) -> PreferencesManager {
        let sync = SyncManager::new(remote.clone())
            .with_retry_policy(fast_retry(3))
            .with_request_timeout(Duration::from_secs(2));
        let identity = DeviceIdentity::load_or_create(&store);

        PreferencesManager::new(
            store.clone(),
            OfflineQueue::new(store),
            sync,
            NetworkMonitor::new(status),
            identity,
            options,
        )
    }

    fn manual() -> PreferencesOptions {
        PreferencesOptions {
            auto_sync: false,
            poll_interval: None,
        }
    }

    async fn eventually<F: FnMut() -> bool>(mut check: F) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "condition not reached in time");
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<SyncNotice>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: &SyncNotice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    // ========================================================================
    // Push Ordering
    // ========================================================================

    #[tokio::test]
    async fn test_edits_during_push_coalesce_into_one_more_push() {
        let remote = Arc::new(MockRemote::new());
        let gate = remote.gate_stores();
        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, PreferencesOptions::default());

        prefs.set(keys::VOLUME, 0.5).unwrap();
        gate.entered.notified().await;
        assert_eq!(prefs.key_state(keys::VOLUME), KeySyncState::Syncing);

        prefs.set(keys::VOLUME, 0.6).unwrap();
        prefs.set(keys::THEME, "light").unwrap();
        assert_eq!(prefs.key_state(keys::VOLUME), KeySyncState::Unsynced);

        gate.release(10);
        prefs.wait_until_idle().await;

        assert_eq!(remote.store_count(), 2);
        let last = remote.current().unwrap();
        assert_eq!(last.preferences.get(keys::VOLUME), Some(&PreferenceValue::Number(0.6)));
        assert_eq!(last.preferences.get(keys::THEME), Some(&PreferenceValue::from("light")));
        assert_eq!(prefs.key_state(keys::VOLUME), KeySyncState::Synced);
        assert_eq!(prefs.pending_actions(), 0);
    }

    #[tokio::test]
    async fn test_sync_now_during_push_waits_for_follow_up() {
        let remote = Arc::new(MockRemote::new());
        let gate = remote.gate_stores();
        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, PreferencesOptions::default());

        prefs.set(keys::SHAPE, "bars").unwrap();
        gate.entered.notified().await;
        prefs.set(keys::SHAPE, "wave").unwrap();

        let waiter = {
            let prefs = prefs.clone();
            tokio::spawn(async move { prefs.sync_now().await })
        };
        gate.release(10);

        let report = waiter.await.unwrap().unwrap();
        assert_eq!(report.remaining, 0);
        assert_eq!(remote.store_count(), 2);
        assert_eq!(
            remote.current().unwrap().preferences.get(keys::SHAPE),
            Some(&PreferenceValue::from("wave"))
        );
    }

    // ========================================================================
    // Offline Queue
    // ========================================================================

    #[tokio::test]
    async fn test_offline_edits_push_once_on_reconnect() {
        let remote = Arc::new(MockRemote::new());
        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Offline, PreferencesOptions::default());
        assert!(prefs.start());

        prefs.set(keys::VOLUME, 0.3).unwrap();
        prefs.set(keys::VOLUME, 0.6).unwrap();
        assert_eq!(prefs.pending_actions(), 2);
        assert_eq!(remote.store_count(), 0);

        prefs.network().set_status(NetworkStatus::Online);
        eventually(|| remote.store_count() > 0 && prefs.pending_actions() == 0).await;
        prefs.wait_until_idle().await;

        let pushed = remote.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].preferences.get(keys::VOLUME), Some(&PreferenceValue::Number(0.6)));
        prefs.stop();
    }

    #[tokio::test]
    async fn test_failed_push_keeps_queue_and_notifies() {
        let remote = Arc::new(MockRemote::new());
        remote.fail_next_store(SyncApiError::Unauthorized);
        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());

        let notifier = Arc::new(RecordingNotifier::default());
        prefs.set_notifier(notifier.clone());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        prefs.subscribe(move |event| {
            if let PreferenceEvent::SyncFailed { error } = event {
                sink.lock().unwrap().push(error.clone());
            }
        });
        let started = Arc::new(Mutex::new(Vec::new()));
        let sink = started.clone();
        prefs.subscribe(move |event| {
            if let PreferenceEvent::SyncStarted { keys: edited } = event {
                sink.lock().unwrap().push(edited.clone());
            }
        });

        prefs.set(keys::QUALITY, "ultra").unwrap();
        assert_eq!(prefs.sync_now().await, Err(SyncError::Unauthorized));

        assert_eq!(prefs.pending_actions(), 1);
        assert_eq!(prefs.key_state(keys::QUALITY), KeySyncState::Unsynced);
        assert_eq!(prefs.get(keys::QUALITY), Some(PreferenceValue::from("ultra")));
        assert_eq!(notifier.notices.lock().unwrap()[0].title, "Sign in to sync");
        assert_eq!(*failures.lock().unwrap(), vec![SyncError::Unauthorized]);
        assert_eq!(*started.lock().unwrap(), vec![vec![keys::QUALITY.to_string()]]);

        let report = prefs.sync_now().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(prefs.pending_actions(), 0);
        assert_eq!(prefs.key_state(keys::QUALITY), KeySyncState::Synced);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_within_one_sync() {
        let remote = Arc::new(MockRemote::new());
        remote.fail_next_fetch(SyncApiError::Network("connection reset".to_string()));
        remote.fail_next_store(SyncApiError::Server {
            status: 502,
            message: "bad gateway".to_string(),
        });
        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());

        prefs.set(keys::INTENSITY, 1.5).unwrap();
        let report = prefs.sync_now().await.unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(remote.fetch_count(), 2);
        assert_eq!(remote.store_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_mutation_for_next_window() {
        let remote = Arc::new(MockRemote::new());
        for _ in 0..3 {
            remote.fail_next_store(SyncApiError::Server {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());
        let notifier = Arc::new(RecordingNotifier::default());
        prefs.set_notifier(notifier.clone());

        prefs.set(keys::SHAPE, "spiral").unwrap();
        let pending = prefs.pending_actions();

        match prefs.sync_now().await {
            Err(SyncError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, SyncError::Server("503: unavailable".to_string()));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(remote.store_count(), 3);
        assert_eq!(prefs.pending_actions(), pending);
        assert_eq!(prefs.key_state(keys::SHAPE), KeySyncState::Unsynced);
        assert_eq!(notifier.notices.lock().unwrap()[0].title, "Sync delayed");

        let report = prefs.sync_now().await.unwrap();
        assert_eq!(report.remaining, 0);
        assert_eq!(prefs.key_state(keys::SHAPE), KeySyncState::Synced);
        assert_eq!(
            remote.current().unwrap().preferences.get(keys::SHAPE),
            Some(&PreferenceValue::from("spiral"))
        );
    }

    #[tokio::test]
    async fn test_queue_outliving_saved_preferences_is_replayed() {
        let store = LocalStore::in_memory();
        let queue = OfflineQueue::new(store.clone());
        queue.enqueue_set(
            BTreeMap::from([(keys::VOLUME.to_string(), PreferenceValue::Number(0.3))]),
            Utc::now(),
        );
        queue.enqueue_set(
            BTreeMap::from([(keys::VOLUME.to_string(), PreferenceValue::from("max"))]),
            Utc::now(),
        );
        drop(queue);

        let remote = Arc::new(MockRemote::new());
        let prefs = device(&remote, store, NetworkStatus::Online, manual());
        assert_eq!(prefs.get(keys::VOLUME), Some(PreferenceValue::Number(0.8)));
        assert_eq!(prefs.key_state(keys::VOLUME), KeySyncState::Unsynced);

        let report = prefs.sync_now().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(prefs.get(keys::VOLUME), Some(PreferenceValue::Number(0.3)));
        assert_eq!(
            remote.current().unwrap().preferences.get(keys::VOLUME),
            Some(&PreferenceValue::Number(0.3))
        );
    }

    #[tokio::test]
    async fn test_quota_exceeded_edit_still_syncs() {
        let remote = Arc::new(MockRemote::new());
        let store = LocalStore::new(MemoryBackend::with_quota(64));
        let prefs = device(&remote, store, NetworkStatus::Online, manual());

        assert_eq!(prefs.set(keys::COLOR, "#123abc"), Ok(true));
        assert_eq!(prefs.get(keys::COLOR), Some(PreferenceValue::from("#123abc")));

        prefs.sync_now().await.unwrap();
        assert_eq!(
            remote.current().unwrap().preferences.get(keys::COLOR),
            Some(&PreferenceValue::from("#123abc"))
        );
    }

    // ========================================================================
    // Conflict Scenarios
    // ========================================================================

    #[tokio::test]
    async fn test_newer_server_theme_replaces_local() {
        let mut server = PreferenceSet::defaults();
        server.insert(keys::THEME, "dark".into());
        server.set_last_modified(Utc::now() + ChronoDuration::hours(1));
        let remote = Arc::new(MockRemote::with_record(SyncRecord::new(server, "phone")));

        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());
        prefs.set(keys::THEME, "light").unwrap();

        let remote_changes = Arc::new(Mutex::new(Vec::new()));
        let sink = remote_changes.clone();
        prefs.subscribe(move |event| {
            if let PreferenceEvent::Changed { key, origin: ChangeOrigin::Remote, .. } = event {
                sink.lock().unwrap().push(key.clone());
            }
        });

        prefs.sync_now().await.unwrap();

        assert_eq!(prefs.get(keys::THEME), Some(PreferenceValue::from("dark")));
        assert_eq!(*remote_changes.lock().unwrap(), vec![keys::THEME.to_string()]);
        assert_eq!(remote.store_count(), 0);
    }

    #[tokio::test]
    async fn test_two_devices_merge_disjoint_edits() {
        let remote = Arc::new(MockRemote::new());
        let laptop = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());
        let phone = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());

        laptop.sync_now().await.unwrap();
        phone.sync_now().await.unwrap();

        laptop.set(keys::SENSITIVITY, 3.0).unwrap();
        phone.set(keys::THEME, "light").unwrap();

        laptop.sync_now().await.unwrap();
        phone.sync_now().await.unwrap();
        laptop.sync_now().await.unwrap();

        for prefs in [&laptop, &phone] {
            assert_eq!(prefs.get(keys::SENSITIVITY), Some(PreferenceValue::Number(3.0)));
            assert_eq!(prefs.get(keys::THEME), Some(PreferenceValue::from("light")));
        }
        let server = remote.current().unwrap();
        assert!(server.preferences.same_values(&laptop.get_all()));
        assert_eq!(server.device_id, phone.device().device_id);
    }

    #[tokio::test]
    async fn test_partial_older_server_record_is_completed_from_local() {
        let remote = Arc::new(MockRemote::new());
        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());
        prefs.sync_now().await.unwrap();

        let partial = PreferenceSet::from_values(
            BTreeMap::from([(keys::THEME.to_string(), PreferenceValue::from("light"))]),
            Utc::now() - ChronoDuration::seconds(1),
        );
        remote.replace_record(SyncRecord::new(partial, "legacy-web"));

        prefs.set(keys::VOLUME, 0.4).unwrap();
        prefs.sync_now().await.unwrap();
        prefs.sync_now().await.unwrap();

        assert_eq!(prefs.pending_actions(), 0);
        let stored = remote.current().unwrap().preferences;
        assert!(stored.validate().is_ok());
        assert_eq!(stored.get(keys::VOLUME), Some(&PreferenceValue::Number(0.4)));
        assert_eq!(stored.get(keys::THEME), Some(&PreferenceValue::from("light")));
        assert_eq!(stored.get(keys::COLOR), Some(&PreferenceValue::from("#00d4ff")));
        assert_eq!(prefs.get(keys::THEME), Some(PreferenceValue::from("light")));
    }

    #[tokio::test]
    async fn test_repeated_sync_is_idempotent() {
        let remote = Arc::new(MockRemote::new());
        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());

        prefs.set(keys::SHOW_FPS, true).unwrap();
        prefs.sync_now().await.unwrap();
        let server_after_first = remote.current();
        let local_after_first = prefs.get_all();

        prefs.sync_now().await.unwrap();
        prefs.sync_now().await.unwrap();

        assert_eq!(remote.store_count(), 1);
        assert_eq!(remote.current(), server_after_first);
        assert_eq!(prefs.get_all(), local_after_first);
    }

    #[tokio::test]
    async fn test_unknown_server_keys_survive_round_trip() {
        let mut server = PreferenceSet::defaults();
        server.insert("bloomRadius", PreferenceValue::Number(12.0));
        server.set_last_modified(Utc::now() - ChronoDuration::minutes(5));
        let remote = Arc::new(MockRemote::with_record(SyncRecord::new(server, "newer-client")));

        let prefs = device(&remote, LocalStore::in_memory(), NetworkStatus::Online, manual());
        prefs.sync_now().await.unwrap();
        prefs.set(keys::MIRROR_MODE, true).unwrap();
        prefs.sync_now().await.unwrap();

        let stored = remote.current().unwrap();
        assert_eq!(stored.preferences.get("bloomRadius"), Some(&PreferenceValue::Number(12.0)));
        assert_eq!(stored.preferences.get(keys::MIRROR_MODE), Some(&PreferenceValue::Bool(true)));
    }

    // ========================================================================
    // Background Watcher
    // ========================================================================

    #[tokio::test]
    async fn test_watcher_polls_server_changes() {
        let remote = Arc::new(MockRemote::new());
        let prefs = device(
            &remote,
            LocalStore::in_memory(),
            NetworkStatus::Online,
            PreferencesOptions {
                auto_sync: true,
                poll_interval: Some(Duration::from_millis(20)),
            },
        );
        assert!(prefs.start());
        eventually(|| remote.current().is_some()).await;
        prefs.wait_until_idle().await;

        let mut server = remote.current().unwrap().preferences;
        server.insert(keys::COLOR, "#abcdef".into());
        server.touch();
        remote.replace_record(SyncRecord::new(server, "tablet"));

        eventually(|| prefs.get(keys::COLOR) == Some(PreferenceValue::from("#abcdef"))).await;
        assert!(prefs.stop());
    }
}
