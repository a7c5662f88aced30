//! Oriel Signal FX - preference sync engine
//!
//! Keeps visualizer preferences (colour, intensity, shape, theme, ...) in
//! sync across a user's devices:
//! - `store`: durable local key-value storage (SQLite or memory)
//! - `sync`: data model, REST transport, conflict resolution, offline queue
//! - `preferences`: the façade UI code talks to
//!
//! Components are wired explicitly by [`bootstrap`]; there is no global state.

pub mod config;
pub mod db;
pub mod notify;
pub mod preferences;
pub mod store;
pub mod sync;

pub use config::{ConfigError, SyncConfig};
pub use notify::{LogNotifier, Notifier, SyncNotice};
pub use preferences::{
    ChangeOrigin, ControlSurface, PreferenceEvent, PreferencesManager, PreferencesOptions,
    SubscriptionId,
};
pub use store::LocalStore;
pub use sync::{
    keys, KeySyncState, NetworkMonitor, NetworkStatus, PreferenceSet, PreferenceValue,
    SyncApiClient, SyncError, ValidationError,
};

use db::{Database, DbError};
use std::sync::Arc;
use sync::{DeviceIdentity, OfflineQueue, SyncApiError, SyncManager};

/// Install the `env_logger` backend (`RUST_LOG` overrides the `info` default)
///
/// Safe to call more than once; only the first call installs a logger.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Fully wired sync engine
pub struct SyncRuntime {
    pub preferences: PreferencesManager,
    /// Hand the bearer token to this client after sign-in
    pub api: Arc<SyncApiClient>,
    pub network: NetworkMonitor,
    pub store: LocalStore,
}

/// Build every component from `config`
///
/// The background watcher is not started; call `preferences.start()` from
/// inside the async runtime.
pub fn bootstrap(config: &SyncConfig) -> Result<SyncRuntime, BootstrapError> {
    config.validate()?;

    let db_path = config.resolve_database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = LocalStore::from(Database::new(db_path)?);

    let device = DeviceIdentity::load_or_create(&store);
    let api = Arc::new(SyncApiClient::new(&config.api_base_url, config.request_timeout())?);
    let sync = SyncManager::new(api.clone())
        .with_retry_policy(config.retry_policy())
        .with_request_timeout(config.request_timeout());

    let queue = OfflineQueue::new(store.clone());
    let network = NetworkMonitor::default();
    let preferences = PreferencesManager::new(
        store.clone(),
        queue,
        sync,
        network.clone(),
        device,
        config.preferences_options(),
    );

    log::info!("Preference sync ready (server {})", api.endpoint());
    Ok(SyncRuntime {
        preferences,
        api,
        network,
        store,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("API client error: {0}")]
    Api(#[from] SyncApiError),
}
