//! User notifications for terminal sync failures
//!
//! Sync failures never block the user. They surface as a non-blocking notice
//! through whatever `Notifier` the host installs; `LogNotifier` just logs.

use crate::sync::SyncError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Warning,
    Error,
}

/// Notice shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncNotice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl SyncNotice {
    /// Notice for a sync that could not complete
    pub fn sync_failed(error: &SyncError) -> Self {
        match error {
            SyncError::Unauthorized => Self {
                level: NoticeLevel::Warning,
                title: "Sign in to sync".to_string(),
                message: "Your preferences are saved on this device and will sync after you sign in."
                    .to_string(),
            },
            SyncError::Validation(msg) => Self {
                level: NoticeLevel::Error,
                title: "Preferences rejected".to_string(),
                message: format!("The server rejected your preferences: {}", msg),
            },
            other => Self {
                level: NoticeLevel::Warning,
                title: "Sync delayed".to_string(),
                message: format!(
                    "Your preferences are saved on this device and will sync later ({})",
                    other
                ),
            },
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &SyncNotice);
}

/// Default notifier: writes notices to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &SyncNotice) {
        match notice.level {
            NoticeLevel::Warning => log::warn!("{}: {}", notice.title, notice.message),
            NoticeLevel::Error => log::error!("{}: {}", notice.title, notice.message),
        }
    }
}
