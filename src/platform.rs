//! Platform services boundary
//!
//! Notifications and the save-path chooser belong to the hosting platform.
//! The default implementation logs; a desktop build supplies its own.

use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait PlatformServices: Send + Sync {
    /// Show (or update) a user-visible notification.
    async fn notify(&self, notification_id: &str, title: &str, message: &str);

    /// Ask the user for a download directory. None when unsupported or
    /// dismissed.
    async fn choose_save_path(&self) -> Option<String>;
}

/// Logging-only platform services.
#[derive(Debug, Default, Clone)]
pub struct LogPlatform;

#[async_trait]
impl PlatformServices for LogPlatform {
    async fn notify(&self, notification_id: &str, title: &str, message: &str) {
        info!("[notify:{notification_id}] {title}: {message}");
    }

    async fn choose_save_path(&self) -> Option<String> {
        None
    }
}
