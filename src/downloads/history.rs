//! Download history
//!
//! Terminal downloads (success and error; never canceled) append here.
//! Retention is two-fold: a size trim on every append and an hourly
//! age sweep. When the UI's idea of history disagrees with the sweep,
//! the sweep wins.

use chrono::{Duration, Utc};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::config::SettingsHandle;
use crate::errors::StorageError;
use crate::models::HistoryEntry;
use crate::storage::StateStore;

const SWEEP_INTERVAL_SECS: u64 = 3600;

#[derive(Clone)]
pub struct HistoryService {
    store: StateStore,
    settings: SettingsHandle,
}

impl HistoryService {
    pub fn new(store: StateStore, settings: SettingsHandle) -> Self {
        Self { store, settings }
    }

    /// Append one entry and trim to the configured size.
    pub async fn record(&self, entry: &HistoryEntry) -> Result<(), StorageError> {
        self.store.append_history(entry).await?;
        let max_size = self.settings.read().await.max_history_size;
        self.store.trim_history(max_size).await
    }

    pub async fn entries(&self) -> Vec<HistoryEntry> {
        self.store.load_history().await.unwrap_or_default()
    }

    /// Remove entries older than the configured interval.
    pub async fn sweep(&self) -> Result<u64, StorageError> {
        let days = self.settings.read().await.history_auto_remove_interval;
        let cutoff = Utc::now() - Duration::days(days);
        let removed = self.store.sweep_history(cutoff).await?;
        if removed > 0 {
            debug!("history sweep removed {removed} entries older than {days} days");
        }
        Ok(removed)
    }

    /// Periodic age-based sweep, hourly for the life of the process.
    pub fn spawn_sweeper(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = service.sweep().await {
                    warn!("history sweep failed: {e}");
                }
            }
        });
    }
}
