//! Persistent state store
//!
//! A single sqlite file holds everything that must survive a restart:
//! settings, scroll positions (plain key/value), the active-download
//! snapshots, and the download history. Records are stored as JSON blobs
//! keyed by their primary key, so every write is an idempotent upsert —
//! the platform storage contract is at-least-once.

use chrono::{DateTime, Utc};
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite, SqlitePool};
use tracing::debug;

use crate::config::Settings;
use crate::errors::StorageError;
use crate::models::{Download, HistoryEntry, TabId};

const SETTINGS_KEY: &str = "appState.settings";
const SCROLL_POSITIONS_KEY: &str = "scrollPositions";

#[derive(Clone)]
pub struct StateStore {
    pool: Pool<Sqlite>,
}

impl StateStore {
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            Sqlite::create_database(database_url).await?;
        }
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads_active (
                download_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads_history (
                download_id TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (download_id, completed_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_kv(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_kv(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Settings ──────────────────────────────────────────────────────────

    /// Load persisted settings, clamped; defaults when none were saved.
    pub async fn load_settings(&self) -> Result<Settings, StorageError> {
        match self.get_kv(SETTINGS_KEY).await? {
            Some(raw) => {
                let settings: Settings = serde_json::from_str(&raw)?;
                Ok(settings.clamped())
            }
            None => Ok(Settings::default()),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        let raw = serde_json::to_string(settings)?;
        self.set_kv(SETTINGS_KEY, &raw).await
    }

    // ── Scroll positions ──────────────────────────────────────────────────

    pub async fn save_scroll_position(
        &self,
        tab_id: TabId,
        position: i64,
    ) -> Result<(), StorageError> {
        let mut positions = self.load_scroll_positions().await?;
        positions.insert(tab_id.to_string(), position);
        self.set_kv(SCROLL_POSITIONS_KEY, &serde_json::to_string(&positions)?)
            .await
    }

    pub async fn remove_scroll_position(&self, tab_id: TabId) -> Result<(), StorageError> {
        let mut positions = self.load_scroll_positions().await?;
        if positions.remove(&tab_id.to_string()).is_some() {
            self.set_kv(SCROLL_POSITIONS_KEY, &serde_json::to_string(&positions)?)
                .await?;
        }
        Ok(())
    }

    pub async fn load_scroll_positions(
        &self,
    ) -> Result<std::collections::HashMap<String, i64>, StorageError> {
        match self.get_kv(SCROLL_POSITIONS_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(std::collections::HashMap::new()),
        }
    }

    // ── Active downloads ──────────────────────────────────────────────────

    pub async fn upsert_active_download(&self, download: &Download) -> Result<(), StorageError> {
        let data = serde_json::to_string(download)?;
        sqlx::query(
            "INSERT INTO downloads_active (download_id, data, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(download_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
        )
        .bind(&download.download_id)
        .bind(&data)
        .bind(download.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_active_download(&self, download_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM downloads_active WHERE download_id = ?")
            .bind(download_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Active snapshots in their original dispatch order.
    pub async fn load_active_downloads(&self) -> Result<Vec<Download>, StorageError> {
        let rows =
            sqlx::query_scalar::<_, String>("SELECT data FROM downloads_active ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;
        let mut downloads = Vec::with_capacity(rows.len());
        for raw in rows {
            match serde_json::from_str(&raw) {
                Ok(download) => downloads.push(download),
                Err(e) => debug!("skipping undecodable active download: {e}"),
            }
        }
        Ok(downloads)
    }

    // ── History ───────────────────────────────────────────────────────────

    pub async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StorageError> {
        let data = serde_json::to_string(entry)?;
        sqlx::query(
            "INSERT INTO downloads_history (download_id, completed_at, data) VALUES (?, ?, ?) \
             ON CONFLICT(download_id, completed_at) DO UPDATE SET data = excluded.data",
        )
        .bind(&entry.download.download_id)
        .bind(entry.completed_at.to_rfc3339())
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn load_history(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT data FROM downloads_history ORDER BY completed_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for raw in rows {
            match serde_json::from_str(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!("skipping undecodable history entry: {e}"),
            }
        }
        Ok(entries)
    }

    /// Keep only the newest `max_size` entries.
    pub async fn trim_history(&self, max_size: usize) -> Result<(), StorageError> {
        sqlx::query(
            "DELETE FROM downloads_history WHERE rowid NOT IN \
             (SELECT rowid FROM downloads_history ORDER BY completed_at DESC LIMIT ?)",
        )
        .bind(max_size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove entries older than the cutoff. Returns how many went.
    pub async fn sweep_history(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM downloads_history WHERE completed_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
