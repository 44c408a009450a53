use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub web: WebConfig,
    pub helper: HelperConfig,
    pub storage: StorageConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Path to the helper binary; bare names resolve through PATH.
    pub binary_path: PathBuf,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Frames larger than this are a protocol violation.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Helper probe/preview calls in flight at once.
    pub max_concurrent_probes: usize,
    /// Minimum gap between probe dispatches.
    pub min_probe_interval_ms: u64,
    /// How much of a manifest the light parse fetches.
    pub manifest_head_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 8790,
            },
            helper: HelperConfig {
                binary_path: PathBuf::from("stream-scout-helper"),
                request_timeout_secs: 60,
                download_timeout_secs: 3600,
                heartbeat_interval_secs: 15,
                reconnect_delay_secs: 2,
                max_frame_bytes: 8 * 1024 * 1024,
            },
            storage: StorageConfig {
                database_url: "sqlite://./stream-scout.db".to_string(),
            },
            limits: LimitsConfig {
                max_concurrent_probes: 2,
                min_probe_interval_ms: 500,
                manifest_head_bytes: 64 * 1024,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            Ok(default_config)
        }
    }
}

/// User-visible runtime options.
///
/// These are persisted through the state store and updated live from the
/// popup. Every numeric option is clamped into its documented range on the
/// way in, so a hand-edited or stale persisted blob cannot take the daemon
/// outside supported values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Cap on simultaneously running downloads (1–10).
    pub max_concurrent_downloads: u32,
    /// Default directory handed to the helper when the UI picked none.
    pub default_save_path: Option<String>,
    pub show_download_notifications: bool,
    /// Direct files smaller than this never become streams (bytes, 0–100 MB).
    pub min_file_size_filter: u64,
    pub auto_generate_previews: bool,
    /// History entries kept after trim (0–200).
    pub max_history_size: usize,
    /// History entries older than this many days are swept (1–365).
    pub history_auto_remove_interval: i64,
}

pub const MIN_FILE_SIZE_CEILING: u64 = 100 * 1024 * 1024;

/// Shared live view of the settings record; updated by the UI, read by
/// everything else.
pub type SettingsHandle = std::sync::Arc<tokio::sync::RwLock<Settings>>;

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 1,
            default_save_path: None,
            show_download_notifications: true,
            min_file_size_filter: 100 * 1024,
            auto_generate_previews: true,
            max_history_size: 50,
            history_auto_remove_interval: 30,
        }
    }
}

impl Settings {
    /// Force every option into its supported range.
    pub fn clamped(mut self) -> Self {
        self.max_concurrent_downloads = self.max_concurrent_downloads.clamp(1, 10);
        self.min_file_size_filter = self.min_file_size_filter.min(MIN_FILE_SIZE_CEILING);
        self.max_history_size = self.max_history_size.min(200);
        self.history_auto_remove_interval = self.history_auto_remove_interval.clamp(1, 365);
        self
    }

    /// Merge a partial update from the UI. Unknown keys are ignored; the
    /// result is clamped.
    pub fn merged_with(&self, update: &serde_json::Value) -> Self {
        let mut current = serde_json::to_value(self).unwrap_or_default();
        if let (Some(base), Some(patch)) = (current.as_object_mut(), update.as_object()) {
            for (key, value) in patch {
                if base.contains_key(key) {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
        serde_json::from_value::<Settings>(current)
            .unwrap_or_else(|_| self.clone())
            .clamped()
    }
}
