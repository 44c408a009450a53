//! Observer message vocabulary
//!
//! Inbound messages are the commands a popup session may issue; outbound
//! messages are everything the core pushes back. Wire names are fixed by
//! the extension protocol, so every variant carries an explicit rename.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Settings;
use crate::models::{Download, DownloadKind, HistoryEntry, Stream, TabId};

/// Delta kind inside a `videos-state-update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateAction {
    Add,
    Update,
    Remove,
    FullRefresh,
}

/// Core → UI messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "videos-state-update")]
    VideosStateUpdate {
        action: UpdateAction,
        #[serde(rename = "tabId")]
        tab_id: TabId,
        #[serde(rename = "videoUrl", skip_serializing_if = "Option::is_none")]
        video_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        video: Option<Box<Stream>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        videos: Option<Vec<Stream>>,
    },

    #[serde(rename = "download-queued")]
    DownloadQueued { download: Download },
    #[serde(rename = "download-started")]
    DownloadStarted { download: Download },
    #[serde(rename = "download-progress")]
    DownloadProgress(DownloadProgressPayload),
    #[serde(rename = "download-success")]
    DownloadSuccess { download: Download },
    #[serde(rename = "download-error")]
    DownloadError { download: Download },
    #[serde(rename = "download-canceled")]
    DownloadCanceled {
        #[serde(rename = "downloadId")]
        download_id: String,
        #[serde(rename = "downloadUrl")]
        download_url: String,
    },
    #[serde(rename = "download-stopping")]
    DownloadStopping {
        #[serde(rename = "downloadId")]
        download_id: String,
        #[serde(rename = "downloadUrl")]
        download_url: String,
    },

    #[serde(rename = "downloadCountUpdated")]
    DownloadCountUpdated { count: usize },
    #[serde(rename = "activeDownloadsData")]
    ActiveDownloadsData {
        downloads: Vec<Download>,
        history: Vec<HistoryEntry>,
    },
    #[serde(rename = "settingsState")]
    SettingsState { settings: Settings },
    #[serde(rename = "cachesCleared")]
    CachesCleared,
    #[serde(rename = "previewCacheStats")]
    PreviewCacheStats { entries: usize, tabs: usize },
    #[serde(rename = "nativeHostConnectionState")]
    NativeHostConnectionState { connected: bool },
}

/// Live progress snapshot for one download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressPayload {
    pub download_id: String,
    pub download_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_url: Option<String>,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_segment: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_segments: Option<u64>,
}

/// UI → core messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "tabId", default)]
        tab_id: Option<TabId>,
        #[serde(default)]
        url: Option<String>,
    },
    #[serde(rename = "getVideos")]
    GetVideos {
        #[serde(rename = "tabId", default)]
        tab_id: Option<TabId>,
    },
    // The payload is nested: it has its own `type` field (the download
    // kind), which must not collide with the envelope tag.
    #[serde(rename = "download")]
    Download { request: DownloadCommand },
    #[serde(rename = "cancel-download")]
    CancelDownload {
        #[serde(rename = "downloadId")]
        download_id: String,
    },
    #[serde(rename = "generatePreview")]
    GeneratePreview {
        url: String,
        #[serde(rename = "tabId", default)]
        tab_id: Option<TabId>,
    },
    #[serde(rename = "getPreviewCacheStats")]
    GetPreviewCacheStats,
    #[serde(rename = "clearCaches")]
    ClearCaches,
    #[serde(rename = "getActiveDownloads")]
    GetActiveDownloads,
    #[serde(rename = "getSettings")]
    GetSettings,
    #[serde(rename = "updateSettings")]
    UpdateSettings { settings: Value },
    #[serde(rename = "chooseSavePath")]
    ChooseSavePath,
    #[serde(rename = "saveScrollPosition")]
    SaveScrollPosition {
        #[serde(rename = "tabId")]
        tab_id: TabId,
        position: i64,
    },
}

/// Parameters of the UI's `download` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCommand {
    pub download_url: String,
    #[serde(default)]
    pub master_url: Option<String>,
    pub tab_id: TabId,
    pub filename: String,
    #[serde(rename = "type")]
    pub kind: DownloadKind,
    #[serde(default)]
    pub preferred_container: Option<String>,
    #[serde(default)]
    pub original_container: Option<String>,
    #[serde(default)]
    pub audio_only: bool,
    #[serde(default)]
    pub stream_selection: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub save_path: Option<String>,
    #[serde(default)]
    pub selected_option_orig_text: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub page_favicon: Option<String>,
    #[serde(default)]
    pub video_data_snapshot: Option<Value>,
}
