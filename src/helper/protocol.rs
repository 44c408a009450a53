//! Helper wire contract
//!
//! Every outbound message is `{id, command, ...}`; the helper answers with
//! frames echoing the `id`. Long-running commands interleave
//! `{command: "progress", ...}` frames before the terminal frame, which
//! either carries `success: true` or an `error` string.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::models::{DownloadKind, ProbeMeta};

/// Commands the core sends to the helper.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command")]
pub enum HelperCommand {
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "probe")]
    Probe {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        light: bool,
    },
    #[serde(rename = "generatePreview")]
    GeneratePreview {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
    #[serde(rename = "download")]
    Download(HelperDownloadRequest),
    #[serde(rename = "cancel-download")]
    CancelDownload {
        #[serde(rename = "downloadId")]
        download_id: String,
    },
}

impl HelperCommand {
    /// Short name for logs and timeout errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Probe { .. } => "probe",
            Self::GeneratePreview { .. } => "generatePreview",
            Self::Download(_) => "download",
            Self::CancelDownload { .. } => "cancel-download",
        }
    }
}

/// Parameters of the `download` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelperDownloadRequest {
    /// Core-assigned id the helper echoes for `cancel-download`.
    pub download_id: String,
    pub download_url: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_path: Option<String>,
    #[serde(rename = "type")]
    pub kind: DownloadKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_container: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub audio_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_selection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// One `{command: "progress"}` frame from a streaming download.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressFrame {
    pub progress: f64,
    pub speed: Option<f64>,
    pub eta: Option<f64>,
    pub current_segment: Option<u64>,
    pub total_segments: Option<u64>,
    pub downloaded: Option<u64>,
    pub size: Option<u64>,
}

impl ProgressFrame {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Extract the probe payload from a terminal frame.
pub fn parse_stream_info(value: &Value) -> Option<ProbeMeta> {
    let info = value.get("streamInfo")?;
    serde_json::from_value(info.clone()).ok()
}

/// A frame is a progress frame when it carries `command: "progress"`.
pub fn is_progress_frame(value: &Value) -> bool {
    value.get("command").and_then(Value::as_str) == Some("progress")
}

/// Extract the `error` string from a terminal frame, if present.
pub fn frame_error(value: &Value) -> Option<String> {
    value.get("error").and_then(Value::as_str).map(str::to_string)
}
