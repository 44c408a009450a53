//! Core data model for stream-scout
//!
//! Everything observer-visible serializes with camelCase field names so the
//! popup UI and the extension consume the same wire shapes the core stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque tab identifier supplied by the event source; keys all per-tab state.
pub type TabId = i64;

/// What a discovered URL turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Hls,
    Dash,
    Direct,
    Blob,
    Unknown,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hls => "hls",
            Self::Dash => "dash",
            Self::Direct => "direct",
            Self::Blob => "blob",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// Where a stream was first reported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoverySource {
    #[serde(rename = "webRequest-mime")]
    WebRequestMime,
    #[serde(rename = "webRequest-url")]
    WebRequestUrl,
    #[serde(rename = "dom-scan")]
    DomScan,
    #[serde(rename = "dom-network-xhr")]
    DomNetworkXhr,
    #[serde(rename = "dom-network-fetch")]
    DomNetworkFetch,
    #[serde(rename = "dom-mutation")]
    DomMutation,
}

/// Light-parse classification of a manifest URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestSubtype {
    Master,
    Variant,
    Standalone,
    NotAMedia,
    FetchFailed,
}

/// Response metadata captured by the event source alongside a URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseMeta {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub accept_ranges: Option<String>,
    pub content_disposition: Option<String>,
    pub filename: Option<String>,
}

/// Classifier verdict for a single URL.
///
/// A sum type so call sites match exhaustively: either the URL is a media
/// candidate worth registering, a segment to suppress, or noise.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Media(MediaCandidate),
    Segment,
    Ignored,
}

/// The media half of a [`Decision`].
#[derive(Debug, Clone, PartialEq)]
pub struct MediaCandidate {
    pub url: String,
    pub kind: StreamKind,
    pub container: Option<String>,
    pub media_kind: Option<MediaKind>,
    /// The wrapper URL this candidate was unwrapped from, if any.
    pub original_url: Option<String>,
    pub found_from_query_param: bool,
}

/// Technical metadata returned by the helper's probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeMeta {
    pub container: Option<String>,
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub duration: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
    pub video_bitrate: Option<u64>,
    pub total_bitrate: Option<u64>,
    pub size_bytes: Option<u64>,
    pub estimated_file_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_tracks: Option<Vec<SubtitleTrack>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubtitleTrack {
    pub language: Option<String>,
    pub title: Option<String>,
    pub codec: Option<String>,
}

/// Metadata obtained from parsing a manifest locally (no helper involved).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParserMeta {
    pub duration: Option<f64>,
    pub segment_count: Option<usize>,
    pub target_duration: Option<f64>,
    pub is_live: bool,
    pub audio_only: bool,
    pub codecs: Option<String>,
    pub bandwidth: Option<u64>,
}

/// A specific-quality child of a master playlist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Variant {
    pub url: String,
    pub canonical: String,
    pub bandwidth: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub codecs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_meta: Option<ParserMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_meta: Option<ProbeMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
}

/// The central record: one discovered stream within a tab.
///
/// Identity inside a tab is `canonical`; the registry never holds two
/// streams with the same `(tab_id, canonical)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub url: String,
    pub canonical: String,
    pub tab_id: TabId,
    pub kind: StreamKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_kind: Option<MediaKind>,
    pub detected_at: DateTime<Utc>,
    pub source: DiscoverySource,

    // Parse state, accumulated by the enrichment pipeline.
    pub light_parsed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<ManifestSubtype>,
    pub fully_parsed: bool,

    // Master/variant relationship.
    pub is_master: bool,
    pub is_variant: bool,
    pub has_known_master: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_canonical: Option<String>,
    /// Masters only; index 0 is the highest quality.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub variants: Vec<Variant>,

    // Technical metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_meta: Option<ProbeMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_meta: Option<ParserMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_info: Option<String>,

    // Provenance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    pub found_from_query_param: bool,
}

impl Stream {
    /// Build a fresh stream record from a classifier verdict.
    pub fn from_candidate(
        candidate: MediaCandidate,
        canonical: String,
        tab_id: TabId,
        source: DiscoverySource,
    ) -> Self {
        Self {
            url: candidate.url,
            canonical,
            tab_id,
            kind: candidate.kind,
            container: candidate.container,
            media_kind: candidate.media_kind,
            detected_at: Utc::now(),
            source,
            light_parsed: false,
            subtype: None,
            fully_parsed: false,
            is_master: false,
            is_variant: false,
            has_known_master: false,
            master_canonical: None,
            variants: Vec::new(),
            probe_meta: None,
            parser_meta: None,
            preview_url: None,
            poster: None,
            title: None,
            expiry_info: None,
            original_url: candidate.original_url,
            found_from_query_param: candidate.found_from_query_param,
        }
    }

    /// Poisoned streams stay in the registry but are filtered from the UI.
    pub fn is_poisoned(&self) -> bool {
        matches!(
            self.subtype,
            Some(ManifestSubtype::NotAMedia) | Some(ManifestSubtype::FetchFailed)
        )
    }
}

/// Download lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Stopping,
    Completed,
    Error,
    Canceled,
}

impl DownloadStatus {
    /// Terminal states do not transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Canceled)
    }
}

/// What the helper is asked to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Direct,
    Hls,
    Dash,
}

/// One dispatched (or queued) download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub download_id: String,
    pub download_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_url: Option<String>,
    pub tab_id: TabId,
    pub filename: String,
    #[serde(rename = "type")]
    pub kind: DownloadKind,
    pub status: DownloadStatus,
    /// 0–100.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_segment: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_segments: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_option_orig_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Enough of the originating stream to reconstitute the UI after restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_data_snapshot: Option<serde_json::Value>,
}

/// Per-download size breakdown recorded into history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadStats {
    pub video_size: Option<u64>,
    pub audio_size: Option<u64>,
    pub total_size: Option<u64>,
}

/// A finished download as the history list stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub download: Download,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_favicon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_stats: Option<DownloadStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}
