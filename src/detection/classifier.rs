//! URL classification
//!
//! Pure decision function over a URL plus whatever response metadata the
//! event source captured. Priority order matters: blob scheme, embedded-URL
//! unwrapping, extension and tracker drops, then content-type, then path.
//! Segment suppression consults per-tab hints learned from DASH manifests.

use std::sync::LazyLock;

use regex::RegexSet;
use url::Url;

use super::normalizer;
use crate::models::{Decision, MediaCandidate, MediaKind, ResponseMeta, StreamKind};

/// Extensions that are never media, regardless of how they were reported.
const NON_MEDIA_EXTENSIONS: &[&str] = &[
    "js", "css", "json", "xml", "woff", "woff2", "ttf", "eot", "otf", "jpg", "jpeg", "png", "gif",
    "svg", "ico", "webp", "avif", "bmp", "pdf", "txt", "map", "php", "jsp",
];

/// Extension prefixes covering versioned families (doc/docx, xls/xlsx, …).
const NON_MEDIA_EXTENSION_PREFIXES: &[&str] = &["doc", "xls", "ppt", "htm", "asp"];

/// Direct-file container extensions.
const CONTAINER_EXTENSIONS: &[&str] = &[
    "mp4", "webm", "ogg", "mov", "avi", "mkv", "flv", "3gp", "m4v", "wmv",
];

/// Substrings identifying tracker/analytics endpoints.
const TRACKER_MARKERS: &[&str] = &[
    "/ping/",
    "/track/",
    "/pixel/",
    "/analytics/",
    "jwpltx",
    "ping.gif",
];

/// Numbered-chunk shapes that mark a URL as a manifest segment.
static SEGMENT_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"segment-\d+",
        r"chunk-\d+",
        r"frag-\d+",
        r"seq-\d+",
        r"part-\d+",
        r"/(media|video|audio)_\d+",
        r"dash\d+",
        r"\d+\.(m4s|ts)$",
        r"[-_]\d+[-_]\d+\.(m4s|mp4)$",
    ])
    .expect("segment patterns are valid")
});

static BYTE_RANGE_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(bytes|range)=\d+-\d+").expect("range pattern is valid"));

/// Per-tab knowledge the classifier needs for segment suppression.
#[derive(Debug, Clone, Default)]
pub struct SegmentHints {
    /// An MPD has been observed for this tab recently.
    pub has_mpd_context: bool,
    /// Path prefixes learned from parsed DASH manifests.
    pub segment_prefixes: Vec<String>,
}

/// Classify a URL, optionally with response metadata.
///
/// `min_file_size` comes from settings: direct files with a known smaller
/// content length are dropped.
pub fn classify(
    url: &str,
    resp: Option<&ResponseMeta>,
    hints: &SegmentHints,
    min_file_size: u64,
) -> Decision {
    classify_inner(url, resp, hints, min_file_size, None, 0)
}

fn classify_inner(
    url: &str,
    resp: Option<&ResponseMeta>,
    hints: &SegmentHints,
    min_file_size: u64,
    wrapper_url: Option<&str>,
    depth: u8,
) -> Decision {
    let url = url.trim();

    if url.starts_with("blob:") {
        return media(url, StreamKind::Blob, None, None, wrapper_url);
    }

    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(_) => return classify_raw(url, hints, wrapper_url),
    };

    // A media URL hidden in a query parameter replaces the candidate
    // outright; classification restarts on the inner URL. This is also the
    // only way a tracker or non-media extension URL survives.
    if depth < 3 {
        if let Some(inner) = normalizer::extract_embedded_url(url) {
            let outermost = wrapper_url.unwrap_or(url);
            return classify_inner(&inner, None, hints, min_file_size, Some(outermost), depth + 1);
        }
    }

    let path = parsed.path().to_ascii_lowercase();
    let extension = path_extension(&path);

    if let Some(ext) = extension.as_deref() {
        if is_non_media_extension(ext) {
            return Decision::Ignored;
        }
    }

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let host_and_path = format!("{host}{path}");
    if TRACKER_MARKERS.iter().any(|m| host_and_path.contains(m)) {
        return Decision::Ignored;
    }

    if let Some(content_type) = resp.and_then(|r| r.content_type.as_deref()) {
        return classify_by_content_type(
            url,
            &path,
            content_type,
            resp,
            hints,
            min_file_size,
            wrapper_url,
        );
    }

    classify_by_path(url, &path, extension.as_deref(), hints, wrapper_url)
}

#[allow(clippy::too_many_arguments)]
fn classify_by_content_type(
    url: &str,
    path: &str,
    content_type: &str,
    resp: Option<&ResponseMeta>,
    hints: &SegmentHints,
    min_file_size: u64,
    wrapper_url: Option<&str>,
) -> Decision {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();

    match ct.as_str() {
        "application/dash+xml" | "application/vnd.mpeg.dash.mpd" => {
            return media(url, StreamKind::Dash, None, None, wrapper_url);
        }
        "application/vnd.apple.mpegurl" | "application/x-mpegurl" | "audio/mpegurl" => {
            return media(url, StreamKind::Hls, None, None, wrapper_url);
        }
        // MPEG-TS is always a segment, never a standalone stream.
        "video/mp2t" => return Decision::Segment,
        "application/xml" | "text/xml" | "application/octet-stream" => {
            if url.to_ascii_lowercase().contains(".mpd") {
                return media(url, StreamKind::Dash, None, None, wrapper_url);
            }
            return classify_by_path(url, path, path_extension(path).as_deref(), hints, wrapper_url);
        }
        _ => {}
    }

    // Misconfigured servers label manifests loosely; catch anything
    // mentioning mpegurl/m3u8.
    if ct.contains("mpegurl") || ct.contains("m3u8") {
        return media(url, StreamKind::Hls, None, None, wrapper_url);
    }

    if ct.starts_with("video/") || ct.starts_with("audio/") {
        if is_segment(url, path, hints) {
            return Decision::Segment;
        }
        if let Some(len) = resp.and_then(|r| r.content_length) {
            if len < min_file_size {
                return Decision::Ignored;
            }
        }
        let media_kind = if ct.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        let container = ct.split('/').nth(1).map(|s| s.to_string());
        return media(
            url,
            StreamKind::Direct,
            container,
            Some(media_kind),
            wrapper_url,
        );
    }

    classify_by_path(url, path, path_extension(path).as_deref(), hints, wrapper_url)
}

fn classify_by_path(
    url: &str,
    path: &str,
    extension: Option<&str>,
    hints: &SegmentHints,
    wrapper_url: Option<&str>,
) -> Decision {
    match extension {
        Some("m3u8") => media(url, StreamKind::Hls, None, None, wrapper_url),
        Some("mpd") => media(url, StreamKind::Dash, None, None, wrapper_url),
        Some(ext) if CONTAINER_EXTENSIONS.contains(&ext) => {
            if is_segment(url, path, hints) {
                Decision::Segment
            } else {
                media(
                    url,
                    StreamKind::Direct,
                    Some(ext.to_string()),
                    None,
                    wrapper_url,
                )
            }
        }
        _ => {
            if is_segment(url, path, hints) {
                Decision::Segment
            } else {
                Decision::Ignored
            }
        }
    }
}

/// Last-resort classification when the URL does not parse.
fn classify_raw(url: &str, hints: &SegmentHints, wrapper_url: Option<&str>) -> Decision {
    let lower = url.to_ascii_lowercase();
    if lower.contains(".m3u8") {
        return media(url, StreamKind::Hls, None, None, wrapper_url);
    }
    if lower.contains(".mpd") {
        return media(url, StreamKind::Dash, None, None, wrapper_url);
    }
    if let Some(ext) = CONTAINER_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(&format!(".{ext}")))
    {
        if is_segment(url, &lower, hints) {
            return Decision::Segment;
        }
        return media(
            url,
            StreamKind::Direct,
            Some(ext.to_string()),
            None,
            wrapper_url,
        );
    }
    Decision::Ignored
}

/// Segment test: extension, byte-range under an MPD context, learned
/// prefixes, or numbered-chunk patterns.
fn is_segment(url: &str, path: &str, hints: &SegmentHints) -> bool {
    if matches!(path_extension(path).as_deref(), Some("ts") | Some("m4s")) {
        return true;
    }
    if hints.has_mpd_context && BYTE_RANGE_PATTERN.is_match(&url.to_ascii_lowercase()) {
        return true;
    }
    if hints.segment_prefixes.iter().any(|p| url.contains(p.as_str())) {
        return true;
    }
    SEGMENT_PATTERNS.is_match(path)
}

fn is_non_media_extension(ext: &str) -> bool {
    NON_MEDIA_EXTENSIONS.contains(&ext)
        || NON_MEDIA_EXTENSION_PREFIXES
            .iter()
            .any(|prefix| ext.starts_with(prefix))
}

fn path_extension(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn media(
    url: &str,
    kind: StreamKind,
    container: Option<String>,
    media_kind: Option<MediaKind>,
    wrapper_url: Option<&str>,
) -> Decision {
    Decision::Media(MediaCandidate {
        url: url.to_string(),
        kind,
        container,
        media_kind,
        original_url: wrapper_url.map(|s| s.to_string()),
        found_from_query_param: wrapper_url.is_some(),
    })
}
