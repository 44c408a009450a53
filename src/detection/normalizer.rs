//! URL canonicalization
//!
//! A stream's identity within a tab is its canonical URL: two URLs that
//! canonicalize identically are the same stream. One algorithm serves every
//! call site. The stripping lists are deliberately conservative — CDN URLs
//! carry signed auth tokens that must survive untouched.

use url::Url;

/// Query parameters that never affect the served content.
const SAFE_STRIP_PARAMS: &[&str] = &[
    "fbclid",
    "gclid",
    "msclkid",
    "_t",
    "_r",
    "cache",
    "_",
    "time",
    "timestamp",
    "random",
    "nonce",
    "cachebuster",
];

/// Origin hosts that identify a known player for blob canonicalization.
const KNOWN_PLAYER_TAGS: &[&str] = &["youtube", "vimeo", "twitch", "dailymotion", "facebook"];

/// Canonicalize a URL for deduplication.
pub fn canonicalize(url: &str) -> String {
    canonicalize_with_mime(url, None)
}

/// Canonicalize with an optional MIME type, which only matters for blob URLs
/// (their identity includes the main media type when known).
pub fn canonicalize_with_mime(url: &str, mime: Option<&str>) -> String {
    let trimmed = url.trim();

    if let Some(rest) = trimmed.strip_prefix("blob:") {
        return canonical_blob(rest, mime);
    }

    let parsed = match Url::parse(trimmed) {
        Ok(parsed) => parsed,
        // Not a parseable absolute URL; identity is the raw string.
        Err(_) => return trimmed.to_string(),
    };

    let origin = render_origin(&parsed);
    let path = trim_trailing_slashes(parsed.path());

    if is_manifest_like(&path) {
        // Manifest URLs collapse to origin + path: session parameters churn
        // on every request and would fragment identity.
        return format!("{origin}{path}");
    }

    let query = parsed.query().map(retain_query).unwrap_or_default();

    if query.is_empty() {
        format!("{origin}{path}")
    } else {
        format!("{origin}{path}?{query}")
    }
}

/// `origin + dirname(path)` for resolving sibling manifest resources.
pub fn base_directory(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(parsed) => {
            let origin = render_origin(&parsed);
            let path = parsed.path();
            let dir = match path.rfind('/') {
                Some(0) | None => "",
                Some(idx) => &path[..idx],
            };
            format!("{origin}{dir}")
        }
        Err(_) => url.trim().to_string(),
    }
}

/// Look for a media URL hidden inside a query-parameter value.
///
/// Tracking pixels wrap the real manifest URL in a parameter; the decoded
/// value must itself look like a URL and name a manifest. Origin-relative
/// values resolve against the wrapper's origin.
pub fn extract_embedded_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let query = parsed.query()?;

    for pair in query.split('&') {
        let value = match pair.split_once('=') {
            Some((_, value)) => value,
            None => continue,
        };
        // One undecodable parameter must not hide an embedded URL in a
        // later one.
        let decoded = match urlencoding::decode(value) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => continue,
        };
        if !decoded.contains(".m3u8") && !decoded.contains(".mpd") {
            continue;
        }
        if decoded.contains("://") || decoded.contains("http") {
            return Some(decoded);
        }
        if decoded.starts_with('/') {
            return Some(format!("{}{}", render_origin(&parsed), decoded));
        }
    }
    None
}

fn canonical_blob(origin_and_uuid: &str, mime: Option<&str>) -> String {
    // blob:https://origin/uuid — identity never crosses origins.
    let origin = match Url::parse(origin_and_uuid) {
        Ok(parsed) => render_origin(&parsed),
        Err(_) => origin_and_uuid
            .split('/')
            .take(3)
            .collect::<Vec<_>>()
            .join("/"),
    };

    let mut canonical = format!("{origin}-blob");
    if let Some(main_type) = mime.and_then(|m| m.split('/').next()).filter(|m| !m.is_empty()) {
        canonical.push('-');
        canonical.push_str(&main_type.to_ascii_lowercase());
    }
    if let Some(tag) = KNOWN_PLAYER_TAGS
        .iter()
        .find(|tag| origin.to_ascii_lowercase().contains(**tag))
    {
        canonical.push('-');
        canonical.push_str(tag);
    }
    canonical
}

fn render_origin(parsed: &Url) -> String {
    let scheme = parsed.scheme();
    let host = parsed.host_str().unwrap_or_default();
    match parsed.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    }
}

fn trim_trailing_slashes(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    trimmed.to_string()
}

fn is_manifest_like(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.contains("/manifest")
        || lower.contains("/playlist")
        || lower.contains("/master.m3u8")
        || lower.contains("/index.m3u8")
        || lower.ends_with("manifest.mpd")
}

/// Keep query pairs whose key survives the safe strip list, preserving the
/// original encoding so canonicalization is idempotent.
fn retain_query(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or(pair);
            let key = key.to_ascii_lowercase();
            !key.starts_with("utm_") && !SAFE_STRIP_PARAMS.contains(&key.as_str())
        })
        .collect::<Vec<_>>()
        .join("&")
}
