//! HLS manifest parsing
//!
//! Light classification runs on the manifest head (a bounded fetch) and
//! only answers "what is this playlist"; the full parse extracts the
//! variant ladder for masters.

use url::Url;

use crate::errors::EnrichError;
use crate::models::{ManifestSubtype, ParserMeta, Variant};

/// Classify a playlist body without fully parsing it.
///
/// Media playlists classify as `variant` — from the manifest alone a child
/// of some master and an independent media playlist look identical; linkage
/// is resolved later if the master shows up.
pub fn light_classify(body: &str) -> ManifestSubtype {
    if !body.contains("#EXTM3U") {
        return ManifestSubtype::NotAMedia;
    }
    if body.contains("#EXT-X-STREAM-INF") {
        return ManifestSubtype::Master;
    }
    if body.contains("#EXTINF") {
        return ManifestSubtype::Variant;
    }
    ManifestSubtype::Standalone
}

/// Parse a master playlist into its variant ladder, highest quality first.
pub fn parse_master(manifest_url: &str, body: &str) -> Result<Vec<Variant>, EnrichError> {
    let (_, master) = m3u8_rs::parse_master_playlist(body.as_bytes())
        .map_err(|e| EnrichError::manifest_parse(manifest_url, format!("{e:?}")))?;

    let mut variants: Vec<Variant> = master
        .variants
        .iter()
        .map(|variant| {
            let absolute = resolve_uri(manifest_url, &variant.uri);
            Variant {
                canonical: crate::detection::canonicalize(&absolute),
                url: absolute,
                bandwidth: Some(variant.bandwidth),
                width: variant.resolution.as_ref().map(|r| r.width as u32),
                height: variant.resolution.as_ref().map(|r| r.height as u32),
                fps: variant.frame_rate,
                codecs: variant.codecs.clone(),
                parser_meta: Some(ParserMeta {
                    codecs: variant.codecs.clone(),
                    bandwidth: Some(variant.bandwidth),
                    audio_only: is_audio_only(variant.codecs.as_deref()),
                    ..ParserMeta::default()
                }),
                probe_meta: None,
                preview_url: None,
            }
        })
        .collect();

    // Index 0 must be the highest quality.
    variants.sort_by(|a, b| {
        let key = |v: &Variant| (v.height.unwrap_or(0), v.bandwidth.unwrap_or(0));
        key(b).cmp(&key(a))
    });

    Ok(variants)
}

/// Parse a media playlist into its summary metadata.
pub fn parse_media(manifest_url: &str, body: &str) -> Result<ParserMeta, EnrichError> {
    let (_, playlist) = m3u8_rs::parse_media_playlist(body.as_bytes())
        .map_err(|e| EnrichError::manifest_parse(manifest_url, format!("{e:?}")))?;

    let duration: f64 = playlist
        .segments
        .iter()
        .map(|segment| segment.duration as f64)
        .sum();

    Ok(ParserMeta {
        duration: (duration > 0.0).then_some(duration),
        segment_count: Some(playlist.segments.len()),
        target_duration: Some(playlist.target_duration as f64),
        is_live: !playlist.end_list,
        ..ParserMeta::default()
    })
}

fn is_audio_only(codecs: Option<&str>) -> bool {
    match codecs {
        Some(codecs) if !codecs.is_empty() => codecs
            .split(',')
            .all(|codec| codec.trim().starts_with("mp4a") || codec.trim().starts_with("opus")),
        _ => false,
    }
}

fn resolve_uri(base: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    match Url::parse(base).and_then(|b| b.join(uri)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => uri.to_string(),
    }
}
