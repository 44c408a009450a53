//! DASH manifest parsing
//!
//! Streaming walk over the MPD XML: collects the representation ladder,
//! presentation-level metadata, and the static segment path prefixes that
//! feed segment suppression. Variants address their representation through
//! a fragment on the manifest canonical; selection at download time goes
//! through `streamSelection`.

use std::sync::LazyLock;

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use url::Url;

use crate::errors::EnrichError;
use crate::models::{ManifestSubtype, ParserMeta, Variant};

/// Everything a full MPD parse yields.
#[derive(Debug, Default)]
pub struct MpdSummary {
    pub variants: Vec<Variant>,
    pub parser_meta: ParserMeta,
    pub segment_prefixes: Vec<String>,
}

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^P(?:(\d+)D)?T?(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?$")
        .expect("duration pattern is valid")
});

/// Classify an MPD body without a full parse.
pub fn light_classify(body: &str) -> ManifestSubtype {
    if !body.contains("<MPD") {
        return ManifestSubtype::NotAMedia;
    }
    if body.contains("<Representation") {
        return ManifestSubtype::Master;
    }
    ManifestSubtype::Standalone
}

/// Full parse of an MPD document.
pub fn parse_mpd(
    manifest_url: &str,
    manifest_canonical: &str,
    body: &str,
) -> Result<MpdSummary, EnrichError> {
    let mut reader = Reader::from_str(body);
    let mut summary = MpdSummary::default();
    let mut in_video_set = false;
    let mut saw_video = false;
    let mut saw_audio = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                match element.name().as_ref() {
                    b"MPD" => {
                        if let Some(duration) = attr(&element, b"mediaPresentationDuration") {
                            summary.parser_meta.duration = parse_iso_duration(&duration);
                        }
                        if attr(&element, b"type").as_deref() == Some("dynamic") {
                            summary.parser_meta.is_live = true;
                        }
                    }
                    b"AdaptationSet" => {
                        let mime = attr(&element, b"mimeType").unwrap_or_default();
                        let content = attr(&element, b"contentType").unwrap_or_default();
                        in_video_set = mime.starts_with("video") || content == "video";
                        if mime.starts_with("audio") || content == "audio" {
                            saw_audio = true;
                        }
                    }
                    b"Representation" => {
                        let width = attr(&element, b"width").and_then(|v| v.parse().ok());
                        let height = attr(&element, b"height").and_then(|v| v.parse().ok());
                        let codecs = attr(&element, b"codecs");
                        let is_video = in_video_set || width.is_some() || height.is_some();
                        if !is_video {
                            continue;
                        }
                        saw_video = true;
                        let id = attr(&element, b"id").unwrap_or_default();
                        let bandwidth = attr(&element, b"bandwidth").and_then(|v| v.parse().ok());
                        summary.variants.push(Variant {
                            url: manifest_url.to_string(),
                            canonical: format!("{manifest_canonical}#rep-{id}"),
                            bandwidth,
                            width,
                            height,
                            fps: attr(&element, b"frameRate").and_then(parse_frame_rate),
                            codecs: codecs.clone(),
                            parser_meta: Some(ParserMeta {
                                codecs,
                                bandwidth,
                                ..ParserMeta::default()
                            }),
                            probe_meta: None,
                            preview_url: None,
                        });
                    }
                    b"SegmentTemplate" => {
                        for name in [b"media".as_ref(), b"initialization".as_ref()] {
                            if let Some(template) = attr_named(&element, name) {
                                if let Some(prefix) = segment_prefix(manifest_url, &template) {
                                    if !summary.segment_prefixes.contains(&prefix) {
                                        summary.segment_prefixes.push(prefix);
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(element)) => {
                if element.name().as_ref() == b"AdaptationSet" {
                    in_video_set = false;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(EnrichError::manifest_parse(manifest_url, e.to_string()));
            }
        }
    }

    summary.parser_meta.audio_only = !saw_video && saw_audio;
    summary
        .variants
        .sort_by(|a, b| {
            let key = |v: &Variant| (v.height.unwrap_or(0), v.bandwidth.unwrap_or(0));
            key(b).cmp(&key(a))
        });

    Ok(summary)
}

fn attr(element: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    attr_named(element, name)
}

fn attr_named(element: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

/// `"PT1H2M3.5S"` → seconds.
fn parse_iso_duration(value: &str) -> Option<f64> {
    let captures = ISO_DURATION.captures(value.trim())?;
    let days: f64 = captures.get(1).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let hours: f64 = captures.get(2).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let minutes: f64 = captures.get(3).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let seconds: f64 = captures.get(4).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let total = days * 86_400.0 + hours * 3_600.0 + minutes * 60.0 + seconds;
    (total > 0.0).then_some(total)
}

/// `"30000/1001"` or `"29.97"` → fps.
fn parse_frame_rate(value: String) -> Option<f64> {
    if let Some((num, den)) = value.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        return (den > 0.0).then(|| num / den);
    }
    value.parse().ok()
}

/// The static directory part of a segment template, as a URL path prefix.
fn segment_prefix(manifest_url: &str, template: &str) -> Option<String> {
    let static_part = template.split('$').next().unwrap_or_default();
    let directory = &static_part[..=static_part.rfind('/')?];

    if directory.starts_with("http://") || directory.starts_with("https://") {
        return Url::parse(directory).ok().map(|u| u.path().to_string());
    }
    Url::parse(manifest_url)
        .and_then(|base| base.join(directory))
        .ok()
        .map(|resolved| resolved.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT1M30S">
  <Period>
    <AdaptationSet mimeType="video/mp4" segmentAlignment="true">
      <SegmentTemplate media="segments/video_$Number$.mp4" initialization="segments/init_video.mp4"/>
      <Representation id="v1080" codecs="avc1.640028" width="1920" height="1080" frameRate="30000/1001" bandwidth="5000000"/>
      <Representation id="v720" codecs="avc1.4d401f" width="1280" height="720" bandwidth="2500000"/>
    </AdaptationSet>
    <AdaptationSet mimeType="audio/mp4">
      <SegmentTemplate media="audio/seg_$Number$.m4s"/>
      <Representation id="a1" codecs="mp4a.40.2" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn test_light_classification() {
        assert_eq!(light_classify(MPD), ManifestSubtype::Master);
        assert_eq!(light_classify("<MPD></MPD>"), ManifestSubtype::Standalone);
        assert_eq!(light_classify("<html/>"), ManifestSubtype::NotAMedia);
    }

    #[test]
    fn test_parse_representations() {
        let summary = parse_mpd(
            "https://cdn.example.com/dash/v1/manifest.mpd",
            "https://cdn.example.com/dash/v1/manifest.mpd",
            MPD,
        )
        .unwrap();

        assert_eq!(summary.variants.len(), 2);
        assert_eq!(summary.variants[0].height, Some(1080));
        assert_eq!(summary.variants[1].height, Some(720));
        assert_eq!(
            summary.variants[0].canonical,
            "https://cdn.example.com/dash/v1/manifest.mpd#rep-v1080"
        );
        let fps = summary.variants[0].fps.unwrap();
        assert!((fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn test_duration_and_liveness() {
        let summary = parse_mpd(
            "https://cdn.example.com/dash/v1/manifest.mpd",
            "https://cdn.example.com/dash/v1/manifest.mpd",
            MPD,
        )
        .unwrap();
        assert_eq!(summary.parser_meta.duration, Some(90.0));
        assert!(!summary.parser_meta.is_live);

        let live = MPD.replace("type=\"static\"", "type=\"dynamic\"");
        let summary = parse_mpd(
            "https://cdn.example.com/dash/v1/manifest.mpd",
            "https://cdn.example.com/dash/v1/manifest.mpd",
            &live,
        )
        .unwrap();
        assert!(summary.parser_meta.is_live);
    }

    #[test]
    fn test_segment_prefixes() {
        let summary = parse_mpd(
            "https://cdn.example.com/dash/v1/manifest.mpd",
            "https://cdn.example.com/dash/v1/manifest.mpd",
            MPD,
        )
        .unwrap();
        assert!(summary
            .segment_prefixes
            .contains(&"/dash/v1/segments/".to_string()));
        assert!(summary
            .segment_prefixes
            .contains(&"/dash/v1/audio/".to_string()));
    }

    #[test]
    fn test_audio_only_mpd() {
        let audio_only = r#"<MPD type="static"><Period>
            <AdaptationSet mimeType="audio/mp4">
              <Representation id="a1" codecs="mp4a.40.2" bandwidth="128000"/>
            </AdaptationSet></Period></MPD>"#;
        let summary = parse_mpd("https://x/m.mpd", "https://x/m.mpd", audio_only).unwrap();
        assert!(summary.variants.is_empty());
        assert!(summary.parser_meta.audio_only);
    }

    #[test]
    fn test_iso_durations() {
        assert_eq!(parse_iso_duration("PT90S"), Some(90.0));
        assert_eq!(parse_iso_duration("PT1H2M3S"), Some(3723.0));
        assert_eq!(parse_iso_duration("PT0.5S"), Some(0.5));
        assert_eq!(parse_iso_duration("P1DT1S"), Some(86401.0));
        assert_eq!(parse_iso_duration("bogus"), None);
    }
}
