//! Enrichment pipeline
//!
//! Drives each discovered stream through its stages: manifests get a light
//! parse (head fetch + classification), masters get a full parse and a
//! sequential per-variant probe with a preview on the top variant; direct
//! and unknown streams get a probe and a preview. All helper calls flow
//! through the rate limiter tagged with the owning tab, so closing the tab
//! drops queued work. Stage failures are local: the stream keeps whatever
//! it has earned so far.

pub mod dash;
pub mod hls;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SettingsHandle;
use crate::detection::DetectionContext;
use crate::errors::EnrichError;
use crate::events::HeaderCache;
use crate::helper::HelperApi;
use crate::limiter::RateLimiter;
use crate::models::{ManifestSubtype, ProbeMeta, Stream, StreamKind, TabId, Variant};
use crate::registry::VideoRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StageKind {
    LightParse,
    Probe,
    Preview,
}

type ProcessingKey = (TabId, String, StageKind);

#[derive(Clone)]
pub struct EnrichmentPipeline {
    registry: VideoRegistry,
    context: DetectionContext,
    limiter: RateLimiter,
    helper: Arc<dyn HelperApi>,
    http: reqwest::Client,
    settings: SettingsHandle,
    headers: HeaderCache,
    processing: Arc<Mutex<HashSet<ProcessingKey>>>,
    manifest_head_bytes: usize,
}

impl EnrichmentPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: VideoRegistry,
        context: DetectionContext,
        limiter: RateLimiter,
        helper: Arc<dyn HelperApi>,
        settings: SettingsHandle,
        headers: HeaderCache,
        manifest_head_bytes: usize,
    ) -> Self {
        Self {
            registry,
            context,
            limiter,
            helper,
            http: reqwest::Client::new(),
            settings,
            headers,
            processing: Arc::new(Mutex::new(HashSet::new())),
            manifest_head_bytes,
        }
    }

    /// Fire-and-forget enrichment of a newly registered stream.
    pub fn spawn(&self, stream: Stream) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.enrich(stream).await;
        });
    }

    pub async fn enrich(&self, stream: Stream) {
        match stream.kind {
            StreamKind::Blob => self.enrich_blob(stream).await,
            StreamKind::Hls | StreamKind::Dash => self.enrich_manifest(stream).await,
            StreamKind::Direct | StreamKind::Unknown => self.enrich_direct(stream).await,
        }
    }

    /// Generate (or regenerate) a preview for one stream on UI request.
    pub async fn generate_preview(&self, tab_id: TabId, url: &str) -> Result<String, EnrichError> {
        let canonical = crate::detection::canonicalize(url);
        let key = (tab_id, canonical.clone(), StageKind::Preview);
        if !self.begin(key.clone()).await {
            return Err(EnrichError::StreamGone {
                url: url.to_string(),
            });
        }
        let result = self.run_preview(tab_id, url).await;
        self.finish(&key).await;

        if let Ok(preview_url) = &result {
            let preview_url = preview_url.clone();
            self.registry
                .update_stream(tab_id, &canonical, |s| s.preview_url = Some(preview_url))
                .await;
        }
        result
    }

    async fn enrich_blob(&self, stream: Stream) {
        self.registry
            .update_stream(stream.tab_id, &stream.canonical, |s| {
                s.fully_parsed = true;
                s.probe_meta = Some(ProbeMeta {
                    format: Some("blob".to_string()),
                    has_video: true,
                    ..ProbeMeta::default()
                });
            })
            .await;
    }

    async fn enrich_manifest(&self, stream: Stream) {
        let key = (
            stream.tab_id,
            stream.canonical.clone(),
            StageKind::LightParse,
        );
        if !self.begin(key.clone()).await {
            debug!("light parse already running for {}", stream.canonical);
            return;
        }
        let subtype = self.light_parse(&stream).await;
        self.finish(&key).await;

        if subtype == Some(ManifestSubtype::Master) {
            self.full_parse_and_probe(&stream).await;
        }
    }

    /// Head fetch + classification. Returns the subtype, or None when the
    /// stream disappeared under us.
    async fn light_parse(&self, stream: &Stream) -> Option<ManifestSubtype> {
        let headers = self.headers.headers_for(stream.tab_id).await;
        let body = self
            .fetch_manifest(&stream.url, &headers, Some(self.manifest_head_bytes))
            .await;

        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!("manifest head fetch failed for {}: {e}", stream.url);
                self.registry
                    .update_stream(stream.tab_id, &stream.canonical, |s| {
                        s.light_parsed = true;
                        s.subtype = Some(ManifestSubtype::FetchFailed);
                    })
                    .await;
                return Some(ManifestSubtype::FetchFailed);
            }
        };

        let subtype = match stream.kind {
            StreamKind::Hls => hls::light_classify(&body),
            _ => dash::light_classify(&body),
        };

        // Media playlists already tell us their shape; keep it.
        let parser_meta = match (stream.kind, subtype) {
            (StreamKind::Hls, ManifestSubtype::Variant | ManifestSubtype::Standalone) => {
                hls::parse_media(&stream.url, &body).ok()
            }
            _ => None,
        };

        let updated = self
            .registry
            .update_stream(stream.tab_id, &stream.canonical, |s| {
                s.light_parsed = true;
                s.subtype = Some(subtype);
                if let Some(meta) = parser_meta {
                    s.parser_meta = Some(meta);
                }
            })
            .await;
        updated.then_some(subtype)
    }

    /// Full manifest parse, variant registration, sequential probes.
    async fn full_parse_and_probe(&self, stream: &Stream) {
        let headers = self.headers.headers_for(stream.tab_id).await;
        let body = match self.fetch_manifest(&stream.url, &headers, None).await {
            Ok(body) => body,
            Err(e) => {
                warn!("manifest fetch failed for {}: {e}", stream.url);
                self.registry
                    .update_stream(stream.tab_id, &stream.canonical, |s| {
                        s.subtype = Some(ManifestSubtype::FetchFailed);
                    })
                    .await;
                return;
            }
        };

        let variants = match stream.kind {
            StreamKind::Hls => match hls::parse_master(&stream.url, &body) {
                Ok(variants) => variants,
                Err(e) => {
                    warn!("master parse failed for {}: {e}", stream.url);
                    return;
                }
            },
            _ => {
                let summary =
                    match dash::parse_mpd(&stream.url, &stream.canonical, &body) {
                        Ok(summary) => summary,
                        Err(e) => {
                            warn!("mpd parse failed for {}: {e}", stream.url);
                            return;
                        }
                    };
                self.context
                    .add_segment_prefixes(Some(stream.tab_id), &summary.segment_prefixes)
                    .await;
                let parser_meta = summary.parser_meta;
                self.registry
                    .update_stream(stream.tab_id, &stream.canonical, |s| {
                        s.parser_meta = Some(parser_meta);
                    })
                    .await;
                summary.variants
            }
        };

        if variants.is_empty() {
            debug!("master {} listed no variants", stream.canonical);
            return;
        }

        self.registry
            .attach_variants(stream.tab_id, &stream.canonical, variants.clone())
            .await;

        self.probe_variants(stream, &variants, headers).await;
    }

    /// Probe every variant in ladder order, one at a time. The top variant
    /// also gets the preview; masters themselves are not media files.
    async fn probe_variants(
        &self,
        stream: &Stream,
        variants: &[Variant],
        headers: Option<HashMap<String, String>>,
    ) {
        for (index, variant) in variants.iter().enumerate() {
            let key = (stream.tab_id, variant.canonical.clone(), StageKind::Probe);
            if !self.begin(key.clone()).await {
                continue;
            }
            let probe = self
                .run_probe(stream.tab_id, &variant.url, headers.clone())
                .await;
            self.finish(&key).await;

            match probe {
                Ok(meta) => {
                    let alive = self
                        .registry
                        .update_variant(stream.tab_id, &stream.canonical, index, |v| {
                            v.probe_meta = Some(meta)
                        })
                        .await;
                    if !alive {
                        return;
                    }
                }
                Err(EnrichError::StreamGone { .. }) => return,
                Err(EnrichError::Probe { source, .. }) if source.is_retryable() => {
                    debug!(
                        "variant probe skipped for {}: helper unavailable ({source})",
                        variant.url
                    );
                    continue;
                }
                Err(e) => {
                    warn!("variant probe failed for {}: {e}", variant.url);
                    continue;
                }
            }

            if index == 0 && self.settings.read().await.auto_generate_previews {
                let key = (stream.tab_id, variant.canonical.clone(), StageKind::Preview);
                if !self.begin(key.clone()).await {
                    continue;
                }
                let preview = self.run_preview(stream.tab_id, &variant.url).await;
                self.finish(&key).await;
                match preview {
                    Ok(preview_url) => {
                        self.registry
                            .update_variant(stream.tab_id, &stream.canonical, index, |v| {
                                v.preview_url = Some(preview_url)
                            })
                            .await;
                    }
                    Err(e) => warn!("preview failed for {}: {e}", variant.url),
                }
            }
        }
    }

    async fn enrich_direct(&self, stream: Stream) {
        let key = (stream.tab_id, stream.canonical.clone(), StageKind::Probe);
        if !self.begin(key.clone()).await {
            debug!("probe already running for {}", stream.canonical);
            return;
        }
        let headers = self.headers.headers_for(stream.tab_id).await;
        let probe = self.run_probe(stream.tab_id, &stream.url, headers).await;
        self.finish(&key).await;

        let meta = match probe {
            Ok(meta) => meta,
            Err(EnrichError::StreamGone { .. }) => return,
            Err(EnrichError::Probe { source, .. }) if source.is_retryable() => {
                debug!(
                    "probe skipped for {}: helper unavailable ({source})",
                    stream.url
                );
                return;
            }
            Err(e) => {
                warn!("probe failed for {}: {e}", stream.url);
                return;
            }
        };

        let alive = self
            .registry
            .update_stream(stream.tab_id, &stream.canonical, |s| {
                s.probe_meta = Some(meta);
                s.fully_parsed = true;
            })
            .await;
        if !alive {
            return;
        }

        if self.settings.read().await.auto_generate_previews {
            let key = (stream.tab_id, stream.canonical.clone(), StageKind::Preview);
            if !self.begin(key.clone()).await {
                return;
            }
            let preview = self.run_preview(stream.tab_id, &stream.url).await;
            self.finish(&key).await;
            match preview {
                Ok(preview_url) => {
                    self.registry
                        .update_stream(stream.tab_id, &stream.canonical, |s| {
                            s.preview_url = Some(preview_url)
                        })
                        .await;
                }
                Err(e) => warn!("preview failed for {}: {e}", stream.url),
            }
        }
    }

    async fn run_probe(
        &self,
        tab_id: TabId,
        url: &str,
        headers: Option<HashMap<String, String>>,
    ) -> Result<ProbeMeta, EnrichError> {
        let helper = self.helper.clone();
        let url_owned = url.to_string();
        let result = self
            .limiter
            .enqueue(Some(tab_id), move || async move {
                helper.probe(&url_owned, headers, false).await
            })
            .await;

        match result {
            Err(_) => Err(EnrichError::StreamGone {
                url: url.to_string(),
            }),
            Ok(Err(source)) => Err(EnrichError::Probe {
                url: url.to_string(),
                source,
            }),
            Ok(Ok(meta)) => Ok(meta),
        }
    }

    async fn run_preview(&self, tab_id: TabId, url: &str) -> Result<String, EnrichError> {
        let headers = self.headers.headers_for(tab_id).await;
        let helper = self.helper.clone();
        let url_owned = url.to_string();
        let result = self
            .limiter
            .enqueue(Some(tab_id), move || async move {
                helper.generate_preview(&url_owned, headers).await
            })
            .await;

        match result {
            Err(_) => Err(EnrichError::StreamGone {
                url: url.to_string(),
            }),
            Ok(Err(source)) => Err(EnrichError::Probe {
                url: url.to_string(),
                source,
            }),
            Ok(Ok(preview_url)) => Ok(preview_url),
        }
    }

    async fn fetch_manifest(
        &self,
        url: &str,
        headers: &Option<HashMap<String, String>>,
        head_bytes: Option<usize>,
    ) -> Result<String, EnrichError> {
        let mut request = self.http.get(url);
        if let Some(headers) = headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        if let Some(cap) = head_bytes {
            request = request.header(reqwest::header::RANGE, format!("bytes=0-{}", cap - 1));
        }

        let response = request
            .send()
            .await
            .map_err(|e| EnrichError::manifest_fetch(url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(EnrichError::manifest_fetch(
                url,
                format!("status {}", response.status()),
            ));
        }

        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| EnrichError::manifest_fetch(url, e.to_string()))?;
            body.extend_from_slice(&chunk);
            if let Some(cap) = head_bytes {
                if body.len() >= cap {
                    break;
                }
            }
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn begin(&self, key: ProcessingKey) -> bool {
        self.processing.lock().await.insert(key)
    }

    async fn finish(&self, key: &ProcessingKey) {
        self.processing.lock().await.remove(key);
    }
}
