//! Event-source ingestion
//!
//! The browser extension reports three kinds of events: observed HTTP
//! responses, DOM-discovered URLs, and tab lifecycle changes. Ingestion is
//! the only path into the registry: classify, canonicalize, upsert, and
//! kick enrichment for new streams. Nothing here blocks on the network —
//! enrichment and downloads own the slow work.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::SettingsHandle;
use crate::detection::{self, DetectionContext};
use crate::enrichment::EnrichmentPipeline;
use crate::limiter::RateLimiter;
use crate::models::{
    Decision, DiscoverySource, ResponseMeta, Stream, StreamKind, TabId,
};
use crate::registry::{UpsertOutcome, VideoRegistry};
use crate::storage::StateStore;

/// Headers that never get replayed to the helper or manifest fetches.
const BLOCKED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
    "proxy-connection",
    "accept-encoding",
    "range",
    "content-length",
    "content-type",
];

/// Last-seen request headers per tab, replayed on probe and download calls.
#[derive(Clone, Default)]
pub struct HeaderCache {
    tabs: Arc<RwLock<HashMap<TabId, HashMap<String, String>>>>,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tab's request headers, dropping hop-by-hop and managed ones.
    pub async fn record(&self, tab_id: TabId, headers: HashMap<String, String>) {
        let filtered: HashMap<String, String> = headers
            .into_iter()
            .filter(|(name, _)| !BLOCKED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
            .collect();
        if filtered.is_empty() {
            return;
        }
        self.tabs.write().await.insert(tab_id, filtered);
    }

    pub async fn headers_for(&self, tab_id: TabId) -> Option<HashMap<String, String>> {
        self.tabs.read().await.get(&tab_id).cloned()
    }

    pub async fn cleanup(&self, tab_id: TabId) {
        self.tabs.write().await.remove(&tab_id);
    }
}

/// An observed HTTP response from the webRequest boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub tab_id: TabId,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub accept_ranges: Option<String>,
    #[serde(default)]
    pub content_disposition: Option<String>,
    #[serde(default)]
    pub request_headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// A URL reported by the in-page scanner.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomEvent {
    pub tab_id: TabId,
    pub url: String,
    pub source: DiscoverySource,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub poster: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabAction {
    Closed,
    Navigated,
    Suspended,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEvent {
    pub tab_id: TabId,
    pub action: TabAction,
    #[serde(default)]
    pub page_url: Option<String>,
}

/// Turns event-source reports into registry state.
#[derive(Clone)]
pub struct EventIngestor {
    registry: VideoRegistry,
    context: DetectionContext,
    pipeline: EnrichmentPipeline,
    limiter: RateLimiter,
    headers: HeaderCache,
    settings: SettingsHandle,
    store: StateStore,
}

impl EventIngestor {
    pub fn new(
        registry: VideoRegistry,
        context: DetectionContext,
        pipeline: EnrichmentPipeline,
        limiter: RateLimiter,
        headers: HeaderCache,
        settings: SettingsHandle,
        store: StateStore,
    ) -> Self {
        Self {
            registry,
            context,
            pipeline,
            limiter,
            headers,
            settings,
            store,
        }
    }

    pub async fn on_request(&self, event: RequestEvent) {
        if let Some(headers) = event.request_headers.clone() {
            self.headers.record(event.tab_id, headers).await;
        }

        let meta = ResponseMeta {
            content_type: event.content_type.clone(),
            content_length: event.content_length,
            accept_ranges: event.accept_ranges.clone(),
            content_disposition: event.content_disposition.clone(),
            filename: None,
        };
        let source = if event.content_type.is_some() {
            DiscoverySource::WebRequestMime
        } else {
            DiscoverySource::WebRequestUrl
        };

        self.ingest(
            event.tab_id,
            &event.url,
            Some(&meta),
            source,
            event.title.clone(),
            None,
        )
        .await;
    }

    pub async fn on_dom(&self, event: DomEvent) {
        let meta = event.mime.as_ref().map(|mime| ResponseMeta {
            content_type: Some(mime.clone()),
            ..ResponseMeta::default()
        });
        self.ingest(
            event.tab_id,
            &event.url,
            meta.as_ref(),
            event.source,
            event.title.clone(),
            event.poster.clone(),
        )
        .await;
    }

    pub async fn on_tab(&self, event: TabEvent) {
        match event.action {
            TabAction::Closed | TabAction::Navigated => {
                info!("tab {} {:?}: dropping detection state", event.tab_id, event.action);
                self.registry.destroy(event.tab_id).await;
                self.context.cleanup(event.tab_id).await;
                self.limiter.cancel_tab(event.tab_id).await;
                self.headers.cleanup(event.tab_id).await;
                let _ = self.store.remove_scroll_position(event.tab_id).await;
                // Downloads outlive the tab; observers see an empty list.
                self.registry.emit_full_refresh(event.tab_id).await;
            }
            TabAction::Suspended => {
                // Everything durable is already persisted; flush settings so
                // a sleeping machine cannot lose a recent change.
                let settings = self.settings.read().await.clone();
                let _ = self.store.save_settings(&settings).await;
            }
        }
    }

    async fn ingest(
        &self,
        tab_id: TabId,
        url: &str,
        meta: Option<&ResponseMeta>,
        source: DiscoverySource,
        title: Option<String>,
        poster: Option<String>,
    ) {
        let hints = self.context.hints_for(tab_id).await;
        let min_file_size = self.settings.read().await.min_file_size_filter;

        let candidate = match detection::classify(url, meta, &hints, min_file_size) {
            Decision::Media(candidate) => candidate,
            Decision::Segment => {
                debug!("suppressed segment for tab {tab_id}: {url}");
                return;
            }
            Decision::Ignored => return,
        };

        if candidate.kind == StreamKind::Dash {
            self.context.mark_mpd(tab_id, Utc::now()).await;
        }

        let mime = meta.and_then(|m| m.content_type.as_deref());
        let canonical = detection::canonicalize_with_mime(&candidate.url, mime);

        let mut stream = Stream::from_candidate(candidate, canonical, tab_id, source);
        stream.title = title;
        stream.poster = poster;

        let snapshot = stream.clone();
        let outcome = self.registry.upsert(tab_id, stream).await;
        if outcome == UpsertOutcome::New {
            info!(
                "new {} stream in tab {tab_id}: {}",
                snapshot.kind.as_str(),
                snapshot.canonical
            );
            self.pipeline.spawn(snapshot);
        }
    }
}
