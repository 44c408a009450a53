//! Web layer
//!
//! The daemon's whole runtime surface: the extension posts events here and
//! popup observers attach over WebSocket. Handlers are thin; everything
//! interesting lives in the components wired into [`AppState`].

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use crate::{
    config::{Config, SettingsHandle},
    detection::DetectionContext,
    downloads::{history::HistoryService, DownloadOrchestrator},
    enrichment::EnrichmentPipeline,
    events::{EventIngestor, HeaderCache},
    fanout::{FanOut, InboundMessage, OutboundMessage, UpdateAction},
    helper::HelperApi,
    limiter::RateLimiter,
    platform::PlatformServices,
    registry::VideoRegistry,
    storage::StateStore,
};

pub mod handlers;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub settings: SettingsHandle,
    pub store: StateStore,
    pub helper: Arc<dyn HelperApi>,
    pub limiter: RateLimiter,
    pub fanout: FanOut,
    pub registry: VideoRegistry,
    pub context: DetectionContext,
    pub headers: HeaderCache,
    pub pipeline: EnrichmentPipeline,
    pub downloads: DownloadOrchestrator,
    pub ingestor: EventIngestor,
    pub platform: Arc<dyn PlatformServices>,
}

impl AppState {
    /// Wire every component in initialization order: settings, helper,
    /// limiter, registry, detection context, orchestrator, fan-out surface.
    pub async fn assemble(
        config: Config,
        helper: Arc<dyn HelperApi>,
        platform: Arc<dyn PlatformServices>,
    ) -> Result<Self> {
        let store = StateStore::new(&config.storage.database_url).await?;
        let settings: SettingsHandle =
            Arc::new(tokio::sync::RwLock::new(store.load_settings().await?));

        let limiter = RateLimiter::new(
            config.limits.max_concurrent_probes,
            tokio::time::Duration::from_millis(config.limits.min_probe_interval_ms),
        );

        let fanout = FanOut::new();
        let registry = VideoRegistry::new(fanout.clone());
        let context = DetectionContext::new();
        let headers = HeaderCache::new();

        let history = HistoryService::new(store.clone(), settings.clone());
        history.spawn_sweeper();

        let downloads = DownloadOrchestrator::new(
            helper.clone(),
            store.clone(),
            history,
            fanout.clone(),
            settings.clone(),
            headers.clone(),
            platform.clone(),
        );
        downloads.restore().await?;

        let pipeline = EnrichmentPipeline::new(
            registry.clone(),
            context.clone(),
            limiter.clone(),
            helper.clone(),
            settings.clone(),
            headers.clone(),
            config.limits.manifest_head_bytes,
        );

        let ingestor = EventIngestor::new(
            registry.clone(),
            context.clone(),
            pipeline.clone(),
            limiter.clone(),
            headers.clone(),
            settings.clone(),
            store.clone(),
        );

        // Push helper connection edges to every observer.
        {
            let fanout = fanout.clone();
            let mut connection_state = helper.connection_state();
            tokio::spawn(async move {
                while connection_state.changed().await.is_ok() {
                    let connected = *connection_state.borrow();
                    fanout
                        .broadcast(OutboundMessage::NativeHostConnectionState { connected })
                        .await;
                }
            });
        }

        Ok(Self {
            config,
            settings,
            store,
            helper,
            limiter,
            fanout,
            registry,
            context,
            headers,
            pipeline,
            downloads,
            ingestor,
            platform,
        })
    }

    /// Dispatch one observer command.
    pub async fn handle_message(&self, port_id: &str, message: InboundMessage) {
        match message {
            InboundMessage::Register { .. } => {
                // Registration happens during the socket handshake.
                debug!("late register from {port_id} ignored");
            }
            InboundMessage::GetVideos { tab_id } => {
                let Some(tab_id) = tab_id else {
                    debug!("getVideos without tabId from {port_id}");
                    return;
                };
                let videos = self.registry.visible_streams(tab_id).await;
                self.fanout
                    .send_to(
                        port_id,
                        OutboundMessage::VideosStateUpdate {
                            action: UpdateAction::FullRefresh,
                            tab_id,
                            video_url: None,
                            video: None,
                            videos: Some(videos),
                        },
                    )
                    .await;
            }
            InboundMessage::Download { request } => {
                self.downloads.start(request, Some(port_id)).await;
            }
            InboundMessage::CancelDownload { download_id } => {
                self.downloads.cancel(&download_id).await;
            }
            InboundMessage::GeneratePreview { url, tab_id } => {
                let pipeline = self.pipeline.clone();
                let tab_id = tab_id.unwrap_or_default();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.generate_preview(tab_id, &url).await {
                        warn!("preview request failed for {url}: {e}");
                    }
                });
            }
            InboundMessage::GetPreviewCacheStats => {
                let (entries, tabs) = self.registry.preview_cache_stats().await;
                self.fanout
                    .send_to(port_id, OutboundMessage::PreviewCacheStats { entries, tabs })
                    .await;
            }
            InboundMessage::ClearCaches => {
                self.registry.clear_previews().await;
                self.fanout
                    .send_to(port_id, OutboundMessage::CachesCleared)
                    .await;
            }
            InboundMessage::GetActiveDownloads => {
                let downloads = self.downloads.active_downloads().await;
                let history = self.downloads.history_entries().await;
                self.fanout
                    .send_to(
                        port_id,
                        OutboundMessage::ActiveDownloadsData { downloads, history },
                    )
                    .await;
            }
            InboundMessage::GetSettings => {
                let settings = self.settings.read().await.clone();
                self.fanout
                    .send_to(port_id, OutboundMessage::SettingsState { settings })
                    .await;
            }
            InboundMessage::UpdateSettings { settings: update } => {
                let merged = self.settings.read().await.merged_with(&update);
                *self.settings.write().await = merged.clone();
                if let Err(e) = self.store.save_settings(&merged).await {
                    warn!("failed to persist settings: {e}");
                }
                self.fanout
                    .broadcast(OutboundMessage::SettingsState { settings: merged })
                    .await;
            }
            InboundMessage::ChooseSavePath => {
                if let Some(path) = self.platform.choose_save_path().await {
                    let updated = {
                        let mut settings = self.settings.write().await;
                        settings.default_save_path = Some(path);
                        settings.clone()
                    };
                    if let Err(e) = self.store.save_settings(&updated).await {
                        warn!("failed to persist settings: {e}");
                    }
                    self.fanout
                        .broadcast(OutboundMessage::SettingsState { settings: updated })
                        .await;
                } else {
                    let settings = self.settings.read().await.clone();
                    self.fanout
                        .send_to(port_id, OutboundMessage::SettingsState { settings })
                        .await;
                }
            }
            InboundMessage::SaveScrollPosition { tab_id, position } => {
                if let Err(e) = self.store.save_scroll_position(tab_id, position).await {
                    warn!("failed to persist scroll position: {e}");
                }
            }
        }
    }
}

/// Web server configuration and setup.
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

/// Build the daemon's router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Event source boundary
        .route("/events/request", post(handlers::request_event))
        .route("/events/dom", post(handlers::dom_event))
        .route("/events/tab", post(handlers::tab_event))
        // Observer transport
        .route("/ws", get(handlers::observer_socket))
        // The extension connects from its own origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.config.web.host, state.config.web.port).parse()?;
        let app = router(state);
        Ok(Self { app, addr })
    }

    /// Serve until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}
