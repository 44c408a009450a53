//! Download orchestration
//!
//! Owns the active-download map (keyed by download URL for duplicate
//! suppression), the FIFO promotion queue behind the concurrency cap, the
//! progress relay from the helper to every observer, cancellation, the
//! one-shot webm codec fallback, persistence of active snapshots, and
//! restoration after a restart. Downloads outlive their tab; only an
//! explicit cancel stops one.

pub mod history;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SettingsHandle;
use crate::errors::HelperError;
use crate::events::HeaderCache;
use crate::fanout::{DownloadCommand, DownloadProgressPayload, FanOut, OutboundMessage};
use crate::helper::{HelperApi, HelperDownloadRequest, ProgressFrame};
use crate::models::{Download, DownloadKind, DownloadStats, DownloadStatus, HistoryEntry};
use crate::platform::PlatformServices;
use crate::storage::StateStore;
use history::HistoryService;

/// How long terminal downloads stay in the active map so late observers
/// still see the terminal state.
const TERMINAL_RETENTION: Duration = Duration::from_secs(10);

/// Helper error text that triggers the one-shot webm fallback.
const CODEC_FALLBACK_MARKER: &str = "codec not currently supported in container";

struct ActiveEntry {
    download: Download,
    command: DownloadCommand,
}

#[derive(Default)]
struct ActiveState {
    /// Keyed by download URL; one entry per URL at a time.
    downloads: HashMap<String, ActiveEntry>,
    /// Download URLs waiting for a slot, in arrival order.
    queue: VecDeque<String>,
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    helper: Arc<dyn HelperApi>,
    store: StateStore,
    history: HistoryService,
    fanout: FanOut,
    settings: SettingsHandle,
    headers: HeaderCache,
    platform: Arc<dyn PlatformServices>,
    state: Arc<Mutex<ActiveState>>,
}

impl DownloadOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        helper: Arc<dyn HelperApi>,
        store: StateStore,
        history: HistoryService,
        fanout: FanOut,
        settings: SettingsHandle,
        headers: HeaderCache,
        platform: Arc<dyn PlatformServices>,
    ) -> Self {
        Self {
            helper,
            store,
            history,
            fanout,
            settings,
            headers,
            platform,
            state: Arc::new(Mutex::new(ActiveState::default())),
        }
    }

    /// Reload persisted active snapshots after a restart.
    ///
    /// The helper is not contacted: any of its processes that survived will
    /// report their own progress once reconnected.
    pub async fn restore(&self) -> Result<(), crate::errors::StorageError> {
        let snapshots = self.store.load_active_downloads().await?;
        if snapshots.is_empty() {
            return Ok(());
        }
        info!("restored {} active download snapshots", snapshots.len());
        let mut state = self.state.lock().await;
        for download in snapshots {
            let command = restored_command(&download);
            state.downloads.insert(
                download.download_url.clone(),
                ActiveEntry { download, command },
            );
        }
        Ok(())
    }

    /// Handle a UI `download` command.
    ///
    /// A second command for an already-active URL does not start anything:
    /// the requesting observer just receives the current progress.
    pub async fn start(&self, command: DownloadCommand, requester: Option<&str>) {
        let download_url = command.download_url.clone();

        let existing = {
            let state = self.state.lock().await;
            state
                .downloads
                .get(&download_url)
                .filter(|entry| !entry.download.status.is_terminal())
                .map(|entry| entry.download.clone())
        };
        if let Some(current) = existing {
            debug!("duplicate download command for {download_url}");
            if let Some(port_id) = requester {
                self.fanout
                    .send_to(port_id, OutboundMessage::DownloadProgress(progress_payload(&current)))
                    .await;
            }
            return;
        }

        let now = Utc::now();
        let download_id = Uuid::new_v4().to_string();
        let download = Download {
            download_id: download_id.clone(),
            download_url: download_url.clone(),
            master_url: command.master_url.clone(),
            tab_id: command.tab_id,
            filename: command.filename.clone(),
            kind: command.kind,
            status: DownloadStatus::Queued,
            progress: 0.0,
            speed: None,
            eta: None,
            current_segment: None,
            total_segments: None,
            downloaded_bytes: None,
            total_bytes: None,
            started_at: now,
            updated_at: now,
            selected_option_orig_text: command.selected_option_orig_text.clone(),
            notification_id: Some(format!("dl-{download_id}")),
            saved_path: None,
            error: None,
            video_data_snapshot: command.video_data_snapshot.clone(),
        };

        let start_now = {
            let mut state = self.state.lock().await;
            state.downloads.insert(
                download_url.clone(),
                ActiveEntry {
                    download: download.clone(),
                    command,
                },
            );
            let cap = self.settings.read().await.max_concurrent_downloads as usize;
            if running_count(&state) < cap {
                true
            } else {
                state.queue.push_back(download_url.clone());
                false
            }
        };

        let _ = self.store.upsert_active_download(&download).await;
        self.fanout
            .broadcast(OutboundMessage::DownloadQueued {
                download: download.clone(),
            })
            .await;
        self.broadcast_count().await;

        if start_now {
            self.spawn_transfer(download_url);
        }
    }

    /// Handle a UI `cancel-download` command.
    pub async fn cancel(&self, download_id: &str) {
        let target = {
            let mut state = self.state.lock().await;
            let entry = state
                .downloads
                .values_mut()
                .find(|entry| entry.download.download_id == download_id);
            match entry {
                Some(entry) if !entry.download.status.is_terminal() => {
                    let was_queued = entry.download.status == DownloadStatus::Queued;
                    entry.download.status = DownloadStatus::Stopping;
                    entry.download.updated_at = Utc::now();
                    Some((entry.download.clone(), was_queued))
                }
                _ => None,
            }
        };

        let Some((download, was_queued)) = target else {
            warn!("cancel for unknown download {download_id}");
            return;
        };

        let _ = self.store.upsert_active_download(&download).await;
        self.fanout
            .broadcast(OutboundMessage::DownloadStopping {
                download_id: download.download_id.clone(),
                download_url: download.download_url.clone(),
            })
            .await;

        if was_queued {
            // Never reached the helper; finish the cancel locally.
            {
                let mut state = self.state.lock().await;
                state.queue.retain(|url| url != &download.download_url);
            }
            self.finish_canceled(&download.download_url).await;
            return;
        }

        if let Err(e) = self.helper.cancel_download(download_id).await {
            warn!("helper cancel failed for {download_id}: {e}");
        }
        // The terminal frame of the streaming download call completes the
        // cancel; see on_terminal.
    }

    /// Snapshot of the active map for `getActiveDownloads`.
    pub async fn active_downloads(&self) -> Vec<Download> {
        let state = self.state.lock().await;
        let mut downloads: Vec<Download> = state
            .downloads
            .values()
            .map(|entry| entry.download.clone())
            .collect();
        downloads.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        downloads
    }

    pub async fn history_entries(&self) -> Vec<HistoryEntry> {
        self.history.entries().await
    }

    fn spawn_transfer(&self, download_url: String) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_transfer(download_url, false).await;
        });
    }

    fn run_transfer(
        &self,
        download_url: String,
        is_retry: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        // A cancel may have landed between promotion and this point.
        let launch = {
            let mut state = self.state.lock().await;
            match state.downloads.get_mut(&download_url) {
                None => None,
                Some(entry) if entry.download.status == DownloadStatus::Stopping => {
                    Some(Err(()))
                }
                Some(entry) if entry.download.status.is_terminal() => None,
                Some(entry) => {
                    entry.download.status = DownloadStatus::Downloading;
                    entry.download.updated_at = Utc::now();
                    Some(Ok((entry.download.clone(), entry.command.clone())))
                }
            }
        };
        let (download, command) = match launch {
            Some(Ok(launched)) => launched,
            Some(Err(())) => {
                self.finish_canceled(&download_url).await;
                return;
            }
            None => return,
        };

        let _ = self.store.upsert_active_download(&download).await;
        if !is_retry {
            self.fanout
                .broadcast(OutboundMessage::DownloadStarted {
                    download: download.clone(),
                })
                .await;
            self.notify(&download, "Download started", &download.filename)
                .await;
        }

        let filename = if is_retry {
            force_webm_extension(&command.filename)
        } else {
            command.filename.clone()
        };
        let save_path = match command.save_path.clone() {
            Some(path) => Some(path),
            None => self.settings.read().await.default_save_path.clone(),
        };
        let request = HelperDownloadRequest {
            download_id: download.download_id.clone(),
            download_url: download_url.clone(),
            filename,
            save_path,
            kind: command.kind,
            preferred_container: command.preferred_container.clone(),
            original_container: command.original_container.clone(),
            audio_only: command.audio_only,
            stream_selection: command.stream_selection.clone(),
            master_url: command.master_url.clone(),
            duration: command.duration,
            headers: self.headers.headers_for(command.tab_id).await,
        };

        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressFrame>(64);
        let relay = {
            let orchestrator = self.clone();
            let url = download_url.clone();
            tokio::spawn(async move {
                let mut last_notified_decile = 0u8;
                while let Some(frame) = progress_rx.recv().await {
                    orchestrator
                        .apply_progress(&url, frame, &mut last_notified_decile)
                        .await;
                }
            })
        };

        let result = self.helper.download(request, progress_tx).await;
        let _ = relay.await;
        self.on_terminal(download_url, result, is_retry).await;
        })
    }

    async fn apply_progress(
        &self,
        download_url: &str,
        frame: ProgressFrame,
        last_notified_decile: &mut u8,
    ) {
        let download = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.downloads.get_mut(download_url) else {
                return;
            };
            let d = &mut entry.download;
            d.progress = frame.progress.clamp(0.0, 100.0);
            d.speed = frame.speed.or(d.speed);
            d.eta = frame.eta.or(d.eta);
            d.current_segment = frame.current_segment.or(d.current_segment);
            d.total_segments = frame.total_segments.or(d.total_segments);
            d.downloaded_bytes = frame.downloaded.or(d.downloaded_bytes);
            d.total_bytes = frame.size.or(d.total_bytes);
            d.updated_at = Utc::now();
            d.clone()
        };

        let _ = self.store.upsert_active_download(&download).await;
        self.fanout
            .broadcast(OutboundMessage::DownloadProgress(progress_payload(&download)))
            .await;

        let decile = (download.progress / 10.0) as u8;
        if decile > *last_notified_decile && download.progress < 100.0 {
            *last_notified_decile = decile;
            self.notify(
                &download,
                "Downloading",
                &format!("{}: {:.0}%", download.filename, download.progress),
            )
            .await;
        }
    }

    async fn on_terminal(
        &self,
        download_url: String,
        result: Result<String, HelperError>,
        is_retry: bool,
    ) {
        let (download, command, stopping) = {
            let state = self.state.lock().await;
            let Some(entry) = state.downloads.get(&download_url) else {
                return;
            };
            (
                entry.download.clone(),
                entry.command.clone(),
                entry.download.status == DownloadStatus::Stopping,
            )
        };

        if stopping {
            self.finish_canceled(&download_url).await;
            return;
        }

        match result {
            Ok(path) => {
                let finished = self
                    .mark_terminal(&download_url, DownloadStatus::Completed, |d| {
                        d.progress = 100.0;
                        d.saved_path = (!path.is_empty()).then(|| path.clone());
                    })
                    .await;
                if let Some(finished) = finished {
                    self.append_history(&finished, &command).await;
                    self.notify(&finished, "Download complete", &finished.filename)
                        .await;
                    self.fanout
                        .broadcast(OutboundMessage::DownloadSuccess { download: finished })
                        .await;
                }
            }
            Err(HelperError::Command { ref message })
                if !is_retry
                    && message.contains(CODEC_FALLBACK_MARKER)
                    && download.kind == DownloadKind::Direct
                    && download_url.split('?').next().unwrap_or("").ends_with(".webm") =>
            {
                info!("retrying {download_url} with .webm container");
                let orchestrator = self.clone();
                let retry_fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
                    Box::pin(async move {
                        orchestrator.run_transfer(download_url, true).await;
                    });
                tokio::spawn(retry_fut);
                return;
            }
            Err(e) => {
                let message = e.to_string();
                let finished = self
                    .mark_terminal(&download_url, DownloadStatus::Error, |d| {
                        d.error = Some(message.clone());
                    })
                    .await;
                if let Some(finished) = finished {
                    self.append_history(&finished, &command).await;
                    self.notify(
                        &finished,
                        "Download failed",
                        finished.error.as_deref().unwrap_or("unknown error"),
                    )
                    .await;
                    self.fanout
                        .broadcast(OutboundMessage::DownloadError { download: finished })
                        .await;
                }
            }
        }

        self.schedule_removal(download_url.clone());
        self.promote_next().await;
    }

    async fn finish_canceled(&self, download_url: &str) {
        let finished = self
            .mark_terminal(download_url, DownloadStatus::Canceled, |_| {})
            .await;
        if let Some(finished) = finished {
            // Canceled downloads never reach history.
            self.fanout
                .broadcast(OutboundMessage::DownloadCanceled {
                    download_id: finished.download_id.clone(),
                    download_url: finished.download_url.clone(),
                })
                .await;
        }
        self.schedule_removal(download_url.to_string());
        self.promote_next().await;
    }

    async fn mark_terminal<F>(
        &self,
        download_url: &str,
        status: DownloadStatus,
        mutate: F,
    ) -> Option<Download>
    where
        F: FnOnce(&mut Download),
    {
        let download = {
            let mut state = self.state.lock().await;
            let entry = state.downloads.get_mut(download_url)?;
            entry.download.status = status;
            entry.download.updated_at = Utc::now();
            mutate(&mut entry.download);
            entry.download.clone()
        };
        let _ = self.store.upsert_active_download(&download).await;
        self.broadcast_count().await;
        Some(download)
    }

    async fn append_history(&self, download: &Download, command: &DownloadCommand) {
        let entry = HistoryEntry {
            download: download.clone(),
            completed_at: Utc::now(),
            page_url: command.page_url.clone(),
            page_favicon: command.page_favicon.clone(),
            download_stats: Some(DownloadStats {
                video_size: None,
                audio_size: None,
                total_size: download.total_bytes.or(download.downloaded_bytes),
            }),
            duration: command.duration,
        };
        if let Err(e) = self.history.record(&entry).await {
            warn!("failed to record history for {}: {e}", download.download_id);
        }
    }

    /// Keep the terminal entry visible briefly, then drop it everywhere.
    fn schedule_removal(&self, download_url: String) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            sleep(TERMINAL_RETENTION).await;
            let removed = {
                let mut state = orchestrator.state.lock().await;
                match state.downloads.get(&download_url) {
                    Some(entry) if entry.download.status.is_terminal() => {
                        let id = entry.download.download_id.clone();
                        state.downloads.remove(&download_url);
                        Some(id)
                    }
                    _ => None,
                }
            };
            if let Some(download_id) = removed {
                let _ = orchestrator.store.remove_active_download(&download_id).await;
                orchestrator.broadcast_count().await;
            }
        });
    }

    /// Start the oldest queued download if a slot is free.
    async fn promote_next(&self) {
        let next = {
            let mut state = self.state.lock().await;
            let cap = self.settings.read().await.max_concurrent_downloads as usize;
            if running_count(&state) >= cap {
                None
            } else {
                loop {
                    match state.queue.pop_front() {
                        Some(url) => {
                            let still_queued = state
                                .downloads
                                .get(&url)
                                .map(|entry| entry.download.status == DownloadStatus::Queued)
                                .unwrap_or(false);
                            if still_queued {
                                break Some(url);
                            }
                        }
                        None => break None,
                    }
                }
            }
        };
        if let Some(url) = next {
            info!("promoting queued download {url}");
            self.spawn_transfer(url);
        }
    }

    async fn broadcast_count(&self) {
        let count = {
            let state = self.state.lock().await;
            state
                .downloads
                .values()
                .filter(|entry| !entry.download.status.is_terminal())
                .count()
        };
        self.fanout
            .broadcast(OutboundMessage::DownloadCountUpdated { count })
            .await;
    }

    async fn notify(&self, download: &Download, title: &str, message: &str) {
        if !self.settings.read().await.show_download_notifications {
            return;
        }
        let notification_id = download
            .notification_id
            .clone()
            .unwrap_or_else(|| format!("dl-{}", download.download_id));
        self.platform.notify(&notification_id, title, message).await;
    }
}

fn running_count(state: &ActiveState) -> usize {
    state
        .downloads
        .values()
        .filter(|entry| {
            matches!(
                entry.download.status,
                DownloadStatus::Downloading | DownloadStatus::Stopping
            )
        })
        .count()
}

fn progress_payload(download: &Download) -> DownloadProgressPayload {
    DownloadProgressPayload {
        download_id: download.download_id.clone(),
        download_url: download.download_url.clone(),
        master_url: download.master_url.clone(),
        progress: download.progress,
        speed: download.speed,
        eta: download.eta,
        current_segment: download.current_segment,
        total_segments: download.total_segments,
    }
}

/// Rebuild a dispatchable command from a restored snapshot.
fn restored_command(download: &Download) -> DownloadCommand {
    DownloadCommand {
        download_url: download.download_url.clone(),
        master_url: download.master_url.clone(),
        tab_id: download.tab_id,
        filename: download.filename.clone(),
        kind: download.kind,
        preferred_container: None,
        original_container: None,
        audio_only: false,
        stream_selection: None,
        duration: None,
        save_path: None,
        selected_option_orig_text: download.selected_option_orig_text.clone(),
        page_url: None,
        page_favicon: None,
        video_data_snapshot: download.video_data_snapshot.clone(),
    }
}

fn force_webm_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.webm"),
        None => format!("{filename}.webm"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::platform::LogPlatform;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::{oneshot, watch};

    enum Script {
        Deliver {
            frames: Vec<f64>,
            outcome: Result<String, HelperError>,
        },
        Hold(oneshot::Receiver<Result<String, HelperError>>),
    }

    struct ScriptedHelper {
        scripts: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<HelperDownloadRequest>>,
        cancels: Mutex<Vec<String>>,
        _state_tx: watch::Sender<bool>,
        state: watch::Receiver<bool>,
    }

    impl ScriptedHelper {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            let (state_tx, state) = watch::channel(true);
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                calls: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                _state_tx: state_tx,
                state,
            })
        }
    }

    #[async_trait]
    impl HelperApi for ScriptedHelper {
        async fn probe(
            &self,
            _url: &str,
            _headers: Option<HashMap<String, String>>,
            _light: bool,
        ) -> Result<crate::models::ProbeMeta, HelperError> {
            unimplemented!("not used in download tests")
        }

        async fn generate_preview(
            &self,
            _url: &str,
            _headers: Option<HashMap<String, String>>,
        ) -> Result<String, HelperError> {
            unimplemented!("not used in download tests")
        }

        async fn download(
            &self,
            request: HelperDownloadRequest,
            progress: mpsc::Sender<ProgressFrame>,
        ) -> Result<String, HelperError> {
            self.calls.lock().await.push(request);
            let script = self
                .scripts
                .lock()
                .await
                .pop_front()
                .expect("no script left for download call");
            match script {
                Script::Deliver { frames, outcome } => {
                    for value in frames {
                        let _ = progress
                            .send(ProgressFrame {
                                progress: value,
                                ..ProgressFrame::default()
                            })
                            .await;
                    }
                    outcome
                }
                Script::Hold(rx) => rx.await.unwrap_or_else(|_| {
                    Err(HelperError::transport("test connection dropped"))
                }),
            }
        }

        async fn cancel_download(&self, download_id: &str) -> Result<(), HelperError> {
            self.cancels.lock().await.push(download_id.to_string());
            Ok(())
        }

        fn connection_state(&self) -> watch::Receiver<bool> {
            self.state.clone()
        }
    }

    struct Harness {
        orchestrator: DownloadOrchestrator,
        helper: Arc<ScriptedHelper>,
        fanout: FanOut,
        _dir: tempfile::TempDir,
    }

    async fn harness(scripts: Vec<Script>, settings: Settings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/state.db", dir.path().display());
        let store = StateStore::new(&url).await.unwrap();
        let settings: SettingsHandle = Arc::new(tokio::sync::RwLock::new(settings));
        let helper = ScriptedHelper::new(scripts);
        let fanout = FanOut::new();
        let history = HistoryService::new(store.clone(), settings.clone());
        let orchestrator = DownloadOrchestrator::new(
            helper.clone(),
            store,
            history,
            fanout.clone(),
            settings,
            HeaderCache::new(),
            Arc::new(LogPlatform),
        );
        Harness {
            orchestrator,
            helper,
            fanout,
            _dir: dir,
        }
    }

    fn command(url: &str, filename: &str) -> DownloadCommand {
        DownloadCommand {
            download_url: url.to_string(),
            master_url: None,
            tab_id: 1,
            filename: filename.to_string(),
            kind: DownloadKind::Direct,
            preferred_container: None,
            original_container: None,
            audio_only: false,
            stream_selection: None,
            duration: None,
            save_path: None,
            selected_option_orig_text: None,
            page_url: Some("https://site.example/watch".to_string()),
            page_favicon: None,
            video_data_snapshot: None,
        }
    }

    fn message_type(message: &OutboundMessage) -> &'static str {
        match message {
            OutboundMessage::DownloadQueued { .. } => "queued",
            OutboundMessage::DownloadStarted { .. } => "started",
            OutboundMessage::DownloadProgress(_) => "progress",
            OutboundMessage::DownloadSuccess { .. } => "success",
            OutboundMessage::DownloadError { .. } => "error",
            OutboundMessage::DownloadCanceled { .. } => "canceled",
            OutboundMessage::DownloadStopping { .. } => "stopping",
            OutboundMessage::DownloadCountUpdated { .. } => "count",
            _ => "other",
        }
    }

    fn message_types(messages: &[OutboundMessage]) -> Vec<&'static str> {
        messages.iter().map(message_type).collect()
    }

    /// Receive broadcasts until one of the wanted type arrives; returns
    /// everything seen including it.
    async fn recv_until(
        rx: &mut mpsc::Receiver<OutboundMessage>,
        want: &str,
    ) -> Vec<OutboundMessage> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let message = rx.recv().await.expect("fanout channel closed");
                let kind = message_type(&message);
                seen.push(message);
                if kind == want {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {want} broadcast within 5s"));
        seen
    }

    #[tokio::test]
    async fn test_success_flow() {
        let harness = harness(
            vec![Script::Deliver {
                frames: vec![30.0, 80.0],
                outcome: Ok("/tmp/clip.mp4".to_string()),
            }],
            Settings::default(),
        )
        .await;
        let mut rx = harness.fanout.register("p", Some(1), None).await;

        harness
            .orchestrator
            .start(command("https://cdn.example.com/clip.mp4", "clip.mp4"), None)
            .await;

        let messages = recv_until(&mut rx, "success").await;
        let types = message_types(&messages);
        assert!(types.contains(&"queued"));
        assert!(types.contains(&"started"));
        assert_eq!(types.iter().filter(|t| **t == "progress").count(), 2);
        assert!(types.contains(&"success"));

        let history = harness.orchestrator.history_entries().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].download.status, DownloadStatus::Completed);
        assert_eq!(history[0].download.saved_path.as_deref(), Some("/tmp/clip.mp4"));
        assert_eq!(history[0].page_url.as_deref(), Some("https://site.example/watch"));
    }

    #[tokio::test]
    async fn test_duplicate_download_is_suppressed() {
        let (hold_tx, hold_rx) = oneshot::channel();
        let harness = harness(vec![Script::Hold(hold_rx)], Settings::default()).await;
        let mut rx = harness.fanout.register("p2", Some(1), None).await;

        let url = "https://cdn.example.com/clip.mp4";
        harness.orchestrator.start(command(url, "clip.mp4"), None).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.helper.calls.lock().await.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Second command while the first is in flight.
        harness
            .orchestrator
            .start(command(url, "clip.mp4"), Some("p2"))
            .await;

        assert_eq!(harness.helper.calls.lock().await.len(), 1);
        // The duplicate reply is the current progress, sent only to p2.
        let _ = recv_until(&mut rx, "progress").await;

        let _ = hold_tx.send(Ok("/tmp/clip.mp4".to_string()));
    }

    #[tokio::test]
    async fn test_error_appends_history() {
        let harness = harness(
            vec![Script::Deliver {
                frames: vec![],
                outcome: Err(HelperError::command("disk full")),
            }],
            Settings::default(),
        )
        .await;
        let mut rx = harness.fanout.register("p", Some(1), None).await;

        harness
            .orchestrator
            .start(command("https://cdn.example.com/clip.mp4", "clip.mp4"), None)
            .await;

        let types = message_types(&recv_until(&mut rx, "error").await);
        assert!(!types.contains(&"success"));

        let history = harness.orchestrator.history_entries().await;
        assert_eq!(history[0].download.status, DownloadStatus::Error);
        assert!(history[0].download.error.as_deref().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_cancel_flow_skips_history() {
        let (hold_tx, hold_rx) = oneshot::channel();
        let harness = harness(vec![Script::Hold(hold_rx)], Settings::default()).await;
        let mut rx = harness.fanout.register("p", Some(1), None).await;

        let url = "https://cdn.example.com/clip.mp4";
        harness.orchestrator.start(command(url, "clip.mp4"), None).await;

        // The transfer must reach the helper before we cancel it.
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.helper.calls.lock().await.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let download_id = harness.orchestrator.active_downloads().await[0]
            .download_id
            .clone();
        harness.orchestrator.cancel(&download_id).await;
        assert_eq!(harness.helper.cancels.lock().await.as_slice(), [download_id.clone()]);

        // Helper acknowledges the cancel by terminating the stream call.
        let _ = hold_tx.send(Err(HelperError::command("canceled")));

        let types = message_types(&recv_until(&mut rx, "canceled").await);
        assert!(types.contains(&"stopping"));
        assert!(!types.contains(&"error"));

        assert!(harness.orchestrator.history_entries().await.is_empty());
        let canceled = harness.orchestrator.active_downloads().await;
        assert_eq!(canceled[0].status, DownloadStatus::Canceled);
    }

    #[tokio::test]
    async fn test_codec_fallback_retries_once() {
        let harness = harness(
            vec![
                Script::Deliver {
                    frames: vec![],
                    outcome: Err(HelperError::command(
                        "codec not currently supported in container mp4",
                    )),
                },
                Script::Deliver {
                    frames: vec![],
                    outcome: Ok("/tmp/clip.webm".to_string()),
                },
            ],
            Settings::default(),
        )
        .await;

        harness
            .orchestrator
            .start(command("https://cdn.example.com/clip.webm", "clip.mp4"), None)
            .await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.orchestrator.history_entries().await.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let calls = harness.helper.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].filename, "clip.mp4");
        assert_eq!(calls[1].filename, "clip.webm");

        let history = harness.orchestrator.history_entries().await;
        assert_eq!(history[0].download.status, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn test_codec_fallback_failure_surfaces_single_error() {
        let harness = harness(
            vec![
                Script::Deliver {
                    frames: vec![],
                    outcome: Err(HelperError::command(
                        "codec not currently supported in container mp4",
                    )),
                },
                Script::Deliver {
                    frames: vec![],
                    outcome: Err(HelperError::command(
                        "codec not currently supported in container webm",
                    )),
                },
            ],
            Settings::default(),
        )
        .await;
        let mut rx = harness.fanout.register("p", Some(1), None).await;

        harness
            .orchestrator
            .start(command("https://cdn.example.com/clip.webm", "clip.mp4"), None)
            .await;

        let types = message_types(&recv_until(&mut rx, "error").await);
        assert_eq!(types.iter().filter(|t| **t == "error").count(), 1);
        assert_eq!(harness.helper.calls.lock().await.len(), 2);
        assert_eq!(harness.orchestrator.history_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_queueing_respects_concurrency_cap() {
        let (hold_tx, hold_rx) = oneshot::channel();
        let harness = harness(
            vec![
                Script::Hold(hold_rx),
                Script::Deliver {
                    frames: vec![],
                    outcome: Ok("/tmp/b.mp4".to_string()),
                },
            ],
            Settings {
                max_concurrent_downloads: 1,
                ..Settings::default()
            },
        )
        .await;

        harness
            .orchestrator
            .start(command("https://cdn.example.com/a.mp4", "a.mp4"), None)
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.helper.calls.lock().await.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        harness
            .orchestrator
            .start(command("https://cdn.example.com/b.mp4", "b.mp4"), None)
            .await;

        // Only the first reached the helper; the second is queued.
        assert_eq!(harness.helper.calls.lock().await.len(), 1);
        let statuses: Vec<DownloadStatus> = harness
            .orchestrator
            .active_downloads()
            .await
            .iter()
            .map(|d| d.status)
            .collect();
        assert!(statuses.contains(&DownloadStatus::Queued));

        // Finish the first; the second must be promoted FIFO.
        let _ = hold_tx.send(Ok("/tmp/a.mp4".to_string()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.helper.calls.lock().await.len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            harness.helper.calls.lock().await[1].download_url,
            "https://cdn.example.com/b.mp4"
        );
    }

    #[tokio::test]
    async fn test_restore_does_not_contact_helper() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/state.db", dir.path().display());
        let store = StateStore::new(&url).await.unwrap();

        let snapshot = Download {
            download_id: "d-restored".to_string(),
            download_url: "https://cdn.example.com/old.mp4".to_string(),
            master_url: None,
            tab_id: 4,
            filename: "old.mp4".to_string(),
            kind: DownloadKind::Direct,
            status: DownloadStatus::Downloading,
            progress: 40.0,
            speed: None,
            eta: None,
            current_segment: None,
            total_segments: None,
            downloaded_bytes: None,
            total_bytes: None,
            started_at: Utc::now(),
            updated_at: Utc::now(),
            selected_option_orig_text: None,
            notification_id: None,
            saved_path: None,
            error: None,
            video_data_snapshot: None,
        };
        store.upsert_active_download(&snapshot).await.unwrap();

        let settings: SettingsHandle =
            Arc::new(tokio::sync::RwLock::new(Settings::default()));
        let helper = ScriptedHelper::new(Vec::new());
        let fanout = FanOut::new();
        let history = HistoryService::new(store.clone(), settings.clone());
        let orchestrator = DownloadOrchestrator::new(
            helper.clone(),
            store,
            history,
            fanout,
            settings,
            HeaderCache::new(),
            Arc::new(LogPlatform),
        );

        orchestrator.restore().await.unwrap();

        let active = orchestrator.active_downloads().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].download_id, "d-restored");
        assert_eq!(active[0].progress, 40.0);
        assert!(helper.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_download_locally() {
        let (_hold_tx, hold_rx) = oneshot::channel();
        let harness = harness(
            vec![Script::Hold(hold_rx)],
            Settings {
                max_concurrent_downloads: 1,
                ..Settings::default()
            },
        )
        .await;

        harness
            .orchestrator
            .start(command("https://cdn.example.com/a.mp4", "a.mp4"), None)
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.helper.calls.lock().await.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        harness
            .orchestrator
            .start(command("https://cdn.example.com/b.mp4", "b.mp4"), None)
            .await;

        let queued_id = harness
            .orchestrator
            .active_downloads()
            .await
            .iter()
            .find(|d| d.status == DownloadStatus::Queued)
            .unwrap()
            .download_id
            .clone();

        harness.orchestrator.cancel(&queued_id).await;

        // The queued entry was canceled without ever touching the helper.
        assert!(harness.helper.cancels.lock().await.is_empty());
        let canceled = harness
            .orchestrator
            .active_downloads()
            .await
            .into_iter()
            .find(|d| d.download_id == queued_id)
            .unwrap();
        assert_eq!(canceled.status, DownloadStatus::Canceled);
    }

    #[test]
    fn test_force_webm_extension() {
        assert_eq!(force_webm_extension("clip.mp4"), "clip.webm");
        assert_eq!(force_webm_extension("clip"), "clip.webm");
        assert_eq!(force_webm_extension("a.b.mp4"), "a.b.webm");
    }
}
