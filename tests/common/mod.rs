//! Shared harness for integration tests: a stub helper and an assembled
//! application state over a scratch database.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep, timeout, Duration};

use stream_scout::config::Config;
use stream_scout::errors::HelperError;
use stream_scout::helper::{HelperApi, HelperDownloadRequest, ProgressFrame};
use stream_scout::models::ProbeMeta;
use stream_scout::platform::LogPlatform;
use stream_scout::web::AppState;

pub struct StubHelper {
    pub probes: Mutex<Vec<String>>,
    pub previews: Mutex<Vec<String>>,
    _state_tx: watch::Sender<bool>,
    state: watch::Receiver<bool>,
}

impl StubHelper {
    pub fn new() -> Arc<Self> {
        let (state_tx, state) = watch::channel(true);
        Arc::new(Self {
            probes: Mutex::new(Vec::new()),
            previews: Mutex::new(Vec::new()),
            _state_tx: state_tx,
            state,
        })
    }
}

#[async_trait]
impl HelperApi for StubHelper {
    async fn probe(
        &self,
        url: &str,
        _headers: Option<HashMap<String, String>>,
        _light: bool,
    ) -> Result<ProbeMeta, HelperError> {
        self.probes.lock().await.push(url.to_string());
        let height = if url.contains("1080") {
            1080
        } else if url.contains("720") {
            720
        } else {
            480
        };
        Ok(ProbeMeta {
            width: Some(height * 16 / 9),
            height: Some(height),
            duration: Some(120.0),
            has_video: true,
            has_audio: true,
            ..ProbeMeta::default()
        })
    }

    async fn generate_preview(
        &self,
        url: &str,
        _headers: Option<HashMap<String, String>>,
    ) -> Result<String, HelperError> {
        self.previews.lock().await.push(url.to_string());
        Ok(format!("preview://{url}"))
    }

    async fn download(
        &self,
        _request: HelperDownloadRequest,
        _progress: mpsc::Sender<ProgressFrame>,
    ) -> Result<String, HelperError> {
        Err(HelperError::command("downloads not scripted in this test"))
    }

    async fn cancel_download(&self, _download_id: &str) -> Result<(), HelperError> {
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }
}

pub struct TestApp {
    pub state: AppState,
    pub helper: Arc<StubHelper>,
    _dir: tempfile::TempDir,
}

pub async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.database_url = format!("sqlite://{}/state.db", dir.path().display());
    // Keep tests fast; ordering guarantees do not depend on the pace.
    config.limits.min_probe_interval_ms = 1;

    let helper = StubHelper::new();
    let state = AppState::assemble(config, helper.clone(), Arc::new(LogPlatform))
        .await
        .unwrap();
    TestApp {
        state,
        helper,
        _dir: dir,
    }
}

pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(10), async {
        loop {
            if condition().await {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met within 10s");
}
