//! Helper connection client
//!
//! Owns the single channel to the external helper process. Outbound
//! requests carry a monotonically increasing `id`; inbound frames are
//! routed back to the waiting caller, with `progress` frames forwarded to
//! the caller's channel until the terminal frame resolves the request.
//!
//! A supervisor task keeps the connection alive: on disconnect every
//! in-flight request is rejected with a transport error and a reconnect is
//! scheduled with capped backoff. A heartbeat runs on the live connection;
//! one missed or ill-formed response forces a disconnect so the supervisor
//! can rebuild the channel.

use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::framing::HelperCodec;
use super::protocol::{self, HelperCommand, HelperDownloadRequest, ProgressFrame};
use crate::config::HelperConfig;
use crate::errors::HelperError;
use crate::models::ProbeMeta;

pub type BoxRead = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// An established duplex channel plus whatever must stay alive with it
/// (the child process handle, for the real transport).
pub struct HelperConnection {
    pub reader: BoxRead,
    pub writer: BoxWrite,
    pub guard: Option<Box<dyn std::any::Any + Send>>,
}

/// How connections are made. Production spawns the helper binary; tests
/// hand over in-memory duplex pipes.
#[async_trait]
pub trait HelperTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<HelperConnection, HelperError>;
}

/// Spawns the helper binary and speaks over its stdio.
pub struct ProcessTransport {
    binary: std::path::PathBuf,
}

impl ProcessTransport {
    pub fn new(binary: std::path::PathBuf) -> Self {
        Self { binary }
    }
}

#[async_trait]
impl HelperTransport for ProcessTransport {
    async fn connect(&self) -> Result<HelperConnection, HelperError> {
        let mut child = tokio::process::Command::new(&self.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HelperError::transport(format!("spawn {:?}: {e}", self.binary)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HelperError::transport("helper stdout unavailable"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HelperError::transport("helper stdin unavailable"))?;

        Ok(HelperConnection {
            reader: Box::pin(stdout),
            writer: Box::pin(stdin),
            guard: Some(Box::new(child)),
        })
    }
}

/// The helper surface the rest of the core programs against.
#[async_trait]
pub trait HelperApi: Send + Sync {
    async fn probe(
        &self,
        url: &str,
        headers: Option<HashMap<String, String>>,
        light: bool,
    ) -> Result<ProbeMeta, HelperError>;

    async fn generate_preview(
        &self,
        url: &str,
        headers: Option<HashMap<String, String>>,
    ) -> Result<String, HelperError>;

    /// Streaming: progress frames flow through `progress` until the
    /// terminal frame resolves with the saved path.
    async fn download(
        &self,
        request: HelperDownloadRequest,
        progress: mpsc::Sender<ProgressFrame>,
    ) -> Result<String, HelperError>;

    async fn cancel_download(&self, download_id: &str) -> Result<(), HelperError>;

    fn connection_state(&self) -> watch::Receiver<bool>;
}

struct Pending {
    terminal: oneshot::Sender<Result<Value, HelperError>>,
    progress: Option<mpsc::Sender<ProgressFrame>>,
}

pub struct HelperClient {
    config: HelperConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    outbound: Mutex<Option<mpsc::Sender<Value>>>,
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
}

impl HelperClient {
    /// Start a client over the process transport.
    pub fn spawn(config: HelperConfig) -> Arc<Self> {
        let transport = Arc::new(ProcessTransport::new(config.binary_path.clone()));
        Self::spawn_with_transport(config, transport)
    }

    /// Start a client over an arbitrary transport.
    pub fn spawn_with_transport(
        config: HelperConfig,
        transport: Arc<dyn HelperTransport>,
    ) -> Arc<Self> {
        let (connected_tx, connected_rx) = watch::channel(false);
        let client = Arc::new(Self {
            config,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            connected_tx,
            connected_rx,
        });
        tokio::spawn(supervise(client.clone(), transport));
        client
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.config.download_timeout_secs)
    }

    /// Send one command and wait for its terminal frame.
    async fn request(
        &self,
        command: HelperCommand,
        progress: Option<mpsc::Sender<ProgressFrame>>,
        budget: Duration,
    ) -> Result<Value, HelperError> {
        let name = command.name();
        let mut envelope = serde_json::to_value(&command).map_err(|e| HelperError::Frame {
            message: e.to_string(),
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        envelope["id"] = Value::from(id);

        let outbound = { self.outbound.lock().await.clone() };
        let Some(outbound) = outbound else {
            return Err(HelperError::NotConnected);
        };

        let (terminal_tx, terminal_rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            Pending {
                terminal: terminal_tx,
                progress,
            },
        );

        if outbound.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(HelperError::NotConnected);
        }

        match timeout(budget, terminal_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HelperError::transport("helper connection lost")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(HelperError::timeout(name, budget.as_secs()))
            }
        }
    }

    async fn dispatch(&self, value: Value) {
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            warn!("helper frame without id: {value}");
            return;
        };

        if protocol::is_progress_frame(&value) {
            let progress = {
                let pending = self.pending.lock().await;
                pending.get(&id).and_then(|entry| entry.progress.clone())
            };
            if let (Some(progress), Some(frame)) = (progress, ProgressFrame::from_value(&value)) {
                // Awaited send keeps frames in arrival order; the consumer
                // drains promptly.
                let _ = progress.send(frame).await;
            }
            return;
        }

        let entry = self.pending.lock().await.remove(&id);
        let Some(entry) = entry else {
            debug!("helper frame for unknown request id {id}");
            return;
        };

        let result = match protocol::frame_error(&value) {
            Some(message) => Err(HelperError::command(message)),
            None => Ok(value),
        };
        let _ = entry.terminal.send(result);
    }

    async fn fail_all_pending(&self, error: HelperError) {
        let entries: Vec<Pending> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.terminal.send(Err(error.clone()));
        }
    }

    async fn heartbeat_once(&self) -> bool {
        let budget = Duration::from_secs(self.config.heartbeat_interval_secs);
        match self.request(HelperCommand::Heartbeat, None, budget).await {
            Ok(value) => value.get("alive").and_then(Value::as_bool) == Some(true),
            Err(e) => {
                warn!("helper heartbeat failed: {e}");
                false
            }
        }
    }

    /// Drive one live connection until it breaks.
    async fn run_connection(self: Arc<Self>, connection: HelperConnection) {
        let _guard = connection.guard;
        let codec = HelperCodec::new(self.config.max_frame_bytes);
        let mut reader = FramedRead::new(connection.reader, codec.clone());
        let mut writer = FramedWrite::new(connection.writer, codec);

        let (out_tx, mut out_rx) = mpsc::channel::<Value>(64);
        *self.outbound.lock().await = Some(out_tx);

        let (dead_tx, mut dead_rx) = oneshot::channel::<()>();
        let heartbeat_client = self.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(
                heartbeat_client.config.heartbeat_interval_secs,
            ));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if !heartbeat_client.heartbeat_once().await {
                    let _ = dead_tx.send(());
                    return;
                }
            }
        });

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(value)) => self.dispatch(value).await,
                    Some(Err(e)) => {
                        warn!("helper read error: {e}");
                        break;
                    }
                    None => {
                        info!("helper closed the pipe");
                        break;
                    }
                },
                item = out_rx.recv() => match item {
                    Some(value) => {
                        if let Err(e) = writer.send(&value).await {
                            warn!("helper write error: {e}");
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut dead_rx => {
                    warn!("helper heartbeat missed; forcing disconnect");
                    break;
                }
            }
        }

        heartbeat.abort();
        *self.outbound.lock().await = None;
    }
}

async fn supervise(client: Arc<HelperClient>, transport: Arc<dyn HelperTransport>) {
    let base_delay = Duration::from_secs(client.config.reconnect_delay_secs.max(1));
    let max_delay = Duration::from_secs(60);
    let mut delay = base_delay;

    loop {
        match transport.connect().await {
            Ok(connection) => {
                info!("helper connected");
                delay = base_delay;
                client.connected_tx.send_replace(true);
                client.clone().run_connection(connection).await;
                client.connected_tx.send_replace(false);
                client
                    .fail_all_pending(HelperError::transport("helper disconnected"))
                    .await;
                warn!("helper disconnected; reconnecting in {delay:?}");
            }
            Err(e) => {
                warn!("helper connect failed: {e}; retrying in {delay:?}");
            }
        }
        sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

#[async_trait]
impl HelperApi for HelperClient {
    async fn probe(
        &self,
        url: &str,
        headers: Option<HashMap<String, String>>,
        light: bool,
    ) -> Result<ProbeMeta, HelperError> {
        let value = self
            .request(
                HelperCommand::Probe {
                    url: url.to_string(),
                    headers,
                    light,
                },
                None,
                self.request_timeout(),
            )
            .await?;
        protocol::parse_stream_info(&value)
            .ok_or_else(|| HelperError::command("probe response missing streamInfo"))
    }

    async fn generate_preview(
        &self,
        url: &str,
        headers: Option<HashMap<String, String>>,
    ) -> Result<String, HelperError> {
        let value = self
            .request(
                HelperCommand::GeneratePreview {
                    url: url.to_string(),
                    headers,
                },
                None,
                self.request_timeout(),
            )
            .await?;
        value
            .get("previewUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HelperError::command("preview response missing previewUrl"))
    }

    async fn download(
        &self,
        request: HelperDownloadRequest,
        progress: mpsc::Sender<ProgressFrame>,
    ) -> Result<String, HelperError> {
        let value = self
            .request(
                HelperCommand::Download(request),
                Some(progress),
                self.download_timeout(),
            )
            .await?;
        Ok(value
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn cancel_download(&self, download_id: &str) -> Result<(), HelperError> {
        let value = self
            .request(
                HelperCommand::CancelDownload {
                    download_id: download_id.to_string(),
                },
                None,
                self.request_timeout(),
            )
            .await?;
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(HelperError::command("cancel rejected by helper"));
        }
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }
}
