use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_scout::{
    config::Config,
    helper::HelperClient,
    platform::LogPlatform,
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "stream-scout")]
#[command(version = "0.1.0")]
#[command(about = "Media stream detection and download orchestration daemon")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Helper binary path (overrides config file)
    #[arg(long, value_name = "PATH")]
    helper_path: Option<PathBuf>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("stream_scout={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting stream-scout v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration from specified file
    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    // Override config with CLI arguments
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(helper_path) = cli.helper_path {
        config.helper.binary_path = helper_path;
    }

    info!("Using helper binary: {:?}", config.helper.binary_path);

    let helper = HelperClient::spawn(config.helper.clone());
    let state = AppState::assemble(config, helper, Arc::new(LogPlatform)).await?;
    info!("Components assembled; state restored");

    let web_server = WebServer::new(state.clone())?;
    info!(
        "Listening on {}:{}",
        web_server.host(),
        web_server.port()
    );
    web_server.serve().await?;

    // Graceful exit: flush settings so a recent change survives.
    let settings = state.settings.read().await.clone();
    state.store.save_settings(&settings).await?;
    info!("Shut down cleanly");

    Ok(())
}
