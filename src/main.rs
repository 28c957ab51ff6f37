use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use camgrid::config::AppConfig;
use camgrid::registry::SessionRegistry;
use camgrid::server::CamServer;
use camgrid::sink::FanoutSink;
use camgrid::transcode::{ProcessLauncher, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "camgrid")]
#[command(about = "Camera stream session server", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "CAMGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long, env = "CAMGRID_BIND")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> camgrid::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("camgrid=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    tracing::info!(
        bind = %config.bind,
        cameras = config.cameras.len(),
        ffmpeg = %config.ffmpeg.display(),
        "Starting camgrid"
    );
    if config.cameras.is_empty() {
        tracing::warn!("No cameras configured; every subscribe will fail with camera not found");
    }

    let supervisor = Supervisor::new(
        config.transcode_config(),
        Arc::new(ProcessLauncher),
        Arc::new(FanoutSink::new()),
    );
    let registry = SessionRegistry::new(
        config.registry_config(),
        supervisor,
        Arc::new(config.directory()),
        config.notifier(),
    );
    let server = CamServer::new(config.server_config(), registry);

    server
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
}
