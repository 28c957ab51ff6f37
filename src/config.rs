//! Application configuration
//!
//! Sources, lowest priority first:
//! 1. Defaults
//! 2. Config file (TOML, YAML or JSON, chosen by extension)
//! 3. `CAMGRID__*` environment variables, e.g. `CAMGRID__BIND=0.0.0.0:9000`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::directory::StaticDirectory;
use crate::error::{Error, Result};
use crate::notify::{ControlNotifier, DEFAULT_QUEUE_CAPACITY};
use crate::registry::{CameraId, RegistryConfig};
use crate::server::ServerConfig;
use crate::transcode::TranscodeConfig;

/// One camera known to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSource {
    pub id: CameraId,
    /// Source URL handed to the transcoder
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind: SocketAddr,
    /// Transcoder executable
    pub ffmpeg: PathBuf,
    pub segment_root: PathBuf,
    pub idle_grace_ms: u64,
    pub stop_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    /// 0 = unlimited
    pub max_viewers: usize,
    pub subscriber_queue: usize,
    /// Frames buffered per control client
    pub control_queue: usize,
    pub cameras: Vec<CameraSource>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        let registry = RegistryConfig::default();
        let transcode = TranscodeConfig::default();
        Self {
            bind: server.bind_addr,
            ffmpeg: transcode.program,
            segment_root: transcode.segment_root,
            idle_grace_ms: registry.idle_grace.as_millis() as u64,
            stop_timeout_ms: transcode.stop_timeout.as_millis() as u64,
            cleanup_interval_ms: registry.cleanup_interval.as_millis() as u64,
            max_viewers: server.max_viewers,
            subscriber_queue: server.subscriber_queue,
            control_queue: DEFAULT_QUEUE_CAPACITY,
            cameras: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("CAMGRID")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::with_addr(self.bind)
            .max_viewers(self.max_viewers)
            .subscriber_queue(self.subscriber_queue)
    }

    /// Control-channel notifier with the configured client queue
    pub fn notifier(&self) -> ControlNotifier {
        ControlNotifier::new(self.control_queue)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .idle_grace(Duration::from_millis(self.idle_grace_ms))
            .cleanup_interval(Duration::from_millis(self.cleanup_interval_ms.max(1)))
    }

    pub fn transcode_config(&self) -> TranscodeConfig {
        TranscodeConfig::default()
            .program(&self.ffmpeg)
            .segment_root(&self.segment_root)
            .stop_timeout(Duration::from_millis(self.stop_timeout_ms))
    }

    /// Camera table as a directory
    pub fn directory(&self) -> StaticDirectory {
        self.cameras
            .iter()
            .map(|camera| (camera.id, camera.url.clone()))
            .collect()
    }
}
