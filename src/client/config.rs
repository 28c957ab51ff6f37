//! Client configuration

use std::time::Duration;

use crate::error::Result;
use crate::registry::{CameraId, Variant};

/// Where the camera server lives and how to reach it
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `http://127.0.0.1:8080`
    pub base_url: String,

    /// TCP connect timeout for HTTP requests
    pub connect_timeout: Duration,

    /// How often the segmented transport re-reads the index
    pub segment_poll_interval: Duration,
}

impl ClientConfig {
    /// Create a new config for a server base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            connect_timeout: Duration::from_secs(5),
            segment_poll_interval: Duration::from_secs(1),
        }
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the segment index poll interval
    pub fn segment_poll_interval(mut self, interval: Duration) -> Self {
        self.segment_poll_interval = interval;
        self
    }

    fn ws_base(&self) -> String {
        if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        }
    }

    /// Live-socket endpoint of a camera
    pub fn live_url(&self, camera: CameraId) -> String {
        format!("{}/live/{}", self.ws_base(), camera)
    }

    /// Chunked HTTP endpoint of a camera
    pub fn stream_url(&self, camera: CameraId) -> String {
        format!("{}/stream/{}", self.base_url, camera)
    }

    /// Directory holding a camera's segments
    pub fn hls_dir_url(&self, camera: CameraId) -> String {
        format!("{}/hls/{}", self.base_url, camera)
    }

    pub fn hls_index_url(&self, camera: CameraId) -> String {
        format!("{}/index.m3u8", self.hls_dir_url(camera))
    }

    /// Control-channel endpoint
    pub fn control_url(&self) -> String {
        format!("{}/control", self.ws_base())
    }

    /// Session control endpoint (`start` or `stop`)
    pub fn session_url(&self, camera: CameraId, action: &str, variant: Variant) -> String {
        format!(
            "{}/api/cameras/{}/{}?variant={}",
            self.base_url, camera, action, variant
        )
    }

    /// HTTP client for streaming requests
    ///
    /// Only the connect phase is bounded; a total request timeout would cut
    /// long-running streams.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()?)
    }
}
