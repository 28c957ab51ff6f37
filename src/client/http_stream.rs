//! Chunked HTTP transport

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::config::ClientConfig;
use super::transport::{MediaLink, Transport, TransportKind};
use crate::error::Result;
use crate::registry::CameraId;

/// Progressive HTTP body carrying the same stream as the live socket
pub struct HttpStreamTransport {
    config: Arc<ClientConfig>,
    client: reqwest::Client,
}

impl HttpStreamTransport {
    pub fn new(config: Arc<ClientConfig>, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl Transport for HttpStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Secondary
    }

    async fn open(&self, camera: CameraId) -> Result<Box<dyn MediaLink>> {
        let response = self
            .client
            .get(self.config.stream_url(camera))
            .send()
            .await?
            .error_for_status()?;
        Ok(Box::new(HttpStreamLink { response }))
    }
}

struct HttpStreamLink {
    response: reqwest::Response,
}

#[async_trait]
impl MediaLink for HttpStreamLink {
    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.response.chunk().await.map_err(Into::into).transpose()
    }

    async fn close(&mut self) {}
}
