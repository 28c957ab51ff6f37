//! Segmented transport
//!
//! Asks the server to start a segmented session, then follows its playlist:
//! each new segment listed in the index is fetched and yielded as one chunk.
//! Closing (or dropping) the link releases the session again.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;

use super::config::ClientConfig;
use super::transport::{MediaLink, Transport, TransportKind};
use crate::error::{Error, Result};
use crate::registry::{CameraId, Variant};

/// Segment playlist follower
pub struct SegmentedTransport {
    config: Arc<ClientConfig>,
    client: reqwest::Client,
}

impl SegmentedTransport {
    pub fn new(config: Arc<ClientConfig>, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl Transport for SegmentedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Segmented
    }

    async fn open(&self, camera: CameraId) -> Result<Box<dyn MediaLink>> {
        self.client
            .post(self.config.session_url(camera, "start", Variant::Segmented))
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(camera = %camera, "Segmented session requested");

        Ok(Box::new(SegmentedLink {
            config: self.config.clone(),
            client: self.client.clone(),
            camera,
            seen: HashSet::new(),
            pending: VecDeque::new(),
            released: false,
        }))
    }
}

/// Parsed media playlist
#[derive(Debug, Default, PartialEq)]
pub struct Playlist {
    /// Segment URIs in playlist order
    pub segments: Vec<String>,
    /// The playlist carries an end marker
    pub ended: bool,
}

impl Playlist {
    pub fn parse(text: &str) -> Self {
        let mut playlist = Playlist::default();
        for line in text.lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            if line == "#EXT-X-ENDLIST" {
                playlist.ended = true;
            } else if !line.starts_with('#') {
                playlist.segments.push(line.to_string());
            }
        }
        playlist
    }
}

struct SegmentedLink {
    config: Arc<ClientConfig>,
    client: reqwest::Client,
    camera: CameraId,
    /// Segments listed by the last index read
    seen: HashSet<String>,
    pending: VecDeque<String>,
    released: bool,
}

impl SegmentedLink {
    fn segment_url(&self, uri: &str) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_string()
        } else {
            format!("{}/{}", self.config.hls_dir_url(self.camera), uri)
        }
    }

    /// Read the index; `None` while the transcoder has not written it yet
    async fn read_index(&self) -> Result<Option<Playlist>> {
        let response = self
            .client
            .get(self.config.hls_index_url(self.camera))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.error_for_status()?.text().await?;
        Ok(Some(Playlist::parse(&text)))
    }

    async fn fetch(&self, uri: &str) -> Result<Bytes> {
        Ok(self
            .client
            .get(self.segment_url(uri))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?)
    }

    fn stop_request(&self) -> reqwest::RequestBuilder {
        self.client
            .post(self.config.session_url(self.camera, "stop", Variant::Segmented))
    }
}

#[async_trait]
impl MediaLink for SegmentedLink {
    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        loop {
            if let Some(uri) = self.pending.pop_front() {
                return Some(self.fetch(&uri).await);
            }

            let playlist = match self.read_index().await {
                Ok(Some(playlist)) => playlist,
                // The index disappears when the session is torn down
                Ok(None) if !self.seen.is_empty() => return None,
                Ok(None) => {
                    tokio::time::sleep(self.config.segment_poll_interval).await;
                    continue;
                }
                Err(err) => return Some(Err(err)),
            };

            let fresh: Vec<String> = playlist
                .segments
                .iter()
                .filter(|uri| !self.seen.contains(*uri))
                .cloned()
                .collect();
            self.seen = playlist.segments.into_iter().collect();

            if fresh.is_empty() {
                if playlist.ended {
                    return None;
                }
                tokio::time::sleep(self.config.segment_poll_interval).await;
            } else {
                self.pending.extend(fresh);
            }
        }
    }

    async fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.stop_request().send().await {
            tracing::debug!(camera = %self.camera, error = %Error::from(err), "Segmented stop failed");
        }
    }
}

impl Drop for SegmentedLink {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped without close (e.g. a first-data timeout): release the
        // server-side session in the background
        let request = self.stop_request();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = request.send().await;
            });
        }
    }
}
