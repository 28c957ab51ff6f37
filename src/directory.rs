//! Camera source lookup
//!
//! The record store that owns camera records is outside this crate; the
//! registry only needs to turn a camera id into a source URL.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::registry::CameraId;

/// Resolves a camera to the URL its transcoder should read
#[async_trait]
pub trait CameraDirectory: Send + Sync + 'static {
    async fn source_url(&self, camera: CameraId) -> Result<String>;
}

/// Fixed camera table, usually loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    sources: HashMap<CameraId, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, camera: impl Into<CameraId>, url: impl Into<String>) -> Self {
        self.insert(camera, url);
        self
    }

    pub fn insert(&mut self, camera: impl Into<CameraId>, url: impl Into<String>) {
        self.sources.insert(camera.into(), url.into());
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl FromIterator<(CameraId, String)> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = (CameraId, String)>>(iter: I) -> Self {
        Self {
            sources: iter.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CameraDirectory for StaticDirectory {
    async fn source_url(&self, camera: CameraId) -> Result<String> {
        self.sources
            .get(&camera)
            .cloned()
            .ok_or(Error::CameraNotFound(camera))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let directory = StaticDirectory::new().with_camera(7u32, "rtsp://10.0.0.7/stream1");

        assert_eq!(
            directory.source_url(CameraId(7)).await.unwrap(),
            "rtsp://10.0.0.7/stream1"
        );
        assert!(matches!(
            directory.source_url(CameraId(8)).await,
            Err(Error::CameraNotFound(CameraId(8)))
        ));
    }
}
