//! Transport abstraction and fallback chain

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::config::ClientConfig;
use super::http_stream::HttpStreamTransport;
use super::live::LiveSocketTransport;
use super::segmented::SegmentedTransport;
use crate::error::Result;
use crate::registry::CameraId;

/// Delivery mechanism, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Low-latency binary socket
    Primary,
    /// Chunked HTTP fallback
    Secondary,
    /// Playlist of segments, highest latency
    Segmented,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Primary => "primary",
            TransportKind::Secondary => "secondary",
            TransportKind::Segmented => "segmented",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open media connection
#[async_trait]
pub trait MediaLink: Send {
    /// Next media chunk; `None` when the stream ended cleanly
    async fn next_chunk(&mut self) -> Option<Result<Bytes>>;

    /// Release the connection
    async fn close(&mut self);
}

/// Opens media connections for a camera
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self, camera: CameraId) -> Result<Box<dyn MediaLink>>;
}

/// Ordered list of transports to try
#[derive(Clone, Default)]
pub struct TransportChain {
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard chain: live socket, chunked HTTP, then segments
    pub fn standard(config: ClientConfig) -> Result<Self> {
        let config = Arc::new(config);
        let http = config.http_client()?;
        Ok(Self::new()
            .with(LiveSocketTransport::new(config.clone()))
            .with(HttpStreamTransport::new(config.clone(), http.clone()))
            .with(SegmentedTransport::new(config, http)))
    }

    /// Append a transport
    pub fn with(mut self, transport: impl Transport + 'static) -> Self {
        self.transports.push(Arc::new(transport));
        self
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.transports.iter().map(|t| t.kind()).collect()
    }

    /// The transport after `current`, or the first one for `None`
    pub fn next(&self, current: Option<usize>) -> Option<(usize, Arc<dyn Transport>)> {
        let index = current.map_or(0, |i| i + 1);
        self.transports.get(index).map(|t| (index, t.clone()))
    }
}

impl fmt::Debug for TransportChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChain")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_chain_order() {
        let chain = TransportChain::standard(ClientConfig::new("http://127.0.0.1:8080")).unwrap();
        assert_eq!(
            chain.kinds(),
            vec![
                TransportKind::Primary,
                TransportKind::Secondary,
                TransportKind::Segmented
            ]
        );
    }

    #[test]
    fn test_next_walks_the_chain() {
        let chain = TransportChain::standard(ClientConfig::new("http://127.0.0.1:8080")).unwrap();

        let (first, transport) = chain.next(None).unwrap();
        assert_eq!(first, 0);
        assert_eq!(transport.kind(), TransportKind::Primary);

        let (second, transport) = chain.next(Some(first)).unwrap();
        assert_eq!(second, 1);
        assert_eq!(transport.kind(), TransportKind::Secondary);

        assert!(chain.next(Some(2)).is_none());
        assert!(TransportChain::new().next(None).is_none());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TransportKind::Secondary).unwrap(),
            "\"secondary\""
        );
        assert_eq!(TransportKind::Segmented.to_string(), "segmented");
    }
}
