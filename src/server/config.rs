//! Server configuration

use std::net::SocketAddr;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent media viewers (0 = unlimited)
    pub max_viewers: usize,

    /// Outbound chunk queue per viewer; a viewer that falls this far behind
    /// is dropped
    pub subscriber_queue: usize,

    /// Serve the segment directory under `/hls`
    pub serve_segments: bool,

    /// Allow cross-origin requests from any origin
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_viewers: 0, // Unlimited
            subscriber_queue: 64,
            serve_segments: true,
            permissive_cors: true,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum concurrent viewers
    pub fn max_viewers(mut self, max: usize) -> Self {
        self.max_viewers = max;
        self
    }

    /// Set the per-viewer queue length (at least 1)
    pub fn subscriber_queue(mut self, chunks: usize) -> Self {
        self.subscriber_queue = chunks.max(1);
        self
    }

    /// Do not mount the segment directory
    pub fn disable_segments(mut self) -> Self {
        self.serve_segments = false;
        self
    }
}
