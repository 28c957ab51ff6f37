//! Viewer-side client
//!
//! Provides the operator-console half of the system:
//! - Per-camera tiles that negotiate a transport (live socket, chunked HTTP,
//!   segments) and recover from failures with bounded backoff
//! - A control-channel connection that republishes server status events
//!
//! # Example
//!
//! ```no_run
//! use camgrid::client::{CameraTile, ClientConfig, NegotiatorConfig, TransportChain};
//! use camgrid::registry::CameraId;
//!
//! # async fn example() -> camgrid::Result<()> {
//! let chain = TransportChain::standard(ClientConfig::new("http://127.0.0.1:8080"))?;
//! let (media, mut chunks) = tokio::sync::mpsc::channel(64);
//! let tile = CameraTile::activate(CameraId(7), chain, NegotiatorConfig::default(), media);
//!
//! while let Some(chunk) = chunks.recv().await {
//!     println!("{} bytes via {:?}", chunk.len(), tile.state().active_transport);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod control;
pub mod http_stream;
pub mod live;
pub mod negotiator;
pub mod segmented;
pub mod transport;

pub use backoff::{Gate, ReconnectController, ReconnectPolicy};
pub use self::config::ClientConfig;
pub use control::{ControlChannel, ControlChannelState, ControlDialer, WsControlDialer};
pub use http_stream::HttpStreamTransport;
pub use live::LiveSocketTransport;
pub use negotiator::{
    CameraTile, ClientTransportState, ConnectionState, NegotiatorConfig, TransportQuality,
};
pub use segmented::{Playlist, SegmentedTransport};
pub use transport::{MediaLink, Transport, TransportChain, TransportKind};
