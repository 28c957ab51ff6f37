//! Multi-camera stream sessions
//!
//! `camgrid` turns camera source URLs into live feeds for operator consoles.
//! The server side keeps at most one transcoder per (camera, variant), fans
//! its output out to every open viewer socket and tears it down when the
//! last viewer leaves. The client side picks a delivery transport per camera
//! tile and reconnects with bounded backoff.
//!
//! # Server
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use camgrid::directory::StaticDirectory;
//! use camgrid::notify::ControlNotifier;
//! use camgrid::registry::{RegistryConfig, SessionRegistry};
//! use camgrid::server::{CamServer, ServerConfig};
//! use camgrid::sink::FanoutSink;
//! use camgrid::transcode::{ProcessLauncher, Supervisor, TranscodeConfig};
//!
//! # async fn example() -> camgrid::Result<()> {
//! let supervisor = Supervisor::new(
//!     TranscodeConfig::default(),
//!     Arc::new(ProcessLauncher),
//!     Arc::new(FanoutSink::new()),
//! );
//! let directory = StaticDirectory::new().with_camera(7u32, "rtsp://10.0.0.7/stream1");
//! let registry = SessionRegistry::new(
//!     RegistryConfig::default(),
//!     supervisor,
//!     Arc::new(directory),
//!     ControlNotifier::default(),
//! );
//!
//! CamServer::new(ServerConfig::default(), registry).run().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod notify;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;
pub mod stats;
pub mod transcode;

pub use error::{Error, Result};
