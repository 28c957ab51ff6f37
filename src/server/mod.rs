//! Camera streaming server
//!
//! Endpoints:
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /live/{camera}` | WebSocket, binary frames of the live-socket variant |
//! | `GET /stream/{camera}` | Same feed as a chunked HTTP body |
//! | `GET /hls/{camera}/index.m3u8` | Segmented variant, plain files |
//! | `GET /control` | WebSocket, JSON lifecycle events |
//! | `POST /api/cameras/{camera}/start` | Hold a session open (`?variant=`) |
//! | `POST /api/cameras/{camera}/stop` | Release the hold |
//! | `GET /api/sessions` | Snapshot of live sessions |

pub mod config;
pub mod handlers;
pub mod listener;

pub use self::config::ServerConfig;
pub use handlers::AppState;
pub use listener::CamServer;
