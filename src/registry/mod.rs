//! Session registry
//!
//! The registry maps each camera to its live sessions (one per delivery
//! variant). It creates a session lazily for the first subscriber and tears
//! it down when the subscriber set has been empty for the grace interval.
//!
//! # Architecture
//!
//! ```text
//!                          SessionRegistry
//!                 ┌─────────────────────────────────┐
//!                 │ cameras: DashMap<CameraId,      │
//!                 │   Mutex<CameraSlot {            │
//!                 │     sessions: Variant → Entry   │
//!                 │   }>                            │
//!                 │ >                               │
//!                 └──────┬───────────────┬──────────┘
//!                        │               │
//!                        ▼               ▼
//!                   Supervisor      ControlNotifier
//!                  start / stop     session_started / stopped / error
//!                        │
//!                        ▼
//!               transcoder stdout ──► FanoutSink ──► sockets
//! ```
//!
//! # Locking
//!
//! Every decision about a camera's sessions (create, attach, tear down,
//! react to an exit) happens under that camera's slot mutex, so concurrent
//! subscribes for one camera start at most one transcoder. Cameras never
//! share a lock. Chunk delivery does not touch the registry at all.

pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod store;

pub use self::config::RegistryConfig;
pub use entry::{SessionEntry, SessionSnapshot};
pub use error::RegistryError;
pub use key::{CameraId, SessionKey, Variant};
pub use store::SessionRegistry;
