//! Transcoder process supervision
//!
//! One external transcoder runs per session. It reads the camera's source
//! URL and either writes a continuous byte stream on stdout (live-socket
//! variant, pushed into the [`FanoutSink`](crate::sink::FanoutSink)) or a
//! rolling set of segment files plus an index into
//! `<segment_root>/<camera>/` (segmented variant, served as plain files).

pub mod config;
pub mod process;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use self::config::{OutputTarget, TranscodeCommand, TranscodeConfig};
pub use process::{ChildProcess, ExitReport, Launcher, ProcessHandle, ProcessLauncher, ProcessStatus};
pub use supervisor::Supervisor;
