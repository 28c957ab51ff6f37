//! Session entry and snapshot types
//!
//! This module defines the per-session state stored in the registry.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::key::{CameraId, SessionKey, Variant};
use crate::session::{SessionEvent, SessionState};
use crate::stats::StatsSnapshot;
use crate::transcode::ProcessHandle;

/// Entry for a single session in the registry
pub struct SessionEntry {
    /// Serial number, distinguishes successive sessions of the same key
    pub id: u64,

    pub key: SessionKey,

    /// Current lifecycle state
    pub state: SessionState,

    /// Transcoder handle, owned by this session
    pub process: Option<ProcessHandle>,

    /// When the transcoder was spawned
    pub started_at: Option<SystemTime>,

    /// When the subscriber set last became empty
    pub idle_since: Option<Instant>,

    /// Reason of the last failure
    pub last_error: Option<String>,

    /// Task following the transcoder's status
    pub(super) driver: Option<JoinHandle<()>>,
}

impl SessionEntry {
    pub(super) fn new(id: u64, key: SessionKey) -> Self {
        Self {
            id,
            key,
            state: SessionState::Idle,
            process: None,
            started_at: None,
            idle_since: None,
            last_error: None,
            driver: None,
        }
    }

    /// Feed an event through the state machine
    ///
    /// Invalid events leave the state unchanged. Returns the resulting state.
    pub(super) fn apply(&mut self, event: SessionEvent) -> SessionState {
        match self.state.next(event) {
            Some(next) => {
                if next != self.state {
                    tracing::debug!(
                        session = %self.key,
                        from = %self.state,
                        to = %next,
                        event = ?event,
                        "Session transition"
                    );
                }
                self.state = next;
            }
            None => {
                tracing::debug!(
                    session = %self.key,
                    state = %self.state,
                    event = ?event,
                    "Ignoring event"
                );
            }
        }
        self.state
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub camera_id: CameraId,
    pub variant: Variant,
    pub state: SessionState,
    /// Attached sockets, including administrative leases
    pub subscribers: usize,
    /// Spawn time in milliseconds since the Unix epoch
    pub started_at_ms: Option<u64>,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub stats: StatsSnapshot,
}

pub(super) fn epoch_millis(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}
