//! Session state machine
//!
//! Tracks a stream session from the first subscribe request until its
//! transcoder is gone. Transitions are driven by discrete events coming from
//! the registry (start and kill requests) and from the supervised process
//! (spawn, first output, exit).

use serde::{Deserialize, Serialize};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, transcoder not requested yet
    Idle,
    /// Transcoder requested, no output seen yet
    Starting,
    /// Output confirmed flowing
    Active,
    /// Teardown requested, waiting for the transcoder to exit
    Stopping,
    /// Transcoder exited after a teardown request
    Terminated,
    /// Transcoder failed to start or exited on its own
    Errored,
}

/// Events that drive the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// First subscriber arrived, transcoder is being launched
    StartRequested,
    /// Transcoder process exists
    Spawned,
    /// First output observed (a stdout chunk or the segment index)
    FirstOutput,
    /// Subscriber set emptied past the grace interval, or shutdown
    KillRequested,
    /// Transcoder exited (or never started)
    Exited,
}

impl SessionState {
    /// Transition table
    ///
    /// Returns `None` when the event is not valid in the current state; the
    /// caller keeps the current state in that case.
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Idle, E::StartRequested) => Some(S::Starting),
            (S::Starting, E::Spawned) => Some(S::Starting),
            (S::Starting, E::FirstOutput) => Some(S::Active),
            (S::Active, E::FirstOutput) => Some(S::Active),
            (S::Starting, E::Exited) | (S::Active, E::Exited) => Some(S::Errored),
            (S::Starting, E::KillRequested) | (S::Active, E::KillRequested) => Some(S::Stopping),
            (S::Stopping, E::Exited) => Some(S::Terminated),
            _ => None,
        }
    }

    /// Whether new subscribers may attach
    pub fn accepts_subscribers(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Active)
    }

    /// Terminal states are removed from the registry and never reused
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Terminated => "terminated",
            SessionState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
