//! Registry error types
//!
//! Error types for session registry operations.

use super::key::{CameraId, SessionKey};
use crate::sink::SubscriberId;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No live session for this key
    #[error("session not found: {0}")]
    SessionNotFound(SessionKey),

    /// Subscriber is not attached to any session of this camera
    #[error("subscriber {subscriber} is not attached to camera {camera}")]
    NotSubscribed {
        camera: CameraId,
        subscriber: SubscriberId,
    },

    /// Session is shutting down and no longer accepts subscribers
    #[error("session is stopping: {0}")]
    SessionStopping(SessionKey),
}
