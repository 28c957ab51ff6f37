//! Control-channel notifier
//!
//! Administrative clients connect to `/control` and receive JSON text frames
//! announcing session lifecycle changes. The notifier is independent of media
//! fan-out: a broadcast never waits on a client, and a full or closed client
//! queue never affects delivery to anybody else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::registry::{CameraId, SessionSnapshot, Variant};

/// Lifecycle event pushed to administrative clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Transcoder output confirmed flowing
    #[serde(rename_all = "camelCase")]
    SessionStarted { camera_id: CameraId, variant: Variant },
    /// Session torn down after its last subscriber left
    #[serde(rename_all = "camelCase")]
    SessionStopped { camera_id: CameraId, variant: Variant },
    /// Transcoder failed to start or exited on its own
    #[serde(rename_all = "camelCase")]
    SessionError {
        camera_id: CameraId,
        variant: Variant,
        message: String,
    },
    /// Every live session, sent to a client when it connects
    StatusSnapshot { sessions: Vec<SessionSnapshot> },
}

impl ControlEvent {
    pub fn camera_id(&self) -> Option<CameraId> {
        match self {
            ControlEvent::SessionStarted { camera_id, .. }
            | ControlEvent::SessionStopped { camera_id, .. }
            | ControlEvent::SessionError { camera_id, .. } => Some(*camera_id),
            ControlEvent::StatusSnapshot { .. } => None,
        }
    }

    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::SessionStarted { .. } => "session_started",
            ControlEvent::SessionStopped { .. } => "session_stopped",
            ControlEvent::SessionError { .. } => "session_error",
            ControlEvent::StatusSnapshot { .. } => "status_snapshot",
        }
    }
}

/// Frames buffered per control client unless configured otherwise
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Identifier of a connected administrative client
pub type ControlClientId = u64;

/// Fan-out of [`ControlEvent`]s to administrative clients
#[derive(Clone)]
pub struct ControlNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    clients: DashMap<ControlClientId, mpsc::Sender<String>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ControlNotifier {
    /// Create a notifier whose per-client queues hold `queue_capacity` frames
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                clients: DashMap::new(),
                next_id: AtomicU64::new(1),
                queue_capacity: queue_capacity.max(1),
            }),
        }
    }

    /// Register a client and get the receiving end of its queue
    pub fn register(&self) -> (ControlClientId, mpsc::Receiver<String>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        self.inner.clients.insert(id, tx);

        tracing::info!(client = id, clients = self.inner.clients.len(), "Control client connected");
        (id, rx)
    }

    pub fn unregister(&self, id: ControlClientId) {
        if self.inner.clients.remove(&id).is_some() {
            tracing::info!(client = id, "Control client disconnected");
        }
    }

    /// Queue a frame for one client
    pub fn send_to(&self, id: ControlClientId, event: &ControlEvent) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };
        match self.inner.clients.get(&id) {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Push an event to every client without waiting
    ///
    /// Clients whose queue is closed are dropped; a full queue loses this
    /// event only. Returns the number of clients that accepted the frame.
    pub fn broadcast(&self, event: &ControlEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let mut delivered = 0;
        self.inner.clients.retain(|id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client = *id, event = event.kind(), "Control client lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        tracing::debug!(event = event.kind(), camera = ?event.camera_id(), delivered, "Control event");
        delivered
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.queue_capacity
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Drop every client queue, ending their connections
    pub fn disconnect_all(&self) {
        let count = self.inner.clients.len();
        self.inner.clients.clear();
        if count > 0 {
            tracing::info!(clients = count, "Control clients disconnected");
        }
    }
}

impl Default for ControlNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

fn encode(event: &ControlEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(frame) => Some(frame),
        Err(err) => {
            tracing::error!(error = %err, "Failed to encode control event");
            None
        }
    }
}
