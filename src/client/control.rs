//! Control channel client
//!
//! Keeps one connection to the server's `/control` endpoint and republishes
//! its status events to any number of watchers. Reconnection uses its own
//! [`ReconnectController`], independent of the camera tiles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::backoff::{ReconnectController, ReconnectPolicy};
use super::config::ClientConfig;
use super::negotiator::ConnectionState;
use crate::error::{Error, Result};
use crate::notify::ControlEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed control events of one connection
pub type EventStream = BoxStream<'static, Result<ControlEvent>>;

/// Opens control connections
#[async_trait]
pub trait ControlDialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<EventStream>;
}

/// WebSocket dialer for `/control`
pub struct WsControlDialer {
    url: String,
}

impl WsControlDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.control_url())
    }
}

#[async_trait]
impl ControlDialer for WsControlDialer {
    async fn dial(&self) -> Result<EventStream> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let events = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ControlEvent>(text.as_str()) {
                    Ok(event) => Some(Ok(event)),
                    Err(err) => {
                        tracing::warn!(error = %err, "Ignoring malformed control frame");
                        None
                    }
                },
                Ok(_) => None,
                Err(err) => Some(Err(Error::from(err))),
            }
        });
        Ok(events.boxed())
    }
}

/// Observable state of the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlChannelState {
    pub connection_state: ConnectionState,
    /// Attempts since the last successful connection
    pub retry_count: u32,
}

impl Default for ControlChannelState {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Idle,
            retry_count: 0,
        }
    }
}

/// Client side of the control channel
pub struct ControlChannel {
    state: watch::Receiver<ControlChannelState>,
    events: broadcast::Sender<ControlEvent>,
    cancel: CancellationToken,
    manual: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Start connecting in the background
    pub fn connect(dialer: Arc<dyn ControlDialer>, policy: ReconnectPolicy) -> Self {
        let (state_tx, state) = watch::channel(ControlChannelState::default());
        let (events, _) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let manual = Arc::new(Notify::new());

        let task = tokio::spawn(run(
            dialer,
            ReconnectController::new(policy),
            state_tx,
            events.clone(),
            cancel.clone(),
            manual.clone(),
        ));

        Self {
            state,
            events,
            cancel,
            manual,
            task: Some(task),
        }
    }

    /// Receive events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ControlChannelState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ControlChannelState> {
        self.state.clone()
    }

    /// Manual reconnect: reset the retry counter and dial now
    ///
    /// Ignored while a dial is in flight.
    pub fn reconnect(&self) {
        if self.state.borrow().connection_state == ConnectionState::Connected {
            return;
        }
        self.manual.notify_waiters();
    }

    /// Close the connection and stop reconnecting
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    dialer: Arc<dyn ControlDialer>,
    mut controller: ReconnectController,
    state: watch::Sender<ControlChannelState>,
    events: broadcast::Sender<ControlEvent>,
    cancel: CancellationToken,
    manual: Arc<Notify>,
) {
    'connect: while let Some(attempt) = controller.acquire(&cancel, &manual).await {
        state.send_replace(ControlChannelState {
            connection_state: ConnectionState::Connecting,
            retry_count: attempt,
        });

        let dialed = tokio::select! {
            _ = cancel.cancelled() => break,
            dialed = tokio::time::timeout(CONNECT_TIMEOUT, dialer.dial()) => dialed,
        };
        let mut stream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::warn!(attempt = attempt, error = %err, "Control channel connect failed");
                state.send_replace(failed_or_waiting(&controller));
                continue;
            }
            Err(_) => {
                tracing::warn!(attempt = attempt, "Control channel connect timed out");
                state.send_replace(failed_or_waiting(&controller));
                continue;
            }
        };

        controller.on_connected();
        state.send_replace(ControlChannelState {
            connection_state: ConnectionState::Connected,
            retry_count: 0,
        });
        tracing::info!("Control channel connected");

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break 'connect,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    tracing::debug!(kind = event.kind(), "Control event");
                    // No watchers is fine
                    let _ = events.send(event);
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "Control channel failed");
                    break;
                }
                None => {
                    tracing::info!("Control channel closed by server");
                    break;
                }
            }
        }

        state.send_replace(ControlChannelState {
            connection_state: ConnectionState::Connecting,
            retry_count: controller.attempt_count(),
        });
    }

    state.send_replace(ControlChannelState::default());
}

fn failed_or_waiting(controller: &ReconnectController) -> ControlChannelState {
    ControlChannelState {
        connection_state: if controller.is_exhausted() {
            ConnectionState::Failed
        } else {
            ConnectionState::Connecting
        },
        retry_count: controller.attempt_count(),
    }
}
