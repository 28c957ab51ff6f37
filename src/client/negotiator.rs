//! Per-camera transport negotiation
//!
//! A [`CameraTile`] runs one negotiator task. Each pass walks the transport
//! chain in order:
//!
//! ```text
//! Idle -> Connecting(primary) -> Connected
//!                             -> Connecting(secondary) -> Connected
//!                                                      -> Connecting(segmented) -> Connected
//!                                                                               -> Failed
//! ```
//!
//! Entering `Connecting(X)` opens transport X and waits, bounded by
//! `first_data_timeout`, for the first chunk. A timeout or an error advances
//! to the next transport. Every pass counts as one attempt of the tile's
//! [`ReconnectController`], so passes (and reconnects after a dropped stream)
//! are spaced by the backoff delay and stop at the attempt limit until
//! [`CameraTile::retry`] is called.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::{ReconnectController, ReconnectPolicy};
use super::transport::{MediaLink, TransportChain, TransportKind};
use crate::error::Error;
use crate::registry::CameraId;

/// Connection state of a tile or of the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Automatic attempts failed
    Failed,
}

/// What a tile shows the operator about its feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportQuality {
    Offline,
    Connecting,
    /// Low-latency transport
    Live,
    /// Chunked HTTP fallback
    Fallback,
    /// Segment playback
    Degraded,
}

/// Observable state of one tile
#[derive(Debug, Clone, PartialEq)]
pub struct ClientTransportState {
    pub camera: CameraId,
    pub active_transport: Option<TransportKind>,
    pub connection_state: ConnectionState,
    /// Attempts since the last successful connection
    pub attempt_count: u32,
    pub last_attempt_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl ClientTransportState {
    pub fn idle(camera: CameraId) -> Self {
        Self {
            camera,
            active_transport: None,
            connection_state: ConnectionState::Idle,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    pub fn quality(&self) -> TransportQuality {
        match (self.connection_state, self.active_transport) {
            (ConnectionState::Connected, Some(TransportKind::Primary)) => TransportQuality::Live,
            (ConnectionState::Connected, Some(TransportKind::Secondary)) => {
                TransportQuality::Fallback
            }
            (ConnectionState::Connected, _) => TransportQuality::Degraded,
            (ConnectionState::Connecting, _) => TransportQuality::Connecting,
            _ => TransportQuality::Offline,
        }
    }
}

/// Negotiator settings
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// How long a transport may take to deliver its first chunk
    pub first_data_timeout: Duration,

    pub policy: ReconnectPolicy,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            first_data_timeout: Duration::from_secs(5),
            policy: ReconnectPolicy::default(),
        }
    }
}

impl NegotiatorConfig {
    pub fn first_data_timeout(mut self, timeout: Duration) -> Self {
        self.first_data_timeout = timeout;
        self
    }

    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// An active camera tile
///
/// Media chunks go to the `media` sender given on activation. Dropping the
/// tile cancels its task; [`CameraTile::deactivate`] also waits for the open
/// transport to be released.
pub struct CameraTile {
    camera: CameraId,
    state: watch::Receiver<ClientTransportState>,
    cancel: CancellationToken,
    retry: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl CameraTile {
    /// Start negotiating a feed for `camera`
    pub fn activate(
        camera: CameraId,
        chain: TransportChain,
        config: NegotiatorConfig,
        media: mpsc::Sender<Bytes>,
    ) -> Self {
        let (state_tx, state) = watch::channel(ClientTransportState::idle(camera));
        let cancel = CancellationToken::new();
        let retry = Arc::new(Notify::new());

        let negotiator = Negotiator {
            camera,
            chain,
            first_data_timeout: config.first_data_timeout,
            controller: ReconnectController::new(config.policy),
            state: state_tx,
            media,
            cancel: cancel.clone(),
            retry: retry.clone(),
        };
        let task = tokio::spawn(negotiator.run());

        Self {
            camera,
            state,
            cancel,
            retry,
            task: Some(task),
        }
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    /// Current state
    pub fn state(&self) -> ClientTransportState {
        self.state.borrow().clone()
    }

    /// Watch state changes
    pub fn watch(&self) -> watch::Receiver<ClientTransportState> {
        self.state.clone()
    }

    /// Manual retry: reset the attempt counter and start a pass now
    ///
    /// Only acts while the tile is waiting between passes. No effect while
    /// connected or while a pass is already running.
    pub fn retry(&self) {
        if self.state.borrow().connection_state == ConnectionState::Connected {
            return;
        }
        tracing::info!(camera = %self.camera, "Manual retry requested");
        self.retry.notify_waiters();
    }

    /// Stop the tile and release its transport
    pub async fn deactivate(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(camera = %self.camera, error = %err, "Tile task failed");
            }
        }
    }
}

impl Drop for CameraTile {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Pass {
    Connected {
        kind: TransportKind,
        link: Box<dyn MediaLink>,
        first: Bytes,
    },
    Exhausted(Option<String>),
    Cancelled,
}

enum Feed {
    Dropped(Option<String>),
    Cancelled,
}

struct Negotiator {
    camera: CameraId,
    chain: TransportChain,
    first_data_timeout: Duration,
    controller: ReconnectController,
    state: watch::Sender<ClientTransportState>,
    media: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    retry: Arc<Notify>,
}

impl Negotiator {
    fn update(&self, modify: impl FnOnce(&mut ClientTransportState)) {
        self.state.send_modify(modify);
    }

    async fn run(mut self) {
        let camera = self.camera;
        tracing::debug!(camera = %camera, transports = ?self.chain.kinds(), "Tile activated");

        while let Some(attempt) = self.controller.acquire(&self.cancel, &self.retry).await {
            let last_attempt_at = self.controller.last_attempt_at();
            self.update(|s| {
                s.connection_state = ConnectionState::Connecting;
                s.attempt_count = attempt;
                s.last_attempt_at = last_attempt_at;
            });

            match self.pass().await {
                Pass::Cancelled => break,
                Pass::Exhausted(last_error) => {
                    tracing::warn!(
                        camera = %camera,
                        attempt = attempt,
                        error = %Error::TransportExhausted(camera),
                        "Tile offline"
                    );
                    self.update(|s| {
                        s.connection_state = ConnectionState::Failed;
                        s.active_transport = None;
                        s.last_error = last_error;
                    });
                }
                Pass::Connected { kind, link, first } => {
                    self.controller.on_connected();
                    self.update(|s| {
                        s.connection_state = ConnectionState::Connected;
                        s.active_transport = Some(kind);
                        s.attempt_count = 0;
                        s.last_error = None;
                    });
                    tracing::info!(camera = %camera, transport = %kind, "Tile connected");

                    match self.feed(link, first).await {
                        Feed::Cancelled => break,
                        Feed::Dropped(error) => {
                            tracing::info!(
                                camera = %camera,
                                transport = %kind,
                                error = ?error,
                                "Feed dropped, reconnecting"
                            );
                            self.update(|s| {
                                s.connection_state = ConnectionState::Connecting;
                                s.active_transport = None;
                                s.last_error = error;
                            });
                        }
                    }
                }
            }
        }

        self.state.send_replace(ClientTransportState::idle(camera));
        tracing::debug!(camera = %camera, "Tile deactivated");
    }

    /// One walk over the chain
    async fn pass(&self) -> Pass {
        let camera = self.camera;
        let mut current = None;
        let mut last_error = None;

        while let Some((index, transport)) = self.chain.next(current) {
            current = Some(index);
            let kind = transport.kind();
            self.update(|s| {
                s.connection_state = ConnectionState::Connecting;
                s.active_transport = Some(kind);
            });

            let deadline = Instant::now() + self.first_data_timeout;
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return Pass::Cancelled,
                opened = tokio::time::timeout_at(deadline, transport.open(camera)) => opened,
            };

            let error = match opened {
                Ok(Ok(mut link)) => {
                    // Both waits share one deadline
                    let first = tokio::select! {
                        _ = self.cancel.cancelled() => None,
                        first = tokio::time::timeout_at(deadline, link.next_chunk()) => Some(first),
                    };
                    let error = match first {
                        None => {
                            link.close().await;
                            return Pass::Cancelled;
                        }
                        Some(Ok(Some(Ok(first)))) => return Pass::Connected { kind, link, first },
                        Some(Ok(Some(Err(err)))) => err,
                        Some(Ok(None)) => {
                            Error::Transport("stream ended before first data".to_string())
                        }
                        Some(Err(_)) => self.timed_out(kind),
                    };
                    link.close().await;
                    error
                }
                Ok(Err(err)) => err,
                Err(_) => self.timed_out(kind),
            };
            tracing::info!(camera = %camera, transport = %kind, error = %error, "Transport failed");
            last_error = Some(error.to_string());
        }

        Pass::Exhausted(last_error)
    }

    fn timed_out(&self, transport: TransportKind) -> Error {
        Error::TransportTimeout {
            camera: self.camera,
            transport,
            timeout: self.first_data_timeout,
        }
    }

    /// Forward chunks until the link ends or the tile is cancelled
    async fn feed(&self, mut link: Box<dyn MediaLink>, first: Bytes) -> Feed {
        let mut chunk = first;
        let outcome = loop {
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => break Feed::Cancelled,
                sent = self.media.send(chunk) => sent,
            };
            if sent.is_err() {
                tracing::debug!(camera = %self.camera, "Media consumer gone");
                break Feed::Cancelled;
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => break Feed::Cancelled,
                next = link.next_chunk() => next,
            };
            chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => break Feed::Dropped(Some(err.to_string())),
                None => break Feed::Dropped(None),
            };
        };

        link.close().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::client::transport::Transport;
    use crate::error::Result;

    #[derive(Clone, Copy)]
    enum Step {
        /// Connects but never delivers
        Stall,
        /// Refuses the connection
        Fail,
        /// Delivers one chunk, then idles
        Deliver,
        /// Delivers one chunk after a short wait, then ends
        Brief,
    }

    #[derive(Default)]
    struct Counters {
        opens: Mutex<Vec<Instant>>,
        closes: AtomicUsize,
    }

    impl Counters {
        fn opens(&self) -> usize {
            self.opens.lock().unwrap().len()
        }
    }

    struct ScriptedTransport {
        kind: TransportKind,
        script: Mutex<VecDeque<Step>>,
        fallback: Step,
        counters: Arc<Counters>,
    }

    impl ScriptedTransport {
        fn new(kind: TransportKind, fallback: Step) -> Self {
            Self {
                kind,
                script: Mutex::new(VecDeque::new()),
                fallback,
                counters: Arc::new(Counters::default()),
            }
        }

        fn script(self, steps: &[Step]) -> Self {
            self.script.lock().unwrap().extend(steps.iter().copied());
            self
        }

        fn counters(&self) -> Arc<Counters> {
            self.counters.clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn open(&self, _camera: CameraId) -> Result<Box<dyn MediaLink>> {
            self.counters.opens.lock().unwrap().push(Instant::now());
            let step = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
            match step {
                Step::Fail => Err(Error::Transport("connection refused".to_string())),
                step => Ok(Box::new(ScriptedLink {
                    step,
                    delivered: false,
                    counters: self.counters.clone(),
                })),
            }
        }
    }

    struct ScriptedLink {
        step: Step,
        delivered: bool,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl MediaLink for ScriptedLink {
        async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
            match self.step {
                Step::Deliver | Step::Brief if !self.delivered => {
                    if matches!(self.step, Step::Brief) {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    self.delivered = true;
                    Some(Ok(Bytes::from_static(b"\x47\x40\x00")))
                }
                Step::Brief => None,
                _ => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_timeout_advances_at_deadline() {
        let primary = ScriptedTransport::new(TransportKind::Primary, Step::Stall);
        let counters = primary.counters();
        let chain = TransportChain::new()
            .with(primary)
            .with(ScriptedTransport::new(TransportKind::Secondary, Step::Stall));
        let config = NegotiatorConfig::default().first_data_timeout(Duration::from_secs(1));
        let (media, _rx) = mpsc::channel(8);

        let start = Instant::now();
        let tile = CameraTile::activate(CameraId(5), chain, config, media);
        let mut state = tile.watch();

        state
            .wait_for(|s| s.active_transport == Some(TransportKind::Primary))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(tile.state().active_transport, Some(TransportKind::Primary));
        assert_eq!(tile.state().quality(), TransportQuality::Connecting);

        state
            .wait_for(|s| s.active_transport == Some(TransportKind::Secondary))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "advanced early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1005), "advanced late: {elapsed:?}");
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_limit_requires_manual_retry() {
        let primary = ScriptedTransport::new(TransportKind::Primary, Step::Fail);
        let counters = primary.counters();
        let policy = ReconnectPolicy::default().max_attempts(6);
        let config = NegotiatorConfig::default().policy(policy.clone());
        let (media, _rx) = mpsc::channel(8);

        let tile = CameraTile::activate(CameraId(2), TransportChain::new().with(primary), config, media);
        let mut state = tile.watch();

        state
            .wait_for(|s| s.connection_state == ConnectionState::Failed && s.attempt_count == 6)
            .await
            .unwrap();
        assert_eq!(counters.opens(), 6);

        // Attempts were spaced by the delay implied by the count so far
        let opens = counters.opens.lock().unwrap().clone();
        for (made, pair) in opens.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            assert!(gap >= policy.delay_for(made as u32 + 1), "attempt {} too early", made + 2);
        }

        // No seventh automatic attempt
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counters.opens(), 6);
        let current = tile.state();
        assert_eq!(current.connection_state, ConnectionState::Failed);
        assert_eq!(current.attempt_count, 6);
        assert_eq!(current.quality(), TransportQuality::Offline);
        assert!(current.last_error.is_some());

        tile.retry();
        state.wait_for(|s| s.attempt_count == 1).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(counters.opens(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_count_resets_on_connect() {
        let primary = ScriptedTransport::new(TransportKind::Primary, Step::Deliver)
            .script(&[Step::Fail, Step::Fail]);
        let counters = primary.counters();
        let (media, mut rx) = mpsc::channel(8);

        let tile = CameraTile::activate(
            CameraId(9),
            TransportChain::new().with(primary),
            NegotiatorConfig::default(),
            media,
        );
        let mut state = tile.watch();

        state
            .wait_for(|s| s.connection_state == ConnectionState::Connected)
            .await
            .unwrap();
        let current = tile.state();
        assert_eq!(current.attempt_count, 0);
        assert_eq!(current.quality(), TransportQuality::Live);
        assert_eq!(counters.opens(), 3);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"\x47\x40\x00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_advances_to_secondary() {
        let secondary = ScriptedTransport::new(TransportKind::Secondary, Step::Deliver);
        let chain = TransportChain::new()
            .with(ScriptedTransport::new(TransportKind::Primary, Step::Fail))
            .with(secondary);
        let (media, mut rx) = mpsc::channel(8);

        let start = Instant::now();
        let tile = CameraTile::activate(CameraId(4), chain, NegotiatorConfig::default(), media);
        let mut state = tile.watch();

        state
            .wait_for(|s| s.connection_state == ConnectionState::Connected)
            .await
            .unwrap();
        // An explicit error advances without waiting for the timeout
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(tile.state().active_transport, Some(TransportKind::Secondary));
        assert_eq!(tile.state().quality(), TransportQuality::Fallback);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_releases_link() {
        let primary = ScriptedTransport::new(TransportKind::Primary, Step::Deliver);
        let counters = primary.counters();
        let (media, _rx) = mpsc::channel(8);

        let tile = CameraTile::activate(
            CameraId(1),
            TransportChain::new().with(primary),
            NegotiatorConfig::default(),
            media,
        );
        let mut state = tile.watch();
        state
            .wait_for(|s| s.connection_state == ConnectionState::Connected)
            .await
            .unwrap();

        tile.deactivate().await;

        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), ClientTransportState::idle(CameraId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_during_pass_keeps_reconnect_spacing() {
        let primary = ScriptedTransport::new(TransportKind::Primary, Step::Brief);
        let counters = primary.counters();
        let policy = ReconnectPolicy::default();
        let config = NegotiatorConfig::default().policy(policy.clone());
        let (media, _rx) = mpsc::channel(64);

        let tile = CameraTile::activate(CameraId(3), TransportChain::new().with(primary), config, media);
        let mut state = tile.watch();
        state
            .wait_for(|s| {
                s.connection_state == ConnectionState::Connecting
                    && s.active_transport == Some(TransportKind::Primary)
            })
            .await
            .unwrap();

        // Nothing is waiting for a retry while the pass runs
        tile.retry();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let opens = counters.opens.lock().unwrap().clone();
        assert!(opens.len() >= 3, "only {} opens", opens.len());
        for pair in opens.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= policy.delay_for(0), "reconnected after {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_while_waiting_between_passes() {
        let primary = ScriptedTransport::new(TransportKind::Primary, Step::Fail);
        let counters = primary.counters();
        let (media, _rx) = mpsc::channel(8);

        let tile = CameraTile::activate(
            CameraId(6),
            TransportChain::new().with(primary),
            NegotiatorConfig::default(),
            media,
        );
        let mut state = tile.watch();
        state
            .wait_for(|s| s.connection_state == ConnectionState::Failed)
            .await
            .unwrap();
        assert_eq!(counters.opens(), 1);

        tile.deactivate().await;
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(counters.opens(), 1);
        assert_eq!(*state.borrow(), ClientTransportState::idle(CameraId(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_while_waiting_for_first_data() {
        let primary = ScriptedTransport::new(TransportKind::Primary, Step::Stall);
        let counters = primary.counters();
        let (media, _rx) = mpsc::channel(8);

        let tile = CameraTile::activate(
            CameraId(8),
            TransportChain::new().with(primary),
            NegotiatorConfig::default(),
            media,
        );
        let mut state = tile.watch();
        state
            .wait_for(|s| s.active_transport == Some(TransportKind::Primary))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        tile.deactivate().await;
        assert_eq!(counters.opens(), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counters.opens(), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }
}
