//! HTTP server
//!
//! Binds the listener, builds the router and runs it until shutdown.

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::config::ServerConfig;
use super::handlers::{self, AppState};
use crate::error::Result;
use crate::registry::SessionRegistry;

/// Camera streaming server
pub struct CamServer {
    state: AppState,
}

impl CamServer {
    /// Create a new server around a registry
    pub fn new(config: ServerConfig, registry: SessionRegistry) -> Self {
        Self {
            state: AppState::new(registry, config),
        }
    }

    /// Get a reference to the session registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.state.registry
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.state.config.bind_addr
    }

    /// Build the router with all endpoints
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/live/{camera}", get(handlers::live_socket))
            .route("/stream/{camera}", get(handlers::http_stream))
            .route("/control", get(handlers::control_socket))
            .route("/api/sessions", get(handlers::list_sessions))
            .route("/api/cameras/{camera}/start", post(handlers::start_session))
            .route("/api/cameras/{camera}/stop", post(handlers::stop_session));

        if self.state.config.serve_segments {
            let root = self.state.registry.supervisor().config().segment_root.clone();
            router = router.nest_service("/hls", ServeDir::new(root));
        }

        let router = router
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.state.config.permissive_cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Camera server listening");

        // Spawn cleanup task for the session registry
        let cleanup_handle = self.state.registry.spawn_cleanup_task();

        let registry = self.state.registry.clone();
        let signal = async move {
            shutdown.await;
            tracing::info!("Shutdown signal received");
            // Ending sessions and control queues lets open sockets finish
            registry.shutdown().await;
            registry.notifier().disconnect_all();
        };

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await;

        // Stop cleanup task on shutdown
        cleanup_handle.abort();

        result.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::client::{
        ClientConfig, HttpStreamTransport, LiveSocketTransport, SegmentedTransport, Transport,
    };
    use crate::directory::StaticDirectory;
    use crate::error::Error;
    use crate::notify::{ControlEvent, ControlNotifier};
    use crate::registry::{CameraId, RegistryConfig, SessionKey};
    use crate::sink::FanoutSink;
    use crate::transcode::testing::FakeLauncher;
    use crate::transcode::{Supervisor, TranscodeConfig};

    struct TestServer {
        addr: SocketAddr,
        launcher: Arc<FakeLauncher>,
        registry: SessionRegistry,
        _segments: tempfile::TempDir,
    }

    async fn start_server() -> TestServer {
        start_server_with(|config| config).await
    }

    async fn start_server_with(tune: impl FnOnce(ServerConfig) -> ServerConfig) -> TestServer {
        let segments = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let supervisor = Supervisor::new(
            TranscodeConfig::default().segment_root(segments.path()),
            launcher.clone(),
            Arc::new(FanoutSink::new()),
        );
        let registry = SessionRegistry::new(
            RegistryConfig::default().idle_grace(Duration::ZERO),
            supervisor,
            Arc::new(StaticDirectory::new().with_camera(7u32, "rtsp://cam7/stream")),
            ControlNotifier::new(16),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CamServer::new(tune(ServerConfig::with_addr(addr)), registry.clone());
        tokio::spawn(async move { server.serve(listener, std::future::pending()).await });

        TestServer {
            addr,
            launcher,
            registry,
            _segments: segments,
        }
    }

    impl TestServer {
        fn client_config(&self) -> Arc<ClientConfig> {
            Arc::new(
                ClientConfig::new(format!("http://{}", self.addr))
                    .segment_poll_interval(Duration::from_millis(20)),
            )
        }

        /// Emit one chunk from the next launched transcoder
        fn emit_when_launched(&self, data: &'static [u8]) -> tokio::task::JoinHandle<()> {
            let launcher = self.launcher.clone();
            tokio::spawn(async move {
                wait_for_launch(&launcher, 1).await;
                launcher.last().unwrap().emit(data).await;
            })
        }

        async fn wait_for_teardown(&self, key: SessionKey) {
            for _ in 0..200 {
                if self.registry.state(key).await.is_none() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("session {key} was not torn down");
        }
    }

    async fn wait_for_launch(launcher: &FakeLauncher, count: usize) {
        for _ in 0..200 {
            if launcher.launches() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transcoder was not launched");
    }

    #[tokio::test]
    async fn test_invalid_camera_id_closes_with_policy_violation() {
        let server = start_server().await;
        let url = format!("ws://{}/live/not-a-number", server.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        match ws.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1008),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(server.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_live_socket_receives_chunks() {
        let server = start_server().await;
        let url = format!("ws://{}/live/7", server.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        wait_for_launch(&server.launcher, 1).await;
        server.launcher.last().unwrap().emit(b"\x47\x40\x00").await;

        match ws.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(&data[..], b"\x47\x40\x00"),
            other => panic!("expected binary frame, got {other:?}"),
        }

        ws.close(None).await.unwrap();
        for _ in 0..200 {
            if server.registry.state(SessionKey::live(7u32)).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session was not torn down after the socket closed");
    }

    #[tokio::test]
    async fn test_control_socket_sends_snapshot_first() {
        let server = start_server().await;
        let url = format!("ws://{}/control", server.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let first = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("expected text frame, got {other:?}"),
        };
        let event: ControlEvent = serde_json::from_str(&first).unwrap();
        assert_eq!(event, ControlEvent::StatusSnapshot { sessions: vec![] });
    }

    #[tokio::test]
    async fn test_admin_start_and_errors() {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let base = format!("http://{}", server.addr);

        let response = client
            .post(format!("{base}/api/cameras/abc/start"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error_code"], "INVALID_CAMERA_ID");

        let response = client
            .post(format!("{base}/api/cameras/42/start"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let response = client
            .post(format!("{base}/api/cameras/7/start?variant=segmented"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["cameraId"], 7);
        assert_eq!(body["variant"], "segmented");
        assert_eq!(body["state"], "starting");

        let sessions: serde_json::Value = client
            .get(format!("{base}/api/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sessions.as_array().unwrap().len(), 1);

        let response = client
            .post(format!("{base}/api/cameras/7/stop"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(server
            .registry
            .state(SessionKey::segmented(7u32))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_live_transport_against_server() {
        let server = start_server().await;
        let transport = LiveSocketTransport::new(server.client_config());

        let mut link = transport.open(CameraId(7)).await.unwrap();
        wait_for_launch(&server.launcher, 1).await;
        server.launcher.last().unwrap().emit(b"\x47\x40\x00").await;

        let chunk = link.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"\x47\x40\x00");

        link.close().await;
        server.wait_for_teardown(SessionKey::live(7u32)).await;
    }

    #[tokio::test]
    async fn test_live_transport_close_codes() {
        let server = start_server().await;
        let transport = LiveSocketTransport::new(server.client_config());

        // Unknown camera: the server closes with 1011, which is a failure
        let mut rejected = transport.open(CameraId(42)).await.unwrap();
        match rejected.next_chunk().await {
            Some(Err(Error::Transport(message))) => assert!(message.contains("1011"), "{message}"),
            other => panic!("expected a transport error, got {other:?}"),
        }

        // Session ended by the transcoder: going-away close ends the stream
        let mut link = transport.open(CameraId(7)).await.unwrap();
        wait_for_launch(&server.launcher, 1).await;
        let process = server.launcher.last().unwrap();
        process.emit(b"first").await;
        assert_eq!(&link.next_chunk().await.unwrap().unwrap()[..], b"first");

        process.exit(1);
        assert!(link.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_http_stream_transport_against_server() {
        let server = start_server().await;
        let transport = HttpStreamTransport::new(server.client_config(), reqwest::Client::new());
        let key = SessionKey::live(7u32);

        let emitter = server.emit_when_launched(b"chunked");
        let mut link = transport.open(CameraId(7)).await.unwrap();
        emitter.await.unwrap();

        let chunk = link.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"chunked");
        assert_eq!(server.registry.session(key).await.unwrap().subscribers, 1);

        // Dropping the body unsubscribes once the server notices the
        // connection is gone
        drop(link);
        for _ in 0..200 {
            if server.registry.state(key).await.is_none() {
                return;
            }
            if let Some(process) = server.launcher.last() {
                process.emit(b"more").await;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("HTTP stream subscriber was not released");
    }

    #[tokio::test]
    async fn test_stream_endpoint_headers_and_viewer_limit() {
        let server = start_server_with(|config| config.max_viewers(1)).await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/stream/7", server.addr);

        let emitter = server.emit_when_launched(b"x");
        let first = client.get(&url).send().await.unwrap();
        emitter.await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(first.headers()["content-type"], "video/mp2t");

        let second = client.get(&url).send().await.unwrap();
        assert_eq!(second.status(), 503);
        let body: serde_json::Value = second.json().await.unwrap();
        assert_eq!(body["error_code"], "VIEWER_LIMIT");

        let invalid = client
            .get(format!("http://{}/stream/abc", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(invalid.status(), 400);
        drop(first);
    }

    #[tokio::test]
    async fn test_segmented_transport_follows_index_and_releases() {
        let server = start_server().await;
        let transport = SegmentedTransport::new(server.client_config(), reqwest::Client::new());
        let key = SessionKey::segmented(7u32);

        let mut link = transport.open(CameraId(7)).await.unwrap();
        assert!(server.registry.state(key).await.is_some());
        wait_for_launch(&server.launcher, 1).await;
        let process = server.launcher.last().unwrap();

        // The index does not exist yet; the link keeps polling
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            process.write_segment("segment_00001.ts", b"one").await;
            process
        });
        assert_eq!(&link.next_chunk().await.unwrap().unwrap()[..], b"one");

        let process = publisher.await.unwrap();
        process.write_segment("segment_00002.ts", b"two").await;
        assert_eq!(&link.next_chunk().await.unwrap().unwrap()[..], b"two");

        link.close().await;
        assert_eq!(server.registry.state(key).await, None);
    }

    #[tokio::test]
    async fn test_dropped_segmented_link_releases_session() {
        let server = start_server().await;
        let transport = SegmentedTransport::new(server.client_config(), reqwest::Client::new());
        let key = SessionKey::segmented(7u32);

        let link = transport.open(CameraId(7)).await.unwrap();
        assert!(server.registry.state(key).await.is_some());

        drop(link);
        server.wait_for_teardown(key).await;
    }
}
