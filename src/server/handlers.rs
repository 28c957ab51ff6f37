//! HTTP and WebSocket handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;

use super::config::ServerConfig;
use crate::error::{Error, Result};
use crate::registry::{CameraId, SessionKey, SessionRegistry, SessionSnapshot, Variant};
use crate::sink::{Subscriber, SubscriberId};

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub config: Arc<ServerConfig>,
    viewers: Option<Arc<Semaphore>>,
}

impl AppState {
    pub fn new(registry: SessionRegistry, config: ServerConfig) -> Self {
        let viewers = if config.max_viewers > 0 {
            Some(Arc::new(Semaphore::new(config.max_viewers)))
        } else {
            None
        };
        Self {
            registry,
            config: Arc::new(config),
            viewers,
        }
    }

    /// Take a viewer slot; `Err` when the limit is reached
    fn admit(&self) -> std::result::Result<Option<OwnedSemaphorePermit>, ()> {
        match &self.viewers {
            Some(sem) => sem.clone().try_acquire_owned().map(Some).map_err(|_| ()),
            None => Ok(None),
        }
    }
}

fn parse_camera(raw: &str) -> Result<CameraId> {
    raw.parse().map_err(|_| Error::InvalidCameraId(raw.to_string()))
}

fn close(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// `GET /live/{camera}`
pub(super) async fn live_socket(
    ws: WebSocketUpgrade,
    Path(raw): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match parse_camera(&raw) {
        Ok(camera) => ws.on_upgrade(move |socket| serve_live_socket(socket, state, camera)),
        Err(_) => {
            tracing::warn!(camera = %raw, "Rejecting live socket: invalid camera id");
            ws.on_upgrade(|mut socket| async move {
                let _ = socket.send(close(close_code::POLICY, "invalid camera id")).await;
            })
        }
    }
}

async fn serve_live_socket(socket: WebSocket, state: AppState, camera: CameraId) {
    let key = SessionKey::live(camera);
    let (mut sender, mut receiver) = socket.split();

    let Ok(_permit) = state.admit() else {
        tracing::warn!(camera = %camera, "Live socket rejected: viewer limit reached");
        let _ = sender.send(close(close_code::AGAIN, "viewer limit reached")).await;
        return;
    };

    let (subscriber, mut media) = Subscriber::channel(state.config.subscriber_queue);
    let id = subscriber.id();

    if let Err(err) = state.registry.subscribe(key, subscriber).await {
        tracing::warn!(camera = %camera, error = %err, "Live socket subscribe failed");
        let _ = sender.send(close(close_code::ERROR, "stream unavailable")).await;
        return;
    }

    tracing::debug!(camera = %camera, subscriber = %id, "Live socket open");

    loop {
        tokio::select! {
            chunk = media.recv() => match chunk {
                Some(chunk) => {
                    if sender.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Session ended or this socket fell behind
                    let _ = sender.send(close(close_code::AWAY, "stream ended")).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    release(&state.registry, key, id).await;
    tracing::debug!(camera = %camera, subscriber = %id, "Live socket closed");
}

async fn release(registry: &SessionRegistry, key: SessionKey, id: SubscriberId) {
    if let Err(err) = registry.unsubscribe(key, id).await {
        tracing::debug!(session = %key, subscriber = %id, error = %err, "Unsubscribe skipped");
    }
}

/// Unsubscribes when an HTTP stream body is dropped
struct SubscriptionGuard {
    registry: SessionRegistry,
    key: SessionKey,
    id: SubscriberId,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let (key, id) = (self.key, self.id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { release(&registry, key, id).await });
        }
    }
}

/// `GET /stream/{camera}`: the live feed as a chunked HTTP body
pub(super) async fn http_stream(
    Path(raw): Path<String>,
    State(state): State<AppState>,
) -> Result<Response> {
    let camera = parse_camera(&raw)?;
    let key = SessionKey::live(camera);
    let permit = state
        .admit()
        .map_err(|_| Error::ViewerLimit(state.config.max_viewers))?;

    let (subscriber, media) = Subscriber::channel(state.config.subscriber_queue);
    let id = subscriber.id();
    state.registry.subscribe(key, subscriber).await?;

    let guard = SubscriptionGuard {
        registry: state.registry.clone(),
        key,
        id,
        _permit: permit,
    };
    let body = ReceiverStream::new(media).map(move |chunk| {
        let _ = &guard;
        Ok::<_, Infallible>(chunk)
    });

    tracing::info!(camera = %camera, subscriber = %id, "HTTP stream started");

    Ok((
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

/// `GET /control`
pub(super) async fn control_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_control_socket(socket, state))
}

async fn serve_control_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let notifier = state.registry.notifier().clone();

    // Register first so nothing between the snapshot and the first event is lost
    let (client, mut events) = notifier.register();

    let snapshot = state.registry.status_event().await;
    match serde_json::to_string(&snapshot) {
        Ok(frame) => {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                notifier.unregister(client);
                return;
            }
        }
        Err(err) => tracing::error!(error = %err, "Failed to encode status snapshot"),
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(frame) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sender.send(close(close_code::AWAY, "server shutting down")).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    notifier.unregister(client);
}

#[derive(Debug, Deserialize)]
pub(super) struct VariantQuery {
    variant: Option<Variant>,
}

impl VariantQuery {
    fn key(&self, camera: CameraId) -> SessionKey {
        SessionKey::new(camera, self.variant.unwrap_or(Variant::Segmented))
    }
}

/// `POST /api/cameras/{camera}/start`
pub(super) async fn start_session(
    Path(raw): Path<String>,
    Query(query): Query<VariantQuery>,
    State(state): State<AppState>,
) -> Result<Json<SessionSnapshot>> {
    let key = query.key(parse_camera(&raw)?);
    let snapshot = state.registry.start(key).await?;

    tracing::info!(session = %key, "Session started by request");
    Ok(Json(snapshot))
}

/// `POST /api/cameras/{camera}/stop`
pub(super) async fn stop_session(
    Path(raw): Path<String>,
    Query(query): Query<VariantQuery>,
    State(state): State<AppState>,
) -> Result<Json<Value>> {
    let key = query.key(parse_camera(&raw)?);
    state.registry.stop(key).await?;

    let session = state.registry.session(key).await;
    tracing::info!(session = %key, remaining = session.is_some(), "Session stop requested");
    Ok(Json(json!({
        "cameraId": key.camera,
        "variant": key.variant,
        "session": session,
    })))
}

/// `GET /api/sessions`
pub(super) async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.registry.snapshot().await)
}
