//! Crate error types

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::client::TransportKind;
use crate::registry::{CameraId, RegistryError};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for session, transport and configuration failures
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transcoder could not be started or exited right away
    #[error("source unavailable for camera {camera}: {diagnostic}")]
    SourceUnavailable { camera: CameraId, diagnostic: String },

    /// No media arrived on a transport within the expected window
    #[error("no data from {transport} transport for camera {camera} within {timeout:?}")]
    TransportTimeout {
        camera: CameraId,
        transport: TransportKind,
        timeout: Duration,
    },

    /// Every transport in the fallback chain failed
    #[error("all transports failed for camera {0}")]
    TransportExhausted(CameraId),

    /// An attempt was suppressed because the backoff delay had not elapsed
    #[error("attempt suppressed, next attempt allowed in {0:?}")]
    RateLimited(Duration),

    /// Transport-level failure (connect, read, protocol)
    #[error("transport error: {0}")]
    Transport(String),

    /// Every viewer slot is taken
    #[error("viewer limit of {0} reached")]
    ViewerLimit(usize),

    /// Camera is not known to the record store
    #[error("camera not found: {0}")]
    CameraNotFound(CameraId),

    /// Camera id in a request was not a valid number
    #[error("invalid camera id: {0}")]
    InvalidCameraId(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            Error::SourceUnavailable { .. } => (StatusCode::BAD_GATEWAY, "SOURCE_UNAVAILABLE"),
            Error::CameraNotFound(_) => (StatusCode::NOT_FOUND, "CAMERA_NOT_FOUND"),
            Error::InvalidCameraId(_) => (StatusCode::BAD_REQUEST, "INVALID_CAMERA_ID"),
            Error::Registry(RegistryError::SessionNotFound(_)) => {
                (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND")
            }
            Error::Registry(_) => (StatusCode::CONFLICT, "REGISTRY_ERROR"),
            Error::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            Error::ViewerLimit(_) => (StatusCode::SERVICE_UNAVAILABLE, "VIEWER_LIMIT"),
            Error::TransportTimeout { .. }
            | Error::TransportExhausted(_)
            | Error::Transport(_)
            | Error::WebSocket(_)
            | Error::Http(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        };
        let message = self.to_string();

        tracing::warn!(
            status = %status,
            error_code = error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message,
        }));

        (status, body).into_response()
    }
}
