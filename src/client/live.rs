//! Live-socket transport

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::config::ClientConfig;
use super::transport::{MediaLink, Transport, TransportKind};
use crate::error::{Error, Result};
use crate::registry::CameraId;

/// Binary WebSocket carrying the raw transport stream
pub struct LiveSocketTransport {
    config: Arc<ClientConfig>,
}

impl LiveSocketTransport {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for LiveSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Primary
    }

    async fn open(&self, camera: CameraId) -> Result<Box<dyn MediaLink>> {
        let url = self.config.live_url(camera);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        tracing::debug!(camera = %camera, url = %url, "Live socket connected");
        Ok(Box::new(LiveSocketLink { socket }))
    }
}

struct LiveSocketLink {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl MediaLink for LiveSocketLink {
    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(frame)) => {
                    // Normal and going-away closes end the stream; anything
                    // else is a server-side rejection
                    return match frame {
                        Some(frame) if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
                            Some(Err(Error::Transport(format!(
                                "live socket closed: {} {}",
                                u16::from(frame.code),
                                frame.reason.as_str()
                            ))))
                        }
                        _ => None,
                    };
                }
                Ok(_) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}
