//! Connection seam between sessions and the wire
//!
//! A [`Connector`] opens one read-only frame stream per connection attempt.
//! The production connector speaks WebSocket; tests script their own.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::NetworkError;

/// Inbound frame relevant to the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One opaque encoded audio chunk
    Binary(Bytes),
    /// Control or status text, logged only
    Text(String),
    /// Peer closed the connection
    Close(Option<String>),
}

/// Stream of inbound frames for one connection
pub type FrameStream = BoxStream<'static, Result<Frame, NetworkError>>;

/// Opens connections for transport sessions
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<FrameStream, NetworkError>>;
}

/// WebSocket connector
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<FrameStream, NetworkError>> {
        async move {
            let (ws, response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

            tracing::debug!("WebSocket handshake complete: HTTP {}", response.status());

            // The write half is never used; pongs are queued by the protocol
            // layer and flushed on the next read.
            let frames = ws.filter_map(|message| async move {
                match message {
                    Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(Bytes::from(data)))),
                    Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                    Ok(Message::Close(frame)) => {
                        Some(Ok(Frame::Close(frame.map(|f| format!("{} {}", u16::from(f.code), f.reason)))))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(NetworkError::ReceiveFailed(e.to_string()))),
                }
            });

            Ok(frames.boxed())
        }
        .boxed()
    }
}
