//! One connection attempt to one session identity
//!
//! The session task forwards binary frames straight into its chunk buffer
//! and reports lifecycle events to the controller over a channel. Every
//! session ends with exactly one `Closed` or `Failed` notice, sent after the
//! buffer has been marked ended so a blocked feed always wakes up.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;
use uuid::Uuid;

use crate::audio::buffer::{PushOutcome, SharedChunkBuffer};
use crate::config::StreamConfig;
use crate::error::NetworkError;
use crate::network::transport::{Connector, Frame};

/// Lifecycle event reported by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    Closed(String),
    Failed(NetworkError),
}

/// A [`SessionEvent`] tagged with the episode it belongs to
#[derive(Debug, Clone)]
pub struct SessionNotice {
    pub episode: u64,
    pub session_id: Uuid,
    pub event: SessionEvent,
}

pub type NoticeSender = mpsc::UnboundedSender<SessionNotice>;

/// Deadlines that turn a stalled connection into a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Handshake deadline
    pub connect: Duration,
    /// Longest gap between frames on an open stream
    pub idle: Duration,
}

impl From<&StreamConfig> for SessionTimeouts {
    fn from(config: &StreamConfig) -> Self {
        Self {
            connect: config.connect_timeout(),
            idle: config.idle_timeout(),
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

/// Handle to a running session task
pub struct TransportSession {
    id: Uuid,
    episode: u64,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TransportSession {
    /// Start connecting to `url`. Must be called inside a tokio runtime.
    pub fn spawn(
        episode: u64,
        url: Url,
        connector: Arc<dyn Connector>,
        timeouts: SessionTimeouts,
        buffer: SharedChunkBuffer,
        notices: NoticeSender,
    ) -> Self {
        let id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run(
            SessionContext {
                id,
                episode,
                buffer,
                notices,
            },
            url,
            connector,
            timeouts,
            shutdown_rx,
        ));

        Self {
            id,
            episode,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the session to stop. Idempotent, and fine on a session that is
    /// still connecting or never opened.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionContext {
    id: Uuid,
    episode: u64,
    buffer: SharedChunkBuffer,
    notices: NoticeSender,
}

impl SessionContext {
    fn notify(&self, event: SessionEvent) {
        // The controller may already be gone during shutdown
        let _ = self.notices.send(SessionNotice {
            episode: self.episode,
            session_id: self.id,
            event,
        });
    }

    fn finish(&self, event: SessionEvent) {
        self.buffer.mark_ended();
        self.notify(event);
    }
}

async fn run(
    ctx: SessionContext,
    url: Url,
    connector: Arc<dyn Connector>,
    timeouts: SessionTimeouts,
    mut shutdown: oneshot::Receiver<()>,
) {
    tracing::info!(episode = ctx.episode, session = %ctx.id, "Connecting to {}", url);

    let connected = tokio::select! {
        _ = &mut shutdown => {
            ctx.finish(SessionEvent::Closed("stopped before open".into()));
            return;
        }
        result = tokio::time::timeout(timeouts.connect, connector.connect(url)) => {
            result.unwrap_or_else(|_| {
                Err(NetworkError::ConnectionFailed(format!(
                    "no handshake within {} ms",
                    timeouts.connect.as_millis()
                )))
            })
        }
    };

    let mut frames = match connected {
        Ok(frames) => frames,
        Err(e) => {
            tracing::error!(episode = ctx.episode, "Connection failed: {}", e);
            ctx.finish(SessionEvent::Failed(e));
            return;
        }
    };

    tracing::info!(episode = ctx.episode, "Stream open");
    ctx.notify(SessionEvent::Opened);

    let mut chunks: u64 = 0;
    let mut bytes: u64 = 0;

    let end = loop {
        tokio::select! {
            _ = &mut shutdown => break SessionEvent::Closed("stop".into()),
            frame = tokio::time::timeout(timeouts.idle, frames.next()) => match frame {
                Err(_) => {
                    break SessionEvent::Failed(NetworkError::ReceiveFailed(format!(
                        "no data for {} ms",
                        timeouts.idle.as_millis()
                    )));
                }
                Ok(Some(Ok(Frame::Binary(data)))) => {
                    chunks += 1;
                    bytes += data.len() as u64;
                    if ctx.buffer.push(data) == PushOutcome::Rejected {
                        tracing::debug!(episode = ctx.episode, "Chunk arrived after end of stream");
                    }
                }
                Ok(Some(Ok(Frame::Text(text)))) => {
                    tracing::debug!(episode = ctx.episode, "Control message: {}", describe_control_text(&text));
                }
                Ok(Some(Ok(Frame::Close(reason)))) => {
                    break SessionEvent::Closed(reason.unwrap_or_else(|| "closed by peer".into()));
                }
                Ok(Some(Err(e))) => break SessionEvent::Failed(e),
                Ok(None) => break SessionEvent::Closed("stream ended".into()),
            }
        }
    };

    // Release the connection before anyone can start the next episode
    drop(frames);

    match &end {
        SessionEvent::Failed(e) => tracing::error!(episode = ctx.episode, chunks, bytes, "Stream failed: {}", e),
        SessionEvent::Closed(reason) => tracing::warn!(episode = ctx.episode, chunks, bytes, "Stream closed: {}", reason),
        SessionEvent::Opened => {}
    }

    ctx.finish(end);
}

/// Short description of a text frame for the log
pub fn describe_control_text(text: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(kind) = map.get("type").and_then(|v| v.as_str()) {
            return format!("type={}", kind);
        }
    }

    const MAX_CHARS: usize = 120;
    match text.char_indices().nth(MAX_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
