//! Scripted connector for session and controller tests

use futures_util::future::{self, BoxFuture};
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use crate::error::NetworkError;
use crate::network::transport::{Connector, Frame, FrameStream};

type FrameTx = mpsc::UnboundedSender<Result<Frame, NetworkError>>;
type FrameRx = mpsc::UnboundedReceiver<Result<Frame, NetworkError>>;

enum Script {
    Accept(FrameRx),
    Hang,
    Refuse,
}

/// Connector whose connection attempts follow a script. Unscripted
/// attempts are refused.
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<Script>>,
    attempts: Mutex<Vec<(Instant, Url)>>,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Accept the next unscripted attempt and hand back its far end
    pub(crate) fn accept_next(&self) -> Link {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().push_back(Script::Accept(rx));
        Link { tx }
    }

    /// Refuse the next attempt, keeping later script entries in order
    pub(crate) fn refuse_next(&self) {
        self.script.lock().push_back(Script::Refuse);
    }

    /// Leave the next attempt connecting forever
    pub(crate) fn hang_next(&self) {
        self.script.lock().push_back(Script::Hang);
    }

    /// Time and URL of every attempt so far
    pub(crate) fn attempts(&self) -> Vec<(Instant, Url)> {
        self.attempts.lock().clone()
    }

    pub(crate) fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<FrameStream, NetworkError>> {
        self.attempts.lock().push((Instant::now(), url));

        match self.script.lock().pop_front() {
            Some(Script::Accept(rx)) => {
                let frames = stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });
                future::ready(Ok(frames.boxed())).boxed()
            }
            Some(Script::Hang) => future::pending().boxed(),
            Some(Script::Refuse) | None => future::ready(Err(NetworkError::ConnectionFailed("refused".into()))).boxed(),
        }
    }
}

/// Server side of a scripted connection. Dropping it ends the stream.
pub(crate) struct Link {
    tx: FrameTx,
}

impl Link {
    pub(crate) fn binary(&self, data: &[u8]) {
        let _ = self.tx.send(Ok(Frame::Binary(bytes::Bytes::copy_from_slice(data))));
    }

    pub(crate) fn text(&self, text: &str) {
        let _ = self.tx.send(Ok(Frame::Text(text.to_string())));
    }

    pub(crate) fn close(&self) {
        let _ = self.tx.send(Ok(Frame::Close(None)));
    }

    pub(crate) fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(NetworkError::ReceiveFailed(message.to_string())));
    }

    /// Whether the session released its end of the connection
    pub(crate) fn is_dropped(&self) -> bool {
        self.tx.is_closed()
    }
}
