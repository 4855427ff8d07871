//! Controller actor driving the lifecycle state machine
//!
//! The controller runs as a single tokio task. Commands from the control
//! surface, notices from transport sessions, and reconnect timers all
//! arrive as messages, are fed through [`Lifecycle`], and the resulting
//! effects are carried out here. Nothing else touches the pipeline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::buffer::{ChunkBuffer, SharedChunkBuffer};
use crate::audio::feed::StreamingFeed;
use crate::audio::playback::{Player, PlayerFactory};
use crate::config::{BufferConfig, ReconnectConfig, StreamConfig};
use crate::error::{ControlError, Error, Result};
use crate::lifecycle::state::{Effect, EndCause, Input, Lifecycle, LifecycleState};
use crate::network::session::{SessionEvent, SessionNotice, SessionTimeouts, TransportSession};
use crate::network::{Connector, SessionIdentity};
use crate::protocol::{Status, StatusEvent};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Settings the controller needs from [`crate::config::AppConfig`]
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub buffer: BufferConfig,
    pub reconnect: ReconnectConfig,
    pub stream: StreamConfig,
}

impl From<&crate::config::AppConfig> for ControllerConfig {
    fn from(config: &crate::config::AppConfig) -> Self {
        Self {
            buffer: config.buffer.clone(),
            reconnect: config.reconnect.clone(),
            stream: config.stream.clone(),
        }
    }
}

/// Read-only view of the controller
#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    pub state: LifecycleState,
    pub identity: Option<SessionIdentity>,
    pub retries: u32,
    pub episode: u64,
    pub last_status: Option<StatusEvent>,
}

impl Snapshot {
    fn initial() -> Self {
        Self {
            state: LifecycleState::Idle,
            identity: None,
            retries: 0,
            episode: 0,
            last_status: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    Start(SessionIdentity),
    Stop,
}

/// Cloneable control surface of a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    status: broadcast::Sender<StatusEvent>,
    stream: Arc<StreamConfig>,
}

impl ControllerHandle {
    /// Start streaming from `endpoint` as `identifier`. Invalid requests are
    /// rejected here, before anything changes.
    pub fn start(&self, endpoint: &str, identifier: &str) -> Result<SessionIdentity> {
        let identity = SessionIdentity::new(endpoint, identifier)?;
        self.start_identity(identity.clone())?;
        Ok(identity)
    }

    pub fn start_identity(&self, identity: SessionIdentity) -> Result<()> {
        identity.stream_url(&self.stream)?;
        self.commands
            .send(Command::Start(identity))
            .map_err(|_| Error::Control(ControlError::ControllerGone))
    }

    /// Stop streaming and cancel any pending reconnect
    pub fn stop(&self) -> Result<()> {
        self.commands
            .send(Command::Stop)
            .map_err(|_| Error::Control(ControlError::ControllerGone))
    }

    pub fn state(&self) -> LifecycleState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every snapshot change
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to status transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }
}

/// Buffer, session and player of one episode
struct Pipeline {
    buffer: SharedChunkBuffer,
    session: TransportSession,
    player: Option<Box<dyn Player>>,
}

impl Pipeline {
    fn shutdown(mut self) {
        let episode = self.session.episode();
        self.buffer.mark_ended();
        self.session.close();
        if let Some(player) = self.player.as_mut() {
            player.stop();
            if let Some(err) = player.check_errors() {
                tracing::warn!(episode, "Player reported: {}", err);
            }
        }

        let stats = self.buffer.stats();
        tracing::debug!(
            episode,
            session = %self.session.id(),
            pushed = stats.pushed,
            popped = stats.popped,
            dropped = stats.dropped,
            backlog_clears = stats.backlog_clears,
            "Pipeline torn down"
        );
    }
}

/// The controller task
pub struct Controller {
    machine: Lifecycle,
    config: ControllerConfig,
    connector: Arc<dyn Connector>,
    players: Arc<dyn PlayerFactory>,
    pipeline: Option<Pipeline>,
    retry: Option<JoinHandle<()>>,
    commands: mpsc::UnboundedReceiver<Command>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    retry_tx: mpsc::UnboundedSender<u64>,
    retry_rx: mpsc::UnboundedReceiver<u64>,
    snapshot: watch::Sender<Snapshot>,
    status: broadcast::Sender<StatusEvent>,
}

impl Controller {
    /// Spawn the controller on the current tokio runtime. The task ends once
    /// every handle has been dropped.
    pub fn spawn(
        config: ControllerConfig,
        connector: Arc<dyn Connector>,
        players: Arc<dyn PlayerFactory>,
    ) -> Result<ControllerHandle> {
        // Every episode builds a buffer from this; reject bad sizing up front
        config.buffer.validate()?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::initial());
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        let handle = ControllerHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            status: status.clone(),
            stream: Arc::new(config.stream.clone()),
        };

        let controller = Controller {
            machine: Lifecycle::new(config.reconnect.clone()),
            config,
            connector,
            players,
            pipeline: None,
            retry: None,
            commands,
            notices_tx,
            notices,
            retry_tx,
            retry_rx,
            snapshot: snapshot_tx,
            status,
        };

        tokio::spawn(controller.run());
        Ok(handle)
    }

    async fn run(mut self) {
        tracing::debug!("Controller started");

        loop {
            let input = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start(identity)) => Input::Start(identity),
                    Some(Command::Stop) => Input::Stop,
                    None => break,
                },
                Some(notice) = self.notices.recv() => match notice.event {
                    SessionEvent::Opened => Input::Opened { episode: notice.episode },
                    SessionEvent::Closed(reason) => Input::Ended {
                        episode: notice.episode,
                        cause: EndCause::Closed(reason),
                    },
                    SessionEvent::Failed(e) => Input::Ended {
                        episode: notice.episode,
                        cause: EndCause::Failed(e),
                    },
                },
                Some(episode) = self.retry_rx.recv() => Input::RetryDue { episode },
            };

            self.dispatch(input);
        }

        self.cancel_retry();
        self.teardown();
        tracing::debug!("Controller finished");
    }

    fn dispatch(&mut self, input: Input) {
        for effect in self.machine.handle(input) {
            match effect {
                Effect::Teardown => {
                    self.publish(LifecycleState::Closing);
                    self.teardown();
                }
                Effect::CancelRetry => self.cancel_retry(),
                Effect::Connect { episode, identity } => self.connect(episode, &identity),
                Effect::ScheduleRetry { episode, delay } => self.schedule_retry(episode, delay),
                Effect::Report(status) => self.report(status),
            }
        }
        self.publish(self.machine.state());
    }

    fn connect(&mut self, episode: u64, identity: &SessionIdentity) {
        // Never two pipelines at once
        self.teardown();

        let url = match identity.stream_url(&self.config.stream) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(episode, "Cannot build stream URL: {}", e);
                let _ = self.notices_tx.send(SessionNotice {
                    episode,
                    session_id: uuid::Uuid::nil(),
                    event: SessionEvent::Failed(e),
                });
                return;
            }
        };

        let buffer: SharedChunkBuffer = Arc::new(ChunkBuffer::from_config(&self.config.buffer));
        let feed = StreamingFeed::new(buffer.clone(), self.config.buffer.poll_interval());

        // Playback faults never stop the stream itself
        let player = match self.players.create(feed, episode) {
            Ok(player) => Some(player),
            Err(e) => {
                tracing::error!(episode, "Failed to start player: {}", e);
                None
            }
        };

        let session = TransportSession::spawn(
            episode,
            url,
            self.connector.clone(),
            SessionTimeouts::from(&self.config.stream),
            buffer.clone(),
            self.notices_tx.clone(),
        );

        self.pipeline = Some(Pipeline {
            buffer,
            session,
            player,
        });
    }

    fn teardown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown();
        }
    }

    fn schedule_retry(&mut self, episode: u64, delay: Duration) {
        self.cancel_retry();
        let tx = self.retry_tx.clone();
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(episode);
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry.take() {
            timer.abort();
        }
    }

    fn report(&mut self, status: Status) {
        tracing::info!(episode = self.machine.episode(), "Status: {}", status.message());
        let event = StatusEvent::new(status, self.machine.episode());
        self.snapshot.send_modify(|s| s.last_status = Some(event.clone()));
        // No subscribers is fine
        let _ = self.status.send(event);
    }

    fn publish(&self, state: LifecycleState) {
        let identity = self.machine.identity().cloned();
        let retries = self.machine.retries();
        let episode = self.machine.episode();

        self.snapshot.send_if_modified(|s| {
            let changed = s.state != state
                || s.identity != identity
                || s.retries != retries
                || s.episode != episode;
            s.state = state;
            s.identity = identity;
            s.retries = retries;
            s.episode = episode;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::tests::MemorySink;
    use crate::audio::playback::PipePlayerFactory;
    use crate::network::testing::ScriptedConnector;
    use std::io::Write;

    fn spawn_with(
        reconnect: ReconnectConfig,
        players: Arc<dyn PlayerFactory>,
    ) -> (ControllerHandle, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new());
        let config = ControllerConfig {
            reconnect,
            ..ControllerConfig::default()
        };
        let handle = Controller::spawn(config, connector.clone(), players).unwrap();
        (handle, connector)
    }

    fn spawn_default() -> (ControllerHandle, Arc<ScriptedConnector>) {
        spawn_with(
            ReconnectConfig::default(),
            Arc::new(PipePlayerFactory::discard()),
        )
    }

    async fn next_status(rx: &mut broadcast::Receiver<StatusEvent>) -> Status {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("no status within timeout")
            .expect("status channel closed")
            .status
    }

    async fn wait_for_state(handle: &ControllerHandle, state: LifecycleState) {
        let mut watch = handle.watch();
        tokio::time::timeout(
            Duration::from_secs(60),
            watch.wait_for(|s| s.state == state),
        )
        .await
        .expect("state not reached")
        .expect("controller gone");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_give_up() {
        let (handle, connector) = spawn_default();
        let mut status = handle.subscribe();

        handle.start("host:3000", "abc123").unwrap();

        let mut reconnects = Vec::new();
        loop {
            match next_status(&mut status).await {
                Status::Reconnecting { attempt, delay_ms } => reconnects.push((attempt, delay_ms)),
                Status::GaveUp { attempts } => {
                    assert_eq!(attempts, 6);
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(
            reconnects,
            vec![(1, 1000), (2, 2000), (3, 3000), (4, 4000), (5, 5000), (6, 5000)]
        );

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 7);
        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|w| (w[1].0 - w[0].0).as_millis() as u64)
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 3000, 4000, 5000, 5000]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempt_count(), 7);
        assert_eq!(handle.state(), LifecycleState::Stopped);
        assert!(handle.snapshot().identity.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_backoff_cancels_reconnect() {
        let (handle, connector) = spawn_default();

        handle.start("host:3000", "abc123").unwrap();
        wait_for_state(&handle, LifecycleState::Backoff).await;
        assert_eq!(connector.attempt_count(), 1);

        handle.stop().unwrap();
        wait_for_state(&handle, LifecycleState::Stopped).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(handle.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_retries() {
        let (handle, connector) = spawn_default();
        let mut status = handle.subscribe();

        connector.refuse_next();
        let link = connector.accept_next();
        handle.start("host:3000", "abc123").unwrap();

        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 0 });
        assert_eq!(
            next_status(&mut status).await,
            Status::Reconnecting { attempt: 1, delay_ms: 1000 }
        );
        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 1 });
        assert_eq!(next_status(&mut status).await, Status::Connected);
        assert_eq!(handle.snapshot().retries, 0);

        link.close();
        assert_eq!(
            next_status(&mut status).await,
            Status::Reconnecting { attempt: 1, delay_ms: 1000 }
        );

        handle.stop().unwrap();
        assert_eq!(next_status(&mut status).await, Status::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_running_session() {
        let (handle, connector) = spawn_default();
        let mut status = handle.subscribe();

        let first = connector.accept_next();
        let _second = connector.accept_next();

        handle.start("host:3000", "abc123").unwrap();
        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 0 });
        assert_eq!(next_status(&mut status).await, Status::Connected);

        handle.start("other:3000", "def456").unwrap();
        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 0 });
        assert_eq!(next_status(&mut status).await, Status::Connected);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !first.is_dropped() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first session kept its connection");
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].1.host_str(), Some("other"));
        assert_eq!(
            handle.snapshot().identity.map(|i| i.identifier().to_string()),
            Some("def456".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handshake_moves_to_backoff() {
        let (handle, connector) = spawn_default();
        let mut status = handle.subscribe();
        connector.hang_next();

        handle.start("host:3000", "abc123").unwrap();
        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 0 });
        assert_eq!(
            next_status(&mut status).await,
            Status::Reconnecting { attempt: 1, delay_ms: 1000 }
        );
        assert_eq!(handle.state(), LifecycleState::Backoff);

        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 1 });
        // The retry is refused, which proves it was attempted
        assert_eq!(
            next_status(&mut status).await,
            Status::Reconnecting { attempt: 2, delay_ms: 2000 }
        );
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        let gap = attempts[1].0 - attempts[0].0;
        let expected = SessionTimeouts::default().connect + Duration::from_millis(1000);
        assert!(gap >= expected && gap < expected + Duration::from_secs(1));

        handle.stop().unwrap();
        assert_eq!(next_status(&mut status).await, Status::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_moves_to_backoff() {
        let (handle, connector) = spawn_default();
        let mut status = handle.subscribe();
        let _link = connector.accept_next();

        handle.start("host:3000", "abc123").unwrap();
        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 0 });
        assert_eq!(next_status(&mut status).await, Status::Connected);
        assert_eq!(
            next_status(&mut status).await,
            Status::Reconnecting { attempt: 1, delay_ms: 1000 }
        );

        handle.stop().unwrap();
        assert_eq!(next_status(&mut status).await, Status::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_rejects_bad_buffer_sizing() {
        let config = ControllerConfig {
            buffer: BufferConfig {
                capacity: 4,
                backlog_threshold: 4,
                ..BufferConfig::default()
            },
            ..ControllerConfig::default()
        };
        let result = Controller::spawn(
            config,
            Arc::new(ScriptedConnector::new()),
            Arc::new(PipePlayerFactory::discard()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_start_is_rejected_without_side_effects() {
        let (handle, connector) = spawn_default();

        assert!(matches!(
            handle.start("", "abc123"),
            Err(Error::Control(ControlError::MissingEndpoint))
        ));
        assert!(matches!(
            handle.start("host:3000", "  "),
            Err(Error::Control(ControlError::MissingIdentifier))
        ));

        tokio::task::yield_now().await;
        assert_eq!(handle.state(), LifecycleState::Idle);
        assert_eq!(connector.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_harmless() {
        let (handle, _connector) = spawn_default();
        handle.stop().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(handle.state(), LifecycleState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_chunks_play_in_order_then_reconnect_and_stop() {
        let sink = MemorySink::default();
        let collected = sink.0.clone();
        let players = Arc::new(PipePlayerFactory::new(move || {
            Ok(Box::new(sink.clone()) as Box<dyn Write + Send>)
        }));
        let reconnect = ReconnectConfig {
            base_delay_ms: 50,
            step_delay_ms: 50,
            max_delay_ms: 200,
            max_attempts: 6,
        };
        let (handle, connector) = spawn_with(reconnect, players);
        let mut status = handle.subscribe();

        let link = connector.accept_next();
        handle.start("http://host:3000", "abc123").unwrap();
        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 0 });
        assert_eq!(next_status(&mut status).await, Status::Connected);
        wait_for_state(&handle, LifecycleState::Streaming).await;

        let chunks: [&[u8]; 5] = [b"c1", b"c2", b"c3", b"c4", b"c5"];
        for chunk in chunks {
            link.binary(chunk);
        }

        let expected = chunks.concat();
        tokio::time::timeout(Duration::from_secs(5), async {
            while collected.lock().len() < expected.len() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("player did not drain the stream");
        assert_eq!(collected.lock().as_slice(), expected.as_slice());

        // Peer closes, the retry is refused, and a stop lands in the next backoff
        link.close();
        assert_eq!(
            next_status(&mut status).await,
            Status::Reconnecting { attempt: 1, delay_ms: 50 }
        );
        assert_eq!(next_status(&mut status).await, Status::Connecting { attempt: 1 });
        assert_eq!(
            next_status(&mut status).await,
            Status::Reconnecting { attempt: 2, delay_ms: 100 }
        );

        handle.stop().unwrap();
        assert_eq!(next_status(&mut status).await, Status::Stopped);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.attempt_count(), 2);
        assert_eq!(handle.state(), LifecycleState::Stopped);

        let url = &connector.attempts()[0].1;
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/api/audio/stream");
        assert!(url.query().unwrap_or_default().contains("serial=abc123"));
    }
}
