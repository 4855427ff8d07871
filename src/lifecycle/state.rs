//! Reconnect state machine
//!
//! All transition logic lives here. The machine is pure: it consumes
//! [`Input`]s and returns the [`Effect`]s the controller must carry out,
//! which keeps every transition testable without sockets or timers.

use serde::Serialize;
use std::time::Duration;

use crate::config::ReconnectConfig;
use crate::error::NetworkError;
use crate::network::SessionIdentity;
use crate::protocol::Status;

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Connecting,
    Streaming,
    Closing,
    Backoff,
    Stopped,
}

impl LifecycleState {
    /// Whether a pipeline or a pending reconnect exists
    pub fn is_active(self) -> bool {
        matches!(
            self,
            LifecycleState::Connecting
                | LifecycleState::Streaming
                | LifecycleState::Closing
                | LifecycleState::Backoff
        )
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndCause {
    Closed(String),
    Failed(NetworkError),
}

/// Something that happened to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start(SessionIdentity),
    Stop,
    Opened { episode: u64 },
    Ended { episode: u64, cause: EndCause },
    RetryDue { episode: u64 },
}

/// Work the controller must perform, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// End the current buffer, close the session, stop the player
    Teardown,
    /// Abort the pending reconnect timer
    CancelRetry,
    /// Build a fresh buffer, feed, player and session for `episode`
    Connect {
        episode: u64,
        identity: SessionIdentity,
    },
    /// Fire [`Input::RetryDue`] for `episode` after `delay`
    ScheduleRetry { episode: u64, delay: Duration },
    Report(Status),
}

/// The state machine itself
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: LifecycleState,
    identity: Option<SessionIdentity>,
    retries: u32,
    episode: u64,
    policy: ReconnectConfig,
}

impl Lifecycle {
    pub fn new(policy: ReconnectConfig) -> Self {
        Self {
            state: LifecycleState::Idle,
            identity: None,
            retries: 0,
            episode: 0,
            policy,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Apply one input and return the resulting effects
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Start(identity) => self.start(identity),
            Input::Stop => self.stop(),
            Input::Opened { episode } => self.opened(episode),
            Input::Ended { episode, cause } => self.ended(episode, cause),
            Input::RetryDue { episode } => self.retry_due(episode),
        }
    }

    fn start(&mut self, identity: SessionIdentity) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state.is_active() {
            effects.push(Effect::CancelRetry);
            effects.push(Effect::Teardown);
        }

        self.identity = Some(identity.clone());
        self.retries = 0;
        self.episode += 1;
        self.state = LifecycleState::Connecting;

        effects.push(Effect::Report(Status::Connecting { attempt: 0 }));
        effects.push(Effect::Connect {
            episode: self.episode,
            identity,
        });
        effects
    }

    fn stop(&mut self) -> Vec<Effect> {
        if !self.state.is_active() {
            return Vec::new();
        }

        // Clearing the identity and bumping the episode turns any
        // in-flight timer or session notice into a no-op.
        self.identity = None;
        self.episode += 1;
        self.state = LifecycleState::Stopped;

        vec![
            Effect::CancelRetry,
            Effect::Teardown,
            Effect::Report(Status::Stopped),
        ]
    }

    fn opened(&mut self, episode: u64) -> Vec<Effect> {
        if episode != self.episode || self.state != LifecycleState::Connecting {
            return Vec::new();
        }

        self.state = LifecycleState::Streaming;
        self.retries = 0;
        vec![Effect::Report(Status::Connected)]
    }

    fn ended(&mut self, episode: u64, cause: EndCause) -> Vec<Effect> {
        if episode != self.episode
            || !matches!(
                self.state,
                LifecycleState::Connecting | LifecycleState::Streaming
            )
        {
            return Vec::new();
        }

        match &cause {
            EndCause::Closed(reason) => tracing::info!(episode, "Session closed: {}", reason),
            EndCause::Failed(e) => tracing::warn!(episode, "Session failed: {}", e),
        }

        self.state = LifecycleState::Closing;
        let mut effects = vec![Effect::Teardown];

        if self.retries >= self.policy.max_attempts {
            self.identity = None;
            self.state = LifecycleState::Stopped;
            effects.push(Effect::Report(Status::GaveUp {
                attempts: self.retries,
            }));
            return effects;
        }

        let delay = self.policy.delay_for(self.retries);
        self.retries += 1;
        self.state = LifecycleState::Backoff;

        effects.push(Effect::ScheduleRetry { episode, delay });
        effects.push(Effect::Report(Status::Reconnecting {
            attempt: self.retries,
            delay_ms: delay.as_millis() as u64,
        }));
        effects
    }

    fn retry_due(&mut self, episode: u64) -> Vec<Effect> {
        if episode != self.episode || self.state != LifecycleState::Backoff {
            return Vec::new();
        }
        let Some(identity) = self.identity.clone() else {
            return Vec::new();
        };

        self.episode += 1;
        self.state = LifecycleState::Connecting;
        vec![
            Effect::Report(Status::Connecting {
                attempt: self.retries,
            }),
            Effect::Connect {
                episode: self.episode,
                identity,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity::new("host:3000", "abc123").unwrap()
    }

    fn machine() -> Lifecycle {
        Lifecycle::new(ReconnectConfig::default())
    }

    fn failed() -> EndCause {
        EndCause::Failed(NetworkError::ConnectionFailed("refused".into()))
    }

    fn scheduled_delay(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleRetry { delay, .. } => Some(*delay),
            _ => None,
        })
    }

    fn connect_episode(effects: &[Effect]) -> Option<u64> {
        effects.iter().find_map(|e| match e {
            Effect::Connect { episode, .. } => Some(*episode),
            _ => None,
        })
    }

    #[test]
    fn test_start_connects() {
        let mut m = machine();
        let effects = m.handle(Input::Start(identity()));

        assert_eq!(m.state(), LifecycleState::Connecting);
        assert_eq!(
            effects,
            vec![
                Effect::Report(Status::Connecting { attempt: 0 }),
                Effect::Connect {
                    episode: 1,
                    identity: identity()
                },
            ]
        );
    }

    #[test]
    fn test_backoff_sequence_then_give_up() {
        let mut m = machine();
        let mut episode = connect_episode(&m.handle(Input::Start(identity()))).unwrap();
        let mut delays = Vec::new();
        let mut connects = 1;

        loop {
            let effects = m.handle(Input::Ended {
                episode,
                cause: failed(),
            });
            match scheduled_delay(&effects) {
                Some(delay) => {
                    delays.push(delay.as_millis() as u64);
                    let effects = m.handle(Input::RetryDue { episode });
                    episode = connect_episode(&effects).unwrap();
                    connects += 1;
                }
                None => {
                    assert!(effects.contains(&Effect::Report(Status::GaveUp { attempts: 6 })));
                    break;
                }
            }
        }

        assert_eq!(delays, vec![1000, 2000, 3000, 4000, 5000, 5000]);
        assert_eq!(connects, 7);
        assert_eq!(m.state(), LifecycleState::Stopped);
        assert!(m.identity().is_none());
    }

    #[test]
    fn test_open_resets_retries() {
        let mut m = machine();
        let first = connect_episode(&m.handle(Input::Start(identity()))).unwrap();
        m.handle(Input::Ended {
            episode: first,
            cause: failed(),
        });
        let second = connect_episode(&m.handle(Input::RetryDue { episode: first })).unwrap();
        assert_eq!(m.retries(), 1);

        let effects = m.handle(Input::Opened { episode: second });
        assert_eq!(effects, vec![Effect::Report(Status::Connected)]);
        assert_eq!(m.state(), LifecycleState::Streaming);
        assert_eq!(m.retries(), 0);

        let effects = m.handle(Input::Ended {
            episode: second,
            cause: EndCause::Closed("bye".into()),
        });
        assert_eq!(scheduled_delay(&effects), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_stop_during_backoff_neutralizes_timer() {
        let mut m = machine();
        let episode = connect_episode(&m.handle(Input::Start(identity()))).unwrap();
        m.handle(Input::Ended {
            episode,
            cause: failed(),
        });
        assert_eq!(m.state(), LifecycleState::Backoff);

        let effects = m.handle(Input::Stop);
        assert_eq!(
            effects,
            vec![
                Effect::CancelRetry,
                Effect::Teardown,
                Effect::Report(Status::Stopped)
            ]
        );

        assert!(m.handle(Input::RetryDue { episode }).is_empty());
        assert_eq!(m.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_stale_notices_are_ignored() {
        let mut m = machine();
        let first = connect_episode(&m.handle(Input::Start(identity()))).unwrap();
        let second = connect_episode(&m.handle(Input::Start(identity()))).unwrap();
        assert_ne!(first, second);

        assert!(m.handle(Input::Opened { episode: first }).is_empty());
        assert!(m
            .handle(Input::Ended {
                episode: first,
                cause: failed()
            })
            .is_empty());
        assert_eq!(m.state(), LifecycleState::Connecting);
    }

    #[test]
    fn test_restart_tears_down_running_pipeline() {
        let mut m = machine();
        let episode = connect_episode(&m.handle(Input::Start(identity()))).unwrap();
        m.handle(Input::Opened { episode });

        let effects = m.handle(Input::Start(identity()));
        assert_eq!(effects[0], Effect::CancelRetry);
        assert_eq!(effects[1], Effect::Teardown);
        assert_eq!(connect_episode(&effects), Some(episode + 1));
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut m = machine();
        assert!(m.handle(Input::Stop).is_empty());
        assert_eq!(m.state(), LifecycleState::Idle);
    }

    #[test]
    fn test_start_after_give_up() {
        let mut m = Lifecycle::new(ReconnectConfig {
            max_attempts: 0,
            ..ReconnectConfig::default()
        });
        let episode = connect_episode(&m.handle(Input::Start(identity()))).unwrap();
        m.handle(Input::Ended {
            episode,
            cause: failed(),
        });
        assert_eq!(m.state(), LifecycleState::Stopped);

        m.handle(Input::Start(identity()));
        assert_eq!(m.state(), LifecycleState::Connecting);
        assert_eq!(m.retries(), 0);
    }
}
