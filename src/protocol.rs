//! Status and control messages exchanged with the outside world

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status transitions reported to presentation collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    Connecting { attempt: u32 },
    Connected,
    Reconnecting { attempt: u32, delay_ms: u64 },
    Stopped,
    GaveUp { attempts: u32 },
}

impl Status {
    /// Short human-readable form for notifications and logs
    pub fn message(&self) -> String {
        match self {
            Status::Connecting { attempt: 0 } => "Connecting...".to_string(),
            Status::Connecting { attempt } => format!("Connecting (retry {})...", attempt),
            Status::Connected => "Receiving".to_string(),
            Status::Reconnecting { attempt, delay_ms } => {
                format!("Reconnecting in {} ms (retry {})", delay_ms, attempt)
            }
            Status::Stopped => "Stopped".to_string(),
            Status::GaveUp { attempts } => format!("Disconnected (gave up after {} retries)", attempts),
        }
    }
}

/// A status transition with the time it happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(flatten)]
    pub status: Status,
    pub episode: u64,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(status: Status, episode: u64) -> Self {
        Self {
            status,
            episode,
            at: Utc::now(),
        }
    }
}

/// Start request accepted by the HTTP control surface
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default, alias = "endpoint")]
    pub server_url: String,
    #[serde(default, alias = "identifier")]
    pub serial: String,
}
