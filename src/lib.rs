//! # LAN Voice Receiver
//!
//! Low-latency playback of a live audio stream delivered over a WebSocket.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               RECEIVER                                    │
//! │                                                                          │
//! │   start/stop (HTTP, CLI)          status events (broadcast)              │
//! │          │                                 ▲                             │
//! │          ▼                                 │                             │
//! │  ┌────────────────────────────────────────────────────────────────────┐ │
//! │  │             Lifecycle Controller (lifecycle::controller)            │ │
//! │  │   Idle → Connecting → Streaming → Closing → Backoff → Stopped       │ │
//! │  └───────────┬──────────────────────────────────────▲─────────────────┘ │
//! │              │ one episode at a time                │ Opened/Closed/    │
//! │              ▼                                      │ Failed (channel)  │
//! │  ┌──────────────────────────┐   binary frames   ┌──┴─────────────────┐ │
//! │  │ Transport Session (ws)   │ ────────────────▶ │   Chunk Buffer     │ │
//! │  │ network::session         │                   │   audio::buffer    │ │
//! │  └──────────────────────────┘                   └──────────┬─────────┘ │
//! │                                                            │ pop(poll)  │
//! │                                                            ▼            │
//! │                                                 ┌────────────────────┐ │
//! │                                                 │ Streaming Feed     │ │
//! │                                                 │ (std::io::Read)    │ │
//! │                                                 └──────────┬─────────┘ │
//! │                                                            ▼            │
//! │                                                 ┌────────────────────┐ │
//! │                                                 │ Player thread      │ │
//! │                                                 │ (pipe / cpal PCM)  │ │
//! │                                                 └────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod protocol;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Name used for the config directory
    pub const APP_NAME: &str = "lan-voice-receiver";

    /// Chunk buffer capacity. With ~250ms chunks this caps latency near 2-3s.
    pub const DEFAULT_QUEUE_CAPACITY: usize = 12;

    /// Queue length at which the whole backlog is dropped
    pub const DEFAULT_BACKLOG_THRESHOLD: usize = 6;

    /// Feed poll timeout in milliseconds
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 120;

    /// Minimum spacing between backlog warnings in milliseconds
    pub const BACKLOG_LOG_WINDOW_MS: u64 = 2000;

    /// First reconnect delay in milliseconds
    pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

    /// Added per earlier reconnect, in milliseconds
    pub const DEFAULT_BACKOFF_STEP_MS: u64 = 1000;

    /// Upper bound for a reconnect delay in milliseconds
    pub const DEFAULT_BACKOFF_CAP_MS: u64 = 5000;

    /// Reconnects attempted before giving up
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 6;

    /// Path of the live stream endpoint on the host
    pub const DEFAULT_STREAM_PATH: &str = "/api/audio/stream";

    /// Path of the relay endpoint
    pub const RELAY_STREAM_PATH: &str = "/api/relay/audio";

    /// Format marker requested from the host
    pub const DEFAULT_STREAM_FORMAT: &str = "webm";

    /// Deadline for the WebSocket handshake in milliseconds
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// An open stream silent for this long counts as dead, in milliseconds
    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 15_000;

    /// Default HTTP port for the control surface
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// PCM defaults for device output
    pub const DEFAULT_PCM_SAMPLE_RATE: u32 = 16000;
    pub const DEFAULT_PCM_CHANNELS: u16 = 1;

    /// Read size used by player threads
    pub const PLAYER_READ_SIZE: usize = 4096;
}
