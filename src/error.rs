//! Error types for the voice receiver

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Playback subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to start player: {0}")]
    PlayerSpawn(String),

    #[error("Sink write failed: {0}")]
    SinkWrite(String),
}

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Invalid stream URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Errors raised synchronously by the control surface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Missing endpoint")]
    MissingEndpoint,

    #[error("Missing receiver identifier")]
    MissingIdentifier,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Controller is no longer running")]
    ControllerGone,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
