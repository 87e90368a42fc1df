//! # Error Types
//!
//! Custom error types for the tank gateway using `thiserror`.
//!
//! Frame- and relay-level errors never leave the telemetry pipeline; they are
//! logged and leave their mark only on the measurement and statistics. Only
//! [`GatewayError`] is surfaced to `main`, and only during start-up.

use thiserror::Error;

/// Main error type for the tank gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No modem found on any of the candidate paths
    #[error("No radio modem found (tried: {0})")]
    SerialPortNotFound(String),

    /// Persistent storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Wi-Fi driver errors
    #[error("Wi-Fi error: {0}")]
    Wifi(#[from] WifiError),
}

/// Failures of the credential and boot-cycle stores.
///
/// A failed load is always downgraded to "unconfigured" by the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("refusing to save: {0}")]
    Invalid(&'static str),
}

/// Reasons a line from the modem does not yield a raw sensor code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("not a receive event")]
    NotDataEvent,

    #[error("receive event carries no payload")]
    MissingPayload,

    #[error("malformed frame payload {0:?}")]
    MalformedFrame(String),

    #[error("raw value {0} outside 0..=1023")]
    OutOfRangeValue(u16),
}

/// Modem command round-trip failures.
#[derive(Debug, Error)]
pub enum ModemError {
    #[error("no acknowledgement for {command} within {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("{command} rejected: {response}")]
    Rejected { command: String, response: String },

    #[error("modem I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("modem line reader closed")]
    Closed,
}

/// Backend relay failures for a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("backend endpoint unreachable: {0}")]
    BackendUnreachable(String),

    #[error("backend answered HTTP {0}")]
    BackendHttp(u16),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Rejected configuration-portal submissions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("submission is not a valid configuration document: {0}")]
    Malformed(String),

    #[error("network name and password must not be empty")]
    EmptyCredentials,
}

/// Wi-Fi interface control failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WifiError {
    #[error("wifi command failed: {0}")]
    Command(String),

    #[error("wifi tooling unavailable: {0}")]
    Unavailable(String),
}

/// Failures reading an HTTP request from a portal client.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("client I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("client did not send a complete request in time")]
    Timeout,

    #[error("request exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Result type alias for the tank gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
