//! Typed errors for the component boundaries of the bridge.
//!
//! Each component converts its failures into one of these enums at its own
//! boundary. The server and the binary fold them into `anyhow` when all that is
//! left to do is report them.
use thiserror::Error;

/// Failures of the mesh link itself (open, frame, write, shutdown).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial support not compiled in (enable the `serial` feature)")]
    SerialUnavailable,

    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("frame payload too large ({0} bytes)")]
    PayloadTooLarge(usize),

    #[error("write failed: {0}")]
    Write(String),

    #[error("writer task is not running")]
    WriterGone,
}

/// Result of a single outbound broadcast attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("cannot send message: not connected to a Meshtastic device")]
    NotConnected,

    #[error("transmit failed: {0}")]
    TransmitFailure(String),
}

/// Precondition failures of the bot state machine.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("must be connected to a Meshtastic device")]
    NotConnected,

    #[error("AI service must be enabled")]
    ServiceNotReady,
}

/// Configuration rejected at the point it is armed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("completion service API key is required (set llm.api_key or OPENAI_API_KEY)")]
    MissingCredential,

    #[error("command prefix must not be empty")]
    EmptyPrefix,

    #[error("max_response_length {0} is too small (minimum 4)")]
    DegenerateLength(usize),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures of the remote completion call. Never crosses the adapter boundary
/// as an error; the adapter turns it into an error-flagged response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected by completion service")]
    Auth,

    #[error("completion service quota or rate limit exceeded")]
    Quota,

    #[error("completion service returned HTTP {0}")]
    Http(u16),

    #[error("malformed completion response: {0}")]
    Malformed(String),

    #[error("completion service returned no text")]
    Empty,
}

impl ServiceError {
    /// Short reason suitable for sending over the air. Never includes the raw
    /// transport error text.
    pub fn short_reason(&self) -> String {
        match self {
            ServiceError::Network(_) => "service unreachable".to_string(),
            ServiceError::Auth => "invalid API key".to_string(),
            ServiceError::Quota => "quota exceeded".to_string(),
            ServiceError::Http(code) => format!("service error {}", code),
            ServiceError::Malformed(_) => "bad response".to_string(),
            ServiceError::Empty => "empty response".to_string(),
        }
    }
}

/// Refusal by the query dispatcher.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    QueueFull,

    #[error("dispatcher has shut down")]
    Closed,
}
