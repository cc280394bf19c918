//! Error types for the relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying a conversation
#[derive(Debug, Error)]
pub enum RelayError {
    /// Upstream (or device handshake) did not complete in time
    #[error("connection timed out after {0} ms")]
    ConnectTimeout(u64),

    /// Event sent before connect completed or after close
    #[error("socket connection is not active, connect first")]
    NotConnected,

    /// A tool call is already waiting to be picked up
    #[error("tool call adding already in progress")]
    ToolCallAlreadyInFlight,

    #[error("tool {name} not found, must be one of {available:?}")]
    UnknownTool {
        name: String,
        available: Vec<String>,
    },

    #[error("failed to parse arguments '{arguments}', must be valid JSON: {reason}")]
    InvalidArguments { arguments: String, reason: String },

    /// Not a failure: emitted to the log when an append overflows capacity
    #[error("capture buffer overflow, forced flush of {flushed} bytes before appending {incoming}")]
    BufferOverflowForcedFlush { flushed: usize, incoming: usize },

    #[error("audio sink write failed: {0}")]
    SinkWriteFailure(String),

    #[error("malformed control frame: {0:?}")]
    MalformedControlFrame(Vec<u8>),

    /// Tool executor was closed, no more calls accepted
    #[error("tool executor closed")]
    ExecutorClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for RelayError {
    fn from(e: hound::Error) -> Self {
        Self::SinkWriteFailure(e.to_string())
    }
}
