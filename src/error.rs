//! Error type shared by every engine component.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Microphone or tool capability was refused by the user.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Microphone or speaker could not be acquired or stopped producing.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The remote stream reported an error or closed unexpectedly.
    #[error("Channel error: {0}")]
    Channel(String),

    /// An inbound event was missing expected fields.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Unknown function: {0}")]
    UnknownTool(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("A session is already active")]
    SessionActive,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl EngineError {
    /// Whether this error ends the active session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Channel(_)
                | Self::DeviceUnavailable(_)
                | Self::PermissionDenied(_)
                | Self::WebSocket(_)
                | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
