/*
[INPUT]:  Error sources (transport, connection lifecycle, serialization, configuration)
[OUTPUT]: Structured error types with retry hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or changing propagation policy
*/

use thiserror::Error;

/// Main error type for the order notification client
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The initial connect attempt failed before the first success
    #[error("Connection failed: {message}")]
    Connection { message: String },

    /// An established session was lost; reconnection runs in the background
    #[error("Transport dropped: {reason}")]
    TransportDropped { reason: String },

    /// Every reconnect attempt failed; the manager settled in `Failed`
    #[error("Reconnection gave up after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// A subscriber callback returned an error or panicked
    #[error("Listener {listener_id} for order {order_id} failed: {message}")]
    ListenerFault {
        order_id: String,
        listener_id: u64,
        message: String,
    },

    /// A pending connect was cancelled by an explicit disconnect
    #[error("Disconnected before the connection was established")]
    Disconnected,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The process-wide client was already created
    #[error("Global client already installed")]
    AlreadyInstalled,

    /// The connection worker is no longer running
    #[error("Connection worker stopped")]
    WorkerStopped,
}

impl NotifyError {
    /// Create a connection error from any displayable cause
    pub fn connection(message: impl Into<String>) -> Self {
        NotifyError::Connection {
            message: message.into(),
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotifyError::Connection { .. }
                | NotifyError::TransportDropped { .. }
                | NotifyError::WebSocket(_)
        )
    }
}

/// Result type alias for order notification operations
pub type Result<T> = std::result::Result<T, NotifyError>;
