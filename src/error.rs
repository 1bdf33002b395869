//! Error taxonomy shared by the engine, the source adapters and the transport.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Fetch or subscribe against the store failed. Retried, never fatal on its own.
    #[error("signal source unavailable: {0}")]
    SourceUnavailable(String),

    /// The change-notification subscription was lost or produced garbage.
    #[error("change channel degraded: {0}")]
    ChannelDegraded(String),

    #[error("client protocol violation: {0}")]
    ClientProtocolViolation(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("backpressure exceeded for connection {0}")]
    BackpressureExceeded(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(e: tokio_postgres::Error) -> Self {
        EngineError::SourceUnavailable(e.to_string())
    }
}

impl EngineError {
    /// Whether a retry of the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::SourceUnavailable(_) | EngineError::ChannelDegraded(_) | EngineError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
