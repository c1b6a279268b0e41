//! Error types for the builder daemon.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("websocket connection failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("websocket link closed by server")]
    LinkClosed,
    #[error("malformed frame: {0}")]
    BadFrame(#[source] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("subprocess step failed to spawn: {0}")]
    Spawn(std::io::Error),
    #[error("artifact glob pattern {0:?} is invalid: {1}")]
    BadGlob(String, #[source] glob::PatternError),
}

pub type BuilderResult<T> = Result<T, BuilderError>;
