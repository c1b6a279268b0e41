//! Error taxonomy for the task store (spec.md §7): Transient vs.
//! non-retriable, kept as distinct variants so callers can tell a
//! `Busy` apart from a hard failure the way spec.md §4.A requires.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskDbError {
    /// Transient: the database was locked; retry on the next tick.
    #[error("database busy")]
    Busy,

    #[error("failed to open database: {0}")]
    OpenFailed(#[source] rusqlite::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such task: {0}")]
    NoSuchTask(String),

    #[error("no such event: {0}")]
    NoSuchEvent(String),

    #[error("no such artifact: {0}")]
    NoSuchArtifact(String),

    #[error("domain error: {0}")]
    Domain(String),
}

pub type TaskDbResult<T> = Result<T, TaskDbError>;

/// Classifies a raw sqlite error so callers can distinguish "busy,
/// retry me" from a real failure (spec.md §4.A).
pub fn classify(err: rusqlite::Error) -> TaskDbError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.code == rusqlite::ErrorCode::DatabaseBusy || e.code == rusqlite::ErrorCode::DatabaseLocked {
            return TaskDbError::Busy;
        }
    }
    TaskDbError::Sqlite(err)
}
