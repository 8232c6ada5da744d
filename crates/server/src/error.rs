use docsync_common::protocol::FrameError;
use thiserror::Error;

/// Failures of the persistence gateway.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite {operation} for document `{name}` failed: {source}")]
    Sqlite {
        operation: &'static str,
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("persistence task for document `{name}` did not complete: {source}")]
    Task {
        name: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("document store is closed")]
    Closed,
}

/// Failures surfaced by a document session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed frame: {0}")]
    Decode(#[from] FrameError),

    #[error("failed to apply frame: {0:#}")]
    Apply(anyhow::Error),

    #[error("document `{name}` failed to load: {message}")]
    LoadFailed { name: String, message: String },

    #[error("document session is closed")]
    Closed,
}

impl SessionError {
    /// Frame-level errors keep the connection open; everything else ends it.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Apply(_))
    }
}
