//! Error types for the shairport relay

use crate::frame::FrameParseError;
use crate::supervisor::SessionState;
use std::fmt;
use std::path::PathBuf;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which of the two shairport pipes an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Audio,
    Metadata,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Audio => f.write_str("audio"),
            SourceKind::Metadata => f.write_str("metadata"),
        }
    }
}

/// Errors that can occur while running a relay session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The shairport pipe does not exist
    #[error("{kind} source not found at {}", path.display())]
    SourceUnavailable { kind: SourceKind, path: PathBuf },

    /// Transcoder spawn, exit status or playback failure
    #[error("Pipeline failure: {0}")]
    PipelineFailure(String),

    /// A metadata frame could not be decoded
    #[error("Metadata frame error: {0}")]
    FrameParse(#[from] FrameParseError),

    /// The sink connection went away
    #[error("Transport lost: {0}")]
    TransportLost(String),

    /// The keepalive could not bring playback back
    #[error("Health check failed: {0}")]
    HealthCheckFailure(String),

    /// `start_session` while a session is already running
    #[error("A session is already active ({0})")]
    SessionActive(SessionState),

    /// Operation not allowed in the current session state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Reconnect without a target and no previous one
    #[error("No sink target given and no previous target to reuse")]
    NoTarget,

    /// The supervisor task has terminated
    #[error("Session supervisor is not running")]
    SupervisorGone,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a pipeline failure from a message
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::PipelineFailure(msg.into())
    }

    pub fn source_unavailable(kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self::SourceUnavailable {
            kind,
            path: path.into(),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::SupervisorGone
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::SupervisorGone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_unavailable_names_the_pipe() {
        let err = Error::source_unavailable(SourceKind::Metadata, "/tmp/shairport-sync-metadata");
        assert_eq!(
            err.to_string(),
            "metadata source not found at /tmp/shairport-sync-metadata"
        );
    }
}
