//! Error types for chronicle-core operations.

use std::path::PathBuf;
use std::time::Duration;

use chronicle_protocol::{
    ErrorInfo, ERROR_ALREADY_ACTIVE_ELSEWHERE, ERROR_ALREADY_PROCESSING, ERROR_DISCONNECTED,
    ERROR_TIMEOUT,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Component errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures of one `send_request` on the worker channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The request exceeded its deadline. Retryable by the caller.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The transport is down. Reconnect before retrying.
    #[error("worker channel disconnected")]
    Disconnected,

    /// The worker answered with an `error` member.
    #[error("worker rejected request: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    #[error("processing already in flight for {document_id}")]
    AlreadyProcessing { document_id: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The worker pushed `ai:processing-error` for the document.
    #[error("worker failed to process document: {message}")]
    Worker { message: String },

    /// The request was cancelled locally or the handle outlived the coordinator.
    #[error("processing cancelled")]
    Cancelled,
}

impl ProcessingError {
    /// Short category shown next to the "Retry" action.
    pub fn category(&self) -> &'static str {
        match self {
            ProcessingError::AlreadyProcessing { .. } => ERROR_ALREADY_PROCESSING,
            ProcessingError::Channel(ChannelError::Timeout(_)) => ERROR_TIMEOUT,
            ProcessingError::Channel(ChannelError::Disconnected) => ERROR_DISCONNECTED,
            ProcessingError::Channel(_) => "channel_error",
            ProcessingError::Worker { .. } => "worker_error",
            ProcessingError::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("repository not found at {0}")]
    RepoNotFound(PathBuf),

    #[error("path is outside the workspace: {0}")]
    OutsideWorkspace(PathBuf),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("commit worker is not running")]
    WorkerStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to read session metadata {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write session metadata {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session metadata malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("failed to read configuration {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Home directory not found")]
    HomeNotFound,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Crate error
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors surfaced by the public API.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{document_id} cannot start: {active} already has an active session")]
    AlreadyActiveElsewhere { document_id: String, active: String },

    #[error("no session is tracked for {0}")]
    NotTracked(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("commit failed: {0}")]
    CommitFailed(#[from] CommitError),

    #[error("persistence write failed: {0}")]
    PersistenceWriteFailed(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A blocking tracker task was cancelled before finishing, e.g. while the
    /// runtime shuts down.
    #[error("session task did not finish: {0}")]
    TaskCancelled(String),
}

impl CoreError {
    /// Maps the error onto the control protocol's `{code, message}` shape.
    pub fn to_error_info(&self) -> ErrorInfo {
        let code = match self {
            CoreError::AlreadyActiveElsewhere { .. } => ERROR_ALREADY_ACTIVE_ELSEWHERE,
            CoreError::NotTracked(_) => chronicle_protocol::ERROR_NOT_TRACKED,
            CoreError::Processing(err) => err.category(),
            CoreError::Channel(ChannelError::Timeout(_)) => ERROR_TIMEOUT,
            CoreError::Channel(ChannelError::Disconnected) => ERROR_DISCONNECTED,
            CoreError::Channel(_) => "channel_error",
            CoreError::CommitFailed(_) => "commit_failed",
            CoreError::PersistenceWriteFailed(_) => "persistence_write_failed",
            CoreError::Config(_) => "config_error",
            CoreError::TaskCancelled(_) => "internal_error",
        };
        ErrorInfo::new(code, self.to_string())
    }
}

impl From<CoreError> for ErrorInfo {
    fn from(err: CoreError) -> Self {
        err.to_error_info()
    }
}

/// Convenience type alias for Results using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_categories_follow_channel_failure() {
        let timeout = ProcessingError::from(ChannelError::Timeout(Duration::from_secs(5)));
        assert_eq!(timeout.category(), ERROR_TIMEOUT);
        let dropped = ProcessingError::from(ChannelError::Disconnected);
        assert_eq!(dropped.category(), ERROR_DISCONNECTED);
    }

    #[test]
    fn core_error_maps_to_protocol_codes() {
        let err = CoreError::AlreadyActiveElsewhere {
            document_id: "/w/b.md".to_string(),
            active: "/w/a.md".to_string(),
        };
        let info = err.to_error_info();
        assert_eq!(info.code, ERROR_ALREADY_ACTIVE_ELSEWHERE);
        assert!(info.message.contains("/w/a.md"));

        let busy = CoreError::from(ProcessingError::AlreadyProcessing {
            document_id: "/w/a.md".to_string(),
        });
        assert_eq!(busy.to_error_info().code, ERROR_ALREADY_PROCESSING);
    }
}
