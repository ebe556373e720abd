//! Error types for the workspace control plane.
//!
//! Every fallible operation in the crate returns [`Result`]. Daemon errors
//! are normalized into this taxonomy at the runtime-adapter boundary; the
//! tool layer maps each variant to a stable machine code via [`Error::code`]
//! so clients can branch on kind without parsing messages.
//!
//! Security-sensitive payloads (environment values, file contents) must
//! never appear in error messages.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for workspace control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the workspace control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Container not found (unknown id/alias, or terminal).
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Execution not found.
    #[error("exec not found: {0}")]
    ExecNotFound(String),

    /// Workspace path not found.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// Alias collision among live containers.
    #[error("container with alias '{0}' already exists")]
    AliasExists(String),

    // =========================================================================
    // Policy Errors
    // =========================================================================
    /// Image rejected by registry/image policy.
    #[error("image '{image}' rejected by policy: {reason}")]
    ImagePolicy { image: String, reason: String },

    /// Path escapes the workspace root.
    #[error("path violation for '{path}': {reason}")]
    PathViolation { path: String, reason: String },

    /// Optimistic-concurrency token mismatch on a workspace write.
    #[error("etag conflict at '{path}'")]
    EtagConflict { path: String },

    /// Per-container concurrent execution limit reached.
    #[error("container '{container}' is at its concurrent execution limit ({limit})")]
    ConcurrencyLimit { container: String, limit: usize },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Operation exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Execution is already in a terminal state.
    #[error("exec '{exec_id}' already terminal ({status})")]
    ExecTerminal { exec_id: String, status: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Container daemon is down or unreachable.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Container daemon returned an error.
    #[error("container runtime error: {0}")]
    RuntimeError(String),

    // =========================================================================
    // Storage / Configuration Errors
    // =========================================================================
    /// Durable state store failure.
    #[error("state store error: {0}")]
    Store(String),

    /// Configuration could not be loaded or validated.
    #[error("invalid configuration for '{option}': {reason}")]
    Config { option: String, reason: String },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Staging directory could not be restored after a failed batch.
    #[error("staging rollback failed at {path}: {reason}")]
    StagingRollback { path: PathBuf, reason: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Invariant violation (should not happen). Carries a correlation id so
    /// a client report can be matched to server logs.
    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl Error {
    /// Builds an [`Error::Internal`] with a fresh correlation id.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: uuid::Uuid::now_v7().simple().to_string(),
            message: message.into(),
        }
    }

    /// Stable machine code for the error kind.
    ///
    /// These codes are part of the tool contract and must not change across
    /// releases.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContainerNotFound(_) | Self::ExecNotFound(_) | Self::PathNotFound(_) => {
                "not_found"
            }
            Self::AliasExists(_) => "already_exists",
            Self::ImagePolicy { .. } => "image_policy",
            Self::PathViolation { .. } => "path_violation",
            Self::EtagConflict { .. } => "etag_conflict",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled(_) | Self::ExecTerminal { .. } => "cancelled",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::RuntimeError(_) => "runtime_error",
            Self::Store(_)
            | Self::Config { .. }
            | Self::Io(_)
            | Self::StagingRollback { .. }
            | Self::Internal { .. } => "internal",
        }
    }

    /// Returns true if the error indicates the daemon itself is unreachable
    /// (as opposed to rejecting one request).
    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::ContainerNotFound("c_1".into()).code(), "not_found");
        assert_eq!(Error::AliasExists("w1".into()).code(), "already_exists");
        assert_eq!(
            Error::ImagePolicy {
                image: "x".into(),
                reason: "y".into()
            }
            .code(),
            "image_policy"
        );
        assert_eq!(
            Error::PathViolation {
                path: "/etc".into(),
                reason: "escape".into()
            }
            .code(),
            "path_violation"
        );
        assert_eq!(
            Error::EtagConflict { path: "/x".into() }.code(),
            "etag_conflict"
        );
        assert_eq!(
            Error::ConcurrencyLimit {
                container: "c_1".into(),
                limit: 4
            }
            .code(),
            "concurrency_limit"
        );
        assert_eq!(
            Error::RuntimeUnavailable("down".into()).code(),
            "runtime_unavailable"
        );
        assert_eq!(Error::RuntimeError("500".into()).code(), "runtime_error");
        assert_eq!(Error::internal("boom").code(), "internal");
    }

    #[test]
    fn test_internal_carries_correlation_id() {
        let err = Error::internal("invariant broken");
        match &err {
            Error::Internal { correlation_id, .. } => {
                assert!(!correlation_id.is_empty());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(err.to_string().contains("invariant broken"));
    }

    #[test]
    fn test_conflict_message_carries_path_only() {
        let err = Error::EtagConflict {
            path: "/workspace/x".into(),
        };
        assert_eq!(err.to_string(), "etag conflict at '/workspace/x'");
    }
}
