//! Unified error types for the procgov workspace.
//!
//! The variants follow the failure classes the supervisor distinguishes:
//! transport and protocol failures are scoped to a single connection,
//! native failures carry the OS error code of the call that failed, and
//! validation failures are raised before any native state is touched.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum ProcgovError {
    /// An I/O operation on a filesystem path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The IPC channel broke or was disconnected.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A peer sent a message that is not valid in the current state.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// A native resource-container call failed.
    #[error("{operation} failed with native error {code}")]
    Native {
        /// Name of the native operation that failed.
        operation: &'static str,
        /// Numeric OS error code.
        code: i32,
    },

    /// A request was rejected before any native state was mutated.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// Target processes already belong to different jobs.
    #[error("processes belong to different jobs: '{first}' and '{second}'")]
    JobConflict {
        /// First job discovered among the targets.
        first: String,
        /// Second, distinct job discovered among the targets.
        second: String,
    },

    /// The requested job name differs from the job the targets already run in.
    #[error("requested job '{requested}' but the process already runs in job '{discovered}'")]
    JobNameMismatch {
        /// Name supplied by the caller.
        requested: String,
        /// Name of the job the targets were found in.
        discovered: String,
    },

    /// A job was created or updated but none of the target processes could
    /// be moved into it.
    #[error("no target process could be assigned to job '{job}' ({failed} failed)")]
    NothingAssigned {
        /// Job the processes were meant to join.
        job: String,
        /// Number of targets whose assignment failed.
        failed: usize,
    },

    /// The supervisor answered a request with an error.
    #[error("supervisor rejected the request: {message}")]
    Rejected {
        /// Error reported by the supervisor.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl ProcgovError {
    /// Builds a [`ProcgovError::Native`] from an I/O error raised by a native call.
    ///
    /// Errors without an OS code (for example, synthetic `io::Error`s) map to `-1`.
    #[must_use]
    pub fn native(operation: &'static str, err: &std::io::Error) -> Self {
        Self::Native {
            operation,
            code: err.raw_os_error().unwrap_or(-1),
        }
    }

    /// Shorthand for a [`ProcgovError::Validation`].
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`ProcgovError::Protocol`].
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns whether this error only affects the connection it occurred on.
    #[must_use]
    pub const fn is_connection_scoped(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ProcgovError>;
