//! Error types for switch and host command operations.

use std::io;
use thiserror::Error;

/// Result type alias for switch operations.
pub type OvsResult<T> = Result<T, OvsError>;

/// Errors raised while driving Open vSwitch or the host link layer.
#[derive(Debug, Error)]
pub enum OvsError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Tool output could not be interpreted.
    #[error("Failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed (e.g. "Interface table").
        what: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl OvsError {
    /// Creates a parse error.
    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on the next polling cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OvsError::ShellExec { .. }
                | OvsError::ShellCommandFailed { .. }
                | OvsError::Parse { .. }
        )
    }
}
