//! Core error types for cape.
//!
//! Remote execution failures are never errors at this level: they are
//! normalized into an [`OcfExitCode`](crate::OcfExitCode) and delivered as a
//! completion. What remains here are malformed inputs.

use thiserror::Error;

/// Core error type for cape operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unknown operation method '{0}'")]
    UnknownMethod(String),

    #[error("exit code {0} is outside the OCF range")]
    UnknownExitCode(i32),

    #[error("unknown recovery state '{0}'")]
    UnknownState(String),

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },
}

impl Error {
    /// Create an unknown method error.
    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self::UnknownMethod(method.into())
    }

    /// Create an invalid operation error.
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }
}
