//! Transport errors.

use std::io;

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised while reaching a node.
///
/// Action outcomes are never errors: they are reported as
/// [`cape_core::OcfExitCode`] completions. These cover setting up the
/// channel to the node and handing requests to it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no transport of kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("transport '{kind}' cannot run '{class}' resources")]
    UnsupportedClass { kind: String, class: String },

    #[error("cannot connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("CIM request failed: {reason}")]
    Cim { reason: String },

    #[error("message bus closed")]
    BusClosed,

    #[error("object '{object}' is not connected")]
    NotConnected { object: String },
}

impl TransportError {
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    pub fn unsupported_class(kind: impl Into<String>, class: impl Into<String>) -> Self {
        Self::UnsupportedClass {
            kind: kind.into(),
            class: class.into(),
        }
    }

    pub fn connect_failed(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectFailed {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cim(reason: impl Into<String>) -> Self {
        Self::Cim {
            reason: reason.into(),
        }
    }
}

/// Check if an I/O error only means "try again later".
#[must_use]
pub fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}
