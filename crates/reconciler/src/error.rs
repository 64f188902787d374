//! Error types for the reconciler crate.
//!
//! Only load-time problems are errors. Once the engine runs, remote failures
//! travel as outcome codes and never surface here.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {format} document: {reason}")]
    Malformed { format: &'static str, reason: String },

    #[error("invalid topology: {reason}")]
    InvalidTopology { reason: String },

    #[error("duplicate {what} '{name}'")]
    Duplicate { what: &'static str, name: String },

    #[error("assembly '{assembly}' uses unknown transport '{kind}'")]
    UnknownTransport { assembly: String, kind: String },

    #[error("resource '{resource}' has class '{class}', which transport '{transport}' cannot run")]
    UnsupportedClass {
        resource: String,
        class: String,
        transport: String,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("instance provider failed: {reason}")]
    Provider { reason: String },

    #[error("engine is not running")]
    EngineStopped,
}

impl Error {
    /// Create a read error.
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Create a malformed document error.
    pub fn malformed(format: &'static str, reason: impl ToString) -> Self {
        Self::Malformed {
            format,
            reason: reason.to_string(),
        }
    }

    /// Create an invalid topology error.
    pub fn invalid_topology(reason: impl Into<String>) -> Self {
        Self::InvalidTopology {
            reason: reason.into(),
        }
    }

    /// Create a duplicate name error.
    pub fn duplicate(what: &'static str, name: impl Into<String>) -> Self {
        Self::Duplicate {
            what,
            name: name.into(),
        }
    }

    /// Create an unknown transport error.
    pub fn unknown_transport(assembly: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::UnknownTransport {
            assembly: assembly.into(),
            kind: kind.into(),
        }
    }

    /// Create an unsupported class error.
    pub fn unsupported_class(
        resource: impl Into<String>,
        class: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self::UnsupportedClass {
            resource: resource.into(),
            class: class.into(),
            transport: transport.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a provider error.
    pub fn provider(reason: impl ToString) -> Self {
        Self::Provider {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::unsupported_class("rsc_bar_angus", "stonith", "cim");
        let text = err.to_string();
        assert!(text.contains("rsc_bar_angus"));
        assert!(text.contains("stonith"));
        assert!(text.contains("cim"));
    }

    #[test]
    fn test_duplicate() {
        let err = Error::duplicate("assembly", "bar");
        assert_eq!(err.to_string(), "duplicate assembly 'bar'");
    }
}
