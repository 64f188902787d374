//! Result alias and logging combinators.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for cape core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for results whose failure is reported and then absorbed.
///
/// The reactor never propagates errors upward; call sites that hit a
/// best-effort failure log it and carry on with a fallback.
pub trait ResultExt<T> {
    /// Convert to an Option, logging the error at warn level if present.
    fn into_option_logged(self, context: &str) -> Option<T>;

    /// Get the value or a default, logging the error at warn level if present.
    fn or_default_logged(self, default: T, context: &str) -> T;
}

impl<T, E: Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{context}");
                None
            }
        }
    }

    fn or_default_logged(self, default: T, context: &str) -> T {
        self.into_option_logged(context).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_into_option_logged() {
        let ok: Result<u32> = Ok(7);
        assert_eq!(ok.into_option_logged("reading"), Some(7));

        let err: Result<u32> = Err(Error::UnknownExitCode(42));
        assert_eq!(err.into_option_logged("reading"), None);
    }

    #[test]
    fn test_or_default_logged() {
        let err: std::result::Result<u32, String> = Err("boom".to_string());
        assert_eq!(err.or_default_logged(3, "parsing"), 3);
    }
}
