//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for event operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Event error types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("event channel closed")]
    ChannelClosed,

    #[error("no event buffered")]
    Empty,

    #[error("subscriber lagged, {skipped} events skipped")]
    Lagged { skipped: u64 },

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event socket error: {0}")]
    Io(#[from] std::io::Error),
}
