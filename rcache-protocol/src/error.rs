//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or payload handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown status code: {0}")]
    UnknownStatus(u32),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("truncated payload: need {needed} more bytes")]
    TruncatedPayload { needed: usize },

    #[error("invalid UTF-8 in payload field")]
    InvalidUtf8,

    #[error("compression error: {0}")]
    Compression(String),

    #[error("inflated size mismatch: declared {expected}, got {actual}")]
    InflatedSizeMismatch { expected: u32, actual: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
