//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] rcache_protocol::ProtocolError),

    #[error("cache fetch failed: {0}")]
    Fetch(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("server shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::Fetch("row group vanished".to_string());
        assert!(err.to_string().contains("row group vanished"));

        let err = ServerError::ShuttingDown;
        assert_eq!(err.to_string(), "server shutting down");
    }
}
