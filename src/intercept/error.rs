//! Interception error types

use thiserror::Error;

/// Result type for interception operations
pub type Result<T> = std::result::Result<T, InterceptError>;

/// Errors raised while starting the listener or serving a connection
#[derive(Error, Debug)]
pub enum InterceptError {
    /// Binding the listening socket failed
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// The audit log destination could not be opened
    #[error("Failed to open log file {path}: {source}")]
    LogOpenFailed {
        path: String,
        source: std::io::Error,
    },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// Client did not finish the handshake in time
    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InterceptError {
    /// Create a TLS handshake error
    pub fn tls_handshake(msg: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed(msg.into())
    }
}
