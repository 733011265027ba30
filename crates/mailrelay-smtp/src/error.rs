//! Error types for SMTP transport operations.

use std::io;

/// Result type alias for SMTP transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP transport error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Protocol error (malformed reply).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid envelope address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Invalid destination (host and port).
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// The peer closed the connection or the session was closed locally.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Connection admission refused because every active slot and queue
    /// position is taken.
    #[error("Connection limit reached ({active} active, {queued} queued)")]
    LimitExceeded {
        /// Maximum number of active connections.
        active: usize,
        /// Maximum number of queued connection requests.
        queued: usize,
    },
}

impl Error {
    /// Returns true if the error means the connection can no longer be used.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Tls(_) | Self::ConnectionClosed | Self::Timeout(_)
        )
    }
}
