//! Error types for delivery operations.

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Delivery error types.
///
/// Recipient-level rejections are never errors; they are reported through
/// [`RecipientStatus`](crate::RecipientStatus). Everything here is either
/// rejected at the call boundary or fatal to every envelope not yet
/// finalized on the connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport or session failure.
    #[error(transparent)]
    Smtp(#[from] mailrelay_smtp::Error),

    /// The server refused the greeting, EHLO/HELO, STARTTLS or RSET.
    #[error("Server rejected {command}: {code} {message}")]
    Rejected {
        /// Command (or `greeting`) that was refused.
        command: &'static str,
        /// Reply code.
        code: u16,
        /// Reply text.
        message: String,
    },

    /// A required extension is not advertised by the server.
    #[error("Server does not support {0}")]
    Unsupported(&'static str),

    /// A reused session was authenticated differently than configured.
    #[error("Reused session does not match the configured {0}")]
    SessionMismatch(&'static str),

    /// Authentication failed.
    #[error("Authentication failed: {code} {message}")]
    Authentication {
        /// Reply code.
        code: u16,
        /// Reply text.
        message: String,
    },

    /// A reply did not arrive in time.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The session closed while envelopes were outstanding.
    #[error("Connection closed before delivery finished")]
    ConnectionClosed,

    /// The delivery was cancelled.
    #[error("Delivery cancelled")]
    Cancelled,

    /// The reply sequence made no sense for the commands sent.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `deliver` was called without envelopes.
    #[error("At least one envelope is required")]
    NoEnvelopes,

    /// An envelope was built without recipients.
    #[error("At least one recipient is required")]
    NoRecipients,

    /// Delivery configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A bounded wait on a delivery future elapsed.
    #[error("Delivery still pending after wait timeout")]
    WaitTimeout,
}

impl Error {
    /// Returns true for failures raised at the call boundary, before any
    /// network activity.
    #[must_use]
    pub const fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::NoEnvelopes | Self::NoRecipients | Self::InvalidConfig(_)
        )
    }

    /// Returns true if a retry later might succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Smtp(e) => e.is_connection_error(),
            Self::Rejected { code, .. } | Self::Authentication { code, .. } => {
                *code >= 400 && *code < 500
            }
            Self::Timeout(_) | Self::ConnectionClosed => true,
            _ => false,
        }
    }
}
