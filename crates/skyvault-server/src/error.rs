//! Error types for the file-storage server
//!
//! Every failure a request can hit maps onto one variant here. Handlers turn
//! them into `success:false` replies with [`Error::sanitized_message`], so the
//! client learns what went wrong without learning server-side paths.

use thiserror::Error;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    ///
    /// Wraps filesystem and socket failures that are not backpressure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame, malformed JSON or a missing required field
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Not logged in, or bad credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Traversal attempt or a path that does not resolve inside the user root
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// File or directory does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Persistence collaborator failure
    #[error("Store error: {0}")]
    Store(#[from] skyvault_core::StoreError),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Peer disconnected or the socket failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if error is due to client input
    ///
    /// # Returns
    ///
    /// `true` if error was caused by invalid client input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPath(_)
                | Error::FileNotFound(_)
                | Error::Protocol(_)
                | Error::Authentication(_)
        )
    }

    /// Check if error is security-related
    ///
    /// # Returns
    ///
    /// `true` if error should be written to the audit trail as a security event
    pub fn is_security_event(&self) -> bool {
        matches!(self, Error::Authentication(_) | Error::InvalidPath(_))
    }

    /// Get sanitized error message for client
    ///
    /// # Returns
    ///
    /// Error message safe to send to client (no server paths or backend detail)
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::Authentication(msg) => msg.clone(),
            Error::InvalidPath(_) => "Invalid path".to_string(),
            Error::FileNotFound(_) => "File not found".to_string(),
            Error::Protocol(msg) => msg.clone(),
            // Don't reveal backend or configuration details
            Error::Store(_) => "Internal storage error".to_string(),
            Error::Config(_) => "Server configuration error".to_string(),
            Error::Io(_) => "Filesystem error".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn protocol(context: impl Into<String>) -> Self {
        Error::Protocol(context.into())
    }

    pub fn invalid_path(context: impl Into<String>) -> Self {
        Error::InvalidPath(context.into())
    }

    pub fn not_logged_in() -> Self {
        Error::Authentication("Not logged in".to_string())
    }
}
