//! Error types for credential storage and renewal

/// Errors from the renewal exchange.
///
/// Mirror I/O never surfaces here: the credential store logs and swallows it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("renewal timed out after {0}ms")]
    Timeout(u128),

    #[error("renewal rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed renewal response: {0}")]
    Malformed(String),
}

impl Error {
    /// HTTP status of the renewal response, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
