//! Error types for pipeline operations
//!
//! Every failure a caller sees is one of these, with a normalized
//! `{status, message}` shape. Expired credentials that renewal recovers from
//! never surface; they only become `AuthFinal` when recovery is impossible.

/// Errors returned by the dispatcher and the refresh coordinator.
///
/// `Clone` so one renewal failure can be handed to every queued caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("network failure: {0}")]
    Network(String),

    #[error("authentication failed: {message}")]
    AuthFinal {
        status: Option<u16>,
        message: String,
    },

    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response decode failed: {0}")]
    Decode(String),
}

impl Error {
    /// HTTP status associated with the failure, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::AuthFinal { status, .. } => *status,
            Error::Client { status, .. } | Error::Server { status, .. } => Some(*status),
            Error::Network(_) | Error::InvalidRequest(_) | Error::Decode(_) => None,
        }
    }

    /// Human-readable message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::AuthFinal { message, .. }
            | Error::Client { message, .. }
            | Error::Server { message, .. } => message,
            Error::Network(message) | Error::InvalidRequest(message) | Error::Decode(message) => {
                message
            }
        }
    }

    /// Whether re-authentication is required.
    pub fn is_auth_final(&self) -> bool {
        matches!(self, Error::AuthFinal { .. })
    }
}

/// Renewal failures of any kind end the session.
impl From<session_auth::Error> for Error {
    fn from(e: session_auth::Error) -> Self {
        Error::AuthFinal {
            status: e.status(),
            message: e.to_string(),
        }
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
