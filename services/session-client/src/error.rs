//! Service-specific error types

use thiserror::Error;

/// Startup errors for the client binary.
///
/// Per-request failures are `session_pipeline::Error` values and are reported
/// by `main` directly; these cover configuration and command-line faults.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Usage: {0}")]
    Usage(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
