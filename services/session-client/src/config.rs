//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The refresh token is loaded from the REFRESH_TOKEN env var or
//! refresh_token_file, never stored in the TOML directly.

use serde::Deserialize;
use session_auth::{DEFAULT_RENEWAL_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, REFRESH_COOKIE, REFRESH_PATH};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Upstream API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
}

/// Session persistence and renewal cookie settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// File mirroring the access credential across restarts
    #[serde(default)]
    pub mirror_path: Option<PathBuf>,
    #[serde(default = "default_refresh_cookie")]
    pub refresh_cookie: String,
    /// Path to a file containing the refresh token (alternative to REFRESH_TOKEN)
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub refresh_token: Option<RefreshToken>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mirror_path: None,
            refresh_cookie: default_refresh_cookie(),
            refresh_token_file: None,
            refresh_token: None,
        }
    }
}

/// Long-lived renewal token; redacted in Debug/Display, zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken(String);

impl RefreshToken {
    /// Expose the raw token (use sparingly)
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Drop for RefreshToken {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn default_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_refresh_timeout() -> u64 {
    DEFAULT_RENEWAL_TIMEOUT.as_secs()
}

fn default_refresh_path() -> String {
    REFRESH_PATH.to_string()
}

fn default_refresh_cookie() -> String {
    REFRESH_COOKIE.to_string()
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Refresh token resolution order:
    /// 1. REFRESH_TOKEN env var
    /// 2. refresh_token_file path from config
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("API_BASE_URL") {
            config.api.base_url = url;
        }

        config.validate()?;

        if let Ok(token) = std::env::var("REFRESH_TOKEN") {
            config.session.refresh_token = Some(RefreshToken(token));
        } else if let Some(ref token_file) = config.session.refresh_token_file {
            let mut raw = std::fs::read_to_string(token_file).map_err(|e| {
                Error::Config(format!(
                    "failed to read refresh_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = RefreshToken(raw.trim().to_owned());
            raw.zeroize();
            if !token.expose().is_empty() {
                config.session.refresh_token = Some(token);
            }
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let api = &self.api;
        if !api.base_url.starts_with("http://") && !api.base_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                api.base_url
            )));
        }

        if api.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be greater than 0".into()));
        }

        if api.refresh_timeout_secs == 0 {
            return Err(Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }

        // Renewal must settle before the request that triggered it times out
        if api.refresh_timeout_secs >= api.timeout_secs {
            return Err(Error::Config(format!(
                "refresh_timeout_secs ({}) must be less than timeout_secs ({})",
                api.refresh_timeout_secs, api.timeout_secs
            )));
        }

        if !api.refresh_path.starts_with('/') {
            return Err(Error::Config(format!(
                "refresh_path must start with /, got: {}",
                api.refresh_path
            )));
        }

        if self.session.refresh_cookie.trim().is_empty() {
            return Err(Error::Config("refresh_cookie must not be empty".into()));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-client.toml")
    }
}
