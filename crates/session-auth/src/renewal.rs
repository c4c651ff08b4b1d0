//! Access credential renewal
//!
//! Trades the long-lived refresh credential for a new access credential with
//! `GET <base_url>/auth/refresh`. The refresh credential itself is a cookie
//! held by the HTTP client's cookie jar; this module never sees it.
//!
//! The renewal call runs on its own timeout, shorter than the one used for
//! ordinary requests, and never goes through the request dispatcher.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::credentials::AccessCredential;
use crate::error::{Error, Result};

/// Anything that can produce a fresh access credential.
///
/// Uses `Pin<Box<dyn Future>>` so the coordinator can hold an `Arc<dyn Renewer>`.
pub trait Renewer: Send + Sync {
    fn renew(&self) -> Pin<Box<dyn Future<Output = Result<AccessCredential>> + Send + '_>>;
}

/// Body returned by the renewal endpoint.
///
/// Only the access token is read; user details and the rotated refresh cookie
/// are left to the transport.
#[derive(Debug, Deserialize)]
pub struct RenewalResponse {
    #[serde(default, rename = "accessToken", alias = "access_token")]
    pub access_token: Option<String>,
}

/// Client for the renewal endpoint.
#[derive(Clone)]
pub struct RenewalClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RenewalClient {
    /// `client` must share the cookie jar that holds the refresh credential.
    pub fn new(client: reqwest::Client, base_url: &str, refresh_path: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), refresh_path),
            timeout,
        }
    }

    /// Full URL of the renewal endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call the renewal endpoint once.
    pub async fn renew(&self) -> Result<AccessCredential> {
        debug!(url = %self.url, "requesting credential renewal");
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(self.timeout.as_millis())
                } else {
                    Error::Http(format!("renewal request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            let message = server_message(&body).unwrap_or(body);
            warn!(status = status.as_u16(), "renewal endpoint rejected the refresh credential");
            return Err(Error::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<RenewalResponse>()
            .await
            .map_err(|e| Error::Malformed(format!("invalid renewal response: {e}")))?;

        match body.access_token {
            Some(token) if !token.is_empty() => Ok(AccessCredential::new(token)),
            _ => Err(Error::Malformed(
                "renewal response carried no access token".into(),
            )),
        }
    }
}

impl Renewer for RenewalClient {
    fn renew(&self) -> Pin<Box<dyn Future<Output = Result<AccessCredential>> + Send + '_>> {
        Box::pin(RenewalClient::renew(self))
    }
}

/// Human-readable `message` field from a JSON error body, if present.
pub fn server_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
}
