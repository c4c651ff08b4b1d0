//! Authenticated request dispatch
//!
//! Every outbound API call goes through `Dispatcher::send`: the current access
//! credential is attached as a bearer token, the call is forwarded, and a 401
//! on a first attempt is routed to the refresh coordinator before the request
//! is replayed once with the renewed credential. All other failures are
//! normalized to `{status, message}` and returned without touching renewal.

use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use session_auth::{AccessCredential, server_message};
use tracing::{debug, instrument, warn};

use crate::classify::{Outcome, classify_status};
use crate::coordinator::RefreshCoordinator;
use crate::error::{Error, Result};
use crate::metrics;

/// Message used when neither the body nor the status explains a failure.
const FALLBACK_MESSAGE: &str = "request failed";

/// Description of one API call.
///
/// Descriptors are never mutated in flight: a replay is a new descriptor from
/// `retried()` with the attempt counter bumped.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    id: String,
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<serde_json::Value>,
    attempt: u32,
}

impl RequestDescriptor {
    /// `path` is relative to the dispatcher's base URL, e.g. `/users/42`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: format!("req_{}", uuid::Uuid::new_v4().as_simple()),
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            attempt: 0,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// JSON body; sent with `Content-Type: application/json`.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Copy of this descriptor marked as one more attempt.
    pub fn retried(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// A successful (non-error status) API response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Request dispatcher bound to one API base URL.
pub struct Dispatcher {
    client: reqwest::Client,
    base_url: String,
    refresh_path: String,
    timeout: Duration,
    coordinator: RefreshCoordinator,
}

impl Dispatcher {
    /// `client` should share its cookie jar with the renewal client so the
    /// refresh cookie set by sign-in and renewal responses is retained.
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        refresh_path: &str,
        timeout: Duration,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            refresh_path: refresh_path.to_string(),
            timeout,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Whether `path` targets the renewal endpoint. Such requests never enter
    /// the coordinator, or a rejected renewal would trigger another renewal.
    pub fn is_renewal_endpoint(&self, path: &str) -> bool {
        path.contains(self.refresh_path.as_str())
    }

    /// Send a request, renewing the credential and replaying once on a 401.
    #[instrument(skip_all, fields(request_id = %request.id(), method = %request.method(), path = %request.path()))]
    pub async fn send(&self, request: RequestDescriptor) -> Result<Response> {
        let credential = self.coordinator.store().get().await;
        let response = self.transmit(&request, credential.as_ref()).await?;
        let renewal_endpoint = self.is_renewal_endpoint(request.path());

        let outcome = classify_status(
            response.status.as_u16(),
            renewal_endpoint,
            request.attempt(),
        );
        if outcome != Outcome::Renewable {
            return settle(outcome, response);
        }

        let retry = request.retried();
        debug!(attempt = retry.attempt(), "credential rejected, renewing before replay");
        let fresh = self
            .coordinator
            .ensure_fresh_credential(credential.as_ref(), retry.id())
            .await?;

        metrics::record_replay();
        let response = self.transmit(&retry, Some(&fresh)).await?;
        let outcome = classify_status(response.status.as_u16(), renewal_endpoint, retry.attempt());
        if outcome != Outcome::Success {
            warn!(status = response.status.as_u16(), "replayed request failed");
        }
        settle(outcome, response)
    }

    /// Establish a session at startup.
    ///
    /// With no credential held, asks the coordinator for one through the same
    /// path a 401 takes, so a failed bootstrap clears state and notifies
    /// subscribers exactly like a failed renewal mid-session.
    pub async fn bootstrap(&self) -> Result<()> {
        if self.coordinator.store().get().await.is_some() {
            debug!("session bootstrap skipped, credential already held");
            return Ok(());
        }
        self.coordinator
            .ensure_fresh_credential(None, "bootstrap")
            .await
            .map(|_| ())
    }

    /// One HTTP exchange with the given credential attached.
    async fn transmit(
        &self,
        request: &RequestDescriptor,
        credential: Option<&AccessCredential>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, request.path());

        let mut headers = request.headers.clone();
        if let Some(credential) = credential {
            let mut value = HeaderValue::from_str(&credential.bearer())
                .map_err(|e| Error::InvalidRequest(format!("invalid credential value: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        } else {
            headers.remove(AUTHORIZATION);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(self.timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        // Applied last so caller headers replace builder defaults
        builder = builder.headers(headers);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Network(format!(
                    "request timed out after {}ms",
                    self.timeout.as_millis()
                ))
            } else if e.is_builder() {
                Error::InvalidRequest(e.to_string())
            } else {
                Error::Network(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("failed to read response body: {e}")))?;

        debug!(status = status.as_u16(), attempt = request.attempt(), "response received");
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

/// Turn a classified response into the caller-facing result.
fn settle(outcome: Outcome, response: Response) -> Result<Response> {
    let status = response.status.as_u16();
    match outcome {
        Outcome::Success => Ok(response),
        Outcome::Renewable | Outcome::AuthFinal => Err(Error::AuthFinal {
            status: Some(status),
            message: failure_message(&response),
        }),
        Outcome::ClientError => Err(Error::Client {
            status,
            message: failure_message(&response),
        }),
        Outcome::ServerError => Err(Error::Server {
            status,
            message: failure_message(&response),
        }),
    }
}

/// Server-provided `message`, else the canonical reason phrase.
fn failure_message(response: &Response) -> String {
    std::str::from_utf8(&response.body)
        .ok()
        .and_then(server_message)
        .or_else(|| response.status.canonical_reason().map(str::to_owned))
        .unwrap_or_else(|| FALLBACK_MESSAGE.to_string())
}
