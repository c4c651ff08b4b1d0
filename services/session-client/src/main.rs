//! Session Client
//!
//! Command-line client for a session-authenticated HTTP API:
//! 1. Loads the API and session configuration
//! 2. Seeds the cookie jar with the refresh credential, if one is configured
//! 3. Bootstraps an access credential through the refresh coordinator
//! 4. Sends one request, renewing and replaying transparently on a 401
//! 5. Prints the response body to stdout

mod config;
mod error;

use anyhow::{Context, Result};
use reqwest::Method;
use reqwest::cookie::Jar;
use session_auth::{CredentialStore, RenewalClient};
use session_pipeline::{Dispatcher, RefreshCoordinator, RequestDescriptor};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroize;

use crate::config::Config;

/// How long to wait for the expiry listener to flush before exiting.
const LISTENER_DRAIN: Duration = Duration::from_secs(1);

const USAGE: &str = "session-client [--config PATH] <METHOD> <PATH> [JSON_BODY]";

/// Parsed command line.
#[derive(Debug)]
struct Invocation {
    config_path: Option<String>,
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
}

/// Simple positional parsing with an optional `--config PATH` anywhere.
fn parse_args(args: &[String]) -> error::Result<Invocation> {
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .ok_or_else(|| error::Error::Usage(format!("--config requires a path\n{USAGE}")))?;
            config_path = Some(path.clone());
        } else {
            positional.push(arg.as_str());
        }
    }

    let (method, path, body) = match positional.as_slice() {
        [method, path] => (*method, *path, None),
        [method, path, body] => (*method, *path, Some(*body)),
        _ => return Err(error::Error::Usage(USAGE.into())),
    };

    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| error::Error::Usage(format!("invalid method: {method}")))?;

    if !path.starts_with('/') {
        return Err(error::Error::Usage(format!(
            "path must start with /, got: {path}"
        )));
    }

    let body = body
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| error::Error::Usage(format!("JSON_BODY is not valid JSON: {e}")))?;

    Ok(Invocation {
        config_path,
        method,
        path: path.to_string(),
        body,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the response body
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args)?;

    let config_path = Config::resolve_path(invocation.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        timeout_secs = config.api.timeout_secs,
        refresh_timeout_secs = config.api.refresh_timeout_secs,
        mirror = config.session.mirror_path.is_some(),
        refresh_token = config.session.refresh_token.is_some(),
        "configuration loaded"
    );

    // One client, one jar: renewal responses rotate the refresh cookie and
    // ordinary requests must see the rotated value.
    let jar = Arc::new(Jar::default());
    if let Some(token) = &config.session.refresh_token {
        let url: reqwest::Url = config
            .api
            .base_url
            .parse()
            .with_context(|| format!("invalid base_url {}", config.api.base_url))?;
        let mut cookie = format!("{}={}; Path=/", config.session.refresh_cookie, token.expose());
        jar.add_cookie_str(&cookie, &url);
        cookie.zeroize();
    }
    let client = reqwest::Client::builder()
        .cookie_provider(jar)
        .build()
        .context("failed to build HTTP client")?;

    let store = match &config.session.mirror_path {
        Some(path) => CredentialStore::with_mirror(path.clone()).await,
        None => CredentialStore::in_memory(),
    };

    let renewal = RenewalClient::new(
        client.clone(),
        &config.api.base_url,
        &config.api.refresh_path,
        config.api.refresh_timeout(),
    );
    let coordinator = RefreshCoordinator::new(Arc::new(store), Arc::new(renewal));

    let mut expired = coordinator.subscribe();
    let listener = tokio::spawn(async move {
        loop {
            match expired.recv().await {
                Ok(notice) => {
                    warn!(message = %notice.message, "session expired");
                    eprintln!("{}", notice.message);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "session expiry listener lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let dispatcher = Dispatcher::new(
        client,
        &config.api.base_url,
        &config.api.refresh_path,
        config.api.timeout(),
        coordinator,
    );

    if let Err(e) = dispatcher.bootstrap().await {
        warn!(error = %e, "session bootstrap failed, continuing without credential");
    }

    let mut request = RequestDescriptor::new(invocation.method, invocation.path);
    if let Some(body) = invocation.body {
        request = request.with_body(body);
    }
    let request_id = request.id().to_string();

    let outcome = dispatcher.send(request).await;

    // Closing the channel lets the listener report any pending notice
    drop(dispatcher);
    if tokio::time::timeout(LISTENER_DRAIN, listener).await.is_err() {
        warn!("session expiry listener did not finish in time");
    }

    match outcome {
        Ok(response) => {
            info!(request_id = %request_id, status = response.status().as_u16(), "request completed");
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(response.body())
                .context("failed to write response body")?;
            if !response.body().ends_with(b"\n") {
                stdout.write_all(b"\n").context("failed to write response body")?;
            }
            Ok(())
        }
        Err(e) => {
            error!(request_id = %request_id, status = ?e.status(), message = %e.message(), "request failed");
            Err(e).context(format!("request {request_id} failed"))
        }
    }
}
