//! Session pipeline defaults
//!
//! Values the renewal exchange and the request path agree on when the
//! configuration does not override them.

use std::time::Duration;

/// Renewal endpoint, relative to the API base URL.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Name of the cookie carrying the long-lived refresh credential.
pub const REFRESH_COOKIE: &str = "refresh_token";

/// Per-request timeout for ordinary API calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout for the renewal call. Kept strictly below
/// `DEFAULT_REQUEST_TIMEOUT` so a hung renewal unblocks queued callers first.
pub const DEFAULT_RENEWAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Message carried by the session-expired notification.
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";
