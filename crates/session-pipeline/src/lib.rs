//! Authenticated request pipeline with single-flight credential refresh
//!
//! Wraps outbound API calls so an expired access credential is renewed
//! transparently. Concurrent requests that fail together share one renewal;
//! if renewal fails, all of them fail together and collaborators receive a
//! single session-expired notification.
//!
//! Request lifecycle:
//! 1. Caller builds a `RequestDescriptor` and calls `Dispatcher::send()`
//! 2. Dispatcher attaches the stored credential and forwards the request
//! 3. 2xx → response returned unchanged
//! 4. 401 on a first attempt → `RefreshCoordinator::ensure_fresh_credential()`
//! 5. Renewal succeeds → request replayed once with the new credential
//! 6. Renewal fails → `AuthFinal` for every waiter, `SessionExpired` broadcast
//! 7. Any other failure → normalized `Error` with status and message

pub mod classify;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod metrics;

pub use classify::{MAX_RENEWAL_RETRIES, Outcome, classify_status};
pub use coordinator::{RefreshCoordinator, RefreshState, SessionExpired};
pub use dispatcher::{Dispatcher, RequestDescriptor, Response};
pub use error::{Error, Result};
