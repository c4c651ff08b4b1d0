//! Pipeline metrics
//!
//! Emitted through the `metrics` facade; the embedding application decides
//! whether a recorder is installed.
//!
//! - `session_renewals_total` (counter): label `outcome`
//! - `session_renewal_waiters` (histogram): callers released per renewal
//! - `session_expired_total` (counter)
//! - `session_requests_replayed_total` (counter)

/// Record a settled renewal and how many queued callers it released.
pub fn record_renewal(outcome: &'static str, waiters: usize) {
    metrics::counter!("session_renewals_total", "outcome" => outcome).increment(1);
    metrics::histogram!("session_renewal_waiters").record(waiters as f64);
}

/// Record a session-expired broadcast.
pub fn record_session_expired() {
    metrics::counter!("session_expired_total").increment(1);
}

/// Record a request replayed with a renewed credential.
pub fn record_replay() {
    metrics::counter!("session_requests_replayed_total").increment(1);
}
