//! Response classification
//!
//! Maps an HTTP status, plus what the dispatcher knows about the request, to
//! the action the pipeline takes. Only `Renewable` involves the refresh
//! coordinator.

/// Number of times a single request may be replayed through renewal.
pub const MAX_RENEWAL_RETRIES: u32 = 1;

/// What to do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Hand the response to the caller unchanged
    Success,
    /// Expired credential on a first attempt: renew and replay once
    Renewable,
    /// 401 after a replay; the session cannot be recovered
    AuthFinal,
    /// Other 4xx, including a 401 from the renewal endpoint itself
    ClientError,
    /// 5xx and anything else unexpected
    ServerError,
}

/// Classify a response status.
///
/// A 401 is renewable only on a request that has not been replayed yet and
/// does not target the renewal endpoint; otherwise renewal would loop.
pub fn classify_status(status: u16, renewal_endpoint: bool, attempt: u32) -> Outcome {
    match status {
        s if s < 400 => Outcome::Success,
        401 if renewal_endpoint => Outcome::ClientError,
        401 if attempt >= MAX_RENEWAL_RETRIES => Outcome::AuthFinal,
        401 => Outcome::Renewable,
        400..=499 => Outcome::ClientError,
        _ => Outcome::ServerError,
    }
}
