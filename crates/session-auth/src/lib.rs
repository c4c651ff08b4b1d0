//! Session credential primitives
//!
//! Holds the short-lived access credential and performs the renewal exchange
//! that trades the long-lived refresh cookie for a new one. Coordination of
//! concurrent renewals lives in `session-pipeline`; this crate only provides
//! the pieces it drives.
//!
//! Credential flow:
//! 1. A sign-in or renewal yields an `AccessCredential`
//! 2. The coordinator stores it via `CredentialStore::set()`
//! 3. The dispatcher reads it via `CredentialStore::get()` for every request
//! 4. On a 401 the coordinator calls `Renewer::renew()` (a `RenewalClient`)
//! 5. On terminal failure the coordinator calls `CredentialStore::clear()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod renewal;

pub use constants::*;
pub use credentials::{AccessCredential, CredentialStore};
pub use error::{Error, Result};
pub use renewal::{RenewalClient, RenewalResponse, Renewer, server_message};
