//! Shared HTTP client construction policy.
//!
//! Centralizes networking defaults so the health checker, crawler, and
//! downloader stay consistent on timeouts, user-agent, and TLS posture. The
//! remote fleet is full of self-signed certificates, so invalid certs are
//! tolerated; every client carries explicit connect and read timeouts so no
//! operation blocks indefinitely.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;

/// Connect timeout applied to every client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// User-agent sent with every request.
const USER_AGENT: &str = concat!("openshelf/", env!("CARGO_PKG_VERSION"));

/// Errors building an HTTP client.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Client construction failed (TLS backend, invalid configuration).
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Builds an HTTP client with the shared policy and the given read timeout.
///
/// # Errors
///
/// Returns [`HttpError::Build`] if the underlying client cannot be
/// constructed.
pub fn build_client(read_timeout: Duration) -> Result<Client, HttpError> {
    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(read_timeout)
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(true)
        .gzip(true)
        .build()?;
    Ok(client)
}
