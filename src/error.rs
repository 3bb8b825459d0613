//! Error types for Thermoguard.
//!
//! None of these errors is fatal to the process. Fetch errors degrade to the
//! fallback snapshot, notify errors are logged, validation and rate-limit
//! errors become deny decisions at the boundary.

use chrono::Duration;
use thiserror::Error;

use crate::validation::ThreatCategory;

/// Failure to obtain a fresh batch of readings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Network failure, timeout, or a non-success HTTP status.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The source answered, but the payload is unusable.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl FetchError {
    /// The error reported when a fetch exceeds its time budget.
    pub fn timeout(limit: std::time::Duration) -> Self {
        FetchError::Transient(format!("timed out after {}s", limit.as_secs()))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Malformed(e.without_url().to_string())
        } else {
            FetchError::Transient(e.without_url().to_string())
        }
    }
}

/// Failure to hand an alert to the transport.
#[derive(Debug, Error)]
#[error("failed to deliver alert for {device_id}: {reason}")]
pub struct NotifyError {
    pub device_id: String,
    pub reason: String,
}

/// Input rejected at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("input rejected: {category:?}")]
pub struct ValidationError {
    pub category: ThreatCategory,
    pub rule: Option<String>,
}

/// Too many requests inside the sliding window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded, retry after {}s", .retry_after.num_seconds())]
pub struct RateLimitExceeded {
    pub retry_after: Duration,
}

/// Invalid or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Report a broken internal invariant.
///
/// Panics in debug builds; in release builds it logs a critical event and the
/// caller continues with a safe value.
pub(crate) fn invariant_violated(what: &str, detail: &str) {
    tracing::error!(critical = true, invariant = what, detail, "Internal invariant violated");
    debug_assert!(false, "invariant violated: {what}: {detail}");
}
