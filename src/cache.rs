//! Last-known-good cache for sensor readings.
//!
//! The cache holds exactly one snapshot. A successful fetch replaces it; a
//! failed fetch leaves it in place and serves it marked as fallback, so
//! callers can tell "stale but present" from "never fetched".

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{FetchError, invariant_violated};
use crate::model::{ReadingBatch, ReadingSnapshot};

/// Default time budget of one fetch.
pub const DEFAULT_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Result of [`ReadingCache::fetch_or_fallback`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead {
    /// The fetch succeeded; the snapshot is fresh.
    Live(ReadingSnapshot),

    /// The fetch failed; the last good snapshot is served instead.
    Fallback {
        snapshot: ReadingSnapshot,
        age: Duration,
        error: FetchError,
    },

    /// The fetch failed and nothing was ever stored.
    NoData(FetchError),
}

impl CacheRead {
    pub fn used_fallback(&self) -> bool {
        !matches!(self, CacheRead::Live(_))
    }

    pub fn snapshot(&self) -> Option<&ReadingSnapshot> {
        match self {
            CacheRead::Live(snapshot) | CacheRead::Fallback { snapshot, .. } => Some(snapshot),
            CacheRead::NoData(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            CacheRead::Live(_) => None,
            CacheRead::Fallback { error, .. } | CacheRead::NoData(error) => Some(error),
        }
    }
}

/// Shared snapshot slot.
///
/// The lock is never held across an await point.
pub struct ReadingCache {
    slot: RwLock<Option<ReadingSnapshot>>,
    fetch_timeout: std::time::Duration,
}

impl Default for ReadingCache {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT)
    }
}

impl ReadingCache {
    pub fn new(fetch_timeout: std::time::Duration) -> Self {
        Self {
            slot: RwLock::new(None),
            fetch_timeout,
        }
    }

    /// The last stored snapshot, without fetching.
    pub fn get_snapshot(&self) -> Option<ReadingSnapshot> {
        self.slot.read().clone()
    }

    /// Replace the held snapshot with a fresh one.
    ///
    /// `fetched_at` never moves backwards, even if the wall clock does.
    pub fn store(&self, readings: ReadingBatch, now: DateTime<Utc>) -> ReadingSnapshot {
        let mut slot = self.slot.write();
        let fetched_at = match slot.as_ref() {
            Some(previous) if previous.fetched_at > now => {
                warn!(
                    previous = %previous.fetched_at,
                    now = %now,
                    "Clock moved backwards; keeping previous fetch time"
                );
                previous.fetched_at
            }
            _ => now,
        };
        let snapshot = ReadingSnapshot {
            readings,
            fetched_at,
            is_fallback: false,
        };
        *slot = Some(snapshot.clone());
        snapshot
    }

    /// Run `fetch` under the cache's timeout and fall back on failure.
    pub async fn fetch_or_fallback<F, Fut>(&self, fetch: F, now: DateTime<Utc>) -> CacheRead
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ReadingBatch, FetchError>>,
    {
        let result = match tokio::time::timeout(self.fetch_timeout, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::timeout(self.fetch_timeout)),
        };

        match result {
            Ok(readings) => {
                let snapshot = self.store(readings, now);
                debug!(readings = snapshot.readings.len(), "Reading cache refreshed");
                CacheRead::Live(snapshot)
            }
            Err(error) => self.fallback(error, now),
        }
    }

    fn fallback(&self, error: FetchError, now: DateTime<Utc>) -> CacheRead {
        let Some(mut snapshot) = self.get_snapshot() else {
            warn!(error = %error, "Fetch failed and no snapshot is cached");
            return CacheRead::NoData(error);
        };

        let mut age = snapshot.age(now);
        if age < Duration::zero() {
            invariant_violated(
                "non-negative snapshot age",
                &format!("fetched_at={} now={}", snapshot.fetched_at, now),
            );
            age = Duration::zero();
        }

        snapshot.is_fallback = true;
        warn!(
            error = %error,
            age_secs = age.num_seconds(),
            "Fetch failed; serving cached snapshot"
        );
        CacheRead::Fallback {
            snapshot,
            age,
            error,
        }
    }
}
