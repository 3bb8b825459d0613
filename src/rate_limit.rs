//! Sliding-window request limiting per actor.
//!
//! Each actor owns a queue of request timestamps. Timestamps older than the
//! window are dropped on access; there is no background sweeper.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::error::RateLimitExceeded;

/// Tables are swept for idle actors once they grow past this many entries.
const MAX_TRACKED_ACTORS: usize = 10_000;

/// Per-actor state with one lock per actor.
///
/// Operations on the same actor serialize on the actor's mutex; different
/// actors only share the brief table lookup.
pub(crate) struct ActorTable<T> {
    entries: RwLock<HashMap<i64, Arc<Mutex<T>>>>,
}

impl<T: Default> ActorTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the entry for `actor`, creating it if needed.
    pub(crate) fn entry(&self, actor: i64) -> Arc<Mutex<T>> {
        if let Some(entry) = self.entries.read().get(&actor) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write();
        Arc::clone(entries.entry(actor).or_default())
    }

    pub(crate) fn get(&self, actor: i64) -> Option<Arc<Mutex<T>>> {
        self.entries.read().get(&actor).map(Arc::clone)
    }

    pub(crate) fn remove(&self, actor: i64) -> bool {
        self.entries.write().remove(&actor).is_some()
    }

    /// Drop entries for which `keep` returns false.
    ///
    /// Entries handed out by [`ActorTable::entry`] and still held elsewhere
    /// are always kept, so a caller never writes into a detached record.
    pub(crate) fn retain(&self, mut keep: impl FnMut(&mut T) -> bool) {
        self.entries
            .write()
            .retain(|_, entry| Arc::strong_count(entry) > 1 || keep(&mut entry.lock()));
    }

    /// Sweep with `keep` when the table is over its size bound.
    pub(crate) fn retain_if_large(&self, keep: impl FnMut(&mut T) -> bool) {
        if self.len() > MAX_TRACKED_ACTORS {
            self.retain(keep);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Run `f` on every entry.
    pub(crate) fn for_each(&self, mut f: impl FnMut(i64, &mut T)) {
        for (actor, entry) in self.entries.read().iter() {
            f(*actor, &mut entry.lock());
        }
    }
}

/// Request limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: usize,

    /// Width of the sliding window.
    pub window: Duration,

    /// When false every request is allowed.
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window: Duration::seconds(60),
            enabled: true,
        }
    }
}

#[derive(Debug, Default)]
struct RequestWindow {
    hits: VecDeque<DateTime<Utc>>,
}

impl RequestWindow {
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.hits.front().is_some_and(|t| *t <= cutoff) {
            self.hits.pop_front();
        }
    }
}

/// Sliding-window request counter keyed by actor id.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: ActorTable<RequestWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: ActorTable::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request for `actor`.
    ///
    /// A request over the limit is not counted, so a flood does not extend
    /// its own penalty.
    #[instrument(skip(self, now), level = "debug")]
    pub fn hit(&self, actor: i64, now: DateTime<Utc>) -> Result<(), RateLimitExceeded> {
        if !self.config.enabled {
            return Ok(());
        }

        let window = self.config.window;
        self.windows
            .retain_if_large(|w| w.hits.back().is_some_and(|t| *t > now - window));

        let entry = self.windows.entry(actor);
        let mut requests = entry.lock();
        requests.prune(now, window);

        if requests.hits.len() >= self.config.max_requests {
            let oldest = requests.hits.front().copied().unwrap_or(now);
            let retry_after = (oldest + window - now).max(Duration::seconds(1));
            debug!(
                count = requests.hits.len(),
                retry_after_secs = retry_after.num_seconds(),
                "Rate limit exceeded"
            );
            return Err(RateLimitExceeded { retry_after });
        }

        requests.hits.push_back(now);
        Ok(())
    }

    /// Requests currently counted in `actor`'s window.
    pub fn current_count(&self, actor: i64, now: DateTime<Utc>) -> usize {
        self.windows.get(actor).map_or(0, |entry| {
            let mut requests = entry.lock();
            requests.prune(now, self.config.window);
            requests.hits.len()
        })
    }

    /// Forget `actor`'s window.
    pub fn reset(&self, actor: i64) {
        self.windows.remove(actor);
    }

    /// Number of actors with a window.
    pub fn tracked_actors(&self) -> usize {
        self.windows.len()
    }
}
