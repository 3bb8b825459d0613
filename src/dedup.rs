//! Cooldown-based alert de-duplication.
//!
//! An alert key fires at most once per cooldown window. Clearing a key when
//! its condition resolves re-arms it, so a new incident is reported at once
//! instead of waiting out a cooldown that belonged to the previous one.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::model::AlertKey;

/// Default cooldown between repeated alerts for one key.
pub const DEFAULT_COOLDOWN_SECS: i64 = 600;

pub struct AlertDeduplicator {
    cooldown: Duration,
    last_fired: Mutex<HashMap<AlertKey, DateTime<Utc>>>,
}

impl Default for AlertDeduplicator {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_COOLDOWN_SECS))
    }
}

impl AlertDeduplicator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Decide whether `key` fires at `now`, recording the firing if so.
    ///
    /// A suppressed call leaves the record untouched.
    pub fn should_fire(&self, key: &AlertKey, now: DateTime<Utc>) -> bool {
        let mut last_fired = self.last_fired.lock();
        match last_fired.get(key) {
            Some(at) if now - *at < self.cooldown => {
                debug!(
                    device_id = %key.device_id,
                    condition = key.condition.as_str(),
                    "Alert suppressed by cooldown"
                );
                false
            }
            _ => {
                last_fired.insert(key.clone(), now);
                true
            }
        }
    }

    /// Forget the cooldown of `key`. Returns whether one existed.
    pub fn clear(&self, key: &AlertKey) -> bool {
        self.last_fired.lock().remove(key).is_some()
    }

    /// Whether `key` has a cooldown record.
    pub fn is_cooling(&self, key: &AlertKey) -> bool {
        self.last_fired.lock().contains_key(key)
    }

    /// Drop records whose cooldown has elapsed at `now`. Returns how many
    /// were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut last_fired = self.last_fired.lock();
        let before = last_fired.len();
        last_fired.retain(|_, at| now - *at < self.cooldown);
        before - last_fired.len()
    }

    pub fn len(&self) -> usize {
        self.last_fired.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
