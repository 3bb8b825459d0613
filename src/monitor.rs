//! Periodic threshold evaluation.
//!
//! One cycle loads the rules, fetches readings through the cache, and fires or
//! clears alerts through the deduplicator. Alerts are edge-triggered: a
//! steady violation fires once per cooldown, and a condition that resolves is
//! cleared so that the next violation fires at once.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheRead, ReadingCache};
use crate::dedup::AlertDeduplicator;
use crate::error::FetchError;
use crate::model::{Alert, AlertCondition, AlertKey, Reading, ReadingSnapshot, RuleSet};
use crate::notify::Notifier;
use crate::source::ReadingSource;
use crate::validation::{TEMPERATURE_RANGE, is_device_id, is_group_name};

/// Supplies the threshold rules in force for a cycle.
pub trait ThresholdSource: Send + Sync {
    fn load_rules(&self) -> impl Future<Output = anyhow::Result<RuleSet>> + Send;
}

/// Timing of the monitoring loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between cycles.
    pub interval: std::time::Duration,

    /// Oldest cached snapshot still used for alerting.
    pub max_staleness: Duration,

    /// Readings taken longer ago than this are ignored.
    pub reading_max_age: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(60))
    }
}

impl MonitorConfig {
    /// Staleness bound of three intervals and a one hour reading age limit.
    pub fn new(interval: std::time::Duration) -> Self {
        let max_staleness = i64::try_from(interval.as_secs())
            .ok()
            .and_then(|secs| secs.checked_mul(3))
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Self {
            interval,
            max_staleness,
            reading_max_age: Duration::hours(1),
        }
    }
}

/// How one reading stands against the rules in force.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assessment {
    /// Bad identifiers or a temperature no sensor can report.
    Implausible,
    /// Taken longer ago than the reading age limit.
    Outdated,
    Normal,
    Violation {
        condition: AlertCondition,
        limit: f64,
    },
}

impl Assessment {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Implausible | Self::Outdated)
    }
}

/// Judge `reading` at `now`. The most specific matching rule decides.
pub fn assess(
    reading: &Reading,
    rules: &RuleSet,
    now: DateTime<Utc>,
    reading_max_age: Duration,
) -> Assessment {
    let plausible = is_device_id(&reading.device_id)
        && is_group_name(&reading.group)
        && reading.temperature.is_finite()
        && TEMPERATURE_RANGE.contains(&reading.temperature);
    if !plausible {
        return Assessment::Implausible;
    }

    match reading.taken_at() {
        Some(taken_at) if now - taken_at <= reading_max_age => {}
        _ => return Assessment::Outdated,
    }

    match rules
        .rules_for(&reading.device_id, &reading.group)
        .first()
        .and_then(|rule| rule.violation(reading.temperature))
    {
        Some((condition, limit)) => Assessment::Violation { condition, limit },
        None => Assessment::Normal,
    }
}

/// Reading counts for one group or for all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    /// Valid readings that violate their rule.
    pub critical: usize,
    pub above_max: usize,
    pub below_min: usize,
}

impl GroupStats {
    fn add(&mut self, assessment: Assessment) {
        self.total += 1;
        match assessment {
            Assessment::Implausible | Assessment::Outdated => self.invalid += 1,
            Assessment::Normal => self.valid += 1,
            Assessment::Violation { condition, .. } => {
                self.valid += 1;
                self.critical += 1;
                match condition {
                    AlertCondition::AboveMax => self.above_max += 1,
                    AlertCondition::BelowMin => self.below_min += 1,
                    AlertCondition::FetchFailed => {}
                }
            }
        }
    }
}

/// Snapshot health: overall counts and a per-group breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitoringStats {
    #[serde(flatten)]
    pub totals: GroupStats,
    pub groups: BTreeMap<String, GroupStats>,
}

impl MonitoringStats {
    pub fn collect<'a>(
        readings: impl IntoIterator<Item = &'a Reading>,
        rules: &RuleSet,
        now: DateTime<Utc>,
        reading_max_age: Duration,
    ) -> Self {
        let mut stats = Self::default();
        for reading in readings {
            let assessment = assess(reading, rules, now, reading_max_age);
            stats.totals.add(assessment);
            stats
                .groups
                .entry(reading.group.clone())
                .or_default()
                .add(assessment);
        }
        stats
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Readings checked against rules.
    pub evaluated: usize,
    /// Readings ignored as implausible, stale, or duplicated.
    pub skipped: usize,
    pub fired: usize,
    pub suppressed: usize,
    pub cleared: usize,
    pub notify_failures: usize,
    /// Evaluation ran on a cached snapshot.
    pub used_fallback: bool,
    /// No usable data; `fetch_failed` was raised instead of evaluating.
    pub source_unavailable: bool,
    /// Rules could not be loaded and nothing was evaluated.
    pub rules_unavailable: bool,
}

pub struct MonitoringCycle<S, T, N> {
    source: S,
    thresholds: T,
    notifier: N,
    cache: Arc<ReadingCache>,
    dedup: Arc<AlertDeduplicator>,
    config: MonitorConfig,
}

impl<S, T, N> MonitoringCycle<S, T, N>
where
    S: ReadingSource,
    T: ThresholdSource,
    N: Notifier,
{
    pub fn new(
        source: S,
        thresholds: T,
        notifier: N,
        cache: Arc<ReadingCache>,
        dedup: Arc<AlertDeduplicator>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            source,
            thresholds,
            notifier,
            cache,
            dedup,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run a single cycle at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        let expired = self.dedup.prune(now);
        if expired > 0 {
            debug!(expired, "Expired alert cooldowns pruned");
        }

        let rules = match self.thresholds.load_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!(error = %e, "Failed to load threshold rules; skipping cycle");
                report.rules_unavailable = true;
                return report;
            }
        };

        let read = self
            .cache
            .fetch_or_fallback(|| self.source.fetch(), now)
            .await;

        match read {
            CacheRead::Live(snapshot) => {
                if self.dedup.clear(&AlertKey::fetch_failed()) {
                    info!("Sensor source recovered");
                }
                self.evaluate(&snapshot, &rules, now, &mut report).await;
            }
            CacheRead::Fallback {
                snapshot,
                age,
                error,
            } => {
                if age > self.config.max_staleness {
                    self.source_unavailable(&error, Some(age), now, &mut report)
                        .await;
                } else {
                    report.used_fallback = true;
                    self.evaluate(&snapshot, &rules, now, &mut report).await;
                }
            }
            CacheRead::NoData(error) => {
                self.source_unavailable(&error, None, now, &mut report)
                    .await;
            }
        }

        report
    }

    /// Run cycles on the configured interval until `shutdown` turns true or
    /// its sender is dropped. A cycle in progress is always completed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval.as_secs(),
            max_staleness_secs = self.config.max_staleness.num_seconds(),
            "Monitoring loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once(Utc::now()).await;
                    info!(
                        evaluated = report.evaluated,
                        skipped = report.skipped,
                        fired = report.fired,
                        suppressed = report.suppressed,
                        cleared = report.cleared,
                        fallback = report.used_fallback,
                        source_unavailable = report.source_unavailable,
                        "Monitoring cycle complete"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Monitoring loop stopped");
    }

    async fn source_unavailable(
        &self,
        error: &FetchError,
        age: Option<Duration>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        report.source_unavailable = true;
        let key = AlertKey::fetch_failed();

        if !self.dedup.should_fire(&key, now) {
            report.suppressed += 1;
            return;
        }

        let message = match age {
            Some(age) => format!(
                "Sensor source unavailable; last good data is {} min old ({error})",
                age.num_minutes()
            ),
            None => format!("Sensor source unavailable; no data received yet ({error})"),
        };
        let alert = Alert {
            key,
            group: None,
            temperature: None,
            limit: None,
            message,
            fired_at: now,
            stale: true,
        };
        self.deliver(&alert, report).await;
    }

    async fn evaluate(
        &self,
        snapshot: &ReadingSnapshot,
        rules: &RuleSet,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let mut readings: Vec<&Reading> = snapshot.readings.iter().collect();
        readings.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        let mut previous: Option<&str> = None;
        for reading in readings {
            if previous == Some(reading.device_id.as_str()) {
                debug!(device_id = %reading.device_id, "Duplicate reading ignored");
                report.skipped += 1;
                continue;
            }
            previous = Some(reading.device_id.as_str());

            let violation = match assess(reading, rules, now, self.config.reading_max_age) {
                Assessment::Implausible => {
                    warn!(device_id = %reading.device_id, "Implausible reading skipped");
                    report.skipped += 1;
                    continue;
                }
                Assessment::Outdated => {
                    debug!(
                        device_id = %reading.device_id,
                        timestamp = reading.timestamp,
                        "Outdated reading skipped"
                    );
                    report.skipped += 1;
                    continue;
                }
                Assessment::Normal => None,
                Assessment::Violation { condition, limit } => Some((condition, limit)),
            };
            report.evaluated += 1;

            for condition in [AlertCondition::AboveMax, AlertCondition::BelowMin] {
                let key = AlertKey::new(reading.device_id.as_str(), condition);

                match violation {
                    Some((violated, limit)) if violated == condition => {
                        if !self.dedup.should_fire(&key, now) {
                            report.suppressed += 1;
                            continue;
                        }
                        let alert = Alert {
                            message: describe(reading, condition, limit, snapshot.is_fallback),
                            key,
                            group: Some(reading.group.clone()),
                            temperature: Some(reading.temperature),
                            limit: Some(limit),
                            fired_at: now,
                            stale: snapshot.is_fallback,
                        };
                        self.deliver(&alert, report).await;
                    }
                    _ => {
                        if self.dedup.clear(&key) {
                            info!(
                                device_id = %reading.device_id,
                                condition = condition.as_str(),
                                temperature = reading.temperature,
                                "Condition resolved"
                            );
                            report.cleared += 1;
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, alert: &Alert, report: &mut CycleReport) {
        report.fired += 1;
        info!(
            device_id = %alert.key.device_id,
            condition = alert.key.condition.as_str(),
            stale = alert.stale,
            "Alert fired"
        );
        if let Err(e) = self.notifier.notify(&alert.scope(), alert).await {
            warn!(error = %e, "Alert delivery failed");
            report.notify_failures += 1;
        }
    }
}

fn describe(reading: &Reading, condition: AlertCondition, limit: f64, stale: bool) -> String {
    let direction = match condition {
        AlertCondition::BelowMin => "below the minimum",
        _ => "above the maximum",
    };
    let suffix = if stale { " (cached data)" } else { "" };
    format!(
        "{} in {}: {:.1}°C is {direction} of {:.1}°C{suffix}",
        reading.device_id, reading.group, reading.temperature, limit
    )
}
