//! Data models for Thermoguard.
//!
//! Sensor readings, snapshots, threshold rules, alert keys and the request and
//! response bodies of the control surface.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single temperature reading as reported by the sensor source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Device identifier, unique across groups.
    pub device_id: String,

    /// The group (site, warehouse, room) the device belongs to.
    pub group: String,

    /// Temperature in degrees Celsius.
    pub temperature: f64,

    /// Unix timestamp (seconds) when the device took the reading.
    pub timestamp: i64,
}

impl Reading {
    /// Get the reading timestamp as a DateTime.
    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// An ordered batch of readings returned by one fetch.
pub type ReadingBatch = Vec<Reading>;

/// The readings held by the cache together with their provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingSnapshot {
    /// Readings in the order the source returned them.
    pub readings: Vec<Reading>,

    /// When the readings were successfully fetched.
    pub fetched_at: DateTime<Utc>,

    /// True when this snapshot is served because a newer fetch failed.
    pub is_fallback: bool,
}

impl ReadingSnapshot {
    /// Time elapsed since the snapshot was fetched.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.fetched_at
    }

    /// Distinct group names, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.readings.iter().map(|r| r.group.clone()).collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// Readings of one group, sorted by device id.
    pub fn group_readings(&self, group: &str) -> Vec<&Reading> {
        let mut readings: Vec<&Reading> =
            self.readings.iter().filter(|r| r.group == group).collect();
        readings.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        readings
    }

    /// Look up a single device.
    pub fn device(&self, device_id: &str) -> Option<&Reading> {
        self.readings.iter().find(|r| r.device_id == device_id)
    }
}

/// The condition an alert is raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    /// Temperature above the configured maximum.
    AboveMax,
    /// Temperature below the configured minimum.
    BelowMin,
    /// The sensor source has been unavailable longer than the staleness bound.
    FetchFailed,
}

impl AlertCondition {
    /// Stable identifier used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCondition::AboveMax => "above_max",
            AlertCondition::BelowMin => "below_min",
            AlertCondition::FetchFailed => "fetch_failed",
        }
    }

    /// Parse the identifier produced by [`AlertCondition::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "above_max" => Some(AlertCondition::AboveMax),
            "below_min" => Some(AlertCondition::BelowMin),
            "fetch_failed" => Some(AlertCondition::FetchFailed),
            _ => None,
        }
    }
}

/// Device id used for alerts about the sensor source itself.
pub const SOURCE_DEVICE_ID: &str = "sensor-source";

/// Identity of an alert for de-duplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertKey {
    pub device_id: String,
    pub condition: AlertCondition,
}

impl AlertKey {
    pub fn new(device_id: impl Into<String>, condition: AlertCondition) -> Self {
        Self {
            device_id: device_id.into(),
            condition,
        }
    }

    /// The key for "the sensor source is unavailable".
    pub fn fetch_failed() -> Self {
        Self::new(SOURCE_DEVICE_ID, AlertCondition::FetchFailed)
    }
}

/// What a threshold rule applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuleScope {
    /// Every device of a group.
    Group { group: String },
    /// One device.
    Device { group: String, device_id: String },
}

impl RuleScope {
    fn matches(&self, device_id: &str, group: &str) -> bool {
        match self {
            RuleScope::Group { group: g } => g == group,
            RuleScope::Device {
                group: g,
                device_id: d,
            } => g == group && d == device_id,
        }
    }
}

/// A min/max bound on temperature. Either side may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub scope: RuleScope,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ThresholdRule {
    /// Returns the violated condition and the bound it crossed, if any.
    pub fn violation(&self, temperature: f64) -> Option<(AlertCondition, f64)> {
        if let Some(max) = self.max
            && temperature > max
        {
            return Some((AlertCondition::AboveMax, max));
        }
        if let Some(min) = self.min
            && temperature < min
        {
            return Some((AlertCondition::BelowMin, min));
        }
        None
    }
}

/// The set of threshold rules in force for one monitoring cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: Vec<ThresholdRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<ThresholdRule>) -> Self {
        Self { rules }
    }

    /// Rules that apply to a device, device-scoped rules first.
    pub fn rules_for(&self, device_id: &str, group: &str) -> Vec<&ThresholdRule> {
        let mut matching: Vec<&ThresholdRule> = self
            .rules
            .iter()
            .filter(|rule| rule.scope.matches(device_id, group))
            .collect();
        matching.sort_by_key(|rule| matches!(rule.scope, RuleScope::Group { .. }));
        matching
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Who should receive an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "group", rename_all = "lowercase")]
pub enum RecipientScope {
    /// Admins of one group (and privileged actors).
    Group(String),
    /// Every recipient.
    Everyone,
}

/// An alert that has passed de-duplication.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub key: AlertKey,

    /// Group of the device, absent for source alerts.
    pub group: Option<String>,

    /// Observed temperature, absent for source alerts.
    pub temperature: Option<f64>,

    /// The threshold that was crossed.
    pub limit: Option<f64>,

    /// Human-readable description of the alert.
    pub message: String,

    pub fired_at: DateTime<Utc>,

    /// True when the alert was computed from fallback data.
    pub stale: bool,
}

impl Alert {
    /// Recipients of this alert.
    pub fn scope(&self) -> RecipientScope {
        match &self.group {
            Some(group) => RecipientScope::Group(group.clone()),
            None => RecipientScope::Everyone,
        }
    }
}

/// A previously fired alert as stored in the alert log.
#[derive(Debug, Clone, Serialize)]
pub struct AlertLogEntry {
    pub device_id: String,
    pub condition: String,
    pub group: Option<String>,
    pub temperature: Option<f64>,
    pub message: String,
    pub fired_at: DateTime<Utc>,
}

/// Response for GET /alerts/recent endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<AlertLogEntry>,

    /// The lookback window in minutes that was used.
    pub lookback_minutes: u32,
}

/// Query parameters for GET /alerts/recent endpoint.
#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    /// The actor asking; results are limited to their groups.
    pub actor_id: i64,

    /// Lookback window in minutes (default: 60).
    #[serde(default = "default_lookback_minutes")]
    pub minutes: u32,
}

fn default_lookback_minutes() -> u32 {
    60
}

/// Where an inbound input came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// A typed command.
    #[default]
    Command,
    /// Callback data attached to a button.
    Callback,
}

/// Request body for POST /command endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub actor_id: i64,
    pub text: String,
    #[serde(default)]
    pub kind: InputKind,
}

/// Response body for POST /command endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            retry_after_secs: None,
            data,
        }
    }

    pub fn denied(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            retry_after_secs: retry_after.map(|d| d.num_seconds().max(1)),
            data: None,
        }
    }
}
