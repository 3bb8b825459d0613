//! Runtime configuration.
//!
//! Everything is read from environment variables. `SENSOR_SOURCE_URL` and
//! `TRANSPORT_TOKEN` are required; every other value has a default. Duration
//! settings are capped at one year. Role assignments are JSON:
//!
//! - `PRIVILEGED_ACTORS`: `[123, 456]`
//! - `ADMIN_GROUPS`: `{"123": ["Cold Room", "Freezers"]}`
//! - `MEMBER_GROUPS`: same shape as `ADMIN_GROUPS`

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::de::DeserializeOwned;

use crate::error::ConfigError;
use crate::monitor::MonitorConfig;
use crate::rate_limit::RateLimitConfig;
use crate::roles::RoleDirectory;
use crate::threat::ThreatPolicy;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_PATH: &str = "sqlite:thermoguard.db?mode=rwc";

/// Shortest accepted `TRANSPORT_TOKEN`.
pub const MIN_TOKEN_LENGTH: usize = 16;

/// Upper bound of every duration setting.
const MAX_SETTING_DAYS: i64 = 365;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,

    /// Sensor endpoint. May embed a deployment secret in its path.
    pub source_url: String,

    /// Bearer token every caller of the control surface must present.
    pub transport_token: String,

    pub monitoring_interval: std::time::Duration,
    pub fetch_timeout: std::time::Duration,
    pub alert_cooldown: Duration,
    pub reading_max_age: Duration,

    pub max_message_length: usize,
    pub rate_limit_per_minute: usize,
    pub rate_limiting_enabled: bool,

    pub warn_threshold: usize,
    pub block_threshold: usize,
    pub block_base: Duration,
    pub block_max: Duration,
    pub clean_period: Duration,

    pub privileged_actors: Vec<i64>,
    pub admin_groups: HashMap<i64, Vec<String>>,
    pub member_groups: HashMap<i64, Vec<String>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("source_url", &redact_url(&self.source_url))
            .field("monitoring_interval", &self.monitoring_interval)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("alert_cooldown_secs", &self.alert_cooldown.num_seconds())
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("rate_limiting_enabled", &self.rate_limiting_enabled)
            .field("privileged_actors", &self.privileged_actors.len())
            .field("admins", &self.admin_groups.len())
            .field("members", &self.member_groups.len())
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let source_url = lookup("SENSOR_SOURCE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("SENSOR_SOURCE_URL"))?;
        if !(source_url.starts_with("http://") || source_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                name: "SENSOR_SOURCE_URL",
                reason: "expected an http(s) URL".to_string(),
            });
        }

        let transport_token = lookup("TRANSPORT_TOKEN")
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or(ConfigError::Missing("TRANSPORT_TOKEN"))?;
        if transport_token.len() < MIN_TOKEN_LENGTH {
            return Err(ConfigError::Invalid {
                name: "TRANSPORT_TOKEN",
                reason: format!("must be at least {MIN_TOKEN_LENGTH} characters"),
            });
        }

        let monitoring_interval = duration(&lookup, "MONITORING_INTERVAL", 60, Duration::try_seconds)?;
        let fetch_timeout = duration(&lookup, "FETCH_TIMEOUT", 10, Duration::try_seconds)?;
        let block_base = duration(&lookup, "BLOCK_BASE_MINUTES", 5, Duration::try_minutes)?;
        let block_max = duration(&lookup, "BLOCK_MAX_MINUTES", 24 * 60, Duration::try_minutes)?;
        let warn_threshold: usize = positive(&lookup, "VIOLATION_WARN_THRESHOLD", 3)?;
        let block_threshold: usize = positive(&lookup, "VIOLATION_BLOCK_THRESHOLD", 5)?;

        if block_threshold <= warn_threshold {
            return Err(ConfigError::Invalid {
                name: "VIOLATION_BLOCK_THRESHOLD",
                reason: format!("must exceed VIOLATION_WARN_THRESHOLD ({warn_threshold})"),
            });
        }
        if block_max < block_base {
            return Err(ConfigError::Invalid {
                name: "BLOCK_MAX_MINUTES",
                reason: format!(
                    "must be at least BLOCK_BASE_MINUTES ({})",
                    block_base.num_minutes()
                ),
            });
        }

        Ok(Self {
            port: parsed(&lookup, "THERMOGUARD_PORT", DEFAULT_PORT)?,
            database_url: lookup("THERMOGUARD_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            source_url,
            transport_token,
            monitoring_interval: monitoring_interval.to_std().map_err(|e| ConfigError::Invalid {
                name: "MONITORING_INTERVAL",
                reason: e.to_string(),
            })?,
            fetch_timeout: fetch_timeout.to_std().map_err(|e| ConfigError::Invalid {
                name: "FETCH_TIMEOUT",
                reason: e.to_string(),
            })?,
            alert_cooldown: duration(&lookup, "ALERT_COOLDOWN", 600, Duration::try_seconds)?,
            reading_max_age: duration(&lookup, "READING_MAX_AGE", 3600, Duration::try_seconds)?,
            max_message_length: positive(&lookup, "MAX_MESSAGE_LENGTH", 4000)?,
            rate_limit_per_minute: positive(&lookup, "RATE_LIMIT_PER_MINUTE", 50)?,
            rate_limiting_enabled: flag(&lookup, "ENABLE_RATE_LIMITING", true)?,
            warn_threshold,
            block_threshold,
            block_base,
            block_max,
            clean_period: duration(&lookup, "CLEAN_PERIOD", 3600, Duration::try_seconds)?,
            privileged_actors: json(&lookup, "PRIVILEGED_ACTORS")?,
            admin_groups: json(&lookup, "ADMIN_GROUPS")?,
            member_groups: json(&lookup, "MEMBER_GROUPS")?,
        })
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit_per_minute,
            window: Duration::seconds(60),
            enabled: self.rate_limiting_enabled,
        }
    }

    pub fn threat_policy(&self) -> ThreatPolicy {
        ThreatPolicy {
            warn_threshold: self.warn_threshold,
            block_threshold: self.block_threshold,
            base_block: self.block_base,
            max_block: self.block_max,
            clean_period: self.clean_period,
            ..ThreatPolicy::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            reading_max_age: self.reading_max_age,
            ..MonitorConfig::new(self.monitoring_interval)
        }
    }

    pub fn role_directory(&self) -> RoleDirectory {
        RoleDirectory::new(
            self.privileged_actors.iter().copied(),
            self.admin_groups.clone(),
            self.member_groups.clone(),
        )
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: fmt::Display,
{
    let value = parsed(lookup, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// A positive count of `unit`s (`default` when unset), capped at
/// [`MAX_SETTING_DAYS`].
fn duration(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: i64,
    unit: fn(i64) -> Option<Duration>,
) -> Result<Duration, ConfigError> {
    let value: i64 = positive(lookup, name, default)?;
    unit(value)
        .filter(|d| *d <= Duration::days(MAX_SETTING_DAYS))
        .ok_or_else(|| ConfigError::Invalid {
            name,
            reason: format!("must not exceed {MAX_SETTING_DAYS} days"),
        })
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("'{other}' is not a boolean"),
        }),
    }
}

fn json<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        }
        _ => Ok(T::default()),
    }
}

/// Keep the scheme and host of `url` and hide everything after it.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return "***".to_string();
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    if authority.len() == rest.len() && host.len() == authority.len() {
        format!("{scheme}://{host}")
    } else {
        format!("{scheme}://{host}/***")
    }
}
