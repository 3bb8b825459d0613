//! SQLite storage layer for Thermoguard.
//!
//! Holds the threshold rules and the log of fired alerts. Everything else
//! (rate windows, blocks, cooldowns, the reading cache) is in memory only.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::NotifyError;
use crate::model::{Alert, AlertLogEntry, RecipientScope, RuleScope, RuleSet, ThresholdRule};
use crate::monitor::ThresholdSource;
use crate::notify::Notifier;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:thermoguard.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    ///
    /// Group-wide rules are stored with an empty `device_id`.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threshold_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                grp TEXT NOT NULL,
                device_id TEXT NOT NULL DEFAULT '',
                min_temp REAL,
                max_temp REAL,
                updated_at INTEGER NOT NULL,
                UNIQUE (grp, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                condition TEXT NOT NULL,
                grp TEXT,
                temperature REAL,
                message TEXT NOT NULL,
                fired_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for recent-alert queries
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alert_log_fired_at
            ON alert_log(fired_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace the rule for the rule's scope.
    pub async fn upsert_threshold(
        &self,
        rule: &ThresholdRule,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let (group, device_id) = match &rule.scope {
            RuleScope::Group { group } => (group.as_str(), ""),
            RuleScope::Device { group, device_id } => (group.as_str(), device_id.as_str()),
        };

        sqlx::query(
            r#"
            INSERT INTO threshold_rules (grp, device_id, min_temp, max_temp, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (grp, device_id) DO UPDATE SET
                min_temp = excluded.min_temp,
                max_temp = excluded.max_temp,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(group)
        .bind(device_id)
        .bind(rule.min)
        .bind(rule.max)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;

        debug!(group, device_id, "Threshold rule stored");
        Ok(())
    }

    /// Load every stored threshold rule.
    pub async fn load_thresholds(&self) -> anyhow::Result<RuleSet> {
        let rows = sqlx::query(
            r#"
            SELECT grp, device_id, min_temp, max_temp
            FROM threshold_rules
            ORDER BY grp, device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let rules = rows
            .iter()
            .map(|row| {
                let group: String = row.get("grp");
                let device_id: String = row.get("device_id");
                let scope = if device_id.is_empty() {
                    RuleScope::Group { group }
                } else {
                    RuleScope::Device { group, device_id }
                };
                ThresholdRule {
                    scope,
                    min: row.get("min_temp"),
                    max: row.get("max_temp"),
                }
            })
            .collect();

        Ok(RuleSet::new(rules))
    }

    /// Append a fired alert to the alert log.
    pub async fn record_alert(&self, alert: &Alert) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_log (device_id, condition, grp, temperature, message, fired_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.key.device_id)
        .bind(alert.key.condition.as_str())
        .bind(alert.group.as_deref())
        .bind(alert.temperature)
        .bind(&alert.message)
        .bind(alert.fired_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Alerts fired within the last `minutes`, newest first.
    pub async fn recent_alerts(
        &self,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AlertLogEntry>> {
        let start_ts = now.timestamp() - i64::from(minutes) * 60;

        let rows = sqlx::query(
            r#"
            SELECT device_id, condition, grp, temperature, message, fired_at
            FROM alert_log
            WHERE fired_at >= ?
            ORDER BY fired_at DESC, id DESC
            "#,
        )
        .bind(start_ts)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let fired_at: i64 = row.get("fired_at");
                AlertLogEntry {
                    device_id: row.get("device_id"),
                    condition: row.get("condition"),
                    group: row.get("grp"),
                    temperature: row.get("temperature"),
                    message: row.get("message"),
                    fired_at: Utc.timestamp_opt(fired_at, 0).single().unwrap_or(now),
                }
            })
            .collect())
    }
}

impl ThresholdSource for Storage {
    async fn load_rules(&self) -> anyhow::Result<RuleSet> {
        self.load_thresholds().await
    }
}

impl Notifier for Storage {
    async fn notify(&self, _scope: &RecipientScope, alert: &Alert) -> Result<(), NotifyError> {
        self.record_alert(alert).await.map_err(|e| NotifyError {
            device_id: alert.key.device_id.clone(),
            reason: e.to_string(),
        })
    }
}
