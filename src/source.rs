//! Sensor data source client.
//!
//! The source is a single HTTP endpoint answering with
//!
//! ```json
//! { "status": "success", "message": [ { "device_id": "...", "group": "...",
//!   "temperature": 4.2, "timestamp": 1700000000 } ] }
//! ```
//!
//! A non-success status, a non-2xx response, or a body that does not follow
//! this shape is a [`FetchError`]. Individual entries that cannot be read or
//! fail the plausibility checks are dropped and counted.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::redact_url;
use crate::error::FetchError;
use crate::model::{Reading, ReadingBatch};
use crate::validation::{TEMPERATURE_RANGE, is_device_id, is_group_name};

/// Anything that can produce a batch of readings.
pub trait ReadingSource: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<ReadingBatch, FetchError>> + Send;
}

/// Client for the HTTP sensor endpoint.
#[derive(Clone)]
pub struct HttpReadingSource {
    client: reqwest::Client,
    url: String,
}

impl std::fmt::Debug for HttpReadingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReadingSource")
            .field("url", &redact_url(&self.url))
            .finish()
    }
}

impl HttpReadingSource {
    /// Create a client for `url` whose requests give up after `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl ReadingSource for HttpReadingSource {
    async fn fetch(&self) -> Result<ReadingBatch, FetchError> {
        let response = self.client.get(&self.url).send().await?;
        let response = response.error_for_status()?;
        let body = response.text().await?;
        parse_payload(&body)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    message: Value,
}

/// Parse a source response body into readings.
pub fn parse_payload(body: &str) -> Result<ReadingBatch, FetchError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;

    if envelope.status != "success" {
        return Err(FetchError::Malformed(format!(
            "source reported status '{}'",
            envelope.status
        )));
    }

    let Value::Array(entries) = envelope.message else {
        return Err(FetchError::Malformed(
            "'message' is not a list".to_string(),
        ));
    };

    let total = entries.len();
    let readings: ReadingBatch = entries.iter().filter_map(reading_from_value).collect();

    let rejected = total - readings.len();
    if rejected > 0 {
        warn!(total, rejected, "Dropped unreadable sensor entries");
    }
    debug!(readings = readings.len(), "Sensor payload parsed");

    Ok(readings)
}

/// Read one entry, tolerating numbers sent as strings.
fn reading_from_value(value: &Value) -> Option<Reading> {
    let device_id = scalar_string(value.get("device_id")?)?;
    let group = scalar_string(value.get("group")?)?;
    let temperature = scalar_f64(value.get("temperature")?)?;
    let timestamp = scalar_f64(value.get("timestamp")?)? as i64;

    let plausible = is_device_id(&device_id)
        && is_group_name(&group)
        && temperature.is_finite()
        && TEMPERATURE_RANGE.contains(&temperature)
        && timestamp > 0;

    plausible.then_some(Reading {
        device_id,
        group,
        temperature,
        timestamp,
    })
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn scalar_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}
