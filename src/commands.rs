//! Command and callback grammar.
//!
//! Commands are whitespace-separated words with an optional leading `/`:
//!
//! - `status`, `groups`, `stats`
//! - `group <name>` (the rest of the line is the name)
//! - `sensor <device_id>`
//! - `threshold <group> <device_id|*> <min|-> <max|->`
//! - `unblock <actor_id>`
//!
//! Callbacks are `status`, `groups`, `group:<name>` or `sensor:<device_id>`.
//! Every piece is checked against its own grammar before it is used.

use crate::error::ValidationError;
use crate::model::InputKind;
use crate::roles::Capability;
use crate::validation::{InputContext, ThreatCategory, ValidationEngine, parse_temperature};

/// A parsed, validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Status,
    Groups,
    Group(String),
    Sensor(String),
    /// Set a rule. `device_id: None` applies to the whole group.
    Threshold {
        group: String,
        device_id: Option<String>,
        min: Option<f64>,
        max: Option<f64>,
    },
    Stats,
    Unblock(i64),
}

impl Command {
    /// The capability an actor needs to run this command.
    pub fn capability(&self) -> Capability {
        match self {
            Command::Status => Capability::ViewStatus,
            Command::Groups | Command::Group(_) | Command::Sensor(_) => Capability::ViewReadings,
            Command::Threshold { .. } => Capability::ManageThresholds,
            Command::Stats => Capability::ViewSecurity,
            Command::Unblock(_) => Capability::ManageBlocks,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Groups => "groups",
            Command::Group(_) => "group",
            Command::Sensor(_) => "sensor",
            Command::Threshold { .. } => "threshold",
            Command::Stats => "stats",
            Command::Unblock(_) => "unblock",
        }
    }

    /// Parse `text` as a command or callback.
    ///
    /// Hostile input is reported with its threat category; anything else that
    /// does not fit the grammar is a `grammar_mismatch`.
    pub fn parse(
        text: &str,
        kind: InputKind,
        engine: &ValidationEngine,
    ) -> Result<Command, ValidationError> {
        match kind {
            InputKind::Command => parse_command(text, engine),
            InputKind::Callback => parse_callback(text, engine),
        }
    }
}

fn mismatch(rule: &str) -> ValidationError {
    ValidationError {
        category: ThreatCategory::GrammarMismatch,
        rule: Some(rule.to_string()),
    }
}

fn parse_command(text: &str, engine: &ValidationEngine) -> Result<Command, ValidationError> {
    engine.validate(text, InputContext::System)?;

    let mut words = text.split_whitespace();
    let token = words.next().ok_or_else(|| mismatch("empty"))?;
    engine.validate(token, InputContext::CommandToken)?;
    let args: Vec<&str> = words.collect();

    let command = match (token.trim_start_matches('/'), args.as_slice()) {
        ("status" | "start", []) => Command::Status,
        ("groups", []) => Command::Groups,
        ("stats", []) => Command::Stats,
        ("group", [_, ..]) => {
            let name = args.join(" ");
            engine.validate(&name, InputContext::GroupName)?;
            Command::Group(name)
        }
        ("sensor", [device_id]) => {
            engine.validate(device_id, InputContext::DeviceId)?;
            Command::Sensor(device_id.to_string())
        }
        ("threshold", [group, device_id, min, max]) => {
            parse_threshold(engine, group, device_id, min, max)?
        }
        ("unblock", [actor]) => {
            engine.validate(actor, InputContext::System)?;
            let actor = actor
                .parse::<i64>()
                .map_err(|_| mismatch("actor_id"))?;
            Command::Unblock(actor)
        }
        ("status" | "start" | "groups" | "stats" | "group" | "sensor" | "threshold" | "unblock", _) => {
            return Err(mismatch("arguments"));
        }
        _ => return Err(mismatch("unknown_command")),
    };

    Ok(command)
}

fn parse_threshold(
    engine: &ValidationEngine,
    group: &str,
    device_id: &str,
    min: &str,
    max: &str,
) -> Result<Command, ValidationError> {
    engine.validate(group, InputContext::GroupName)?;

    let device_id = match device_id {
        "*" => None,
        id => {
            engine.validate(id, InputContext::DeviceId)?;
            Some(id.to_string())
        }
    };

    let bound = |value: &str| -> Result<Option<f64>, ValidationError> {
        if value == "-" {
            return Ok(None);
        }
        engine.validate(value, InputContext::Numeric)?;
        parse_temperature(value)
            .map(Some)
            .ok_or_else(|| mismatch("temperature_range"))
    };
    let min = bound(min)?;
    let max = bound(max)?;

    match (min, max) {
        (None, None) => return Err(mismatch("no_bounds")),
        (Some(lo), Some(hi)) if lo > hi => return Err(mismatch("min_above_max")),
        _ => {}
    }

    Ok(Command::Threshold {
        group: group.to_string(),
        device_id,
        min,
        max,
    })
}

fn parse_callback(text: &str, engine: &ValidationEngine) -> Result<Command, ValidationError> {
    engine.validate(text, InputContext::Callback)?;

    let command = match text.split_once(':') {
        None => match text {
            "status" => Command::Status,
            "groups" => Command::Groups,
            _ => return Err(mismatch("unknown_callback")),
        },
        Some(("group", name)) => {
            engine.validate(name, InputContext::GroupName)?;
            Command::Group(name.to_string())
        }
        Some(("sensor", device_id)) => {
            engine.validate(device_id, InputContext::DeviceId)?;
            Command::Sensor(device_id.to_string())
        }
        Some(_) => return Err(mismatch("unknown_callback")),
    };

    Ok(command)
}
