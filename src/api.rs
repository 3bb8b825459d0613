//! HTTP control surface for Thermoguard.
//!
//! Every command passes the same pipeline: the guard admits or refuses the
//! actor, the text is parsed against the command grammar, the actor's role
//! must allow the command and its group, and only then does it run.
//!
//! Every route except `/health` requires `Authorization: Bearer <token>` with
//! the configured transport token. The actor id in a request is only trusted
//! once the caller has presented it.
//!
//! Handlers never echo or log the raw command text. Rejections are logged by
//! category.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::cache::ReadingCache;
use crate::commands::Command;
use crate::guard::Guard;
use crate::model::{
    AlertsQuery, AlertsResponse, CommandRequest, CommandResponse, Reading, RuleScope,
    ThresholdRule,
};
use crate::model::RuleSet;
use crate::monitor::{MonitorConfig, MonitoringStats};
use crate::roles::{ActorIdentity, Capability, GroupAccess, RoleDirectory};
use crate::storage::Storage;

/// Longest lookback accepted by GET /alerts/recent (one week).
const MAX_LOOKBACK_MINUTES: u32 = 7 * 24 * 60;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<Guard>,
    pub roles: Arc<RoleDirectory>,
    pub cache: Arc<ReadingCache>,
    pub storage: Storage,
    pub monitor: MonitorConfig,
    pub transport_token: Arc<str>,
}

/// Build the router with request tracing.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/command", post(post_command))
        .route("/alerts/recent", get(get_alerts))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    // Health check (no token required)
    Router::new()
        .merge(protected)
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Reject requests that do not carry the transport token.
pub async fn require_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), state.transport_token.as_bytes()) => {
            next.run(request).await
        }
        _ => {
            warn!(
                path = request.uri().path(),
                presented = presented.is_some(),
                "Request without a valid transport token"
            );
            reply(
                StatusCode::UNAUTHORIZED,
                CommandResponse::denied("Missing or invalid credentials.", None),
            )
            .into_response()
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

type Reply = (StatusCode, Json<CommandResponse>);

fn reply(status: StatusCode, response: CommandResponse) -> Reply {
    (status, Json(response))
}

/// POST /command - Run a command or button callback.
///
/// # Request Body
///
/// ```json
/// {
///     "actor_id": 123456,
///     "text": "/sensor dev-1",
///     "kind": "command"
/// }
/// ```
///
/// `kind` is `command` (default) or `callback`.
///
/// # Response
///
/// - `200 OK`: the command ran; `data` carries its result
/// - `400 Bad Request`: the input was rejected
/// - `403 Forbidden`: the actor may not run this command
/// - `404 Not Found`: no data for the requested group or sensor
/// - `429 Too Many Requests`: rate limited or blocked, see `retry_after_secs`
#[instrument(skip_all, fields(actor, kind))]
pub async fn post_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Reply {
    let span = tracing::Span::current();
    span.record("actor", request.actor_id);
    span.record("kind", tracing::field::debug(request.kind));

    let now = Utc::now();
    let actor = state.roles.resolve(request.actor_id);

    let admitted = state.guard.check(&actor, now);
    if !admitted.allow {
        return reply(
            StatusCode::TOO_MANY_REQUESTS,
            CommandResponse::denied("Too many requests. Try again later.", admitted.retry_after),
        );
    }

    let command = match Command::parse(&request.text, request.kind, state.guard.engine()) {
        Ok(command) => command,
        Err(err) => {
            let decision = state.guard.reject(&actor, &err, now);
            let message = if err.category.is_hostile() {
                "Input rejected."
            } else {
                "Unrecognized command. Check the syntax and try again."
            };
            return reply(
                StatusCode::BAD_REQUEST,
                CommandResponse::denied(message, decision.retry_after),
            );
        }
    };

    if !actor.role.allows(command.capability()) {
        warn!(
            actor = actor.id,
            role = actor.role.as_str(),
            command = command.name(),
            "Command not permitted for role"
        );
        return forbidden();
    }

    let response = execute(&state, &actor, command, now).await;
    info!(status = response.0.as_u16(), "Command handled");
    response
}

fn forbidden() -> Reply {
    reply(
        StatusCode::FORBIDDEN,
        CommandResponse::denied("You do not have access to this.", None),
    )
}

fn not_found(message: &str) -> Reply {
    reply(StatusCode::NOT_FOUND, CommandResponse::denied(message, None))
}

async fn execute(
    state: &AppState,
    actor: &ActorIdentity,
    command: Command,
    now: DateTime<Utc>,
) -> Reply {
    let access = state.roles.group_access(actor.id);

    match command {
        Command::Status => status(state, &access, now).await,
        Command::Groups => {
            let groups: Vec<String> = state
                .cache
                .get_snapshot()
                .map(|s| s.groups())
                .unwrap_or_default()
                .into_iter()
                .filter(|g| access.permits(g))
                .collect();
            reply(
                StatusCode::OK,
                CommandResponse::ok(
                    format!("{} groups available", groups.len()),
                    Some(json!({ "groups": groups })),
                ),
            )
        }
        Command::Group(name) => {
            if !access.permits(&name) {
                return forbidden();
            }
            let Some(snapshot) = state.cache.get_snapshot() else {
                return not_found("No sensor data received yet.");
            };
            let readings: Vec<&Reading> = snapshot.group_readings(&name);
            if readings.is_empty() {
                return not_found("No readings for this group.");
            }
            reply(
                StatusCode::OK,
                CommandResponse::ok(
                    format!("{} sensors in {name}", readings.len()),
                    Some(json!({
                        "group": name,
                        "fetched_at": snapshot.fetched_at,
                        "age_secs": snapshot.age(now).num_seconds(),
                        "readings": readings,
                    })),
                ),
            )
        }
        Command::Sensor(device_id) => {
            let Some(snapshot) = state.cache.get_snapshot() else {
                return not_found("No sensor data received yet.");
            };
            let Some(reading) = snapshot.device(&device_id) else {
                return not_found("Unknown sensor.");
            };
            if !access.permits(&reading.group) {
                return forbidden();
            }
            reply(
                StatusCode::OK,
                CommandResponse::ok(
                    format!("{}: {:.1}°C", reading.device_id, reading.temperature),
                    Some(json!({
                        "reading": reading,
                        "taken_at": reading.taken_at(),
                        "fetched_at": snapshot.fetched_at,
                    })),
                ),
            )
        }
        Command::Threshold {
            group,
            device_id,
            min,
            max,
        } => {
            if !access.permits(&group) {
                return forbidden();
            }
            let scope = match device_id {
                Some(device_id) => RuleScope::Device { group, device_id },
                None => RuleScope::Group { group },
            };
            let rule = ThresholdRule { scope, min, max };

            match state.storage.upsert_threshold(&rule, now).await {
                Ok(()) => {
                    info!(actor = actor.id, scope = ?rule.scope, ?min, ?max, "Threshold updated");
                    reply(
                        StatusCode::OK,
                        CommandResponse::ok("Threshold saved.", Some(json!({ "rule": rule }))),
                    )
                }
                Err(e) => {
                    warn!(error = %e, "Failed to store threshold");
                    reply(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        CommandResponse::denied("Could not save the threshold.", None),
                    )
                }
            }
        }
        Command::Stats => {
            let stats = state.guard.stats(now);
            reply(
                StatusCode::OK,
                CommandResponse::ok(
                    format!(
                        "{} tracked, {} warned, {} blocked",
                        stats.threats.tracked_actors,
                        stats.threats.warned_actors,
                        stats.threats.blocked_actors
                    ),
                    Some(json!(stats)),
                ),
            )
        }
        Command::Unblock(target) => {
            let lifted = state.guard.unblock(target);
            info!(actor = actor.id, target, lifted, "Unblock requested");
            let message = if lifted {
                format!("Actor {target} unblocked.")
            } else {
                format!("Actor {target} had no restrictions.")
            };
            reply(
                StatusCode::OK,
                CommandResponse::ok(message, Some(json!({ "unblocked": lifted }))),
            )
        }
    }
}

async fn status(state: &AppState, access: &GroupAccess, now: DateTime<Utc>) -> Reply {
    let Some(snapshot) = state.cache.get_snapshot() else {
        return reply(
            StatusCode::OK,
            CommandResponse::ok(
                "Monitoring is running. No sensor data received yet.",
                Some(json!({ "has_data": false })),
            ),
        );
    };

    let age = snapshot.age(now);
    let stale = age > state.monitor.max_staleness;
    let groups: Vec<String> = snapshot
        .groups()
        .into_iter()
        .filter(|g| access.permits(g))
        .collect();
    let sensors = snapshot
        .readings
        .iter()
        .filter(|r| access.permits(&r.group))
        .count();

    let mut message = format!(
        "Monitoring {sensors} sensors in {} groups. Last update {} min ago.",
        groups.len(),
        age.num_minutes()
    );

    let (rules, thresholds_loaded) = match state.storage.load_thresholds().await {
        Ok(rules) => (rules, true),
        Err(e) => {
            warn!(error = %e, "Failed to load thresholds for status");
            (RuleSet::default(), false)
        }
    };
    let statistics = MonitoringStats::collect(
        snapshot.readings.iter().filter(|r| access.permits(&r.group)),
        &rules,
        now,
        state.monitor.reading_max_age,
    );
    if statistics.totals.critical > 0 {
        message.push_str(&format!(
            " {} critical ({} too warm, {} too cold).",
            statistics.totals.critical, statistics.totals.above_max, statistics.totals.below_min
        ));
    }
    if statistics.totals.invalid > 0 {
        message.push_str(&format!(" {} invalid.", statistics.totals.invalid));
    }
    if stale {
        message.push_str(" Sensor data is outdated.");
    }

    reply(
        StatusCode::OK,
        CommandResponse::ok(
            message,
            Some(json!({
                "has_data": true,
                "fetched_at": snapshot.fetched_at,
                "age_secs": age.num_seconds(),
                "stale": stale,
                "sensors": sensors,
                "groups": groups,
                "thresholds_loaded": thresholds_loaded,
                "statistics": statistics,
            })),
        ),
    )
}

/// GET /alerts/recent - Alerts fired within a lookback window.
///
/// # Query Parameters
///
/// - `actor_id`: The actor asking; only alerts of their groups are returned
/// - `minutes` (optional): Lookback window in minutes (default: 60, at most one week)
///
/// Source alerts carry no group and are visible to every actor who may view
/// readings.
#[instrument(skip(state))]
pub async fn get_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<AlertsResponse>, StatusCode> {
    let now = Utc::now();
    let minutes = query.minutes.min(MAX_LOOKBACK_MINUTES);
    let actor = state.roles.resolve(query.actor_id);

    if !state.guard.check(&actor, now).allow {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    if !actor.role.allows(Capability::ViewReadings) {
        warn!(actor = actor.id, role = actor.role.as_str(), "Alert log not permitted for role");
        return Err(StatusCode::FORBIDDEN);
    }
    let access = state.roles.group_access(actor.id);

    match state.storage.recent_alerts(minutes, now).await {
        Ok(mut alerts) => {
            alerts.retain(|a| a.group.as_deref().is_none_or(|g| access.permits(g)));
            info!(
                alert_count = alerts.len(),
                lookback_minutes = minutes,
                "Alerts queried"
            );
            Ok(Json(AlertsResponse {
                alerts,
                lookback_minutes: minutes,
            }))
        }
        Err(e) => {
            warn!(
                lookback_minutes = minutes,
                error = %e,
                "Failed to load alerts"
            );
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
