//! Integration tests for the Thermoguard control surface.
//!
//! These tests drive the full pipeline (guard, parser, roles, execution)
//! through the HTTP API.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tokio_test::assert_ok;

use thermoguard::api::{AppState, build_router};
use thermoguard::cache::ReadingCache;
use thermoguard::guard::Guard;
use thermoguard::model::{Alert, AlertCondition, AlertKey, Reading, RuleScope, ThresholdRule};
use thermoguard::monitor::MonitorConfig;
use thermoguard::rate_limit::{RateLimitConfig, RateLimiter};
use thermoguard::roles::RoleDirectory;
use thermoguard::storage::Storage;
use thermoguard::threat::{ThreatPolicy, ThreatResponder};
use thermoguard::validation::ValidationEngine;

const OWNER: i64 = 1;
const ADMIN: i64 = 10;
const MEMBER: i64 = 20;
const STRANGER: i64 = 99;

const TOKEN: &str = "integration-transport-token";
const BEARER: &str = "Bearer integration-transport-token";

struct Harness {
    server: TestServer,
    storage: Storage,
}

async fn create_test_server(rate_limit: RateLimitConfig) -> Harness {
    let storage = assert_ok!(Storage::new("sqlite::memory:").await);

    let roles = RoleDirectory::new(
        [OWNER],
        HashMap::from([(ADMIN, vec!["north".to_string()])]),
        HashMap::from([(MEMBER, vec!["north".to_string()])]),
    );

    let now = Utc::now().timestamp();
    let cache = Arc::new(ReadingCache::default());
    cache.store(
        vec![
            Reading {
                device_id: "dev-1".to_string(),
                group: "north".to_string(),
                temperature: 4.5,
                timestamp: now,
            },
            Reading {
                device_id: "dev-2".to_string(),
                group: "north".to_string(),
                temperature: 5.0,
                timestamp: now,
            },
            Reading {
                device_id: "dev-9".to_string(),
                group: "south".to_string(),
                temperature: -18.0,
                timestamp: now,
            },
        ],
        Utc::now(),
    );

    let state = AppState {
        guard: Arc::new(Guard::new(
            ValidationEngine::default(),
            RateLimiter::new(rate_limit),
            ThreatResponder::new(ThreatPolicy::default()),
        )),
        roles: Arc::new(roles),
        cache,
        storage: storage.clone(),
        monitor: MonitorConfig::default(),
        transport_token: Arc::from(TOKEN),
    };

    Harness {
        server: TestServer::new(build_router(state)).unwrap(),
        storage,
    }
}

async fn default_server() -> Harness {
    create_test_server(RateLimitConfig::default()).await
}

async fn command(server: &TestServer, actor: i64, text: &str) -> axum_test::TestResponse {
    server
        .post("/command")
        .add_header(header::AUTHORIZATION, HeaderValue::from_static(BEARER))
        .json(&json!({ "actor_id": actor, "text": text }))
        .await
}

async fn callback(server: &TestServer, actor: i64, data: &str) -> axum_test::TestResponse {
    server
        .post("/command")
        .add_header(header::AUTHORIZATION, HeaderValue::from_static(BEARER))
        .json(&json!({ "actor_id": actor, "text": data, "kind": "callback" }))
        .await
}

async fn alerts(server: &TestServer, query: &str) -> axum_test::TestResponse {
    server
        .get(&format!("/alerts/recent?{query}"))
        .add_header(header::AUTHORIZATION, HeaderValue::from_static(BEARER))
        .await
}

fn alert(device_id: &str, condition: AlertCondition, group: Option<&str>) -> Alert {
    Alert {
        key: AlertKey::new(device_id, condition),
        group: group.map(str::to_string),
        temperature: group.map(|_| 9.5),
        limit: group.map(|_| 8.0),
        message: format!("{device_id} alert"),
        fired_at: Utc::now() - Duration::minutes(5),
        stale: false,
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = default_server().await;

    let response = h.server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_requests_without_transport_token_are_unauthorized() {
    let h = default_server().await;

    // A claimed privileged id is worthless without the token.
    let response = h
        .server
        .post("/command")
        .json(&json!({ "actor_id": OWNER, "text": format!("/unblock {MEMBER}") }))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    let body: Value = response.json();
    assert_eq!(body["ok"], false);

    h.server
        .post("/command")
        .add_header(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong-token"))
        .json(&json!({ "actor_id": OWNER, "text": "/stats" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    h.server
        .post("/command")
        .add_header(header::AUTHORIZATION, HeaderValue::from_static(TOKEN))
        .json(&json!({ "actor_id": OWNER, "text": "/stats" }))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    h.server
        .get(&format!("/alerts/recent?actor_id={OWNER}"))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    // Hostile text sent without the token never reaches the guard.
    for _ in 0..10 {
        h.server
            .post("/command")
            .json(&json!({ "actor_id": MEMBER, "text": "1; DROP TABLE users" }))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }
    command(&h.server, MEMBER, "/status")
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_status_is_scoped_to_member_groups() {
    let h = default_server().await;

    let response = command(&h.server, MEMBER, "/status").await;
    response.assert_status_ok();

    let body: Value = response.json();
    assert_eq!(body["ok"], true);
    assert_eq!(body["data"]["has_data"], true);
    assert_eq!(body["data"]["sensors"], 2);
    assert_eq!(body["data"]["groups"], json!(["north"]));
    assert_eq!(body["data"]["stale"], false);

    let response = command(&h.server, OWNER, "/status").await;
    let body: Value = response.json();
    assert_eq!(body["data"]["sensors"], 3);
}

#[tokio::test]
async fn test_status_reports_statistics() {
    let h = default_server().await;
    let rule = ThresholdRule {
        scope: RuleScope::Group {
            group: "north".to_string(),
        },
        min: Some(2.0),
        max: Some(4.8),
    };
    assert_ok!(h.storage.upsert_threshold(&rule, Utc::now()).await);

    let response = command(&h.server, MEMBER, "/status").await;
    response.assert_status_ok();
    let body: Value = response.json();
    let stats = &body["data"]["statistics"];
    assert_eq!(body["data"]["thresholds_loaded"], true);
    assert_eq!(stats["total"], 2);
    assert_eq!(stats["valid"], 2);
    assert_eq!(stats["invalid"], 0);
    assert_eq!(stats["critical"], 1);
    assert_eq!(stats["above_max"], 1);
    assert_eq!(stats["groups"]["north"]["critical"], 1);
    assert!(stats["groups"].get("south").is_none());
    assert!(body["message"].as_str().unwrap().contains("1 critical"));

    let response = command(&h.server, OWNER, "/status").await;
    let body: Value = response.json();
    let stats = &body["data"]["statistics"];
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["groups"]["south"]["total"], 1);
    assert_eq!(stats["groups"]["south"]["critical"], 0);
}

#[tokio::test]
async fn test_unknown_actor_is_forbidden() {
    let h = default_server().await;

    let response = command(&h.server, STRANGER, "/status").await;

    response.assert_status(StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_sensor_and_group_access() {
    let h = default_server().await;

    command(&h.server, MEMBER, "/sensor dev-1")
        .await
        .assert_status_ok();
    command(&h.server, MEMBER, "/sensor dev-9")
        .await
        .assert_status(StatusCode::FORBIDDEN);
    command(&h.server, MEMBER, "/sensor dev-404")
        .await
        .assert_status(StatusCode::NOT_FOUND);

    let response = callback(&h.server, MEMBER, "group:north").await;
    response.assert_status_ok();
    let body: Value = response.json();
    let devices: Vec<&str> = body["data"]["readings"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["device_id"].as_str().unwrap())
        .collect();
    assert_eq!(devices, vec!["dev-1", "dev-2"]);

    callback(&h.server, MEMBER, "group:south")
        .await
        .assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_groups_callback() {
    let h = default_server().await;

    let response = callback(&h.server, OWNER, "groups").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["groups"], json!(["north", "south"]));
}

#[tokio::test]
async fn test_threshold_requires_admin_of_group() {
    let h = default_server().await;

    command(&h.server, ADMIN, "/threshold north * 2 8")
        .await
        .assert_status_ok();
    command(&h.server, ADMIN, "/threshold south * 2 8")
        .await
        .assert_status(StatusCode::FORBIDDEN);
    command(&h.server, MEMBER, "/threshold north dev-1 2 8")
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let rules = assert_ok!(h.storage.load_thresholds().await);
    assert_eq!(rules.len(), 1);
    assert_eq!(rules.rules_for("dev-1", "north")[0].max, Some(8.0));
}

#[tokio::test]
async fn test_hostile_input_escalates_to_block() {
    let h = default_server().await;

    // Two violations: still clean. Third: warned. Fourth: blocked.
    for _ in 0..3 {
        let response = command(&h.server, MEMBER, "1; DROP TABLE users").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert!(body.get("retry_after_secs").is_none());
    }

    let response = command(&h.server, MEMBER, "1; DROP TABLE users").await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["retry_after_secs"], 300);

    // Even valid commands are refused while blocked.
    let response = command(&h.server, MEMBER, "/status").await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json();
    assert!(body["retry_after_secs"].as_i64().unwrap() > 0);

    // Other actors are unaffected.
    command(&h.server, ADMIN, "/status")
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_typos_never_block() {
    let h = default_server().await;

    for _ in 0..10 {
        command(&h.server, MEMBER, "/statsu")
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    command(&h.server, MEMBER, "/status")
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_privileged_actor_is_never_blocked() {
    let h = create_test_server(RateLimitConfig {
        max_requests: 2,
        ..RateLimitConfig::default()
    })
    .await;

    for _ in 0..10 {
        command(&h.server, OWNER, "<script>alert(1)</script>")
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    command(&h.server, OWNER, "/status")
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_rate_limit() {
    let h = create_test_server(RateLimitConfig {
        max_requests: 3,
        ..RateLimitConfig::default()
    })
    .await;

    for _ in 0..3 {
        command(&h.server, MEMBER, "/status")
            .await
            .assert_status_ok();
    }

    let response = command(&h.server, MEMBER, "/status").await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json();
    let retry_after = body["retry_after_secs"].as_i64().unwrap();
    assert!((1..=60).contains(&retry_after));
}

#[tokio::test]
async fn test_security_commands_need_privilege() {
    let h = default_server().await;

    command(&h.server, ADMIN, "/stats")
        .await
        .assert_status(StatusCode::FORBIDDEN);

    let response = command(&h.server, OWNER, "/stats").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert!(body["data"]["tracked_actors"].is_number());
    assert!(body["data"]["rate_windows"].is_number());
}

#[tokio::test]
async fn test_unblock_lifts_block() {
    let h = default_server().await;

    for _ in 0..4 {
        command(&h.server, MEMBER, "../../etc/passwd").await;
    }
    command(&h.server, MEMBER, "/status")
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);

    let response = command(&h.server, OWNER, &format!("/unblock {MEMBER}")).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["unblocked"], true);

    command(&h.server, MEMBER, "/status")
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_get_alerts_empty() {
    let h = default_server().await;

    let response = alerts(&h.server, &format!("actor_id={MEMBER}")).await;

    response.assert_status_ok();

    let body: Value = response.json();
    assert!(body["alerts"].as_array().unwrap().is_empty());
    assert_eq!(body["lookback_minutes"], 60);
}

#[tokio::test]
async fn test_get_alerts_lookback_is_capped() {
    let h = default_server().await;

    let response = alerts(&h.server, &format!("actor_id={MEMBER}&minutes=999999")).await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["lookback_minutes"], 7 * 24 * 60);
}

#[tokio::test]
async fn test_get_alerts_scoped_to_actor_groups() {
    let h = default_server().await;
    for entry in [
        alert("dev-1", AlertCondition::AboveMax, Some("north")),
        alert("dev-9", AlertCondition::BelowMin, Some("south")),
        alert("source", AlertCondition::FetchFailed, None),
    ] {
        assert_ok!(h.storage.record_alert(&entry).await);
    }

    let devices = |response: axum_test::TestResponse| -> Vec<String> {
        response.assert_status_ok();
        let body: Value = response.json();
        let mut devices: Vec<String> = body["alerts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["device_id"].as_str().unwrap().to_string())
            .collect();
        devices.sort();
        devices
    };

    let member = devices(alerts(&h.server, &format!("actor_id={MEMBER}")).await);
    assert_eq!(member, vec!["dev-1", "source"]);

    let owner = devices(alerts(&h.server, &format!("actor_id={OWNER}")).await);
    assert_eq!(owner, vec!["dev-1", "dev-9", "source"]);

    alerts(&h.server, &format!("actor_id={STRANGER}"))
        .await
        .assert_status(StatusCode::FORBIDDEN);
    alerts(&h.server, "minutes=60")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_alerts_respects_block() {
    let h = default_server().await;

    for _ in 0..4 {
        command(&h.server, MEMBER, "<script>alert(1)</script>").await;
    }

    alerts(&h.server, &format!("actor_id={MEMBER}"))
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);
}
