//! Thermoguard - temperature monitoring with a hardened command surface.
//!
//! Runs two tasks until Ctrl-C: the monitoring loop and the HTTP server.
//!
//! # API Endpoints
//!
//! All but `/health` require `Authorization: Bearer $TRANSPORT_TOKEN`.
//!
//! - `POST /command` - Run a command or button callback
//! - `GET /alerts/recent` - Alerts fired recently
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use thermoguard::api::{AppState, build_router};
use thermoguard::cache::ReadingCache;
use thermoguard::config::{Config, redact_url};
use thermoguard::dedup::AlertDeduplicator;
use thermoguard::guard::Guard;
use thermoguard::monitor::MonitoringCycle;
use thermoguard::notify::LogNotifier;
use thermoguard::rate_limit::RateLimiter;
use thermoguard::source::HttpReadingSource;
use thermoguard::storage::Storage;
use thermoguard::threat::ThreatResponder;
use thermoguard::validation::ValidationEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Command text is never logged; rejections are logged by category only.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("thermoguard=info".parse()?))
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        db_url = %config.database_url,
        source = %redact_url(&config.source_url),
        "Starting Thermoguard"
    );

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let roles = config.role_directory();
    if roles.privileged_count() == 0 {
        warn!("No privileged actors configured; security commands are unavailable");
    }

    let guard = Arc::new(Guard::new(
        ValidationEngine::new(config.max_message_length),
        RateLimiter::new(config.rate_limit_config()),
        ThreatResponder::new(config.threat_policy()),
    ));
    let cache = Arc::new(ReadingCache::new(config.fetch_timeout));
    let dedup = Arc::new(AlertDeduplicator::new(config.alert_cooldown));

    let source = HttpReadingSource::new(&config.source_url, config.fetch_timeout)?;
    let monitor = MonitoringCycle::new(
        source,
        storage.clone(),
        (LogNotifier, storage.clone()),
        cache.clone(),
        dedup,
        config.monitor_config(),
    );

    let state = AppState {
        guard,
        roles: Arc::new(roles),
        cache,
        storage,
        monitor: config.monitor_config(),
        transport_token: Arc::from(config.transport_token.as_str()),
    };
    let app = build_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Thermoguard is listening");

    let mut server_shutdown = shutdown_rx;
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while server_shutdown.changed().await.is_ok() {
                    if *server_shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;

    monitor_task.await?;
    server_task.await??;

    info!("Thermoguard stopped");
    Ok(())
}
