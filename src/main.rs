//! placescout - multi-tenant map-search lead scraper
//!
//! Drives a headless browser against the public map-search UI, extracts
//! structured business records, deduplicates them per user, and resumes
//! repeat scrapes of the same query from a persisted cursor.

mod api;
mod config;
mod db;
mod dedup;
mod orchestrator;
mod progress;
mod query;
mod scraper;
mod session;

use api::{create_router, AppState};
use config::Config;
use db::Database;
use session::{PoolConfig, SessionPool};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cadence for the persistent-store maintenance sweep (expired cursors,
/// aged session rows).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Finished scrape-session rows are kept this long.
const SESSION_RETENTION_DAYS: i64 = 90;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "placescout=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env());

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    // Launch the shared browser up front; a failure here is survivable, the
    // pool retries lazily on the first acquire.
    let pool = SessionPool::new(PoolConfig::from(config.as_ref()));
    if let Err(e) = pool.start().await {
        tracing::warn!(error = %e, "browser launch deferred to first scrape");
    }

    spawn_maintenance(db.clone());

    let state = AppState::new(Arc::clone(&config), db, Arc::clone(&pool));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("placescout listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Periodic persistent-store upkeep: expired cursors go immediately, old
/// session rows after the retention window. Place rows are never touched.
fn spawn_maintenance(db: Database) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            interval.tick().await;
            match db.cleanup_expired_cursors() {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "maintenance: removed expired cursors");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "maintenance: cursor cleanup failed"),
            }
            match db.cleanup_old_sessions(SESSION_RETENTION_DAYS) {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "maintenance: removed aged session rows");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "maintenance: session cleanup failed"),
            }
        }
    });
}
