//! HTTP API for placescout.
//!
//! Boundary only: handlers translate between the wire and the core
//! collaborators (orchestrator, pool, progress tracker, database). The
//! authenticated user id arrives in the `x-user-id` header from the
//! upstream auth layer.

mod handlers;
mod types;
mod ws;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::config::Config;
use crate::db::Database;
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressTracker;
use crate::session::SessionPool;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub pool: Arc<SessionPool>,
    pub progress: Arc<ProgressTracker>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Create new application state and start the progress reaper.
    pub fn new(config: Arc<Config>, db: Database, pool: Arc<SessionPool>) -> Self {
        let progress = ProgressTracker::new();
        progress.spawn_reaper();

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&config),
            db.clone(),
            Arc::clone(&pool),
            Arc::clone(&progress),
        ));

        Self {
            config,
            db,
            pool,
            progress,
            orchestrator,
        }
    }
}
