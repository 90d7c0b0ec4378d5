//! Scrape orchestration: assemble inputs, spawn the background scrape,
//! persist what it found.
//!
//! The orchestrator is the only place where the pipeline, the progress
//! tracker, and the database meet. Post-scrape persistence runs inside a
//! guarded block: a failed upsert or cursor write is logged and dropped,
//! never surfaced — the extracted results stay valid either way.

use crate::config::Config;
use crate::db::{CursorUpdate, Database, DbError, ScrapeCursor, SessionOutcome};
use crate::progress::ProgressTracker;
use crate::query;
use crate::scraper::{
    BusinessRecord, ProgressReporter, ResumePoint, ScrapeError, ScrapeOptions, ScrapeOutcome,
    Scraper, ScrapeStatsReport,
};
use crate::session::SessionPool;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Response returned as soon as an async scrape is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct StartedScrape {
    pub scrape_id: String,
    pub status: &'static str,
    pub cursor_status: &'static str,
    pub previously_collected: i64,
    pub seen_places_count: usize,
    pub target_count: usize,
}

/// Outcome of the synchronous scrape endpoint.
pub struct BlockingScrape {
    pub records: Vec<BusinessRecord>,
    pub stats: ScrapeStatsReport,
    pub time_taken_seconds: f64,
}

pub struct Orchestrator {
    config: Arc<Config>,
    db: Database,
    pool: Arc<SessionPool>,
    progress: Arc<ProgressTracker>,
    scraper: Arc<Scraper>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        db: Database,
        pool: Arc<SessionPool>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        let scraper = Arc::new(Scraper::new(Arc::clone(&config), Arc::clone(&pool)));
        Self { config, db, pool, progress, scraper }
    }

    /// Accept an async scrape: assemble the seen set and cursor, create the
    /// progress entry and session row, spawn the background task, return
    /// immediately.
    pub async fn start_scrape(
        &self,
        user_id: &str,
        search_query: &str,
        target_count: Option<usize>,
        max_scrolls: Option<usize>,
    ) -> Result<StartedScrape, DbError> {
        let scrape_id: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
        let target_count = target_count.unwrap_or(self.config.default_target_count);

        // Seen set scoped to this exact query identity: duplicate counts
        // shown to the user reflect this query, not their global history.
        let query_hash = query::query_hash(search_query);
        let seen_places = self.db.seen_places_for_query(user_id, &query_hash)?;

        let cursor = self
            .db
            .get_or_create_cursor(user_id, search_query, self.config.cursor_ttl_days)?;
        let resume = cursor.can_resume().then(|| ResumePoint::from(&cursor));
        let cursor_status = if resume.is_some() { "resuming" } else { "new" };

        let display_max_scrolls =
            max_scrolls.unwrap_or_else(|| target_count.div_ceil(5).clamp(20, 150));
        self.progress
            .create(&scrape_id, target_count as u64, display_max_scrolls as u64);

        let session_row = self.db.create_session(user_id, search_query)?;

        tracing::info!(
            user_id,
            scrape_id = %scrape_id,
            query = search_query,
            cursor_status,
            seen = seen_places.len(),
            "accepted async scrape"
        );

        self.spawn_scrape_task(ScrapeTask {
            scrape_id: scrape_id.clone(),
            session_id: session_row.id,
            user_id: user_id.to_string(),
            search_query: search_query.to_string(),
            target_count,
            max_scrolls,
            seen_places: seen_places.clone(),
            prior_cursor: cursor,
        });

        Ok(StartedScrape {
            scrape_id,
            status: "started",
            cursor_status,
            previously_collected: resume.map_or(0, |r| r.cards_collected),
            seen_places_count: seen_places.len(),
            target_count,
        })
    }

    fn spawn_scrape_task(&self, task: ScrapeTask) {
        let db = self.db.clone();
        let config = Arc::clone(&self.config);
        let progress = Arc::clone(&self.progress);
        let scraper = Arc::clone(&self.scraper);

        tokio::spawn(async move {
            if let Err(e) = db.start_session(&task.session_id) {
                tracing::warn!(session_id = %task.session_id, error = %e, "could not mark session running");
            }

            let started = Instant::now();
            let reporter = ProgressReporter::new(Arc::clone(&progress), task.scrape_id.clone());
            let options = ScrapeOptions {
                target_count: task.target_count,
                max_scrolls: task.max_scrolls,
                seen_places: task.seen_places.clone(),
                cursor: task
                    .prior_cursor
                    .can_resume()
                    .then(|| ResumePoint::from(&task.prior_cursor)),
            };

            let result = scraper
                .scrape(&task.user_id, &task.search_query, options, &reporter)
                .await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(outcome) => {
                    persist_outcome(&db, &config, &task, &outcome, elapsed);
                    progress.complete(&task.scrape_id, outcome.records, true);
                }
                Err(e) => {
                    tracing::error!(scrape_id = %task.scrape_id, error = %e, "async scrape failed");
                    progress.fail(&task.scrape_id, &e.to_string());
                    let outcome = SessionOutcome {
                        time_taken_seconds: to_secs(elapsed),
                        error_message: Some(e.to_string()),
                        ..SessionOutcome::default()
                    };
                    if let Err(db_err) = db.complete_session(&task.session_id, &outcome) {
                        tracing::error!(error = %db_err, "could not record failed session");
                    }
                }
            }
        });
    }

    /// Run the pipeline inline for the synchronous endpoint. No cursor, no
    /// seen set, no persistence — a one-shot scrape.
    pub async fn run_blocking_scrape(
        &self,
        user_id: &str,
        search_query: &str,
        target_count: Option<usize>,
        max_scrolls: Option<usize>,
    ) -> Result<BlockingScrape, ScrapeError> {
        let started = Instant::now();
        let options = ScrapeOptions {
            target_count: target_count.unwrap_or(self.config.default_target_count),
            max_scrolls,
            ..ScrapeOptions::default()
        };
        let outcome = self
            .scraper
            .scrape(user_id, search_query, options, &ProgressReporter::disabled())
            .await?;
        Ok(BlockingScrape {
            records: outcome.records,
            stats: outcome.stats,
            time_taken_seconds: (started.elapsed().as_secs_f64() * 100.0).round() / 100.0,
        })
    }
}

struct ScrapeTask {
    scrape_id: String,
    session_id: String,
    user_id: String,
    search_query: String,
    target_count: usize,
    max_scrolls: Option<usize>,
    seen_places: HashSet<String>,
    prior_cursor: ScrapeCursor,
}

/// Write places, cursor, and session row for a finished scrape. Each write
/// is independently guarded: persistence failures never invalidate the
/// scrape's results.
fn persist_outcome(
    db: &Database,
    config: &Config,
    task: &ScrapeTask,
    outcome: &ScrapeOutcome,
    elapsed_secs: f64,
) {
    let place_ids: Vec<String> =
        outcome.records.iter().map(|r| r.place_id.clone()).collect();
    let cids: HashMap<String, String> = outcome
        .records
        .iter()
        .filter_map(|r| r.cid.as_ref().map(|cid| (r.place_id.clone(), cid.clone())))
        .collect();

    if let Err(e) = db.record_places(&task.user_id, &place_ids, &task.search_query, &cids) {
        tracing::error!(error = %e, "could not record scraped places");
    }

    // Cursors never regress: a resumed scrape that covered less ground than
    // a previous one keeps the larger card count.
    let update = CursorUpdate {
        cards_collected: outcome
            .cursor
            .cards_collected
            .max(task.prior_cursor.cards_collected),
        last_scroll_position: outcome.cursor.last_scroll_position,
        last_place_id: outcome.cursor.last_place_id.clone(),
        last_card_index: outcome.cursor.last_card_index,
        total_scrolls: Some(
            task.prior_cursor.total_scrolls_performed + outcome.cursor.scrolls_performed,
        ),
        visible_card_count: Some(outcome.cursor.visible_card_count),
        cursor_data: None,
    };
    if let Err(e) = db.update_cursor(
        &task.user_id,
        &task.search_query,
        &update,
        config.cursor_ttl_days,
    ) {
        tracing::error!(error = %e, "could not update cursor");
    }

    let session_outcome = SessionOutcome {
        total_found: to_i64(outcome.stats.cards_found),
        new_results: to_i64(outcome.records.len()),
        skipped_duplicates: to_i64(outcome.stats.skipped_duplicates),
        time_taken_seconds: to_secs(elapsed_secs),
        scrolls_performed: to_i64(outcome.stats.scrolls_performed),
        sheet_url: None,
        error_message: None,
    };
    if let Err(e) = db.complete_session(&task.session_id, &session_outcome) {
        tracing::error!(error = %e, "could not complete session row");
    }
}

#[allow(clippy::cast_possible_wrap)]
fn to_i64(value: usize) -> i64 {
    value as i64
}

#[allow(clippy::cast_possible_truncation)]
fn to_secs(elapsed: f64) -> i64 {
    elapsed.round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PoolConfig;

    fn test_orchestrator() -> Orchestrator {
        let config = Arc::new(Config::from_env());
        let db = Database::open_in_memory().unwrap();
        let pool = SessionPool::new(PoolConfig::from(config.as_ref()));
        let progress = ProgressTracker::new();
        Orchestrator::new(config, db, pool, progress)
    }

    #[tokio::test]
    async fn start_scrape_reports_fresh_cursor_for_new_query() {
        let orchestrator = test_orchestrator();
        let started = orchestrator
            .start_scrape("user-1", "dentists in Amritsar", Some(25), None)
            .await
            .unwrap();

        assert_eq!(started.status, "started");
        assert_eq!(started.cursor_status, "new");
        assert_eq!(started.previously_collected, 0);
        assert_eq!(started.seen_places_count, 0);
        assert_eq!(started.target_count, 25);
        assert_eq!(started.scrape_id.len(), 12);

        // The accept path registered progress and a session row.
        assert!(orchestrator.progress.snapshot(&started.scrape_id).is_some());
        // The cursor exists, zeroed.
        let cursor = orchestrator
            .db
            .get_cursor("user-1", "dentists in Amritsar")
            .unwrap()
            .unwrap();
        assert_eq!(cursor.cards_collected, 0);
    }

    #[tokio::test]
    async fn start_scrape_resumes_when_cursor_has_cards() {
        let orchestrator = test_orchestrator();
        orchestrator
            .db
            .update_cursor(
                "user-1",
                "cafes pune",
                &CursorUpdate {
                    cards_collected: 80,
                    last_scroll_position: 4200,
                    ..CursorUpdate::default()
                },
                30,
            )
            .unwrap();
        orchestrator
            .db
            .record_places(
                "user-1",
                &["0x1".to_string(), "0x2".to_string()],
                "cafes pune",
                &HashMap::new(),
            )
            .unwrap();

        let started = orchestrator
            .start_scrape("user-1", "cafes pune", None, None)
            .await
            .unwrap();
        assert_eq!(started.cursor_status, "resuming");
        assert_eq!(started.previously_collected, 80);
        assert_eq!(started.seen_places_count, 2);
        assert_eq!(started.target_count, 50);
    }
}
