//! The scraping pipeline: navigate, scroll, collect, extract.
//!
//! One scrape drives the user's pooled browser page through the map search
//! UI: scroll the results feed collecting card links (skipping place IDs the
//! user already has), then extract details from each collected card in
//! parallel through short-lived worker contexts. A resume cursor restores
//! the previous scroll position so repeat scrapes skip ground already
//! covered.

pub mod collect;
mod extract;
pub mod selectors;

use crate::config::Config;
use crate::db::ScrapeCursor;
use crate::dedup::{DedupService, DedupStats, Identity};
use crate::progress::{ProgressTracker, ProgressUpdate, ScrapeStatus};
use crate::session::{PoolError, SessionPool};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use collect::{AnchorInfo, CollectPlan, CollectTally, StopReason, SCROLL_STEP};
use extract::{random_delay, wait_for};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Placeholder strings the UI renders while loading; a "name" matching any
/// of these means extraction failed.
const INVALID_NAMES: &[&str] = &[
    "none",
    "null",
    "undefined",
    "unknown",
    "results",
    "result",
    "search results",
    "google maps",
    "map",
    "maps",
    "loading",
    "loading...",
    "error",
    "n/a",
    "na",
];

/// True when result-card anchors are present in the DOM.
const RESULT_ANCHOR_READY_JS: &str =
    r#"document.querySelector('a[href*="/maps/place/"]') !== null"#;

/// Enumerate visible result-card anchors with their accessible names.
const COLLECT_ANCHORS_JS: &str = r#"
(() => Array.from(document.querySelectorAll('a[href*="/maps/place/"]')).map(a => ({
    href: a.getAttribute('href') || '',
    label: a.getAttribute('aria-label'),
})))()
"#;

/// Current scroll offset of the results feed, in pixels.
const FEED_POSITION_JS: &str = r#"
(() => {
    const el = document.querySelector('div[role="feed"]');
    return el ? Math.round(el.scrollTop) : 0;
})()
"#;

/// Scroll the results feed by one step; falls back to the window.
const SCROLL_FEED_JS_TEMPLATE: &str = r#"
(() => {
    const el = document.querySelector('div[role="feed"]');
    if (el) { el.scrollBy(0, __STEP__); return true; }
    window.scrollBy(0, __STEP__);
    return false;
})()
"#;

/// Click the consent prompt's accept button if one is showing.
const CONSENT_JS: &str = r#"
(() => {
    const btn = Array.from(document.querySelectorAll('button'))
        .find(b => (b.textContent || '').trim() === 'Accept all');
    if (btn) { btn.click(); return true; }
    return false;
})()
"#;

/// How long to wait for the first result anchors after navigation.
const RESULTS_APPEAR_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Browser operation failed: {0}")]
    Cdp(#[from] CdpError),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Search results never appeared")]
    NoResults,
}

/// A structured business record extracted from the detail panel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub reviews_count: Option<i64>,
    pub category: Option<String>,
    pub hours: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_claimed: bool,
    pub photo_url: Option<String>,
    pub place_id: String,
    pub cid: Option<String>,
    pub href: String,
}

/// A business name is only trusted when it is non-trivial and not one of
/// the UI's placeholder strings.
pub fn is_valid_business_name(name: &str) -> bool {
    let cleaned = name.trim().to_lowercase();
    cleaned.chars().count() >= 2 && !INVALID_NAMES.contains(&cleaned.as_str())
}

/// Caller-supplied knobs for one scrape.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOptions {
    pub target_count: usize,
    pub max_scrolls: Option<usize>,
    /// Place IDs to treat as duplicates before extraction.
    pub seen_places: HashSet<String>,
    /// Resume point from a previous scrape of this query.
    pub cursor: Option<ResumePoint>,
}

/// The slice of a persisted cursor the pipeline consumes.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub last_scroll_position: i64,
    pub cards_collected: i64,
    pub last_place_id: Option<String>,
    pub last_card_index: Option<i64>,
}

impl From<&ScrapeCursor> for ResumePoint {
    fn from(cursor: &ScrapeCursor) -> Self {
        Self {
            last_scroll_position: cursor.last_scroll_position,
            cards_collected: cursor.cards_collected,
            last_place_id: cursor.last_place_id.clone(),
            last_card_index: cursor.last_card_index,
        }
    }
}

/// Counters reported alongside results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeStatsReport {
    pub cards_found: usize,
    pub cards_extracted: usize,
    pub extraction_errors: u64,
    pub scrolls_performed: usize,
    pub stale_scrolls: usize,
    pub skipped_duplicates: usize,
    pub dedup: DedupStats,
}

/// Terminal pipeline state persisted by the cursor manager.
#[derive(Debug, Clone, Default)]
pub struct CursorEmission {
    pub last_scroll_position: i64,
    /// Seen-and-skipped plus newly collected cards this run.
    pub cards_collected: i64,
    pub last_place_id: Option<String>,
    pub last_card_index: Option<i64>,
    pub scrolls_performed: i64,
    pub visible_card_count: i64,
}

/// Everything a finished scrape hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct ScrapeOutcome {
    pub records: Vec<BusinessRecord>,
    pub stats: ScrapeStatsReport,
    pub cursor: CursorEmission,
}

/// Progress sink handed through the pipeline. The disabled variant turns
/// every update into a no-op so the synchronous endpoint can share the code
/// path.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    target: Option<(Arc<ProgressTracker>, String)>,
}

impl ProgressReporter {
    pub fn new(tracker: Arc<ProgressTracker>, scrape_id: String) -> Self {
        Self { target: Some((tracker, scrape_id)) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn update(&self, update: ProgressUpdate) {
        if let Some((tracker, scrape_id)) = &self.target {
            tracker.update(scrape_id, update);
        }
    }

    pub fn fail(&self, error: &str) {
        if let Some((tracker, scrape_id)) = &self.target {
            tracker.fail(scrape_id, error);
        }
    }
}

/// The scraping engine. Stateless between scrapes; collaborators are passed
/// in, never global.
pub struct Scraper {
    config: Arc<Config>,
    pool: Arc<SessionPool>,
}

impl Scraper {
    pub fn new(config: Arc<Config>, pool: Arc<SessionPool>) -> Self {
        Self { config, pool }
    }

    /// Run one full scrape for a user. Top-level failures mark progress
    /// failed and propagate; per-card failures are absorbed en route.
    pub async fn scrape(
        &self,
        user_id: &str,
        search_query: &str,
        options: ScrapeOptions,
        progress: &ProgressReporter,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        match self.run(user_id, search_query, options, progress).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                progress.fail(&e.to_string());
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        user_id: &str,
        search_query: &str,
        options: ScrapeOptions,
        progress: &ProgressReporter,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        let target_count = if options.target_count == 0 {
            self.config.default_target_count
        } else {
            options.target_count
        };
        let plan = CollectPlan::new(
            target_count,
            options.max_scrolls,
            !options.seen_places.is_empty(),
            self.config.stale_scroll_limit,
        );
        tracing::info!(
            user_id,
            query = search_query,
            target_count,
            collection_target = plan.collection_target,
            max_scrolls = plan.max_scrolls,
            seen = options.seen_places.len(),
            resuming = options.cursor.is_some(),
            "starting scrape"
        );

        progress.update(ProgressUpdate {
            status: Some(ScrapeStatus::Scrolling),
            progress_percent: Some(5),
            phase: Some("Initializing scrape...".to_string()),
            ..ProgressUpdate::default()
        });

        let page = self.pool.acquire(user_id).await?;
        let search_url = search_url_for(&self.config.maps_search_url, search_query);

        progress.update(ProgressUpdate {
            progress_percent: Some(8),
            phase: Some("Opening map search...".to_string()),
            ..ProgressUpdate::default()
        });

        tokio::time::timeout(self.config.browser_timeout, page.goto(search_url.as_str()))
            .await
            .map_err(|_| ScrapeError::Timeout("navigation"))??;
        random_delay(2.0, 4.0).await;
        dismiss_consent(&page).await;

        progress.update(ProgressUpdate {
            progress_percent: Some(12),
            phase: Some("Searching for businesses...".to_string()),
            ..ProgressUpdate::default()
        });

        wait_for(&page, RESULT_ANCHOR_READY_JS, RESULTS_APPEAR_WAIT)
            .await
            .map_err(|_| ScrapeError::NoResults)?;

        if let Some(cursor) = &options.cursor {
            self.resume_from_cursor(&page, cursor).await;
        }

        progress.update(ProgressUpdate {
            progress_percent: Some(15),
            phase: Some("Scrolling to find businesses...".to_string()),
            ..ProgressUpdate::default()
        });

        let tally = self
            .collect_card_links(&page, &plan, &options.seen_places, progress)
            .await;
        tracing::info!(
            collected = tally.collected(),
            skipped = tally.skipped_duplicates(),
            scrolls = tally.scrolls_performed(),
            "card collection finished"
        );

        let scroll_position = feed_position(&page).await;
        let cursor_emission = CursorEmission {
            last_scroll_position: scroll_position,
            cards_collected: to_i64(tally.collected() + tally.skipped_duplicates()),
            last_place_id: tally.last_place_id().map(String::from),
            last_card_index: tally.last_card_index().map(to_i64),
            scrolls_performed: to_i64(tally.scrolls_performed()),
            visible_card_count: to_i64(tally.last_visible_count()),
        };

        let skipped_duplicates = tally.skipped_duplicates();
        let scrolls_performed = tally.scrolls_performed();
        let stale_scrolls = tally.stale_scrolls();
        let cards = tally.into_links();
        let cards_found = cards.len();

        extract::report_extraction_start(progress, cards.len());
        let (extracted, extraction_errors) =
            extract::extract_cards(&self.config, &self.pool, &search_url, cards, progress).await;

        progress.update(ProgressUpdate {
            progress_percent: Some(95),
            phase: Some("Processing and deduplicating results...".to_string()),
            ..ProgressUpdate::default()
        });

        // Final dedup pass in completion order, then trim to the ask.
        let mut dedup = DedupService::new();
        let mut records = Vec::new();
        let mut skipped_no_name = 0usize;
        for record in extracted.into_iter().flatten() {
            if !is_valid_business_name(&record.name) {
                skipped_no_name += 1;
                tracing::warn!(place_id = %record.place_id, name = %record.name, "discarding record without valid name");
                continue;
            }
            let unique = dedup.admit(Identity {
                place_id: Some(&record.place_id),
                cid: record.cid.as_deref(),
                href: Some(&record.href),
                name: Some(&record.name),
                address: record.address.as_deref(),
            });
            if unique {
                records.push(record);
            }
        }
        if skipped_no_name > 0 {
            tracing::warn!(skipped_no_name, "records discarded for invalid names");
        }

        let cards_extracted = records.len();
        records.truncate(target_count);

        let stats = ScrapeStatsReport {
            cards_found: cards_found + skipped_duplicates,
            cards_extracted,
            extraction_errors,
            scrolls_performed,
            stale_scrolls,
            skipped_duplicates,
            dedup: dedup.stats(),
        };
        tracing::info!(
            results = records.len(),
            cards_extracted = stats.cards_extracted,
            errors = stats.extraction_errors,
            "scrape complete"
        );

        Ok(ScrapeOutcome { records, stats, cursor: cursor_emission })
    }

    /// Restore the feed scroll position saved by the previous scrape, and
    /// verify the anchor we expected is actually visible there. Pixel
    /// offsets go stale when the UI changes; on mismatch start fresh.
    async fn resume_from_cursor(&self, page: &Page, cursor: &ResumePoint) {
        if cursor.last_scroll_position <= 0 {
            return;
        }
        let position = cursor.last_scroll_position;
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('div[role="feed"]');
                if (el) {{ el.scrollTo(0, {position}); return true; }}
                return false;
            }})()"#
        );
        if page.evaluate(script).await.is_err() {
            return;
        }
        random_delay(1.0, 2.0).await;

        if let Some(expected) = cursor.last_place_id.as_deref() {
            let probe = format!(r#"document.querySelector('a[href*="{expected}"]') !== null"#);
            let verified = match page.evaluate(probe).await {
                Ok(result) => result.into_value::<bool>().unwrap_or(false),
                Err(_) => false,
            };
            if !verified {
                tracing::info!(
                    expected,
                    position,
                    "cursor anchor not found at resumed position, starting fresh"
                );
                let _ = page
                    .evaluate(
                        r#"(() => { const el = document.querySelector('div[role="feed"]'); if (el) el.scrollTo(0, 0); })()"#,
                    )
                    .await;
                return;
            }
        }
        tracing::info!(position, "resumed from cursor scroll position");
    }

    /// Scroll/collect loop. Browser errors during a pass degrade to an empty
    /// anchor list, which the stale counter converts into termination.
    async fn collect_card_links(
        &self,
        page: &Page,
        plan: &CollectPlan,
        seen_places: &HashSet<String>,
        progress: &ProgressReporter,
    ) -> CollectTally {
        let mut tally = CollectTally::default();
        let scroll_script =
            SCROLL_FEED_JS_TEMPLATE.replace("__STEP__", &SCROLL_STEP.to_string());

        loop {
            let anchors = visible_anchors(page).await;
            let new_cards = tally.observe_scroll_pass(&anchors, seen_places, plan);

            if let Some(reason) = tally.should_stop(plan) {
                log_stop(reason, &tally, plan);
                if reason == StopReason::DominatedBySeen {
                    progress.update(ProgressUpdate {
                        phase: Some(format!(
                            "Stopped early - {} new businesses found",
                            tally.collected()
                        )),
                        cards_found: Some(to_u64(tally.collected())),
                        ..ProgressUpdate::default()
                    });
                }
                break;
            }

            tracing::debug!(
                scroll = tally.scrolls_performed(),
                max = plan.max_scrolls,
                new_cards,
                total = tally.collected(),
                "scroll pass"
            );

            // Scrolling owns the 15–30% band of overall progress.
            let percent = 15 + (tally.scrolls_performed() * 15 / plan.max_scrolls.max(1)).min(15);
            progress.update(ProgressUpdate {
                progress_percent: Some(to_u8(percent)),
                phase: Some(format!(
                    "Scrolling... Found {} new, skipped {} duplicates",
                    tally.collected(),
                    tally.skipped_duplicates()
                )),
                cards_found: Some(to_u64(tally.collected())),
                scrolls_done: Some(to_u64(tally.scrolls_performed())),
                ..ProgressUpdate::default()
            });

            let _ = page.evaluate(scroll_script.clone()).await;
            random_delay(self.config.scroll_delay_min, self.config.scroll_delay_max).await;
        }
        tally
    }
}

fn log_stop(reason: StopReason, tally: &CollectTally, plan: &CollectPlan) {
    match reason {
        StopReason::TargetReached => {
            tracing::info!(target = plan.collection_target, "reached collection target");
        }
        StopReason::DominatedBySeen => {
            tracing::info!(
                skipped = tally.skipped_duplicates(),
                new = tally.collected(),
                "early exit: feed dominated by already-seen businesses"
            );
        }
        StopReason::StaleScrolls => {
            tracing::info!(stale = plan.stale_scroll_limit, "stopping: stale scrolls in a row");
        }
        StopReason::MaxScrolls => {
            tracing::info!(max_scrolls = plan.max_scrolls, "stopping: scroll limit reached");
        }
    }
}

/// Build the search URL for a query.
pub fn search_url_for(base: &str, search_query: &str) -> String {
    format!("{base}{}", search_query.trim().replace(' ', "+"))
}

async fn visible_anchors(page: &Page) -> Vec<AnchorInfo> {
    match page.evaluate(COLLECT_ANCHORS_JS).await {
        Ok(result) => result.into_value::<Vec<AnchorInfo>>().unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "error enumerating result cards");
            Vec::new()
        }
    }
}

async fn feed_position(page: &Page) -> i64 {
    match page.evaluate(FEED_POSITION_JS).await {
        Ok(result) => result.into_value::<i64>().unwrap_or(0),
        Err(_) => 0,
    }
}

/// Dismiss the consent prompt when it appears; absence is the common case.
async fn dismiss_consent(page: &Page) {
    match page.evaluate(CONSENT_JS).await {
        Ok(result) => {
            if result.into_value::<bool>().unwrap_or(false) {
                tracing::info!("accepted consent prompt");
                random_delay(1.0, 2.0).await;
            }
        }
        Err(e) => tracing::debug!(error = %e, "consent check failed"),
    }
}

#[allow(clippy::cast_possible_wrap)]
fn to_i64(value: usize) -> i64 {
    value as i64
}

#[allow(clippy::cast_possible_truncation)]
fn to_u64(value: usize) -> u64 {
    value as u64
}

#[allow(clippy::cast_possible_truncation)]
fn to_u8(value: usize) -> u8 {
    value.min(u8::MAX as usize) as u8
}
