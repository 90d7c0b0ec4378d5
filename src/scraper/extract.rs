//! Click-based detail extraction for collected cards.
//!
//! The detail sidebar only populates through the in-page request the card's
//! click event triggers: extraction therefore reloads the *search* page in a
//! fresh context, locates the anchor for the target place ID, and clicks it.
//! Direct navigation to the place URL yields a skeletal page and is kept
//! only as a fallback, paired with a synthetic `popstate` event.
//!
//! Per-card failures are counted and swallowed — one broken card never
//! aborts a scrape.

use super::collect::CardLink;
use super::selectors::{
    self, ADDRESS_CHAIN, CATEGORY_CHAIN, CLAIMED_SELECTOR, HOURS_CHAIN, NAME_CHAIN, PHONE_CHAIN,
    PHOTO_CHAIN, RATING_CHAIN, REVIEWS_CHAIN, WEBSITE_CHAIN,
};
use super::{is_valid_business_name, BusinessRecord, ProgressReporter, ScrapeError};
use crate::config::Config;
use crate::dedup;
use crate::progress::{ProgressUpdate, ScrapeStatus};
use crate::session::SessionPool;
use chromiumoxide::Page;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Synthetic history event; the page listens for it to hydrate the sidebar
/// when a real click could not be delivered.
const POPSTATE_JS: &str = r"
    window.history.pushState({}, '', window.location.href);
    window.dispatchEvent(new Event('popstate'));
";

/// Poll until the detail panel's heading carries text.
const DETAIL_READY_JS: &str =
    r"(document.querySelector('h1')?.textContent?.trim()?.length ?? 0) > 0";

/// Upper bound on waiting for the detail panel to hydrate.
const DETAIL_WAIT: Duration = Duration::from_secs(8);

/// Upper bound on waiting for search results to render in a worker context.
const RESULTS_WAIT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counters shared across extraction workers.
#[derive(Debug, Default)]
pub struct ExtractCounters {
    pub extracted: AtomicU64,
    pub errors: AtomicU64,
}

/// Extract details for every collected card, at most
/// `config.max_concurrent_cards` in flight. Results come back in card order;
/// failed cards yield `None`.
pub async fn extract_cards(
    config: &Arc<Config>,
    pool: &Arc<SessionPool>,
    search_url: &str,
    cards: Vec<CardLink>,
    progress: &ProgressReporter,
) -> (Vec<Option<BusinessRecord>>, u64) {
    let total = cards.len();
    let counters = Arc::new(ExtractCounters::default());
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_cards.max(1)));

    let mut handles = Vec::with_capacity(total);
    for card in cards {
        let config = Arc::clone(config);
        let pool = Arc::clone(pool);
        let counters = Arc::clone(&counters);
        let semaphore = Arc::clone(&semaphore);
        let progress = progress.clone();
        let search_url = search_url.to_string();

        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return None;
            };
            match extract_one(&config, &pool, &search_url, &card).await {
                Ok(record) => {
                    let done = counters.extracted.fetch_add(1, Ordering::Relaxed) + 1;
                    report_extraction_progress(&progress, &record, done, total, &counters);
                    Some(record)
                }
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(place_id = %card.place_id, error = %e, "card extraction failed");
                    None
                }
            }
        }));
    }

    let mut results = Vec::with_capacity(total);
    for handle in handles {
        results.push(handle.await.unwrap_or(None));
    }

    let errors = counters.errors.load(Ordering::Relaxed);
    (results, errors)
}

#[allow(clippy::cast_possible_truncation)]
fn report_extraction_progress(
    progress: &ProgressReporter,
    record: &BusinessRecord,
    done: u64,
    total: usize,
    counters: &ExtractCounters,
) {
    // Extraction owns the 30–95% band of overall progress.
    let percent = if total == 0 {
        95
    } else {
        30 + (done as usize * 65 / total).min(65) as u8
    };
    let sample = is_valid_business_name(&record.name)
        .then(|| serde_json::to_value(record).ok())
        .flatten();
    progress.update(ProgressUpdate {
        progress_percent: Some(percent),
        phase: Some(format!("Extracting... {done}/{total} complete")),
        cards_extracted: Some(done),
        extraction_errors: Some(counters.errors.load(Ordering::Relaxed)),
        sample_result: sample,
        ..ProgressUpdate::default()
    });
}

/// Run one card through a fresh worker context. The context is disposed on
/// every path.
async fn extract_one(
    config: &Config,
    pool: &Arc<SessionPool>,
    search_url: &str,
    card: &CardLink,
) -> Result<BusinessRecord, ScrapeError> {
    let worker = pool.worker_page().await?;
    let result = drive_card(config, &worker.page, search_url, card).await;
    pool.dispose_worker(worker).await;
    result
}

async fn drive_card(
    config: &Config,
    page: &Page,
    search_url: &str,
    card: &CardLink,
) -> Result<BusinessRecord, ScrapeError> {
    // Originate on the search page; the click from there is what loads data.
    tokio::time::timeout(config.browser_timeout, page.goto(search_url))
        .await
        .map_err(|_| ScrapeError::Timeout("worker navigation"))??;

    wait_for(page, super::RESULT_ANCHOR_READY_JS, RESULTS_WAIT)
        .await
        .map_err(|_| ScrapeError::Timeout("worker search results"))?;
    random_delay(1.0, 2.0).await;
    super::dismiss_consent(page).await;

    if !click_card_anchor(page, &card.place_id).await {
        // Fallback: direct navigation plus a synthetic popstate to coax the
        // sidebar into hydrating anyway.
        tracing::debug!(place_id = %card.place_id, "card click failed, navigating directly");
        let full_url = absolutize(&card.href);
        tokio::time::timeout(config.browser_timeout, page.goto(full_url.as_str()))
            .await
            .map_err(|_| ScrapeError::Timeout("card navigation"))??;
        let _ = page.evaluate(POPSTATE_JS).await;
    }

    // The sidebar fills in after the click; an empty heading past the wait
    // window is survivable (the aria-label fallback may still name it).
    if wait_for(page, DETAIL_READY_JS, DETAIL_WAIT).await.is_err() {
        tracing::debug!(place_id = %card.place_id, "timed out waiting for detail heading");
    }
    random_delay(config.card_extract_delay_min, config.card_extract_delay_max).await;

    let mut record = extract_business_info(page).await;
    record.place_id.clone_from(&card.place_id);
    record.href.clone_from(&card.href);
    if record.cid.is_none() {
        record.cid = dedup::extract_cid_from_url(&card.href);
    }

    // The card's aria-label is the name of last resort.
    if !is_valid_business_name(&record.name) {
        if let Some(card_name) = card.card_name.as_deref() {
            if is_valid_business_name(card_name) {
                record.name = card_name.to_string();
            }
        }
    }

    tracing::debug!(
        name = %record.name,
        rating = ?record.rating,
        reviews = ?record.reviews_count,
        "extracted card"
    );
    Ok(record)
}

/// Click the search-result anchor for a place ID, trying an exact href match
/// then a prefix match. Returns false when no anchor could be clicked.
async fn click_card_anchor(page: &Page, place_id: &str) -> bool {
    let id_prefix: String = place_id.chars().take(20).collect();
    let candidates = [
        format!(r#"a[href*="{place_id}"]"#),
        format!(r#"a[href*="/maps/place/"][href*="{id_prefix}"]"#),
    ];

    for selector in &candidates {
        let Ok(element) = page.find_element(selector.as_str()).await else {
            continue;
        };
        random_delay(0.3, 0.6).await;
        match element.click().await {
            Ok(_) => {
                tracing::debug!(place_id, "clicked card anchor");
                return true;
            }
            Err(e) => {
                tracing::debug!(place_id, selector = selector.as_str(), error = %e, "click attempt failed");
            }
        }
    }
    false
}

/// Read every field off the populated detail panel. Individual field misses
/// leave the field empty; this never fails.
async fn extract_business_info(page: &Page) -> BusinessRecord {
    let mut record = BusinessRecord::default();

    if let Some(name) = selectors::resolve_chain(page, &NAME_CHAIN).await {
        record.name = name;
    } else if let Some(title) = page_title(page).await {
        // Last resort: the document title carries "<name> - Google Maps".
        if let Some(stripped) = title.strip_suffix(" - Google Maps") {
            record.name = stripped.trim().to_string();
        }
    }

    record.rating = selectors::resolve_chain(page, &RATING_CHAIN)
        .await
        .as_deref()
        .and_then(selectors::parse_rating);
    record.reviews_count = selectors::resolve_chain(page, &REVIEWS_CHAIN)
        .await
        .as_deref()
        .and_then(selectors::parse_review_count);
    record.category = selectors::resolve_chain(page, &CATEGORY_CHAIN).await;
    record.address = selectors::resolve_chain(page, &ADDRESS_CHAIN)
        .await
        .map(|v| selectors::strip_label_prefix(&v, "Address:").to_string());
    record.phone = selectors::resolve_chain(page, &PHONE_CHAIN)
        .await
        .map(|v| selectors::strip_label_prefix(&v, "Phone:").to_string());
    record.website = selectors::resolve_chain(page, &WEBSITE_CHAIN).await;
    record.hours = selectors::resolve_chain(page, &HOURS_CHAIN).await;
    record.photo_url = selectors::resolve_chain(page, &PHOTO_CHAIN).await;
    record.is_claimed = page.find_element(CLAIMED_SELECTOR).await.is_ok();

    // Coordinates ride in the URL once the detail view is active.
    if let Ok(Some(url)) = page.url().await {
        if let Some((lat, lng)) = selectors::parse_coordinates(&url) {
            record.latitude = Some(lat);
            record.longitude = Some(lng);
        }
    }

    record
}

async fn page_title(page: &Page) -> Option<String> {
    let result = page.evaluate("document.title").await.ok()?;
    result.into_value::<String>().ok().filter(|t| !t.is_empty())
}

/// Poll a boolean expression until it is true or the wait elapses.
pub(super) async fn wait_for(
    page: &Page,
    expression: &str,
    wait: Duration,
) -> Result<(), ScrapeError> {
    let start = Instant::now();
    loop {
        if let Ok(result) = page.evaluate(expression).await {
            if result.into_value::<bool>().unwrap_or(false) {
                return Ok(());
            }
        }
        if start.elapsed() >= wait {
            return Err(ScrapeError::Timeout("condition"));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Sleep a uniformly random duration between the two bounds (seconds).
pub(super) async fn random_delay(min_secs: f64, max_secs: f64) {
    let (lo, hi) = if min_secs <= max_secs {
        (min_secs, max_secs)
    } else {
        (max_secs, min_secs)
    };
    let secs = rand::thread_rng().gen_range(lo..=hi);
    tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
}

fn absolutize(href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("https://www.google.com{href}")
    }
}

/// Mark the start of the extraction phase on the progress feed.
pub fn report_extraction_start(progress: &ProgressReporter, total: usize) {
    progress.update(ProgressUpdate {
        status: Some(ScrapeStatus::Extracting),
        progress_percent: Some(30),
        phase: Some(format!("Extracting details from {total} businesses...")),
        cards_found: Some(total as u64),
        ..ProgressUpdate::default()
    });
}
