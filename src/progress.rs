//! Live progress tracking for in-flight scrapes.
//!
//! One entry per scrape id, polled over HTTP and pushed over WebSocket.
//! Status only moves forward (starting → scrolling → extracting →
//! completed/failed) and `progress_percent` never decreases until a
//! terminal transition. A reaper drops entries idle for over an hour.

use crate::scraper::BusinessRecord;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Remove entries idle longer than this.
const STALE_AFTER: Duration = Duration::from_secs(3600);

/// Reaper check interval
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Keep at most this many preview records per scrape.
const PREVIEW_LIMIT: usize = 10;

/// Scrape lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Starting,
    Scrolling,
    Extracting,
    Completed,
    Failed,
}

impl ScrapeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScrapeStatus::Completed | ScrapeStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            ScrapeStatus::Starting => 0,
            ScrapeStatus::Scrolling => 1,
            ScrapeStatus::Extracting => 2,
            ScrapeStatus::Completed | ScrapeStatus::Failed => 3,
        }
    }

    /// Transitions only move forward through the lifecycle; terminal states
    /// accept nothing.
    pub fn can_advance_to(self, next: ScrapeStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

/// Counters surfaced to the client while a scrape runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressStats {
    pub cards_found: u64,
    pub cards_extracted: u64,
    pub unique_results: u64,
    pub scrolls_done: u64,
    pub max_scrolls: u64,
    pub target_count: u64,
    pub extraction_errors: u64,
}

/// Partial update applied to a progress entry; unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub status: Option<ScrapeStatus>,
    pub progress_percent: Option<u8>,
    pub phase: Option<String>,
    pub cards_found: Option<u64>,
    pub cards_extracted: Option<u64>,
    pub unique_results: Option<u64>,
    pub scrolls_done: Option<u64>,
    pub extraction_errors: Option<u64>,
    pub sample_result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// State held per active scrape.
#[derive(Debug, Clone)]
struct ProgressData {
    scrape_id: String,
    status: ScrapeStatus,
    progress_percent: u8,
    phase: String,
    stats: ProgressStats,
    start_time: Instant,
    last_update: Instant,
    results_preview: Vec<serde_json::Value>,
    sample_result: Option<serde_json::Value>,
    final_results: Option<Vec<BusinessRecord>>,
    error_message: Option<String>,
}

/// Point-in-time view of a scrape, serialized for clients.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub scrape_id: String,
    pub status: ScrapeStatus,
    pub progress_percent: u8,
    pub phase: String,
    pub stats: SnapshotStats,
    pub preview: Vec<serde_json::Value>,
    pub sample_result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStats {
    #[serde(flatten)]
    pub counters: ProgressStats,
    pub time_elapsed: String,
    pub eta: String,
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn status_label(&self) -> &'static str {
        match self.status {
            ScrapeStatus::Starting => "starting",
            ScrapeStatus::Scrolling => "scrolling",
            ScrapeStatus::Extracting => "extracting",
            ScrapeStatus::Completed => "completed",
            ScrapeStatus::Failed => "failed",
        }
    }
}

/// Thread-safe map of all active scrapes.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    scrapes: Mutex<HashMap<String, ProgressData>>,
}

impl ProgressTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new scrape in `starting` state.
    pub fn create(&self, scrape_id: &str, target_count: u64, max_scrolls: u64) {
        let now = Instant::now();
        let data = ProgressData {
            scrape_id: scrape_id.to_string(),
            status: ScrapeStatus::Starting,
            progress_percent: 0,
            phase: "Starting scrape...".to_string(),
            stats: ProgressStats {
                target_count,
                max_scrolls,
                ..ProgressStats::default()
            },
            start_time: now,
            last_update: now,
            results_preview: Vec::new(),
            sample_result: None,
            final_results: None,
            error_message: None,
        };
        self.scrapes.lock().unwrap().insert(scrape_id.to_string(), data);
        tracing::info!(scrape_id, target_count, max_scrolls, "created progress entry");
    }

    /// Apply a partial update. Unknown scrape ids log a warning and return.
    pub fn update(&self, scrape_id: &str, update: ProgressUpdate) {
        let mut scrapes = self.scrapes.lock().unwrap();
        let Some(data) = scrapes.get_mut(scrape_id) else {
            tracing::warn!(scrape_id, "progress update for unknown scrape");
            return;
        };

        if let Some(status) = update.status {
            if data.status.can_advance_to(status) {
                data.status = status;
            } else if status != data.status {
                tracing::warn!(
                    scrape_id,
                    from = ?data.status,
                    to = ?status,
                    "rejected backward progress transition"
                );
            }
        }
        if let Some(percent) = update.progress_percent {
            data.progress_percent = data.progress_percent.max(percent.min(100));
        }
        if let Some(phase) = update.phase {
            data.phase = phase;
        }
        if let Some(v) = update.cards_found {
            data.stats.cards_found = v;
        }
        if let Some(v) = update.cards_extracted {
            data.stats.cards_extracted = v;
        }
        if let Some(v) = update.unique_results {
            data.stats.unique_results = v;
        }
        if let Some(v) = update.scrolls_done {
            data.stats.scrolls_done = v;
        }
        if let Some(v) = update.extraction_errors {
            data.stats.extraction_errors = v;
        }
        if let Some(sample) = update.sample_result {
            if sample.get("name").is_some() && data.results_preview.len() < PREVIEW_LIMIT {
                data.results_preview.push(sample.clone());
            }
            data.sample_result = Some(sample);
        }
        if let Some(error) = update.error_message {
            data.error_message = Some(error);
        }
        data.last_update = Instant::now();
    }

    /// Terminal transition with final results attached.
    pub fn complete(&self, scrape_id: &str, results: Vec<BusinessRecord>, success: bool) {
        let mut scrapes = self.scrapes.lock().unwrap();
        let Some(data) = scrapes.get_mut(scrape_id) else {
            return;
        };
        if data.status.is_terminal() {
            return;
        }
        data.status = if success {
            ScrapeStatus::Completed
        } else {
            ScrapeStatus::Failed
        };
        if success {
            data.progress_percent = 100;
            data.phase = format!("Complete! {} results", results.len());
        } else {
            data.phase = "Failed".to_string();
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            data.stats.unique_results = results.len() as u64;
        }
        data.final_results = Some(results);
        data.last_update = Instant::now();
        tracing::info!(scrape_id, status = ?data.status, "scrape finished");
    }

    /// Terminal failure. The last percent is preserved for display.
    pub fn fail(&self, scrape_id: &str, error: &str) {
        let mut scrapes = self.scrapes.lock().unwrap();
        let Some(data) = scrapes.get_mut(scrape_id) else {
            return;
        };
        if data.status.is_terminal() {
            return;
        }
        data.status = ScrapeStatus::Failed;
        let short: String = error.chars().take(50).collect();
        data.phase = format!("Error: {short}");
        data.error_message = Some(error.to_string());
        data.last_update = Instant::now();
        tracing::error!(scrape_id, error, "scrape failed");
    }

    /// Live snapshot with computed elapsed time and ETA.
    pub fn snapshot(&self, scrape_id: &str) -> Option<ProgressSnapshot> {
        let scrapes = self.scrapes.lock().unwrap();
        let data = scrapes.get(scrape_id)?;
        let elapsed = data.start_time.elapsed();

        Some(ProgressSnapshot {
            scrape_id: data.scrape_id.clone(),
            status: data.status,
            progress_percent: data.progress_percent.min(100),
            phase: data.phase.clone(),
            stats: SnapshotStats {
                counters: data.stats.clone(),
                time_elapsed: format_duration(elapsed),
                eta: estimate_remaining(elapsed, data.progress_percent),
            },
            preview: data.results_preview.iter().take(5).cloned().collect(),
            sample_result: data.sample_result.clone(),
            error_message: data.error_message.clone(),
        })
    }

    /// Final record set for a completed scrape, if available.
    pub fn final_results(&self, scrape_id: &str) -> Option<Vec<BusinessRecord>> {
        let scrapes = self.scrapes.lock().unwrap();
        scrapes.get(scrape_id).and_then(|d| d.final_results.clone())
    }

    /// Drop entries idle longer than `max_age`. Returns how many were removed.
    pub fn reap_stale(&self, max_age: Duration) -> usize {
        let mut scrapes = self.scrapes.lock().unwrap();
        let now = Instant::now();
        let stale: Vec<String> = scrapes
            .iter()
            .filter(|(_, d)| now.duration_since(d.last_update) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            scrapes.remove(id);
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "reaped stale progress entries");
        }
        stale.len()
    }

    /// Start the background reaper. Exits once the tracker is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REAP_INTERVAL).await;
                if let Some(tracker) = weak.upgrade() {
                    tracker.reap_stale(STALE_AFTER);
                } else {
                    break;
                }
            }
        });
    }
}

fn format_duration(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    if total < 60 {
        return format!("{total}s");
    }
    format!("{}m {}s", total / 60, total % 60)
}

/// ETA from linear extrapolation of progress so far.
fn estimate_remaining(elapsed: Duration, percent: u8) -> String {
    if percent == 0 {
        return "Calculating...".to_string();
    }
    if percent >= 100 {
        return "Complete!".to_string();
    }
    let remaining = elapsed.as_secs_f64() * f64::from(100 - percent) / f64::from(percent);
    if remaining < 0.0 {
        return "Almost done...".to_string();
    }
    format_duration(Duration::from_secs_f64(remaining))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(scrape_id: &str) -> Arc<ProgressTracker> {
        let tracker = ProgressTracker::new();
        tracker.create(scrape_id, 50, 20);
        tracker
    }

    #[test]
    fn percent_is_monotonic_until_terminal() {
        let tracker = tracker_with("s1");
        let sequence = [5u8, 15, 12, 30, 22, 95, 40];
        let mut last = 0u8;
        for percent in sequence {
            tracker.update(
                "s1",
                ProgressUpdate {
                    progress_percent: Some(percent),
                    ..ProgressUpdate::default()
                },
            );
            let snap = tracker.snapshot("s1").unwrap();
            assert!(snap.progress_percent >= last);
            last = snap.progress_percent;
        }
        assert_eq!(last, 95);
    }

    #[test]
    fn status_never_moves_backward() {
        let tracker = tracker_with("s1");
        tracker.update(
            "s1",
            ProgressUpdate { status: Some(ScrapeStatus::Extracting), ..ProgressUpdate::default() },
        );
        tracker.update(
            "s1",
            ProgressUpdate { status: Some(ScrapeStatus::Scrolling), ..ProgressUpdate::default() },
        );
        let snap = tracker.snapshot("s1").unwrap();
        assert_eq!(snap.status, ScrapeStatus::Extracting);
    }

    #[test]
    fn complete_pins_percent_and_stores_results() {
        let tracker = tracker_with("s1");
        tracker.update(
            "s1",
            ProgressUpdate { progress_percent: Some(60), ..ProgressUpdate::default() },
        );
        tracker.complete("s1", Vec::new(), true);

        let snap = tracker.snapshot("s1").unwrap();
        assert_eq!(snap.status, ScrapeStatus::Completed);
        assert_eq!(snap.progress_percent, 100);
        assert!(snap.is_terminal());
        assert!(tracker.final_results("s1").is_some());

        // Terminal entries reject further movement.
        tracker.update(
            "s1",
            ProgressUpdate { status: Some(ScrapeStatus::Scrolling), ..ProgressUpdate::default() },
        );
        assert_eq!(tracker.snapshot("s1").unwrap().status, ScrapeStatus::Completed);
    }

    #[test]
    fn fail_preserves_last_percent_and_truncates_phase() {
        let tracker = tracker_with("s1");
        tracker.update(
            "s1",
            ProgressUpdate { progress_percent: Some(42), ..ProgressUpdate::default() },
        );
        let long_error = "x".repeat(120);
        tracker.fail("s1", &long_error);

        let snap = tracker.snapshot("s1").unwrap();
        assert_eq!(snap.status, ScrapeStatus::Failed);
        assert_eq!(snap.progress_percent, 42);
        assert!(snap.phase.chars().count() <= "Error: ".len() + 50);
        assert_eq!(snap.error_message.unwrap().len(), 120);
    }

    #[test]
    fn unknown_scrape_update_is_ignored() {
        let tracker = ProgressTracker::new();
        tracker.update(
            "missing",
            ProgressUpdate { progress_percent: Some(10), ..ProgressUpdate::default() },
        );
        assert!(tracker.snapshot("missing").is_none());
    }

    #[test]
    fn eta_strings_cover_the_percent_range() {
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0), "Calculating...");
        assert_eq!(estimate_remaining(Duration::from_secs(10), 100), "Complete!");
        assert_eq!(estimate_remaining(Duration::from_secs(30), 50), "30s");
        assert_eq!(estimate_remaining(Duration::from_secs(120), 25), "6m 0s");
    }

    #[test]
    fn sample_results_accumulate_into_preview() {
        let tracker = tracker_with("s1");
        for i in 0..15 {
            tracker.update(
                "s1",
                ProgressUpdate {
                    sample_result: Some(serde_json::json!({"name": format!("Biz {i}")})),
                    ..ProgressUpdate::default()
                },
            );
        }
        let snap = tracker.snapshot("s1").unwrap();
        assert_eq!(snap.preview.len(), 5);
        assert!(snap.sample_result.is_some());
    }

    #[test]
    fn reaper_removes_only_stale_entries() {
        let tracker = tracker_with("s1");
        assert_eq!(tracker.reap_stale(Duration::from_secs(3600)), 0);
        assert_eq!(tracker.reap_stale(Duration::from_secs(0)), 1);
        assert!(tracker.snapshot("s1").is_none());
    }
}
