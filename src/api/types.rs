//! API request and response types

use crate::db::{CursorSummary, ScrapeCursor, ScrapeSession, UserStats};
use crate::scraper::{BusinessRecord, ScrapeStatsReport};
use serde::{Deserialize, Serialize};

/// Request to start a scrape (sync or async).
#[derive(Debug, Deserialize)]
pub struct ScrapeRequest {
    pub search_query: String,
    #[serde(default)]
    pub target_count: Option<usize>,
    #[serde(default)]
    pub max_scrolls: Option<usize>,
}

/// Response for the synchronous scrape endpoint.
#[derive(Debug, Serialize)]
pub struct ScrapeResponse {
    pub status: &'static str,
    pub query: String,
    pub total_collected: usize,
    pub unique_results: usize,
    pub target_count: usize,
    pub time_taken: f64,
    pub results: Vec<BusinessRecord>,
    pub stats: ScrapeStatsReport,
}

/// Final results of a completed async scrape.
#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub scrape_id: String,
    pub status: &'static str,
    pub count: usize,
    pub results: Vec<BusinessRecord>,
}

/// Query parameter naming a search query.
#[derive(Debug, Deserialize)]
pub struct CursorQuery {
    pub query: String,
}

/// Response listing a user's active cursors.
#[derive(Debug, Serialize)]
pub struct CursorListResponse {
    pub cursors: Vec<ScrapeCursor>,
}

/// Response for a single cursor lookup.
#[derive(Debug, Serialize)]
pub struct CursorResponse {
    pub cursor: Option<CursorSummary>,
}

/// Response for cursor deletion.
#[derive(Debug, Serialize)]
pub struct CursorClearedResponse {
    pub cleared: bool,
}

/// Response for expired-cursor cleanup.
#[derive(Debug, Serialize)]
pub struct CursorCleanupResponse {
    pub removed: usize,
}

/// Pagination for the history endpoint.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_history_limit() -> i64 {
    20
}

/// Response with the user's scrape history.
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub sessions: Vec<ScrapeSession>,
}

/// Response with the user's dashboard stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: UserStats,
}

/// Response with the user's seen-place set.
#[derive(Debug, Serialize)]
pub struct SeenPlacesResponse {
    pub count: usize,
    pub place_ids: Vec<String>,
}

/// Response for session release/reset actions.
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Liveness probe payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
    pub version: &'static str,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
