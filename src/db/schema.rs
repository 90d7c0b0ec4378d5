//! Database schema and persistent row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS user_places (
    user_id TEXT NOT NULL,
    place_id TEXT NOT NULL,
    cid TEXT,
    query_hash TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    scraped_count INTEGER NOT NULL DEFAULT 1,

    PRIMARY KEY (user_id, place_id)
);

CREATE INDEX IF NOT EXISTS idx_user_places_query ON user_places(user_id, query_hash);

CREATE TABLE IF NOT EXISTS scrape_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    query TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    total_found INTEGER NOT NULL DEFAULT 0,
    new_results INTEGER NOT NULL DEFAULT 0,
    skipped_duplicates INTEGER NOT NULL DEFAULT 0,
    sheet_id TEXT,
    sheet_url TEXT,
    time_taken_seconds INTEGER NOT NULL DEFAULT 0,
    scrolls_performed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_scrape_sessions_user ON scrape_sessions(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS scrape_session_cursors (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    query_original TEXT NOT NULL,
    query_normalized TEXT NOT NULL,
    last_scroll_position INTEGER NOT NULL DEFAULT 0,
    cards_collected INTEGER NOT NULL DEFAULT 0,
    last_place_id TEXT,
    last_card_index INTEGER,
    total_scrolls_performed INTEGER NOT NULL DEFAULT 0,
    last_visible_card_count INTEGER NOT NULL DEFAULT 0,
    cursor_data TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    expires_at TEXT NOT NULL,

    UNIQUE (user_id, query_hash)
);

CREATE INDEX IF NOT EXISTS idx_cursors_expires ON scrape_session_cursors(expires_at);
CREATE INDEX IF NOT EXISTS idx_cursors_user_accessed ON scrape_session_cursors(user_id, last_accessed DESC);
";

/// Scrape session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

pub(crate) fn parse_session_status(s: &str) -> SessionStatus {
    match s {
        "running" => SessionStatus::Running,
        "completed" => SessionStatus::Completed,
        "failed" => SessionStatus::Failed,
        _ => SessionStatus::Pending,
    }
}

/// One scrape attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub id: String,
    pub user_id: String,
    pub query: String,
    pub query_hash: String,
    pub total_found: i64,
    pub new_results: i64,
    pub skipped_duplicates: i64,
    pub sheet_id: Option<String>,
    pub sheet_url: Option<String>,
    pub time_taken_seconds: i64,
    pub scrolls_performed: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub error_message: Option<String>,
}

/// Final numbers written when a scrape session closes.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub total_found: i64,
    pub new_results: i64,
    pub skipped_duplicates: i64,
    pub time_taken_seconds: i64,
    pub scrolls_performed: i64,
    pub sheet_url: Option<String>,
    pub error_message: Option<String>,
}

/// Persistent resume point for one user+query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeCursor {
    pub id: String,
    pub user_id: String,
    pub query_hash: String,
    pub query_original: String,
    pub query_normalized: String,
    pub last_scroll_position: i64,
    pub cards_collected: i64,
    pub last_place_id: Option<String>,
    pub last_card_index: Option<i64>,
    pub total_scrolls_performed: i64,
    pub last_visible_card_count: i64,
    pub cursor_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ScrapeCursor {
    /// A cursor is only worth resuming once it has seen cards.
    pub fn can_resume(&self) -> bool {
        self.cards_collected > 0
    }
}

/// Fields written back to a cursor at the end of a scrape.
#[derive(Debug, Clone, Default)]
pub struct CursorUpdate {
    pub cards_collected: i64,
    pub last_scroll_position: i64,
    pub last_place_id: Option<String>,
    pub last_card_index: Option<i64>,
    pub total_scrolls: Option<i64>,
    pub visible_card_count: Option<i64>,
    pub cursor_data: Option<serde_json::Value>,
}

/// Compact cursor state for client display.
#[derive(Debug, Clone, Serialize)]
pub struct CursorSummary {
    pub has_cursor: bool,
    pub cards_collected: i64,
    pub last_scroll_position: i64,
    pub last_place_id: Option<String>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub can_resume: bool,
}

/// Per-user dashboard aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub total_unique_businesses: i64,
    pub total_scrapes: i64,
    pub total_results_collected: i64,
    pub total_duplicates_skipped: i64,
    pub dedup_efficiency: f64,
    pub total_time_saved_minutes: f64,
    pub recent_scrapes: Vec<RecentScrape>,
}

/// Entry in the dashboard's recent-activity list.
#[derive(Debug, Clone, Serialize)]
pub struct RecentScrape {
    pub id: String,
    pub query: String,
    pub new_results: i64,
    pub date: DateTime<Utc>,
}
