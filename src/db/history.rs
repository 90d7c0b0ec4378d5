//! Place history and scrape session operations.

use super::{
    parse_datetime, parse_optional_datetime, parse_session_status, Database, DbError, DbResult,
    RecentScrape, ScrapeSession, SessionOutcome, SessionStatus, UserStats,
};
use crate::query;
use chrono::{Duration, Utc};
use rusqlite::{params, Row};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Display heuristic: each skipped duplicate saves roughly this many seconds
/// of scraping time.
const SECONDS_SAVED_PER_DUPLICATE: i64 = 3;

impl Database {
    // ==================== Deduplication ====================

    /// All place IDs this user has ever scraped, across every query.
    pub fn seen_places(&self, user_id: &str) -> DbResult<HashSet<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT place_id FROM user_places WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<HashSet<_>, _>>().map_err(DbError::from)
    }

    /// Place IDs this user captured under one specific query identity, so
    /// user-visible duplicate counts reflect only that query.
    pub fn seen_places_for_query(
        &self,
        user_id: &str,
        query_hash: &str,
    ) -> DbResult<HashSet<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT place_id FROM user_places WHERE user_id = ?1 AND query_hash = ?2")?;
        let rows = stmt.query_map(params![user_id, query_hash], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<HashSet<_>, _>>().map_err(DbError::from)
    }

    /// Record scraped place IDs (upsert). On conflict the row keeps its
    /// identity and bumps `last_seen` and `scraped_count`.
    pub fn record_places(
        &self,
        user_id: &str,
        place_ids: &[String],
        search_query: &str,
        cids: &HashMap<String, String>,
    ) -> DbResult<usize> {
        if place_ids.is_empty() {
            return Ok(0);
        }

        let query_hash = query::query_hash(search_query);
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let mut recorded = 0;

        for place_id in place_ids {
            let changed = conn.execute(
                "INSERT INTO user_places (user_id, place_id, cid, query_hash, first_seen, last_seen, scraped_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)
                 ON CONFLICT(user_id, place_id) DO UPDATE SET
                     last_seen = ?5,
                     scraped_count = scraped_count + 1",
                params![user_id, place_id, cids.get(place_id), query_hash, now],
            )?;
            recorded += changed;
        }

        Ok(recorded)
    }

    /// Total unique places ever scraped by this user.
    pub fn unique_place_count(&self, user_id: &str) -> DbResult<i64> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM user_places WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }

    // ==================== Scrape Sessions ====================

    /// Create a scrape session row in `pending` state.
    pub fn create_session(&self, user_id: &str, search_query: &str) -> DbResult<ScrapeSession> {
        let id = Uuid::new_v4().to_string();
        let query_hash = query::query_hash(search_query);
        let now = Utc::now();

        let conn = self.conn();
        conn.execute(
            "INSERT INTO scrape_sessions (id, user_id, query, query_hash, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![id, user_id, search_query, query_hash, now.to_rfc3339()],
        )?;

        Ok(ScrapeSession {
            id,
            user_id: user_id.to_string(),
            query: search_query.to_string(),
            query_hash,
            total_found: 0,
            new_results: 0,
            skipped_duplicates: 0,
            sheet_id: None,
            sheet_url: None,
            time_taken_seconds: 0,
            scrolls_performed: 0,
            created_at: now,
            completed_at: None,
            status: SessionStatus::Pending,
            error_message: None,
        })
    }

    /// Transition a session `pending` → `running`.
    pub fn start_session(&self, session_id: &str) -> DbResult<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE scrape_sessions SET status = 'running' WHERE id = ?1 AND status = 'pending'",
            params![session_id],
        )?;
        if updated == 0 {
            return Err(DbError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Close a session with its final numbers. An error message marks it
    /// `failed`, otherwise `completed`.
    pub fn complete_session(&self, session_id: &str, outcome: &SessionOutcome) -> DbResult<()> {
        let status = if outcome.error_message.is_some() {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE scrape_sessions SET
                 total_found = ?1, new_results = ?2, skipped_duplicates = ?3,
                 time_taken_seconds = ?4, scrolls_performed = ?5, sheet_url = ?6,
                 completed_at = ?7, status = ?8, error_message = ?9
             WHERE id = ?10",
            params![
                outcome.total_found,
                outcome.new_results,
                outcome.skipped_duplicates,
                outcome.time_taken_seconds,
                outcome.scrolls_performed,
                outcome.sheet_url,
                Utc::now().to_rfc3339(),
                status.to_string(),
                outcome.error_message,
                session_id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Get one session by ID.
    pub fn get_session(&self, session_id: &str) -> DbResult<ScrapeSession> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, query, query_hash, total_found, new_results, skipped_duplicates,
                    sheet_id, sheet_url, time_taken_seconds, scrolls_performed, created_at,
                    completed_at, status, error_message
             FROM scrape_sessions WHERE id = ?1",
        )?;
        stmt.query_row(params![session_id], session_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::SessionNotFound(session_id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// Finished sessions for the history view, newest first.
    pub fn user_history(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<ScrapeSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, query, query_hash, total_found, new_results, skipped_duplicates,
                    sheet_id, sheet_url, time_taken_seconds, scrolls_performed, created_at,
                    completed_at, status, error_message
             FROM scrape_sessions
             WHERE user_id = ?1 AND status IN ('completed', 'failed')
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![user_id, limit, offset], session_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== User Stats ====================

    /// Dashboard aggregate: totals, dedup efficiency, and a fixed
    /// 3 s/duplicate time-saved figure.
    pub fn user_stats(&self, user_id: &str) -> DbResult<UserStats> {
        let total_unique_businesses = self.unique_place_count(user_id)?;

        let conn = self.conn();
        let (total_scrapes, total_new, total_skipped): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(new_results), 0), COALESCE(SUM(skipped_duplicates), 0)
             FROM scrape_sessions WHERE user_id = ?1 AND status = 'completed'",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT id, query, new_results, created_at
             FROM scrape_sessions
             WHERE user_id = ?1 AND status = 'completed'
             ORDER BY created_at DESC LIMIT 5",
        )?;
        let recent_scrapes = stmt
            .query_map(params![user_id], |row| {
                Ok(RecentScrape {
                    id: row.get(0)?,
                    query: row.get(1)?,
                    new_results: row.get(2)?,
                    date: parse_datetime(&row.get::<_, String>(3)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let considered = total_new + total_skipped;
        #[allow(clippy::cast_precision_loss)]
        let dedup_efficiency = if considered > 0 {
            (total_skipped as f64 / considered as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        #[allow(clippy::cast_precision_loss)]
        let total_time_saved_minutes =
            ((total_skipped * SECONDS_SAVED_PER_DUPLICATE) as f64 / 60.0 * 10.0).round() / 10.0;

        Ok(UserStats {
            total_unique_businesses,
            total_scrapes,
            total_results_collected: total_new,
            total_duplicates_skipped: total_skipped,
            dedup_efficiency,
            total_time_saved_minutes,
            recent_scrapes,
        })
    }

    // ==================== Maintenance ====================

    /// Delete finished session rows older than `days`. Place rows are kept
    /// forever — only session metadata is cleaned.
    pub fn cleanup_old_sessions(&self, days: i64) -> DbResult<usize> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM scrape_sessions WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ScrapeSession> {
    Ok(ScrapeSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        query: row.get(2)?,
        query_hash: row.get(3)?,
        total_found: row.get(4)?,
        new_results: row.get(5)?,
        skipped_duplicates: row.get(6)?,
        sheet_id: row.get(7)?,
        sheet_url: row.get(8)?,
        time_taken_seconds: row.get(9)?,
        scrolls_performed: row.get(10)?,
        created_at: parse_datetime(&row.get::<_, String>(11)?),
        completed_at: parse_optional_datetime(row.get(12)?),
        status: parse_session_status(&row.get::<_, String>(13)?),
        error_message: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_places_upserts_and_bumps_counters() {
        let db = Database::open_in_memory().unwrap();
        let ids = vec!["0xaa".to_string(), "0xbb".to_string()];
        let cids = HashMap::from([("0xaa".to_string(), "170".to_string())]);

        db.record_places("user-1", &ids, "dentist amritsar", &cids).unwrap();
        db.record_places("user-1", &ids, "dentist amritsar", &cids).unwrap();

        let seen = db.seen_places("user-1").unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("0xaa"));
        assert_eq!(db.unique_place_count("user-1").unwrap(), 2);

        let count: i64 = db
            .conn()
            .query_row(
                "SELECT scraped_count FROM user_places WHERE user_id = 'user-1' AND place_id = '0xaa'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn seen_places_are_isolated_per_user_and_query() {
        let db = Database::open_in_memory().unwrap();
        db.record_places("user-1", &["0x1".to_string()], "dentist amritsar", &HashMap::new())
            .unwrap();
        db.record_places("user-2", &["0x2".to_string()], "dentist amritsar", &HashMap::new())
            .unwrap();

        assert_eq!(db.seen_places("user-1").unwrap().len(), 1);
        assert!(db.seen_places("user-1").unwrap().contains("0x1"));

        let hash = query::query_hash("amritsar dentist");
        let scoped = db.seen_places_for_query("user-1", &hash).unwrap();
        assert!(scoped.contains("0x1"));
        let other = db.seen_places_for_query("user-1", &query::query_hash("plumber delhi")).unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn session_lifecycle_pending_running_completed() {
        let db = Database::open_in_memory().unwrap();
        let session = db.create_session("user-1", "cafes in pune").unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        db.start_session(&session.id).unwrap();
        db.complete_session(
            &session.id,
            &SessionOutcome {
                total_found: 80,
                new_results: 50,
                skipped_duplicates: 30,
                time_taken_seconds: 120,
                scrolls_performed: 25,
                ..SessionOutcome::default()
            },
        )
        .unwrap();

        let stored = db.get_session(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.new_results, 50);
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn failed_sessions_keep_their_error() {
        let db = Database::open_in_memory().unwrap();
        let session = db.create_session("user-1", "cafes in pune").unwrap();
        db.start_session(&session.id).unwrap();
        db.complete_session(
            &session.id,
            &SessionOutcome {
                error_message: Some("search results never appeared".to_string()),
                ..SessionOutcome::default()
            },
        )
        .unwrap();

        let stored = db.get_session(&session.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("search results never appeared"));
    }

    #[test]
    fn stats_derive_dedup_efficiency_and_time_saved() {
        let db = Database::open_in_memory().unwrap();
        db.record_places("user-1", &["0x1".to_string(), "0x2".to_string()], "q", &HashMap::new())
            .unwrap();

        let session = db.create_session("user-1", "q").unwrap();
        db.start_session(&session.id).unwrap();
        db.complete_session(
            &session.id,
            &SessionOutcome {
                total_found: 100,
                new_results: 60,
                skipped_duplicates: 40,
                time_taken_seconds: 90,
                scrolls_performed: 20,
                ..SessionOutcome::default()
            },
        )
        .unwrap();

        let stats = db.user_stats("user-1").unwrap();
        assert_eq!(stats.total_unique_businesses, 2);
        assert_eq!(stats.total_scrapes, 1);
        assert_eq!(stats.total_results_collected, 60);
        assert_eq!(stats.total_duplicates_skipped, 40);
        assert!((stats.dedup_efficiency - 40.0).abs() < f64::EPSILON);
        assert!((stats.total_time_saved_minutes - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.recent_scrapes.len(), 1);
    }

    #[test]
    fn history_lists_only_finished_sessions_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let pending = db.create_session("user-1", "one").unwrap();
        let done = db.create_session("user-1", "two").unwrap();
        db.start_session(&done.id).unwrap();
        db.complete_session(&done.id, &SessionOutcome::default()).unwrap();

        let history = db.user_history("user-1", 20, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.first().map(|s| s.id.clone()), Some(done.id));
        assert_ne!(history.first().map(|s| s.id.clone()), Some(pending.id));
    }
}
