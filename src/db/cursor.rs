//! Pagination cursor operations.
//!
//! A cursor binds `(user_id, query_hash)` to the scroll position and card
//! count reached by the last scrape of that query. Exact hash lookup is the
//! fast path; a bounded fuzzy scan over the user's active cursors catches
//! rephrased queries. Cursors expire 30 days after their last update.

use super::{parse_datetime, Database, DbError, DbResult, CursorSummary, CursorUpdate, ScrapeCursor};
use crate::query;
use chrono::{Duration, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

/// Fuzzy matching is a linear scan; cap it so a user with thousands of
/// cursors cannot make lookups pathological.
const FUZZY_SCAN_LIMIT: i64 = 200;

impl Database {
    // ==================== Cursor Operations ====================

    /// Look up the cursor for this user/query. Exact normalized-hash match
    /// first; on a miss, best-effort fuzzy match over the user's active
    /// cursors. Touches `last_accessed` on a hit.
    pub fn get_cursor(&self, user_id: &str, search_query: &str) -> DbResult<Option<ScrapeCursor>> {
        let query_hash = query::query_hash(search_query);
        let now = Utc::now().to_rfc3339();

        let exact = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {CURSOR_COLUMNS} FROM scrape_session_cursors
                 WHERE user_id = ?1 AND query_hash = ?2 AND expires_at > ?3"
            ))?;
            stmt.query_row(params![user_id, query_hash, now], cursor_from_row)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(DbError::Sqlite(other)),
                })?
        };

        if let Some(cursor) = exact {
            self.touch_cursor(&cursor.id)?;
            tracing::debug!(
                query = search_query,
                cards = cursor.cards_collected,
                position = cursor.last_scroll_position,
                "cursor hit"
            );
            return Ok(Some(cursor));
        }

        // Fuzzy fallback for typos and rephrasings the normalizer misses.
        let candidates = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {CURSOR_COLUMNS} FROM scrape_session_cursors
                 WHERE user_id = ?1 AND expires_at > ?2
                 ORDER BY last_accessed DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![user_id, now, FUZZY_SCAN_LIMIT], cursor_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for cursor in candidates {
            if query::fuzzy_match(search_query, &cursor.query_original, query::FUZZY_THRESHOLD) {
                self.touch_cursor(&cursor.id)?;
                tracing::debug!(
                    query = search_query,
                    matched = %cursor.query_original,
                    "fuzzy cursor match"
                );
                return Ok(Some(cursor));
            }
        }

        Ok(None)
    }

    /// Insert a zeroed cursor for this user/query.
    pub fn create_cursor(
        &self,
        user_id: &str,
        search_query: &str,
        ttl_days: i64,
    ) -> DbResult<ScrapeCursor> {
        let (normalized, query_hash) = query::normalize_with_hash(search_query);
        let now = Utc::now();
        let expires_at = now + Duration::days(ttl_days);
        let id = Uuid::new_v4().to_string();

        let conn = self.conn();
        conn.execute(
            "INSERT INTO scrape_session_cursors
                 (id, user_id, query_hash, query_original, query_normalized,
                  created_at, updated_at, last_accessed, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6, ?7)
             ON CONFLICT(user_id, query_hash) DO NOTHING",
            params![
                id,
                user_id,
                query_hash,
                search_query,
                normalized,
                now.to_rfc3339(),
                expires_at.to_rfc3339(),
            ],
        )?;
        drop(conn);

        // Re-read so a concurrent insert still yields the stored row.
        self.get_cursor_by_hash(user_id, &query_hash)?
            .ok_or_else(|| DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Fetch by exact hash regardless of expiry (internal).
    fn get_cursor_by_hash(&self, user_id: &str, query_hash: &str) -> DbResult<Option<ScrapeCursor>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CURSOR_COLUMNS} FROM scrape_session_cursors
             WHERE user_id = ?1 AND query_hash = ?2"
        ))?;
        stmt.query_row(params![user_id, query_hash], cursor_from_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(DbError::Sqlite(other)),
            })
    }

    /// Existing cursor or a fresh zeroed one.
    pub fn get_or_create_cursor(
        &self,
        user_id: &str,
        search_query: &str,
        ttl_days: i64,
    ) -> DbResult<ScrapeCursor> {
        if let Some(cursor) = self.get_cursor(user_id, search_query)? {
            return Ok(cursor);
        }
        self.create_cursor(user_id, search_query, ttl_days)
    }

    /// Write the resume point reached by a scrape and extend the TTL.
    /// Creates the cursor if it does not exist yet.
    pub fn update_cursor(
        &self,
        user_id: &str,
        search_query: &str,
        update: &CursorUpdate,
        ttl_days: i64,
    ) -> DbResult<ScrapeCursor> {
        let query_hash = query::query_hash(search_query);
        if self.get_cursor_by_hash(user_id, &query_hash)?.is_none() {
            self.create_cursor(user_id, search_query, ttl_days)?;
        }

        let now = Utc::now();
        let expires_at = now + Duration::days(ttl_days);
        let cursor_data = update
            .cursor_data
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());

        {
            let conn = self.conn();
            conn.execute(
                "UPDATE scrape_session_cursors SET
                     cards_collected = ?1,
                     last_scroll_position = ?2,
                     last_place_id = COALESCE(?3, last_place_id),
                     last_card_index = COALESCE(?4, last_card_index),
                     total_scrolls_performed = COALESCE(?5, total_scrolls_performed),
                     last_visible_card_count = COALESCE(?6, last_visible_card_count),
                     cursor_data = COALESCE(?7, cursor_data),
                     updated_at = ?8, last_accessed = ?8, expires_at = ?9
                 WHERE user_id = ?10 AND query_hash = ?11",
                params![
                    update.cards_collected,
                    update.last_scroll_position,
                    update.last_place_id,
                    update.last_card_index,
                    update.total_scrolls,
                    update.visible_card_count,
                    cursor_data,
                    now.to_rfc3339(),
                    expires_at.to_rfc3339(),
                    user_id,
                    query_hash,
                ],
            )?;
        }

        self.get_cursor_by_hash(user_id, &query_hash)?
            .ok_or_else(|| DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Delete the cursor for this user/query. Returns true when one existed.
    pub fn clear_cursor(&self, user_id: &str, search_query: &str) -> DbResult<bool> {
        let query_hash = query::query_hash(search_query);
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM scrape_session_cursors WHERE user_id = ?1 AND query_hash = ?2",
            params![user_id, query_hash],
        )?;
        Ok(deleted > 0)
    }

    /// Remove every expired cursor. Returns how many were deleted.
    pub fn cleanup_expired_cursors(&self) -> DbResult<usize> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM scrape_session_cursors WHERE expires_at < ?1",
            params![Utc::now().to_rfc3339()],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up expired cursors");
        }
        Ok(deleted)
    }

    /// Active cursors for this user, most recently accessed first.
    pub fn list_cursors(&self, user_id: &str, limit: i64) -> DbResult<Vec<ScrapeCursor>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CURSOR_COLUMNS} FROM scrape_session_cursors
             WHERE user_id = ?1 AND expires_at > ?2
             ORDER BY last_accessed DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![user_id, Utc::now().to_rfc3339(), limit],
            cursor_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Compact cursor state for client display, or None without a cursor.
    pub fn cursor_summary(
        &self,
        user_id: &str,
        search_query: &str,
    ) -> DbResult<Option<CursorSummary>> {
        let Some(cursor) = self.get_cursor(user_id, search_query)? else {
            return Ok(None);
        };
        let last_place_id = cursor.last_place_id.as_ref().map(|id| {
            if id.chars().count() > 20 {
                let head: String = id.chars().take(20).collect();
                format!("{head}...")
            } else {
                id.clone()
            }
        });
        Ok(Some(CursorSummary {
            has_cursor: true,
            cards_collected: cursor.cards_collected,
            last_scroll_position: cursor.last_scroll_position,
            last_place_id,
            last_accessed: cursor.last_accessed,
            expires_at: cursor.expires_at,
            can_resume: cursor.can_resume(),
        }))
    }

    fn touch_cursor(&self, cursor_id: &str) -> DbResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE scrape_session_cursors SET last_accessed = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), cursor_id],
        )?;
        Ok(())
    }
}

const CURSOR_COLUMNS: &str = "id, user_id, query_hash, query_original, query_normalized, \
     last_scroll_position, cards_collected, last_place_id, last_card_index, \
     total_scrolls_performed, last_visible_card_count, cursor_data, \
     created_at, updated_at, last_accessed, expires_at";

fn cursor_from_row(row: &Row<'_>) -> rusqlite::Result<ScrapeCursor> {
    Ok(ScrapeCursor {
        id: row.get(0)?,
        user_id: row.get(1)?,
        query_hash: row.get(2)?,
        query_original: row.get(3)?,
        query_normalized: row.get(4)?,
        last_scroll_position: row.get(5)?,
        cards_collected: row.get(6)?,
        last_place_id: row.get(7)?,
        last_card_index: row.get(8)?,
        total_scrolls_performed: row.get(9)?,
        last_visible_card_count: row.get(10)?,
        cursor_data: row
            .get::<_, Option<String>>(11)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(12)?),
        updated_at: parse_datetime(&row.get::<_, String>(13)?),
        last_accessed: parse_datetime(&row.get::<_, String>(14)?),
        expires_at: parse_datetime(&row.get::<_, String>(15)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: i64 = 30;

    #[test]
    fn create_update_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let created = db.create_cursor("user-1", "dentist in Amritsar", TTL).unwrap();
        assert_eq!(created.cards_collected, 0);
        assert!(!created.can_resume());

        let updated = db
            .update_cursor(
                "user-1",
                "dentist in Amritsar",
                &CursorUpdate {
                    cards_collected: 150,
                    last_scroll_position: 5000,
                    last_place_id: Some("0x890cb024fe77e7b6".to_string()),
                    last_card_index: Some(149),
                    total_scrolls: Some(42),
                    visible_card_count: Some(23),
                    cursor_data: Some(serde_json::json!({"feed": "results"})),
                },
                TTL,
            )
            .unwrap();
        assert_eq!(updated.cards_collected, 150);
        assert_eq!(updated.last_scroll_position, 5000);
        assert!(updated.expires_at > created.expires_at);

        let fetched = db.get_cursor("user-1", "dentist in Amritsar").unwrap().unwrap();
        assert_eq!(fetched.last_place_id.as_deref(), Some("0x890cb024fe77e7b6"));
        assert_eq!(fetched.last_card_index, Some(149));
        assert_eq!(fetched.total_scrolls_performed, 42);
        assert_eq!(fetched.cursor_data, Some(serde_json::json!({"feed": "results"})));
        assert!(fetched.can_resume());
    }

    #[test]
    fn semantically_equivalent_queries_share_a_cursor() {
        let db = Database::open_in_memory().unwrap();
        db.create_cursor("user-1", "dentist in Amritsar", TTL).unwrap();

        // Token order and casing differences normalize identically.
        let same = db.get_cursor("user-1", "amritsar DENTIST in").unwrap();
        assert!(same.is_some());

        // A different user never sees it.
        assert!(db.get_cursor("user-2", "dentist in Amritsar").unwrap().is_none());
    }

    #[test]
    fn fuzzy_match_catches_small_variations() {
        let db = Database::open_in_memory().unwrap();
        db.create_cursor("user-1", "dentist amritsar", TTL).unwrap();

        // "dentist in amritsar" normalizes differently (the "in" survives)
        // but is similar enough for the fuzzy fallback.
        let matched = db.get_cursor("user-1", "dentist in amritsar").unwrap();
        assert!(matched.is_some());

        assert!(db.get_cursor("user-1", "plumber ludhiana").unwrap().is_none());
    }

    #[test]
    fn expired_cursors_are_invisible_and_cleanable() {
        let db = Database::open_in_memory().unwrap();
        db.create_cursor("user-1", "stale query", -1).unwrap();
        db.create_cursor("user-1", "fresh query", TTL).unwrap();

        assert!(db.get_cursor("user-1", "stale query").unwrap().is_none());
        assert_eq!(db.list_cursors("user-1", 20).unwrap().len(), 1);

        let removed = db.cleanup_expired_cursors().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.cleanup_expired_cursors().unwrap(), 0);
    }

    #[test]
    fn clear_cursor_then_get_returns_none() {
        let db = Database::open_in_memory().unwrap();
        db.create_cursor("user-1", "cafes pune", TTL).unwrap();
        assert!(db.clear_cursor("user-1", "cafes pune").unwrap());
        assert!(db.get_cursor("user-1", "cafes pune").unwrap().is_none());
        assert!(!db.clear_cursor("user-1", "cafes pune").unwrap());
    }

    #[test]
    fn summary_reports_resume_state() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.cursor_summary("user-1", "cafes pune").unwrap().is_none());

        db.create_cursor("user-1", "cafes pune", TTL).unwrap();
        let summary = db.cursor_summary("user-1", "cafes pune").unwrap().unwrap();
        assert!(summary.has_cursor);
        assert!(!summary.can_resume);

        db.update_cursor(
            "user-1",
            "cafes pune",
            &CursorUpdate {
                cards_collected: 75,
                last_scroll_position: 3200,
                last_place_id: Some("0x890cb024fe77e7b6aabbccdd".to_string()),
                ..CursorUpdate::default()
            },
            TTL,
        )
        .unwrap();
        let summary = db.cursor_summary("user-1", "cafes pune").unwrap().unwrap();
        assert!(summary.can_resume);
        assert_eq!(summary.cards_collected, 75);
        assert!(summary.last_place_id.unwrap().ends_with("..."));
    }
}
