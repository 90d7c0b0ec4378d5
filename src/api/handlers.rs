//! HTTP request handlers

use super::types::{
    CursorClearedResponse, CursorCleanupResponse, CursorListResponse, CursorQuery, CursorResponse,
    ErrorResponse, HealthResponse, HistoryQuery, HistoryResponse, ResultsResponse, ScrapeRequest,
    ScrapeResponse, SeenPlacesResponse, StatsResponse, SuccessResponse,
};
use super::ws::ws_scrape_progress;
use super::AppState;
use crate::progress::{ProgressSnapshot, ScrapeStatus};

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Liveness
        .route("/health", get(health))
        // Scraping
        .route("/scrape", post(scrape_sync))
        .route("/scrape-async", post(scrape_async))
        .route("/scrape/:scrape_id/progress", get(scrape_progress))
        .route("/scrape/:scrape_id/results", get(scrape_results))
        .route("/ws/scrape/:scrape_id", get(ws_scrape_progress))
        // Cursor management
        .route("/cursors", get(list_cursors))
        .route("/cursor", get(get_cursor).delete(clear_cursor))
        .route("/cursor/cleanup", post(cleanup_cursors))
        // History & stats
        .route("/history", get(history))
        .route("/stats", get(stats))
        .route("/seen-places", get(seen_places))
        // Session pool
        .route("/session-info", get(session_info))
        .route("/release-session", post(release_session))
        .route("/reset-session", post(reset_session))
        .with_state(state)
}

// ============================================================
// Authenticated user identity
// ============================================================

/// The authenticated user id, installed by the upstream auth layer as the
/// `x-user-id` header. The core never authenticates on its own.
pub struct UserId(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| AppError::BadRequest("missing x-user-id header".to_string()))
    }
}

// ============================================================
// Scraping
// ============================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let pool_stats = state.pool.stats().await;
    Json(HealthResponse {
        status: "ok",
        active_sessions: pool_stats.active_sessions,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn scrape_async(
    State(state): State<AppState>,
    user: UserId,
    Json(req): Json<ScrapeRequest>,
) -> Result<Response, AppError> {
    let query = validated_query(&req)?;
    let started = state
        .orchestrator
        .start_scrape(&user.0, query, req.target_count, req.max_scrolls)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(started).into_response())
}

async fn scrape_sync(
    State(state): State<AppState>,
    user: UserId,
    Json(req): Json<ScrapeRequest>,
) -> Result<Json<ScrapeResponse>, AppError> {
    let query = validated_query(&req)?;
    tracing::info!(user_id = %user.0, query, "synchronous scrape requested");

    let scrape = state
        .orchestrator
        .run_blocking_scrape(&user.0, query, req.target_count, req.max_scrolls)
        .await
        .map_err(|e| AppError::Internal(format!("Scraping failed: {e}")))?;

    Ok(Json(ScrapeResponse {
        status: "success",
        query: query.to_string(),
        total_collected: scrape.stats.cards_found,
        unique_results: scrape.records.len(),
        target_count: req.target_count.unwrap_or(state.config.default_target_count),
        time_taken: scrape.time_taken_seconds,
        results: scrape.records,
        stats: scrape.stats,
    }))
}

fn validated_query(req: &ScrapeRequest) -> Result<&str, AppError> {
    let query = req.search_query.trim();
    if query.is_empty() {
        return Err(AppError::BadRequest("search_query must not be empty".to_string()));
    }
    Ok(query)
}

async fn scrape_progress(
    State(state): State<AppState>,
    Path(scrape_id): Path<String>,
) -> Result<Json<ProgressSnapshot>, AppError> {
    state
        .progress
        .snapshot(&scrape_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("scrape not found: {scrape_id}")))
}

async fn scrape_results(
    State(state): State<AppState>,
    Path(scrape_id): Path<String>,
) -> Result<Json<ResultsResponse>, AppError> {
    let snapshot = state
        .progress
        .snapshot(&scrape_id)
        .ok_or_else(|| AppError::NotFound(format!("scrape not found: {scrape_id}")))?;

    match snapshot.status {
        ScrapeStatus::Completed => {
            let results = state.progress.final_results(&scrape_id).unwrap_or_default();
            Ok(Json(ResultsResponse {
                scrape_id,
                status: "completed",
                count: results.len(),
                results,
            }))
        }
        ScrapeStatus::Failed => Err(AppError::Internal(
            snapshot
                .error_message
                .unwrap_or_else(|| "scrape failed".to_string()),
        )),
        _ => Err(AppError::TooEarly(format!(
            "scrape still {}: {}% complete",
            snapshot.status_label(),
            snapshot.progress_percent
        ))),
    }
}

// ============================================================
// Cursor management
// ============================================================

async fn list_cursors(
    State(state): State<AppState>,
    user: UserId,
) -> Result<Json<CursorListResponse>, AppError> {
    let cursors = state
        .db
        .list_cursors(&user.0, 20)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(CursorListResponse { cursors }))
}

async fn get_cursor(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<CursorQuery>,
) -> Result<Json<CursorResponse>, AppError> {
    let cursor = state
        .db
        .cursor_summary(&user.0, &params.query)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(CursorResponse { cursor }))
}

async fn clear_cursor(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<CursorQuery>,
) -> Result<Json<CursorClearedResponse>, AppError> {
    let cleared = state
        .db
        .clear_cursor(&user.0, &params.query)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(CursorClearedResponse { cleared }))
}

async fn cleanup_cursors(
    State(state): State<AppState>,
) -> Result<Json<CursorCleanupResponse>, AppError> {
    let removed = state
        .db
        .cleanup_expired_cursors()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(CursorCleanupResponse { removed }))
}

// ============================================================
// History & stats
// ============================================================

async fn history(
    State(state): State<AppState>,
    user: UserId,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let limit = params.limit.clamp(1, 100);
    let offset = params.offset.max(0);
    let sessions = state
        .db
        .user_history(&user.0, limit, offset)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(HistoryResponse { sessions }))
}

async fn stats(
    State(state): State<AppState>,
    user: UserId,
) -> Result<Json<StatsResponse>, AppError> {
    let stats = state
        .db
        .user_stats(&user.0)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(StatsResponse { stats }))
}

async fn seen_places(
    State(state): State<AppState>,
    user: UserId,
) -> Result<Json<SeenPlacesResponse>, AppError> {
    let seen = state
        .db
        .seen_places(&user.0)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let count = seen.len();
    let mut place_ids: Vec<String> = seen.into_iter().collect();
    place_ids.sort_unstable();
    place_ids.truncate(100);
    Ok(Json(SeenPlacesResponse { count, place_ids }))
}

// ============================================================
// Session pool
// ============================================================

async fn session_info(State(state): State<AppState>) -> Response {
    Json(state.pool.stats().await).into_response()
}

async fn release_session(
    State(state): State<AppState>,
    user: UserId,
) -> Json<SuccessResponse> {
    state.pool.release(&user.0).await;
    Json(SuccessResponse { success: true })
}

async fn reset_session(
    State(state): State<AppState>,
    user: UserId,
) -> Result<Json<SuccessResponse>, AppError> {
    state
        .pool
        .reset(&user.0)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Error Handling
// ============================================================

pub enum AppError {
    BadRequest(String),
    NotFound(String),
    TooEarly(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::TooEarly(msg) => (StatusCode::TOO_EARLY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
