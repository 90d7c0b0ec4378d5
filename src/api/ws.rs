//! WebSocket progress stream.
//!
//! Pushes the live progress snapshot every 500 ms until the scrape reaches
//! a terminal state or the client goes away.

use super::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use std::time::Duration;

const PUSH_INTERVAL: Duration = Duration::from_millis(500);

pub async fn ws_scrape_progress(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(scrape_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| push_progress(socket, state, scrape_id))
}

async fn push_progress(mut socket: WebSocket, state: AppState, scrape_id: String) {
    let mut interval = tokio::time::interval(PUSH_INTERVAL);

    loop {
        interval.tick().await;

        let Some(snapshot) = state.progress.snapshot(&scrape_id) else {
            tracing::debug!(scrape_id = %scrape_id, "progress entry gone, closing socket");
            break;
        };

        let Ok(payload) = serde_json::to_string(&snapshot) else {
            break;
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            tracing::debug!(scrape_id = %scrape_id, "client disconnected from progress socket");
            return;
        }
        if snapshot.is_terminal() {
            break;
        }
    }

    let _ = socket.send(Message::Close(None)).await;
}
