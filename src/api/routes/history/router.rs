//! Router for the conversation history API

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use super::public;
use crate::api::public::ApiError;
use crate::api::state::AppState;

type SharedState = Arc<AppState>;

/// Truncate the stored history and reset the in-memory transcript
async fn history_clear(State(state): State<SharedState>) -> Result<Json<bool>, ApiError> {
    state.service.clear_history().await?;
    Ok(Json(true))
}

async fn history_list(State(state): State<SharedState>) -> Json<Vec<public::HistoryEntry>> {
    let entries = state
        .service
        .history()
        .await
        .into_iter()
        .map(public::HistoryEntry::from)
        .collect();
    Json(entries)
}

/// Create the history router
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/clear", get(history_clear))
        .route("/list", get(history_list))
}
