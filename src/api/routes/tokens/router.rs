//! Router for adjusting the default token limit

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use crate::api::public::ApiError;
use crate::api::state::AppState;

type SharedState = Arc<AppState>;

async fn tokens_max(
    State(state): State<SharedState>,
    Path(tokens): Path<u32>,
) -> Result<Json<bool>, ApiError> {
    state.service.set_max_tokens(tokens).await?;
    Ok(Json(true))
}

/// Create the tokens router
pub fn router() -> Router<SharedState> {
    Router::new().route("/max/{tokens}", get(tokens_max))
}
