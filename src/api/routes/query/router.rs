//! Router for relaying prompts to the model backend

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    routing::get,
};

use crate::api::public::ApiError;
use crate::api::state::AppState;

type SharedState = Arc<AppState>;

/// Send the prompt to the model and respond with the reply as plain
/// text
async fn query_handler(
    State(state): State<SharedState>,
    Path((model, prompt)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let reply = state.service.query(&model, &prompt).await?;
    Ok(reply)
}

/// Create the query router
pub fn router() -> Router<SharedState> {
    Router::new().route("/{model}/{prompt}", get(query_handler))
}
