//! API routes module

pub mod history;
mod query;
mod tokens;

use std::sync::Arc;

use crate::api::state::AppState;
use axum::Router;

type SharedState = Arc<AppState>;

/// Create the combined API router
pub fn router() -> Router<SharedState> {
    Router::new()
        // Relay a prompt to the model backend
        .nest("/query", query::router())
        // Conversation history routes
        .nest("/history", history::router())
        // Token limit routes
        .nest("/tokens", tokens::router())
}
