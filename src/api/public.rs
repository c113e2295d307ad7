//! Public API types

use axum::response::{IntoResponse, Response};
use http::StatusCode;

use crate::llm::GatewayError;

// Errors

pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        // Failures talking to the model backend are the backend's
        // fault, not ours
        match self.0.downcast_ref::<GatewayError>() {
            Some(GatewayError::Aborted(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
            Some(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Convert `ApiError` into an Axum compatible response.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Always log the error
        tracing::error!("{}", self.0);

        (self.status(), format!("Something went wrong: {}", self.0)).into_response()
    }
}

/// Enables using `?` on functions that return `Result<_,
/// anyhow::Error>` to turn them into `Result<_, ApiError>`
impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

// Re-export public types from each route

pub mod history {
    pub use crate::api::routes::history::public::*;
}
