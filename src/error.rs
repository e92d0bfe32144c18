use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Failures the server can hit, split by where they are handled:
/// resolution errors abort startup, the other two stay scoped to the
/// request that raised them.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("model resolution failed: {0}")]
    Resolution(#[source] anyhow::Error),

    #[error("{0}")]
    Validation(String),

    #[error("generation failed: {0}")]
    Generation(#[source] anyhow::Error),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Resolution(_) | ServiceError::Generation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        warn!("request failed: {self:?}");
        let body = Json(json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
