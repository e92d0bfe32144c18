use axum::{
    routing::{get, post},
    Router,
};

use std::sync::Arc;

use crate::inference::InferenceService;

pub mod handlers;
pub mod types;

use handlers::{generate, health, index};

// ------------------------------------------------------------
// TYPES
// ------------------------------------------------------------
#[derive(Clone)]
pub struct AppState {
    pub infer: Arc<InferenceService>,
}

// ------------------------------------------------------------
// ROUTER
// ------------------------------------------------------------
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/api/generate", post(generate))
        .route("/health", get(health))
}
