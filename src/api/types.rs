use serde::{Deserialize, Serialize};

/// Bounds of the "Max Output Length" slider; the server enforces the
/// same range on the JSON endpoint.
pub const MIN_NEW_TOKENS: usize = 5;
pub const MAX_NEW_TOKENS: usize = 100;
pub const DEFAULT_NEW_TOKENS: usize = 30;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default = "default_new_tokens")]
    pub max_new_tokens: usize,
}

fn default_new_tokens() -> usize {
    DEFAULT_NEW_TOKENS
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub output: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model: String,
}
