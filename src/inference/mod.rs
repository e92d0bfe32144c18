pub mod gpt2;
pub mod gpt2_model;
pub mod hub;

use std::sync::Arc;

use anyhow::anyhow;

use crate::error::ServiceError;

/// Knobs for one generation call. `seed: None` draws a fresh seed per
/// request, so repeated submissions with the same prompt may differ.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub top_k: usize,
    pub temperature: f64,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 30,
            top_k: 50,
            temperature: 1.0,
            seed: None,
        }
    }
}

/// Engine seam: anything that can turn a prompt into a continuation.
/// Lets the HTTP layer run against a stub and keeps the decoding
/// strategy swappable without touching the handlers.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, ServiceError>;

    fn model_name(&self) -> &str;
}

pub struct InferenceService {
    engine: Arc<dyn TextGenerator>,
}

impl InferenceService {
    pub fn new(engine: Arc<dyn TextGenerator>) -> Self {
        Self { engine }
    }

    pub fn model_name(&self) -> String {
        self.engine.model_name().to_string()
    }

    /// Run a blocking generation pass off the async runtime.
    pub async fn generate(
        &self,
        prompt: String,
        params: SamplingParams,
    ) -> Result<String, ServiceError> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.generate(&prompt, &params))
            .await
            .map_err(|e| ServiceError::Generation(anyhow!("generation task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_params_defaults_match_the_demo_surface() {
        let params = SamplingParams::default();
        assert_eq!(params.max_new_tokens, 30);
        assert_eq!(params.top_k, 50);
        assert!(params.temperature > 0.0);
        assert!(params.seed.is_none());
    }
}
