use axum::{
    extract::State,
    response::Html,
    Json,
};

use crate::{
    api::types::{
        GenerateRequest, GenerateResponse, HealthResponse, MAX_NEW_TOKENS, MIN_NEW_TOKENS,
    },
    api::AppState,
    error::ServiceError,
    inference::SamplingParams,
};

pub async fn index() -> Html<&'static str> {
    Html(include_str!("../../assets/index.html"))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.infer.model_name(),
    })
}

pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ServiceError> {
    // Whitespace-only prompts short-circuit here; the engine is never
    // touched for them.
    if req.prompt.trim().is_empty() {
        return Err(ServiceError::Validation("Please enter a prompt.".into()));
    }
    check_max_new_tokens(req.max_new_tokens)?;

    let params = SamplingParams {
        max_new_tokens: req.max_new_tokens,
        ..SamplingParams::default()
    };
    let output = state.infer.generate(req.prompt, params).await?;

    Ok(Json(GenerateResponse { output }))
}

pub(crate) fn check_max_new_tokens(n: usize) -> Result<(), ServiceError> {
    if !(MIN_NEW_TOKENS..=MAX_NEW_TOKENS).contains(&n) {
        return Err(ServiceError::Validation(format!(
            "max_new_tokens must be between {MIN_NEW_TOKENS} and {MAX_NEW_TOKENS}, got {n}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{InferenceService, TextGenerator};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubGenerator {
        calls: AtomicUsize,
    }

    impl TextGenerator for StubGenerator {
        fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{prompt} and {} more tokens", params.max_new_tokens))
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn state_with_stub() -> (AppState, Arc<StubGenerator>) {
        let stub = Arc::new(StubGenerator {
            calls: AtomicUsize::new(0),
        });
        let state = AppState {
            infer: Arc::new(InferenceService::new(stub.clone())),
        };
        (state, stub)
    }

    #[tokio::test]
    async fn whitespace_prompt_never_reaches_the_engine() {
        let (state, stub) = state_with_stub();
        let req = GenerateRequest {
            prompt: "   ".into(),
            max_new_tokens: 10,
        };

        let res = generate(State(state), Json(req)).await;

        assert!(matches!(res, Err(ServiceError::Validation(_))));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn out_of_range_length_is_rejected_before_generation() {
        let (state, stub) = state_with_stub();

        for bad in [0, 4, 101] {
            let req = GenerateRequest {
                prompt: "The weather today is".into(),
                max_new_tokens: bad,
            };
            let res = generate(State(state.clone()), Json(req)).await;
            assert!(matches!(res, Err(ServiceError::Validation(_))));
        }

        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_prompt_comes_back_prompt_prefixed() {
        let (state, stub) = state_with_stub();
        let req = GenerateRequest {
            prompt: "The weather today is".into(),
            max_new_tokens: 10,
        };

        let res = generate(State(state), Json(req)).await.unwrap();

        assert!(res.0.output.starts_with("The weather today is"));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slider_bounds_are_both_accepted() {
        let (state, _stub) = state_with_stub();

        for ok in [MIN_NEW_TOKENS, MAX_NEW_TOKENS] {
            let req = GenerateRequest {
                prompt: "Once upon a time".into(),
                max_new_tokens: ok,
            };
            let res = generate(State(state.clone()), Json(req)).await.unwrap();
            assert!(!res.0.output.is_empty());
        }
    }

    #[test]
    fn length_check_covers_the_slider_range() {
        assert!(check_max_new_tokens(5).is_ok());
        assert!(check_max_new_tokens(30).is_ok());
        assert!(check_max_new_tokens(100).is_ok());
        assert!(check_max_new_tokens(4).is_err());
        assert!(check_max_new_tokens(101).is_err());
    }
}
