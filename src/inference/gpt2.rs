use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use tokenizers::Tokenizer;
use tracing::info;

use std::fs;
use std::sync::Mutex;

use crate::error::ServiceError;
use crate::inference::gpt2_model::{Gpt2Config, Gpt2Model};
use crate::inference::hub::fetch_snapshot;
use crate::inference::{SamplingParams, TextGenerator};

/// The fine-tuned checkpoint this demo serves. Fixed on purpose: the
/// surface exposes no way to pick a different model at runtime.
pub const MODEL_ID: &str = "roveenk/gpt2assignment";

// ---------------------------------------------------------
// PUBLIC SERVICE
// ---------------------------------------------------------
pub struct Gpt2Service {
    model: Mutex<Gpt2Model>,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_id: u32,
    max_seq_len: usize,
    model_id: String,
}

impl std::fmt::Debug for Gpt2Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpt2Service")
            .field("model_id", &self.model_id)
            .field("max_seq_len", &self.max_seq_len)
            .field("eos_token_id", &self.eos_token_id)
            .finish_non_exhaustive()
    }
}

impl Gpt2Service {
    /// Resolve the identifier, load tokenizer + weights and put the
    /// model in inference mode. Called once at startup; any failure here
    /// is fatal.
    pub fn load(model_id: &str) -> Result<Self, ServiceError> {
        Self::load_inner(model_id).map_err(ServiceError::Resolution)
    }

    fn load_inner(model_id: &str) -> Result<Self> {
        let snapshot = fetch_snapshot(model_id)?;

        let device = select_device()?;
        println!("🔌 GPT-2 → {device:?}");

        let tokenizer = Tokenizer::from_file(&snapshot.tokenizer)
            .map_err(|e| anyhow!("tokenizer load failed: {e}"))?;

        let cfg: Gpt2Config = serde_json::from_slice(&fs::read(&snapshot.config)?)
            .context("config.json parse failed")?;
        info!(
            "GPT-2 config: {} layers, {} heads, {} token context",
            cfg.n_layer,
            cfg.n_head,
            cfg.max_seq_len()
        );

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&snapshot.weights], DType::F32, &device)?
        };
        let model = Gpt2Model::new(&cfg, vb).context("weight load failed")?;

        let eos_token_id = tokenizer
            .token_to_id("<|endoftext|>")
            .or(cfg.eos_token_id)
            .unwrap_or(50256);

        println!("🚀 {model_id} ready ({} token context)", cfg.max_seq_len());

        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
            device,
            eos_token_id,
            max_seq_len: cfg.max_seq_len(),
            model_id: model_id.to_string(),
        })
    }

    // -----------------------------------------------------
    // SAMPLING LOOP
    // -----------------------------------------------------
    fn sample_loop(&self, mut tokens: Vec<u32>, params: &SamplingParams) -> Result<String> {
        {
            let mut m = self.model.lock().map_err(|_| anyhow!("model lock poisoned"))?;
            m.clear_kv_cache();
        }

        let mut lp = build_logits_processor(params);
        let mut pos = 0usize;

        for _ in 0..params.max_new_tokens {
            // first step: whole prompt; later: last token only
            let ctx: &[u32] = if pos == 0 {
                &tokens
            } else {
                std::slice::from_ref(tokens.last().unwrap())
            };

            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;

            let logits = {
                let mut m = self.model.lock().map_err(|_| anyhow!("model lock poisoned"))?;
                let out = m.forward(&input, pos)?;
                let seq_len = out.dim(1)?;
                out.i((0, seq_len - 1))?.to_dtype(DType::F32)?
            };

            pos += ctx.len();

            let next = lp.sample(&logits)?;
            tokens.push(next);

            if next == self.eos_token_id {
                break;
            }
        }

        // The demo shows prompt + continuation, so decode everything,
        // dropping special markers.
        self.tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("decode error: {e}"))
    }
}

impl TextGenerator for Gpt2Service {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, ServiceError> {
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            return Err(ServiceError::Validation("Please enter a prompt.".into()));
        }

        let enc = self
            .tokenizer
            .encode(trimmed, true)
            .map_err(|e| ServiceError::Generation(anyhow!("encode error: {e}")))?;
        let tokens = enc.get_ids().to_vec();

        if tokens.is_empty() {
            return Err(ServiceError::Validation("Please enter a prompt.".into()));
        }
        if tokens.len() + params.max_new_tokens > self.max_seq_len {
            return Err(ServiceError::Validation(format!(
                "prompt is too long: {} prompt tokens + {} new tokens exceeds the {} token context",
                tokens.len(),
                params.max_new_tokens,
                self.max_seq_len
            )));
        }

        self.sample_loop(tokens, params)
            .map_err(ServiceError::Generation)
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// ---------------------------------------------------------
// Helpers
// ---------------------------------------------------------
fn select_device() -> candle_core::Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else {
        Ok(Device::Cpu)
    }
}

fn build_logits_processor(params: &SamplingParams) -> LogitsProcessor {
    let seed = params.seed.unwrap_or_else(seed_from_clock);
    let sampling = if params.temperature <= 0.0 {
        Sampling::ArgMax
    } else if params.top_k > 0 {
        Sampling::TopK {
            k: params.top_k,
            temperature: params.temperature,
        }
    } else {
        Sampling::All {
            temperature: params.temperature,
        }
    };
    LogitsProcessor::from_sampling(seed, sampling)
}

fn seed_from_clock() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolvable_snapshot_is_a_resolution_error() {
        let dir = std::env::temp_dir().join("nextword-no-model");
        std::fs::create_dir_all(&dir).unwrap();

        let err = Gpt2Service::load(dir.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ServiceError::Resolution(_)));
    }
}
