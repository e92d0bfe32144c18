use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;
use std::path::{Path, PathBuf};
use tracing::info;

/// Local paths of the three artifacts a GPT-2 snapshot consists of.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelSnapshot {
    /// Build a snapshot from a directory that already holds the files.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let snapshot = Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights: dir.join("model.safetensors"),
        };

        for path in [&snapshot.config, &snapshot.tokenizer, &snapshot.weights] {
            if !path.exists() {
                return Err(anyhow!("missing model file: {}", path.display()));
            }
        }

        Ok(snapshot)
    }
}

/// Resolve a model identifier to a local snapshot. Directories are used
/// as-is; anything else is treated as a HuggingFace Hub repo id and
/// downloaded into the hub's own cache (a no-op when already cached).
pub fn fetch_snapshot(model_id: &str) -> Result<ModelSnapshot> {
    let local = Path::new(model_id);
    if local.is_dir() {
        info!("Loading model snapshot from local directory: {model_id}");
        return ModelSnapshot::from_dir(local);
    }

    info!("Fetching {model_id} from the HuggingFace Hub");
    let api = Api::new().context("failed to initialize HuggingFace Hub API")?;
    let repo = api.model(model_id.to_string());

    let config = repo
        .get("config.json")
        .with_context(|| format!("failed to fetch config.json for {model_id}"))?;
    let tokenizer = repo
        .get("tokenizer.json")
        .with_context(|| format!("failed to fetch tokenizer.json for {model_id}"))?;
    let weights = repo
        .get("model.safetensors")
        .with_context(|| format!("failed to fetch model.safetensors for {model_id}"))?;

    Ok(ModelSnapshot {
        config,
        tokenizer,
        weights,
    })
}
