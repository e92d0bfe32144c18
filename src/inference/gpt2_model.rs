use candle_core::{Device, Result, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, Module, VarBuilder};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    // Older checkpoints carry n_ctx, newer ones only n_positions.
    #[serde(default)]
    pub n_ctx: Option<usize>,
    #[serde(default)]
    pub n_positions: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    pub fn max_seq_len(&self) -> usize {
        self.n_ctx.or(self.n_positions).unwrap_or(1024)
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

/// HF GPT-2 checkpoints store Conv1D weights as (in, out); Linear wants
/// (out, in), so transpose on load.
fn linear_from_conv1d(vb: VarBuilder, in_dim: usize, out_dim: usize) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let c_attn = linear_from_conv1d(vb.pp("c_attn"), cfg.n_embd, 3 * cfg.n_embd)?;
        let c_proj = linear_from_conv1d(vb.pp("c_proj"), cfg.n_embd, cfg.n_embd)?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: cfg.n_head,
            head_dim: cfg.head_dim(),
            kv_cache: None,
        })
    }

    fn forward(&mut self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let hidden = self.n_head * self.head_dim;

        let qkv = self.c_attn.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, hidden)?.contiguous()?;
        let k = qkv.narrow(D::Minus1, hidden, hidden)?.contiguous()?;
        let v = qkv.narrow(D::Minus1, 2 * hidden, hidden)?.contiguous()?;

        let shape = (b, t, self.n_head, self.head_dim);
        let q = q.reshape(shape)?.transpose(1, 2)?.contiguous()?;
        let mut k = k.reshape(shape)?.transpose(1, 2)?.contiguous()?;
        let mut v = v.reshape(shape)?.transpose(1, 2)?.contiguous()?;

        if let Some((prev_k, prev_v)) = &self.kv_cache {
            k = Tensor::cat(&[prev_k, &k], 2)?.contiguous()?;
            v = Tensor::cat(&[prev_v, &v], 2)?.contiguous()?;
        }
        self.kv_cache = Some((k.clone(), v.clone()));

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut att = (q.matmul(&k.t()?)? * scale)?;
        if let Some(mask) = mask {
            att = att.broadcast_add(mask)?;
        }
        let att = softmax_last_dim(&att)?;

        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.contiguous()?.reshape((b, t, hidden))?;
        self.c_proj.forward(&y)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None;
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn new(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let c_fc = linear_from_conv1d(vb.pp("c_fc"), cfg.n_embd, 4 * cfg.n_embd)?;
        let c_proj = linear_from_conv1d(vb.pp("c_proj"), 4 * cfg.n_embd, cfg.n_embd)?;
        Ok(Self { c_fc, c_proj })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.c_proj.forward(&self.c_fc.forward(x)?.gelu()?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&mut self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, mask)?)?;
        let x = (&x + self.mlp.forward(&self.ln_2.forward(&x)?)?)?;
        Ok(x)
    }
}

/// GPT-2 with the lm head tied to the token embedding. Pre-norm blocks,
/// learned absolute position embeddings, fused QKV projection.
pub struct Gpt2Model {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
}

impl Gpt2Model {
    pub fn new(cfg: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        // Fine-tuned checkpoints exported through GPT2LMHeadModel prefix
        // everything with "transformer."; the original release does not.
        let vb = if vb.contains_tensor("wte.weight") {
            vb
        } else {
            vb.pp("transformer")
        };

        let wte = embedding(cfg.vocab_size, cfg.n_embd, vb.pp("wte"))?;
        let wpe = embedding(cfg.max_seq_len(), cfg.n_embd, vb.pp("wpe"))?;

        let vb_h = vb.pp("h");
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::new(cfg, vb_h.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let ln_f = layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_f"))?;
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
        })
    }

    /// Forward over a `[batch, seq]` id tensor, returning `[batch, seq,
    /// vocab]` logits. `pos` is the number of tokens already in the KV
    /// cache; the first call passes the whole prompt at pos 0, later
    /// calls pass only the newest token.
    pub fn forward(&mut self, input: &Tensor, pos: usize) -> Result<Tensor> {
        let (_b, t) = input.dims2()?;

        let positions =
            Tensor::arange(pos as u32, (pos + t) as u32, input.device())?.unsqueeze(0)?;
        let tok = self.wte.forward(input)?;
        let pos_emb = self.wpe.forward(&positions)?;
        let mut x = tok.broadcast_add(&pos_emb)?;

        // Single-token steps attend to the whole cache, no mask needed.
        let mask = if t > 1 {
            Some(causal_mask(t, pos + t, input.device())?)
        } else {
            None
        };

        for block in self.blocks.iter_mut() {
            x = block.forward(&x, mask.as_ref())?;
        }

        let x = self.ln_f.forward(&x)?;
        self.lm_head.forward(&x)
    }

    pub fn clear_kv_cache(&mut self) {
        for block in &mut self.blocks {
            block.attn.clear_kv_cache();
        }
    }
}

/// Lower-triangular additive mask for `t` query positions over `kv` key
/// positions, where the last `t` keys line up with the queries.
pub(crate) fn causal_mask(t: usize, kv: usize, device: &Device) -> Result<Tensor> {
    let offset = kv - t;
    let mask: Vec<f32> = (0..t)
        .flat_map(|i| {
            (0..kv).map(move |j| {
                if j > offset + i {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (t, kv), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSIC_CONFIG_JSON: &str = r#"{
        "vocab_size": 50257,
        "n_ctx": 1024,
        "n_positions": 1024,
        "n_embd": 768,
        "n_layer": 12,
        "n_head": 12,
        "layer_norm_epsilon": 1e-5,
        "eos_token_id": 50256,
        "activation_function": "gelu_new"
    }"#;

    const MODERN_CONFIG_JSON: &str = r#"{
        "vocab_size": 50257,
        "n_positions": 1024,
        "n_embd": 768,
        "n_layer": 12,
        "n_head": 12
    }"#;

    #[test]
    fn parses_classic_config() {
        let cfg: Gpt2Config = serde_json::from_str(CLASSIC_CONFIG_JSON).unwrap();
        assert_eq!(cfg.max_seq_len(), 1024);
        assert_eq!(cfg.head_dim(), 64);
        assert_eq!(cfg.eos_token_id, Some(50256));
    }

    #[test]
    fn parses_modern_config_without_n_ctx() {
        let cfg: Gpt2Config = serde_json::from_str(MODERN_CONFIG_JSON).unwrap();
        assert_eq!(cfg.max_seq_len(), 1024);
        assert!((cfg.layer_norm_epsilon - 1e-5).abs() < f64::EPSILON);
        assert_eq!(cfg.eos_token_id, None);
    }

    #[test]
    fn max_seq_len_falls_back_to_gpt2_default() {
        let cfg: Gpt2Config = serde_json::from_str(
            r#"{"vocab_size": 50257, "n_embd": 768, "n_layer": 12, "n_head": 12}"#,
        )
        .unwrap();
        assert_eq!(cfg.max_seq_len(), 1024);
    }

    #[test]
    fn causal_mask_is_lower_triangular() {
        let mask = causal_mask(3, 3, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[3, 3]);

        let rows = mask.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
        assert_eq!(rows[1], vec![0.0, 0.0, f32::NEG_INFINITY]);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn causal_mask_aligns_queries_with_cache_suffix() {
        // 2 query positions over 4 keys: queries sit at key slots 2 and 3.
        let rows = causal_mask(2, 4, &Device::Cpu)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(rows[0], vec![0.0, 0.0, 0.0, f32::NEG_INFINITY]);
        assert_eq!(rows[1], vec![0.0, 0.0, 0.0, 0.0]);
    }
}
