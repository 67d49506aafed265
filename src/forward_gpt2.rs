//! GPT-2 forward pass with per-head output capture and override
//!
//! Runs layer by layer so the per-head attention output (`hook_z`, the
//! attention-weighted values before `c_proj`) of every layer can be captured
//! or overridden.
//!
//! GPT-2 specifics:
//! - fused QKV projection (`c_attn`) stored as Conv1D, i.e. `(in, out)` weights
//! - learned absolute position embeddings
//! - pre-LayerNorm blocks, tanh-approximated GELU
//! - LM head tied to the token embedding

use anyhow::Context;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use crate::cache::ActivationCache;
use crate::error::{PatchError, Result};
use crate::hooks::{maybe_override, HookOverride, HookSite};
use crate::masks::create_causal_mask;
use crate::model::PatchBackend;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    /// GPT-2 small (124M): 12 layers, 12 heads, 768 hidden
    pub fn gpt2_small() -> Self {
        Self {
            vocab_size: 50257,
            n_positions: 1024,
            n_embd: 768,
            n_layer: 12,
            n_head: 12,
            layer_norm_epsilon: 1e-5,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}

/// HuggingFace `Conv1D`: a linear layer with `(in, out)` weight layout
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(n_in: usize, n_out: usize, vb: VarBuilder) -> anyhow::Result<Self> {
        let weight = vb.get((n_in, n_out), "weight")?;
        let bias = vb.get(n_out, "bias")?;
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Causal self-attention with the head outputs exposed as `AttnZ(layer)`
struct Attention {
    c_attn: Conv1D,
    c_proj: Conv1D,
    layer: usize,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config, layer: usize) -> anyhow::Result<Self> {
        let c_attn = Conv1D::load(config.n_embd, 3 * config.n_embd, vb.pp("c_attn"))?;
        let c_proj = Conv1D::load(config.n_embd, config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            layer,
            num_heads: config.n_head,
            head_dim: config.head_dim(),
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cache: Option<&mut ActivationCache>,
        over: Option<&HookOverride>,
    ) -> Result<Tensor> {
        let (b, seq_len, d_model) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * d_model, d_model)?
                .reshape((b, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        // z: [batch, seq, heads, head_dim]
        let z = attn_weights.matmul(&v)?.transpose(1, 2)?.contiguous()?;

        // INTERVENTION POINT: hook_z
        let site = HookSite::AttnZ(self.layer);
        let z = maybe_override(z, site, over)?;
        if let Some(cache) = cache {
            cache.store(site, z.clone());
        }

        let z = z.reshape((b, seq_len, d_model))?;
        self.c_proj.forward(&z)
    }
}

/// MLP block (GPT-2 style: Conv1D, GELU, Conv1D)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    c_fc: Conv1D,
    c_proj: Conv1D,
}

impl MLP {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> anyhow::Result<Self> {
        let hidden = 4 * config.n_embd;
        Ok(Self {
            c_fc: Conv1D::load(config.n_embd, hidden, vb.pp("c_fc"))?,
            c_proj: Conv1D::load(hidden, config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        self.c_proj.forward(&hidden)
    }
}

/// Single transformer block
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: MLP,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config, layer: usize) -> anyhow::Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config, layer)?,
            ln_2: layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        cache: Option<&mut ActivationCache>,
        over: Option<&HookOverride>,
    ) -> Result<Tensor> {
        let residual = x;
        let h = self.ln_1.forward(x)?;
        let h = self.attn.forward(&h, cache, over)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.ln_2.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok((residual + h)?)
    }
}

/// GPT-2 with per-layer head-output capture and override
pub struct PatchGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    /// Tied LM head: `wte` transposed, shape `(n_embd, vocab)`
    lm_head: Tensor,
    config: Gpt2Config,
}

impl PatchGpt2 {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> anyhow::Result<Self> {
        info!("Loading GPT-2 from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Gpt2Config = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} heads, {} hidden, {} vocab",
            config.n_layer, config.n_head, config.n_embd, config.vocab_size
        );

        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };
        Self::new(&config, vb)
    }

    /// Build the model from a VarBuilder holding GPT-2 weights
    ///
    /// Accepts both the bare checkpoint layout (`wte.weight`, `h.0...`) and
    /// the `transformer.`-prefixed layout.
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> anyhow::Result<Self> {
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(
                Block::load(vb.pp(format!("h.{i}")), config, i)
                    .with_context(|| format!("Failed to load block {i}"))?,
            );
        }

        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        let lm_head = wte.embeddings().t()?.contiguous()?;

        info!(
            "Model loaded successfully with {} layers (vocab_size: {})",
            config.n_layer, config.vocab_size
        );

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config: config.clone(),
        })
    }

    fn run(
        &self,
        input_ids: &Tensor,
        mut cache: Option<&mut ActivationCache>,
        over: Option<&HookOverride>,
    ) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.n_positions {
            return Err(PatchError::Tokenization(format!(
                "sequence of {seq_len} tokens exceeds context length {}",
                self.config.n_positions
            )));
        }

        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let mut hidden = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;

        for block in &self.blocks {
            hidden = block.forward(&hidden, cache.as_deref_mut(), over)?;
        }

        let hidden = self.ln_f.forward(&hidden)?;
        debug!("GPT-2 forward done (seq_len={})", seq_len);
        Ok(hidden.broadcast_matmul(&self.lm_head)?)
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }
}

impl PatchBackend for PatchGpt2 {
    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn n_heads(&self) -> usize {
        self.config.n_head
    }

    fn d_head(&self) -> usize {
        self.config.head_dim()
    }

    fn d_model(&self) -> usize {
        self.config.n_embd
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)> {
        let mut cache = ActivationCache::new();
        let logits = self.run(input_ids, Some(&mut cache), None)?;
        Ok((logits, cache))
    }

    fn forward_with_override(&self, input_ids: &Tensor, over: &HookOverride) -> Result<Tensor> {
        self.run(input_ids, None, Some(over))
    }
}
