//! PatchModel: the sequence encoder consumed by the patching core
//!
//! Wraps a model backend (GPT-2, LLaMA) and its tokenizer behind one
//! interface: tokenize sentences, resolve target words to token ids, run a
//! forward pass that captures every layer's head outputs, and run a forward
//! pass with a single site overridden.

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::cache::ActivationCache;
use crate::error::{PatchError, Result};
use crate::forward_gpt2::PatchGpt2;
use crate::forward_llama::PatchLlama;
use crate::hooks::HookOverride;

/// Token strings that mean "not in the vocabulary"
const UNKNOWN_TOKENS: &[&str] = &["[UNK]", "<unk>", "<|unk|>"];

/// Word-start marker of SentencePiece vocabularies
const SENTENCEPIECE_SPACE: char = '\u{2581}';

/// Candidate beginning-of-sequence tokens, in lookup order
const BOS_TOKENS: &[&str] = &["<|endoftext|>", "<|begin_of_text|>", "<s>", "<bos>"];

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// GPT-2 (OpenAI), learned positions and fused QKV
    Gpt2,
    /// LLaMA-family decoders (LLaMA, Code-LLaMA, TinyLlama, Mistral)
    Llama,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        let model_lower = model_id.to_lowercase();
        if model_lower.contains("gpt2") || model_lower.contains("distilgpt") {
            ModelArchitecture::Gpt2
        } else if model_lower.contains("llama") || model_lower.contains("mistral") {
            ModelArchitecture::Llama
        } else {
            info!(
                "Unknown model architecture for '{}', defaulting to GPT-2",
                model_id
            );
            ModelArchitecture::Gpt2
        }
    }
}

/// Backend contract for patchable models.
///
/// Backends are read-only after loading: every method takes `&self`, and an
/// override passed to [`forward_with_override`](Self::forward_with_override)
/// only lives for that call. `Send + Sync` lets the sweep share one backend
/// across worker threads.
pub trait PatchBackend: Send + Sync {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn n_heads(&self) -> usize;
    fn d_head(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;

    // --- Forward passes ---

    /// Full forward pass. Returns logits `(batch, seq_len, vocab)` and the
    /// `AttnZ` activation of every layer.
    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, ActivationCache)>;

    /// Forward pass with one site overridden. Returns logits `(batch, seq_len, vocab)`.
    fn forward_with_override(&self, input_ids: &Tensor, over: &HookOverride) -> Result<Tensor>;
}

/// Tokenized sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    ids: Vec<u32>,
}

impl TokenSequence {
    pub fn new(ids: Vec<u32>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `(1, seq_len)` input tensor on `device`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(&self.ids[..], device)?.unsqueeze(0)?)
    }
}

/// High-level model wrapper for patching experiments
pub struct PatchModel {
    model: Box<dyn PatchBackend>,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
    prepend_bos: bool,
}

impl PatchModel {
    /// Wrap an already-built backend and tokenizer
    pub fn new(model: Box<dyn PatchBackend>, tokenizer: Tokenizer, device: Device) -> Self {
        Self {
            model,
            tokenizer,
            device,
            model_id: "custom".to_string(),
            prepend_bos: true,
        }
    }

    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> anyhow::Result<Self> {
        Self::from_pretrained_with_device(model_id, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(
        model_id: &str,
        force_cpu: Option<bool>,
    ) -> anyhow::Result<Self> {
        let architecture = ModelArchitecture::from_model_id(model_id);
        Self::from_pretrained_with_arch(model_id, force_cpu, architecture)
    }

    /// Load with explicit architecture specification
    pub fn from_pretrained_with_arch(
        model_id: &str,
        force_cpu: Option<bool>,
        architecture: ModelArchitecture,
    ) -> anyhow::Result<Self> {
        let device = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };

        // GPT-2 is small enough to keep in F32, which keeps patched and
        // unpatched runs numerically comparable. LLaMA-size models use BF16 on GPU.
        let dtype = match architecture {
            ModelArchitecture::Llama if device.is_cuda() => DType::BF16,
            _ => DType::F32,
        };

        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let model: Box<dyn PatchBackend> = match architecture {
            ModelArchitecture::Gpt2 => Box::new(PatchGpt2::load(model_id, &device, dtype)?),
            ModelArchitecture::Llama => Box::new(PatchLlama::load(model_id, &device, dtype)?),
        };

        Ok(Self {
            model,
            tokenizer,
            device,
            model_id: model_id.to_string(),
            prepend_bos: true,
        })
    }

    /// Whether `tokenize` prepends the tokenizer's BOS token (default: true)
    pub fn with_prepend_bos(mut self, prepend_bos: bool) -> Self {
        self.prepend_bos = prepend_bos;
        self
    }

    /// Get the model ID
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Device the model runs on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of layers in the model
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Number of attention heads per layer
    pub fn n_heads(&self) -> usize {
        self.model.n_heads()
    }

    /// Per-head dimension
    pub fn d_head(&self) -> usize {
        self.model.d_head()
    }

    /// Hidden dimension of the model
    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    /// Vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// BOS token ID, if the tokenizer has one
    pub fn bos_token_id(&self) -> Option<u32> {
        BOS_TOKENS
            .iter()
            .find_map(|token| self.tokenizer.token_to_id(token))
    }

    /// Tokenize a sentence. Deterministic: the same sentence always gives the
    /// same sequence.
    pub fn tokenize(&self, sentence: &str) -> Result<TokenSequence> {
        let encoding = self
            .tokenizer
            .encode(sentence, false)
            .map_err(|e| PatchError::Tokenization(format!("failed to tokenize {sentence:?}: {e}")))?;

        if encoding.get_ids().is_empty() {
            return Err(PatchError::Tokenization(format!(
                "{sentence:?} produced no tokens"
            )));
        }

        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if self.prepend_bos {
            match self.bos_token_id() {
                Some(bos) => ids.push(bos),
                None => debug!("Tokenizer has no BOS token, not prepending"),
            }
        }
        ids.extend_from_slice(encoding.get_ids());

        Ok(TokenSequence::new(ids))
    }

    /// Tokenize text and return token strings
    pub fn token_strings(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| PatchError::Tokenization(format!("failed to tokenize {text:?}: {e}")))?;
        Ok(encoding.get_tokens().to_vec())
    }

    /// Resolve a literal token string (e.g. `" are"`) to its single token ID
    ///
    /// SentencePiece tokenizers (LLaMA family) mark word starts with `▁`
    /// themselves and split `" are"` into two pieces. When the text starts
    /// with a space and does not resolve as given, the word without that
    /// space is accepted if it maps to a single `▁`-prefixed token.
    pub fn token_id(&self, text: &str) -> Result<u32> {
        let err = match self.single_token(text) {
            Ok((id, _)) => return Ok(id),
            Err(e) => e,
        };
        if let Some(word) = text.strip_prefix(' ') {
            if let Ok((id, token)) = self.single_token(word) {
                if token.starts_with(SENTENCEPIECE_SPACE) {
                    debug!("Resolved {:?} as SentencePiece token {:?}", text, token);
                    return Ok(id);
                }
            }
        }
        Err(err)
    }

    fn single_token(&self, text: &str) -> Result<(u32, String)> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| PatchError::Tokenization(format!("failed to tokenize {text:?}: {e}")))?;

        let ids = encoding.get_ids();
        if ids.len() != 1 {
            return Err(PatchError::Tokenization(format!(
                "{text:?} maps to {} tokens {:?}, expected exactly one",
                ids.len(),
                encoding.get_tokens()
            )));
        }

        let token = &encoding.get_tokens()[0];
        if UNKNOWN_TOKENS.contains(&token.as_str()) {
            return Err(PatchError::Tokenization(format!(
                "{text:?} is not in the vocabulary"
            )));
        }

        let id = ids[0];
        if id as usize >= self.vocab_size() {
            return Err(PatchError::Tokenization(format!(
                "token ID {id} for {text:?} is outside the model vocabulary ({})",
                self.vocab_size()
            )));
        }
        Ok((id, token.clone()))
    }

    /// Decode a token ID to string
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    /// Forward pass capturing every layer's head outputs
    ///
    /// Returns logits `(1, seq_len, vocab)` and the activation cache.
    pub fn forward_with_cache(&self, tokens: &TokenSequence) -> Result<(Tensor, ActivationCache)> {
        let input = tokens.to_tensor(&self.device)?;
        self.model.forward_with_cache(&input)
    }

    /// Forward pass with one site overridden, returning logits `(1, seq_len, vocab)`
    pub fn forward_with_override(
        &self,
        tokens: &TokenSequence,
        over: &HookOverride,
    ) -> Result<Tensor> {
        let layer = over.site.layer();
        if layer >= self.n_layers() {
            return Err(PatchError::Config(format!(
                "override site {} out of range (model has {} layers)",
                over.site,
                self.n_layers()
            )));
        }
        let input = tokens.to_tensor(&self.device)?;
        self.model.forward_with_override(&input, over)
    }
}
