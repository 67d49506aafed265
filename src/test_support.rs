//! Tiny deterministic GPT-2 and word-level tokenizer
//!
//! Shared by the unit tests and `tests/integration.rs` so that both exercise
//! the same checkpoint without downloads.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;

use crate::forward_gpt2::{Gpt2Config, PatchGpt2};
use crate::model::PatchModel;

pub const VOCAB: &[&str] = &[
    "<|endoftext|>",
    "[UNK]",
    "the",
    "keys",
    "key",
    "to",
    "cabinet",
    "old",
    "are",
    "is",
    "dogs",
    "dog",
    "near",
    "tree",
    "cats",
    "cat",
    "by",
    "house",
    "on",
    "table",
    "authors",
    "author",
    "of",
    "book",
];

pub fn tiny_config() -> Gpt2Config {
    Gpt2Config {
        vocab_size: VOCAB.len(),
        n_positions: 16,
        n_embd: 16,
        n_layer: 3,
        n_head: 4,
        layer_norm_epsilon: 1e-5,
    }
}

/// Lowercasing whitespace tokenizer over [`VOCAB`]
pub fn word_level_tokenizer() -> Result<Tokenizer> {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, word)| (word.to_string(), serde_json::json!(i)))
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 0,
            "content": "<|endoftext|>",
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": { "type": "Lowercase" },
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
    });
    Tokenizer::from_bytes(json.to_string().as_bytes())
        .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))
}

fn weights(shape: &[usize], seed: usize, scale: f32, offset: f32) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n)
        .map(|i| offset + scale * ((seed * 7919 + i) as f32 * 0.618).sin())
        .collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

/// Checkpoint tensors for [`tiny_config`], every name starting with `prefix`
/// (`""` or `"transformer."`)
pub fn tiny_gpt2_tensors(prefix: &str) -> Result<HashMap<String, Tensor>> {
    let config = tiny_config();
    let d = config.n_embd;
    let mut tensors = HashMap::new();
    let mut seed = 0;
    let mut put = |name: String, shape: &[usize], scale: f32, offset: f32| -> Result<()> {
        seed += 1;
        tensors.insert(format!("{prefix}{name}"), weights(shape, seed, scale, offset)?);
        Ok(())
    };

    put("wte.weight".into(), &[config.vocab_size, d], 0.8, 0.0)?;
    put("wpe.weight".into(), &[config.n_positions, d], 0.3, 0.0)?;
    for i in 0..config.n_layer {
        let p = format!("h.{i}");
        put(format!("{p}.ln_1.weight"), &[d], 0.1, 1.0)?;
        put(format!("{p}.ln_1.bias"), &[d], 0.05, 0.0)?;
        put(format!("{p}.attn.c_attn.weight"), &[d, 3 * d], 0.5, 0.0)?;
        put(format!("{p}.attn.c_attn.bias"), &[3 * d], 0.05, 0.0)?;
        put(format!("{p}.attn.c_proj.weight"), &[d, d], 0.4, 0.0)?;
        put(format!("{p}.attn.c_proj.bias"), &[d], 0.05, 0.0)?;
        put(format!("{p}.ln_2.weight"), &[d], 0.1, 1.0)?;
        put(format!("{p}.ln_2.bias"), &[d], 0.05, 0.0)?;
        put(format!("{p}.mlp.c_fc.weight"), &[d, 4 * d], 0.3, 0.0)?;
        put(format!("{p}.mlp.c_fc.bias"), &[4 * d], 0.05, 0.0)?;
        put(format!("{p}.mlp.c_proj.weight"), &[4 * d, d], 0.2, 0.0)?;
        put(format!("{p}.mlp.c_proj.bias"), &[d], 0.05, 0.0)?;
    }
    put("ln_f.weight".into(), &[d], 0.1, 1.0)?;
    put("ln_f.bias".into(), &[d], 0.05, 0.0)?;
    Ok(tensors)
}

pub fn tiny_gpt2() -> Result<PatchGpt2> {
    let vb = VarBuilder::from_tensors(tiny_gpt2_tensors("")?, DType::F32, &Device::Cpu);
    PatchGpt2::new(&tiny_config(), vb)
}

pub fn tiny_model() -> Result<PatchModel> {
    Ok(PatchModel::new(
        Box::new(tiny_gpt2()?),
        word_level_tokenizer()?,
        Device::Cpu,
    ))
}
