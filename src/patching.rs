//! Clean-run capture and single-head patching
//!
//! One patching experiment needs two unpatched runs (clean and corrupted) and
//! then one patched corrupted run per head. [`capture_runs`] performs the
//! unpatched runs; [`PatchExecutor`] performs the patched ones.

use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::ActivationCache;
use crate::error::{PatchError, Result};
use crate::hooks::HookOverride;
use crate::model::{PatchModel, TokenSequence};
use crate::pairs::MinimalPair;

/// One attention head: `(layer, head)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeadCoord {
    pub layer: usize,
    pub head: usize,
}

impl HeadCoord {
    pub fn new(layer: usize, head: usize) -> Self {
        Self { layer, head }
    }
}

impl fmt::Display for HeadCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer {}, head {}", self.layer, self.head)
    }
}

/// Results of the two unpatched runs of a minimal pair
pub struct CapturedRuns {
    /// Clean logits `(1, seq_len, vocab)`
    pub clean_logits: Tensor,
    /// Head outputs of every layer on the clean sentence
    pub clean_cache: ActivationCache,
    /// Corrupted logits `(1, seq_len, vocab)`
    pub corrupted_logits: Tensor,
    pub corrupted_tokens: TokenSequence,
}

/// Tokenize both sentences and run them unpatched.
///
/// The corrupted run's activations are not needed later, only its logits and
/// tokens are kept.
pub fn capture_runs(model: &PatchModel, pair: &MinimalPair) -> Result<CapturedRuns> {
    let clean_tokens = model.tokenize(&pair.clean)?;
    let corrupted_tokens = model.tokenize(&pair.corrupted)?;
    debug!(
        "Tokenized pair: clean={} tokens, corrupted={} tokens",
        clean_tokens.len(),
        corrupted_tokens.len()
    );

    let (clean_logits, clean_cache) = model.forward_with_cache(&clean_tokens)?;
    let (corrupted_logits, _) = model.forward_with_cache(&corrupted_tokens)?;

    Ok(CapturedRuns {
        clean_logits,
        clean_cache,
        corrupted_logits,
        corrupted_tokens,
    })
}

/// Runs the corrupted sentence with one head restored from the clean run
pub struct PatchExecutor<'a> {
    model: &'a PatchModel,
    clean_cache: &'a ActivationCache,
    corrupted_tokens: &'a TokenSequence,
}

impl<'a> PatchExecutor<'a> {
    pub fn new(
        model: &'a PatchModel,
        clean_cache: &'a ActivationCache,
        corrupted_tokens: &'a TokenSequence,
    ) -> Self {
        Self {
            model,
            clean_cache,
            corrupted_tokens,
        }
    }

    /// Build the override that restores `coord` from the clean cache
    pub fn override_for(&self, coord: HeadCoord) -> Result<HookOverride> {
        if coord.layer >= self.model.n_layers() || coord.head >= self.model.n_heads() {
            return Err(PatchError::Config(format!(
                "{coord} out of range for a {}x{} model",
                self.model.n_layers(),
                self.model.n_heads()
            )));
        }
        let values = self.clean_cache.head_slice(coord.layer, coord.head)?;
        Ok(HookOverride::patch_head(coord.layer, coord.head, values))
    }

    /// Patched corrupted logits `(1, seq_len, vocab)` for one head.
    ///
    /// Errors are not tagged with `coord`; the sweep does that.
    pub fn run(&self, coord: HeadCoord) -> Result<Tensor> {
        let over = self.override_for(coord)?;
        self.model.forward_with_override(self.corrupted_tokens, &over)
    }
}
