//! Logit-difference metric and target-token resolution

use candle_core::{DType, IndexOp, Tensor};
use tracing::info;

use crate::error::{PatchError, Result};
use crate::model::PatchModel;

/// The two verb forms whose logits are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetTokens {
    pub correct: u32,
    pub incorrect: u32,
}

impl TargetTokens {
    /// Resolve both target words (e.g. `" are"`, `" is"`) to single token IDs
    pub fn resolve(model: &PatchModel, correct: &str, incorrect: &str) -> Result<Self> {
        let correct_id = model.token_id(correct)?;
        let incorrect_id = model.token_id(incorrect)?;
        if correct_id == incorrect_id {
            return Err(PatchError::Config(format!(
                "{correct:?} and {incorrect:?} resolve to the same token ID {correct_id}"
            )));
        }
        info!(
            "Target tokens: {:?} -> {}, {:?} -> {}",
            correct, correct_id, incorrect, incorrect_id
        );
        Ok(Self {
            correct: correct_id,
            incorrect: incorrect_id,
        })
    }

    /// Logit difference of these targets at the final position of `logits`
    pub fn logit_difference(&self, logits: &Tensor) -> Result<f32> {
        logit_difference(logits, self.correct, self.incorrect)
    }
}

/// `logits[0, -1, correct] - logits[0, -1, incorrect]`, computed in f32.
///
/// Positive means the model prefers the correct form at the final position.
pub fn logit_difference(logits: &Tensor, correct_id: u32, incorrect_id: u32) -> Result<f32> {
    let (_b, seq_len, vocab) = logits.dims3()?;
    if seq_len == 0 {
        return Err(PatchError::Config("logits have an empty sequence".into()));
    }
    for id in [correct_id, incorrect_id] {
        if id as usize >= vocab {
            return Err(PatchError::Config(format!(
                "token ID {id} outside logits vocabulary ({vocab})"
            )));
        }
    }

    let last = logits.i((0, seq_len - 1))?.to_dtype(DType::F32)?;
    let correct = last.i(correct_id as usize)?.to_scalar::<f32>()?;
    let incorrect = last.i(incorrect_id as usize)?.to_scalar::<f32>()?;
    Ok(correct - incorrect)
}

/// Final-position logit difference for every prompt of a batch
///
/// `logits` is `(batch, seq_len, vocab)`; `answer_ids[i]` is the
/// `(correct, incorrect)` pair for prompt `i`.
pub fn per_prompt_logit_difference(logits: &Tensor, answer_ids: &[(u32, u32)]) -> Result<Vec<f32>> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    if answer_ids.len() != batch {
        return Err(PatchError::Config(format!(
            "{} answer pairs for a batch of {batch}",
            answer_ids.len()
        )));
    }
    if seq_len == 0 {
        return Err(PatchError::Config("logits have an empty sequence".into()));
    }

    let final_logits = logits.i((.., seq_len - 1))?.to_dtype(DType::F32)?;
    let rows: Vec<Vec<f32>> = final_logits.to_vec2()?;

    rows.iter()
        .zip(answer_ids)
        .map(|(row, &(correct, incorrect))| {
            let (c, i) = (correct as usize, incorrect as usize);
            if c >= vocab || i >= vocab {
                return Err(PatchError::Config(format!(
                    "answer pair ({correct}, {incorrect}) outside logits vocabulary ({vocab})"
                )));
            }
            Ok(row[c] - row[i])
        })
        .collect()
}

/// Mean of [`per_prompt_logit_difference`] over the batch
pub fn mean_logit_difference(logits: &Tensor, answer_ids: &[(u32, u32)]) -> Result<f32> {
    let diffs = per_prompt_logit_difference(logits, answer_ids)?;
    if diffs.is_empty() {
        return Err(PatchError::Config("empty batch".into()));
    }
    Ok(diffs.iter().sum::<f32>() / diffs.len() as f32)
}
