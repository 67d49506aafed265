// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i32 in plot coordinates
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // PatchModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! sva-patch: activation patching for subject-verb agreement
//!
//! Localizes the attention heads a transformer uses to make a verb agree
//! with its subject. For a minimal pair (plural "clean" sentence, singular
//! "corrupted" sentence) every head's clean output is restored into the
//! corrupted run in turn, and the shift in `logit(" are") - logit(" is")`
//! is recorded in a `n_layers x n_heads` score matrix.
//!
//! ## Architecture
//!
//! - `model`: PatchModel wrapper (tokenizer + backend) and the PatchBackend trait
//! - `forward_gpt2`: GPT-2 forward pass with head-output capture and override
//! - `forward_llama`: LLaMA forward pass with head-output capture and override
//! - `hooks`: Hook sites and override directives
//! - `cache`: ActivationCache for captured head outputs
//! - `masks`: Shared causal mask cache
//! - `patching`: Clean/corrupted capture and the single-head patch executor
//! - `metric`: Logit difference and target-token resolution
//! - `sweep`: The (layer, head) sweep, score matrix and PatchingResult
//! - `ranking`: Head ranking and percentile thresholds
//! - `protection`: Protection masks from critical heads
//! - `heatmap`: Score-matrix heatmap rendering with plotters
//! - `pairs`: Minimal pair loading and seeded generation
//! - `config`: PatchingConfig
//! - `experiment`: Multi-pair experiment runner with per-head statistics

pub mod cache;
pub mod config;
pub mod error;
pub mod experiment;
pub mod forward_gpt2;
pub mod forward_llama;
pub mod heatmap;
pub mod hooks;
pub mod masks;
pub mod metric;
pub mod model;
pub mod pairs;
pub mod patching;
pub mod protection;
pub mod ranking;
pub mod sweep;

#[doc(hidden)]
pub mod test_support;

pub use cache::ActivationCache;
pub use config::PatchingConfig;
pub use error::{PatchError, Result};
pub use experiment::{Experiment, ExperimentResults, PairResult};
pub use forward_gpt2::{Gpt2Config, PatchGpt2};
pub use forward_llama::{LlamaConfig, PatchLlama};
pub use heatmap::{plot_patching_heatmap, HeatmapOptions};
pub use hooks::{apply_override, HookOverride, HookSite, OverrideDirective};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use metric::{logit_difference, mean_logit_difference, per_prompt_logit_difference, TargetTokens};
pub use model::{ModelArchitecture, PatchBackend, PatchModel, TokenSequence};
pub use pairs::{generate_minimal_pairs, MinimalPair, PairGenerator, PairSet};
pub use patching::{capture_runs, CapturedRuns, HeadCoord, PatchExecutor};
pub use protection::{compute_mask_coverage, mask_to_dict};
pub use ranking::{get_critical_heads, percentile, rank_heads, RankedHead};
pub use sweep::{
    run_activation_patching, CancelFlag, PatchingResult, ScoreMatrix, SweepConfig, SweepDriver,
    SweepState, TraversalOrder,
};
