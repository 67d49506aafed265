//! Experiment runner for multi-pair patching experiments
//!
//! Resolves the target tokens once, sweeps every pair, then aggregates the
//! per-pair score matrices into per-head statistics and a protection mask.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::statistics::Statistics;
use tracing::info;

use crate::config::PatchingConfig;
use crate::metric::TargetTokens;
use crate::model::PatchModel;
use crate::pairs::MinimalPair;
use crate::patching::HeadCoord;
use crate::protection::{compute_mask_coverage, mask_to_dict};
use crate::ranking::{get_critical_heads, rank_heads, RankedHead};
use crate::sweep::{PatchingResult, ScoreMatrix, SweepConfig, SweepDriver, TraversalOrder};

/// One pair and its sweep result
#[derive(Debug, Clone, Serialize)]
pub struct PairResult {
    pub pair: MinimalPair,
    pub result: PatchingResult,
}

/// Aggregated results of an experiment
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResults {
    pub model_id: String,
    pub config: PatchingConfig,
    pub per_pair: Vec<PairResult>,
    /// Per-head mean score across pairs
    pub mean_scores: ScoreMatrix,
    /// Per-head sample standard deviation across pairs (0 for a single pair)
    pub std_scores: ScoreMatrix,
    /// Two-sided one-sample t-test p-value per head (H0: mean effect is 0), row-major
    pub p_values: Vec<f64>,
    /// Heads ranked by mean score
    pub ranked_heads: Vec<RankedHead>,
    pub critical_heads: Vec<HeadCoord>,
    pub mask: BTreeMap<usize, Vec<usize>>,
    pub coverage: f64,
}

/// Main experiment runner
pub struct Experiment {
    config: PatchingConfig,
    model: PatchModel,
}

impl Experiment {
    /// Create a new experiment
    pub fn new(model: PatchModel, config: PatchingConfig) -> Self {
        let model = model.with_prepend_bos(config.prepend_bos);
        Self { config, model }
    }

    pub fn model(&self) -> &PatchModel {
        &self.model
    }

    /// Run the sweep on every pair and aggregate
    pub fn run(&self, pairs: &[MinimalPair]) -> Result<ExperimentResults> {
        self.config.validate()?;
        anyhow::ensure!(!pairs.is_empty(), "no minimal pairs to patch");

        info!("Starting patching experiment");
        info!("Config: {:?}", self.config);

        let targets = TargetTokens::resolve(
            &self.model,
            &self.config.target_correct,
            &self.config.target_incorrect,
        )
        .context("Failed to resolve target tokens")?;

        let sweep_config = SweepConfig {
            order: TraversalOrder::RowMajor,
            parallel: self.config.parallel,
        };

        let mut per_pair = Vec::with_capacity(pairs.len());
        for (i, pair) in pairs.iter().enumerate() {
            info!("Pair {}/{}: {:?} / {:?}", i + 1, pairs.len(), pair.clean, pair.corrupted);
            let result = SweepDriver::new(&self.model, targets)
                .with_config(sweep_config)
                .run(pair)
                .with_context(|| format!("Patching failed for pair {i} ({:?} / {:?})", pair.clean, pair.corrupted))?;

            if let Some(best) = result.scores.argmax() {
                info!(
                    "Pair {}: clean={:.3}, corrupted={:.3}, top head {} ({:.3})",
                    i,
                    result.clean_logit_diff,
                    result.corrupted_logit_diff,
                    best,
                    result.scores.get(best.layer, best.head).unwrap_or(f32::NAN)
                );
            }
            per_pair.push(PairResult {
                pair: pair.clone(),
                result,
            });
        }

        let (n_layers, n_heads) = (self.model.n_layers(), self.model.n_heads());
        let n_cells = n_layers * n_heads;
        let mut means = Vec::with_capacity(n_cells);
        let mut stds = Vec::with_capacity(n_cells);
        let mut p_values = Vec::with_capacity(n_cells);

        for cell in 0..n_cells {
            let values: Vec<f64> = per_pair
                .iter()
                .map(|p| p.result.scores.values()[cell] as f64)
                .collect();
            let stats = cell_statistics(&values);
            means.push(stats.mean as f32);
            stds.push(stats.std_dev as f32);
            p_values.push(stats.p_value);
        }

        let mean_scores = ScoreMatrix::from_vec(n_layers, n_heads, means)?;
        let std_scores = ScoreMatrix::from_vec(n_layers, n_heads, stds)?;
        let ranked_heads = rank_heads(&mean_scores);
        let critical_heads = get_critical_heads(&mean_scores, self.config.percentile)?;
        let mask = mask_to_dict(&critical_heads);
        let coverage = compute_mask_coverage(&critical_heads, n_layers, n_heads);

        info!(
            "{} critical heads at the {}th percentile ({:.1}% coverage)",
            critical_heads.len(),
            self.config.percentile,
            coverage * 100.0
        );

        Ok(ExperimentResults {
            model_id: self.model.model_id().to_string(),
            config: self.config.clone(),
            per_pair,
            mean_scores,
            std_scores,
            p_values,
            ranked_heads,
            critical_heads,
            mask,
            coverage,
        })
    }
}

struct CellStatistics {
    mean: f64,
    std_dev: f64,
    p_value: f64,
}

fn cell_statistics(values: &[f64]) -> CellStatistics {
    let n = values.len() as f64;
    let mean = values.iter().mean();
    if values.len() < 2 {
        return CellStatistics {
            mean,
            std_dev: 0.0,
            p_value: 1.0,
        };
    }

    let std_dev = values.iter().std_dev();
    let se = std_dev / n.sqrt();
    let t = if se > 0.0 { mean / se } else { 0.0 };
    let p_value = StudentsT::new(0.0, 1.0, n - 1.0)
        .map(|dist| 2.0 * (1.0 - dist.cdf(t.abs())))
        .unwrap_or(1.0);

    CellStatistics {
        mean,
        std_dev,
        p_value,
    }
}
