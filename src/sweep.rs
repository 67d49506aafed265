//! The activation-patching sweep over every (layer, head)
//!
//! ```text
//! for layer in 0..n_layers:
//!     for head in 0..n_heads:
//!         patched = corrupted run with (layer, head) restored from clean
//!         scores[layer][head] = logit_diff(patched) - logit_diff(corrupted)
//! ```
//!
//! Every cell is independent of every other, so traversal order and
//! parallelism do not change the matrix. A sweep either visits every
//! coordinate or fails; partial matrices are never returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PatchError, Result};
use crate::metric::TargetTokens;
use crate::model::PatchModel;
use crate::pairs::MinimalPair;
use crate::patching::{capture_runs, HeadCoord, PatchExecutor};

/// Row-major `n_layers x n_heads` matrix of patching effects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreMatrix {
    n_layers: usize,
    n_heads: usize,
    data: Vec<f32>,
}

impl ScoreMatrix {
    pub fn zeros(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            data: vec![0.0; n_layers * n_heads],
        }
    }

    /// Build from row-major values; `data.len()` must be `n_layers * n_heads`
    pub fn from_vec(n_layers: usize, n_heads: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != n_layers * n_heads {
            return Err(PatchError::Config(format!(
                "{} values for a {n_layers}x{n_heads} score matrix",
                data.len()
            )));
        }
        Ok(Self {
            n_layers,
            n_heads,
            data,
        })
    }

    /// `(n_layers, n_heads)`
    pub fn shape(&self) -> (usize, usize) {
        (self.n_layers, self.n_heads)
    }

    pub fn get(&self, layer: usize, head: usize) -> Option<f32> {
        if layer < self.n_layers && head < self.n_heads {
            Some(self.data[layer * self.n_heads + head])
        } else {
            None
        }
    }

    fn set(&mut self, coord: HeadCoord, value: f32) {
        self.data[coord.layer * self.n_heads + coord.head] = value;
    }

    /// Row-major values
    pub fn values(&self) -> &[f32] {
        &self.data
    }

    /// One row per layer
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks(self.n_heads.max(1)).take(self.n_layers)
    }

    /// All cells in row-major order with their coordinates
    pub fn iter(&self) -> impl Iterator<Item = (HeadCoord, f32)> + '_ {
        let n_heads = self.n_heads;
        self.data
            .iter()
            .enumerate()
            .map(move |(i, &v)| (HeadCoord::new(i / n_heads, i % n_heads), v))
    }

    /// First coordinate holding the largest score
    pub fn argmax(&self) -> Option<HeadCoord> {
        let mut best: Option<(HeadCoord, f32)> = None;
        for (coord, v) in self.iter() {
            if best.map_or(true, |(_, b)| v > b) {
                best = Some((coord, v));
            }
        }
        best.map(|(coord, _)| coord)
    }

    pub fn max(&self) -> Option<f32> {
        self.argmax().and_then(|c| self.get(c.layer, c.head))
    }

    pub fn min(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::min)
    }
}

/// Score matrix and baselines of one sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchingResult {
    pub scores: ScoreMatrix,
    pub clean_logit_diff: f32,
    pub corrupted_logit_diff: f32,
}

/// Order in which coordinates are visited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalOrder {
    /// Layer-major, head-minor
    #[default]
    RowMajor,
    Reverse,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepConfig {
    pub order: TraversalOrder,
    /// Spread coordinates over the rayon thread pool
    pub parallel: bool,
}

/// Lifecycle of a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    NotStarted,
    Running(HeadCoord),
    Completed,
    Aborted,
}

/// Shared flag a caller sets to stop a running sweep
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives the patching sweep for one minimal pair
pub struct SweepDriver<'a> {
    model: &'a PatchModel,
    targets: TargetTokens,
    config: SweepConfig,
    cancel: CancelFlag,
    state: Arc<Mutex<SweepState>>,
}

impl<'a> SweepDriver<'a> {
    pub fn new(model: &'a PatchModel, targets: TargetTokens) -> Self {
        Self {
            model,
            targets,
            config: SweepConfig::default(),
            cancel: CancelFlag::new(),
            state: Arc::new(Mutex::new(SweepState::NotStarted)),
        }
    }

    pub fn with_config(mut self, config: SweepConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle for cancelling this sweep from another thread
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> SweepState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SweepState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Coordinates in visiting order
    pub fn coordinates(&self) -> Vec<HeadCoord> {
        let mut coords: Vec<HeadCoord> = (0..self.model.n_layers())
            .flat_map(|layer| (0..self.model.n_heads()).map(move |head| HeadCoord::new(layer, head)))
            .collect();
        if self.config.order == TraversalOrder::Reverse {
            coords.reverse();
        }
        coords
    }

    /// Run the full sweep for `pair`
    pub fn run(&self, pair: &MinimalPair) -> Result<PatchingResult> {
        let result = self.run_inner(pair);
        self.set_state(if result.is_ok() {
            SweepState::Completed
        } else {
            SweepState::Aborted
        });
        result
    }

    fn run_inner(&self, pair: &MinimalPair) -> Result<PatchingResult> {
        let runs = capture_runs(self.model, pair)?;
        let clean_logit_diff = self.targets.logit_difference(&runs.clean_logits)?;
        let corrupted_logit_diff = self.targets.logit_difference(&runs.corrupted_logits)?;
        info!(
            "Baselines: clean={:.4}, corrupted={:.4}",
            clean_logit_diff, corrupted_logit_diff
        );

        let executor = PatchExecutor::new(self.model, &runs.clean_cache, &runs.corrupted_tokens);
        let coords = self.coordinates();
        let total = coords.len();

        let score = |coord: HeadCoord| -> Result<(HeadCoord, f32)> {
            let logits = executor.run(coord).map_err(|e| e.at(coord))?;
            let diff = self
                .targets
                .logit_difference(&logits)
                .map_err(|e| e.at(coord))?;
            let effect = diff - corrupted_logit_diff;
            debug!("{}: {:.4}", coord, effect);
            Ok((coord, effect))
        };

        let cells: Vec<(HeadCoord, f32)> = if self.config.parallel {
            if let Some(&first) = coords.first() {
                self.set_state(SweepState::Running(first));
            }
            coords
                .par_iter()
                .map(|&coord| {
                    if self.cancel.is_cancelled() {
                        return Err(PatchError::Cancelled {
                            completed: 0,
                            total,
                        });
                    }
                    score(coord)
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            let mut cells = Vec::with_capacity(total);
            for (completed, &coord) in coords.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(PatchError::Cancelled { completed, total });
                }
                self.set_state(SweepState::Running(coord));
                cells.push(score(coord)?);
                if coord.head + 1 == self.model.n_heads() {
                    debug!("Finished layer {}", coord.layer);
                }
            }
            cells
        };

        let mut scores = ScoreMatrix::zeros(self.model.n_layers(), self.model.n_heads());
        for (coord, value) in cells {
            scores.set(coord, value);
        }

        Ok(PatchingResult {
            scores,
            clean_logit_diff,
            corrupted_logit_diff,
        })
    }
}

/// Sweep every head of `model` for one pair with the default configuration
pub fn run_activation_patching(
    model: &PatchModel,
    pair: &MinimalPair,
    targets: TargetTokens,
) -> Result<PatchingResult> {
    SweepDriver::new(model, targets).run(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tiny_model;
    use serial_test::serial;

    fn targets(model: &PatchModel) -> TargetTokens {
        TargetTokens::resolve(model, " are", " is").unwrap()
    }

    #[test]
    fn test_score_matrix_accessors() {
        let m = ScoreMatrix::from_vec(2, 3, vec![0.1, 0.5, -1.0, 0.5, 0.2, 0.0]).unwrap();
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m.get(1, 0), Some(0.5));
        assert_eq!(m.get(2, 0), None);
        assert_eq!(m.argmax(), Some(HeadCoord::new(0, 1)));
        assert_eq!(m.max(), Some(0.5));
        assert_eq!(m.min(), Some(-1.0));
        assert_eq!(m.rows().count(), 2);
        assert!(ScoreMatrix::from_vec(2, 3, vec![0.0; 5]).is_err());
    }

    #[test]
    #[serial]
    fn test_sweep_shape_and_state() {
        let model = tiny_model().unwrap();
        let driver = SweepDriver::new(&model, targets(&model));
        assert_eq!(driver.state(), SweepState::NotStarted);

        let result = driver
            .run(&MinimalPair::new("the keys to the cabinet", "the key to the cabinet"))
            .unwrap();
        assert_eq!(result.scores.shape(), (model.n_layers(), model.n_heads()));
        assert!(result.scores.values().iter().all(|v| v.is_finite()));
        assert_eq!(driver.state(), SweepState::Completed);
    }

    #[test]
    #[serial]
    fn test_identical_sentences_give_zero_matrix() {
        let model = tiny_model().unwrap();
        let sentence = "the dogs near the tree";
        let result = run_activation_patching(
            &model,
            &MinimalPair::new(sentence, sentence),
            targets(&model),
        )
        .unwrap();
        assert_eq!(result.clean_logit_diff, result.corrupted_logit_diff);
        assert!(result.scores.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    #[serial]
    fn test_order_and_parallelism_do_not_change_scores() {
        let model = tiny_model().unwrap();
        let pair = MinimalPair::new("the cats on the table", "the cat on the table");
        let t = targets(&model);

        let base = SweepDriver::new(&model, t).run(&pair).unwrap();
        let reversed = SweepDriver::new(&model, t)
            .with_config(SweepConfig {
                order: TraversalOrder::Reverse,
                parallel: false,
            })
            .run(&pair)
            .unwrap();
        let parallel = SweepDriver::new(&model, t)
            .with_config(SweepConfig {
                order: TraversalOrder::RowMajor,
                parallel: true,
            })
            .run(&pair)
            .unwrap();

        assert!(base.scores.values().iter().any(|&v| v != 0.0));
        assert_eq!(base.scores, reversed.scores);
        assert_eq!(base.scores, parallel.scores);
    }

    #[test]
    #[serial]
    fn test_scores_are_patched_minus_corrupted() {
        let model = tiny_model().unwrap();
        let pair = MinimalPair::new("the keys to the cabinet", "the key to the cabinet");
        let t = targets(&model);
        let result = run_activation_patching(&model, &pair, t).unwrap();
        assert!(result.scores.values().iter().any(|&v| v != 0.0));

        let runs = capture_runs(&model, &pair).unwrap();
        let executor = PatchExecutor::new(&model, &runs.clean_cache, &runs.corrupted_tokens);
        for (coord, score) in result.scores.iter() {
            let patched = t.logit_difference(&executor.run(coord).unwrap()).unwrap();
            assert_eq!(score, patched - result.corrupted_logit_diff, "{coord}");
        }
    }

    #[test]
    #[serial]
    fn test_length_mismatch_aborts_with_first_coordinate() {
        let model = tiny_model().unwrap();
        let driver = SweepDriver::new(&model, targets(&model));
        let err = driver
            .run(&MinimalPair::new("the old keys to the cabinet", "the key to the cabinet"))
            .unwrap_err();
        assert_eq!(err.coordinate(), Some(HeadCoord::new(0, 0)));
        assert!(matches!(
            err,
            PatchError::AtCoordinate { ref source, .. } if matches!(**source, PatchError::ShapeMismatch { .. })
        ));
        assert_eq!(driver.state(), SweepState::Aborted);
    }

    #[test]
    #[serial]
    fn test_cancelled_sweep_returns_no_matrix() {
        let model = tiny_model().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let driver = SweepDriver::new(&model, targets(&model)).with_cancel_flag(cancel);
        let err = driver
            .run(&MinimalPair::new("the keys are", "the key are"))
            .unwrap_err();
        assert!(matches!(err, PatchError::Cancelled { completed: 0, .. }));
        assert_eq!(driver.state(), SweepState::Aborted);
    }
}
