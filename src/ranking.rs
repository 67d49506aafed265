//! Head ranking and percentile thresholds over a score matrix

use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};
use crate::patching::HeadCoord;
use crate::sweep::ScoreMatrix;

/// One head with its patching score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedHead {
    pub layer: usize,
    pub head: usize,
    pub score: f32,
}

impl RankedHead {
    pub fn coord(&self) -> HeadCoord {
        HeadCoord::new(self.layer, self.head)
    }
}

/// Every head sorted by score, highest first. Equal scores keep row-major order.
pub fn rank_heads(scores: &ScoreMatrix) -> Vec<RankedHead> {
    let mut ranked: Vec<RankedHead> = scores
        .iter()
        .map(|(coord, score)| RankedHead {
            layer: coord.layer,
            head: coord.head,
            score,
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

fn check_percentile(p: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&p) {
        return Err(PatchError::Config(format!(
            "percentile must be in [0, 100], got {p}"
        )));
    }
    Ok(())
}

/// `p`-th percentile with linear interpolation between closest ranks
/// (numpy's default method)
pub fn percentile(values: &[f32], p: f64) -> Result<f64> {
    check_percentile(p)?;
    if values.is_empty() {
        return Err(PatchError::Config("percentile of an empty set".into()));
    }

    let mut sorted: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    sorted.sort_by(f64::total_cmp);

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Ok(sorted[lo]);
    }
    Ok(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Heads scoring at or above the `p`-th percentile, in row-major order
pub fn get_critical_heads(scores: &ScoreMatrix, p: f64) -> Result<Vec<HeadCoord>> {
    let threshold = percentile(scores.values(), p)?;
    Ok(scores
        .iter()
        .filter(|&(_, score)| score as f64 >= threshold)
        .map(|(coord, _)| coord)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> ScoreMatrix {
        // 2 layers x 3 heads
        ScoreMatrix::from_vec(2, 3, vec![0.2, 1.5, -0.3, 0.9, 1.5, 0.0]).unwrap()
    }

    #[test]
    fn test_rank_is_complete_and_sorted() {
        let ranked = rank_heads(&matrix());
        assert_eq!(ranked.len(), 6);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));

        // Tie between (0,1) and (1,1): coordinate order is kept
        assert_eq!(ranked[0].coord(), HeadCoord::new(0, 1));
        assert_eq!(ranked[1].coord(), HeadCoord::new(1, 1));
        assert_eq!(ranked[5].coord(), HeadCoord::new(0, 2));
    }

    #[test]
    fn test_percentile_matches_linear_interpolation() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0).unwrap(), 1.0);
        assert_eq!(percentile(&values, 100.0).unwrap(), 4.0);
        assert_eq!(percentile(&values, 50.0).unwrap(), 2.5);
        assert!((percentile(&values, 90.0).unwrap() - 3.7).abs() < 1e-9);
        assert!(percentile(&values, 100.5).is_err());
        assert!(percentile(&values, -1.0).is_err());
        assert!(percentile(&[], 50.0).is_err());
    }

    #[test]
    fn test_critical_heads_thresholds() {
        let m = matrix();
        assert_eq!(get_critical_heads(&m, 0.0).unwrap().len(), 6);
        assert_eq!(
            get_critical_heads(&m, 100.0).unwrap(),
            vec![HeadCoord::new(0, 1), HeadCoord::new(1, 1)]
        );

        // Every returned head is at or above the threshold
        let threshold = percentile(m.values(), 60.0).unwrap();
        for coord in get_critical_heads(&m, 60.0).unwrap() {
            assert!(m.get(coord.layer, coord.head).unwrap() as f64 >= threshold);
        }
        assert!(get_critical_heads(&m, 101.0).is_err());
    }
}
