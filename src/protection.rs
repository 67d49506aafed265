//! Protection masks built from critical heads

use std::collections::BTreeMap;

use crate::patching::HeadCoord;

/// Group heads by layer: `layer -> [heads]`, heads in input order
pub fn mask_to_dict(critical_heads: &[HeadCoord]) -> BTreeMap<usize, Vec<usize>> {
    let mut mask: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for coord in critical_heads {
        mask.entry(coord.layer).or_default().push(coord.head);
    }
    mask
}

/// Fraction of all `n_layers * n_heads` heads covered by the mask
pub fn compute_mask_coverage(critical_heads: &[HeadCoord], n_layers: usize, n_heads: usize) -> f64 {
    let total = n_layers * n_heads;
    if total == 0 {
        return 0.0;
    }
    critical_heads.len() as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_grouping() {
        let heads = [
            HeadCoord::new(9, 6),
            HeadCoord::new(0, 1),
            HeadCoord::new(9, 1),
        ];
        let mask = mask_to_dict(&heads);
        assert_eq!(mask.len(), 2);
        assert_eq!(mask[&0], vec![1]);
        assert_eq!(mask[&9], vec![6, 1]);
        assert!(mask_to_dict(&[]).is_empty());
    }

    #[test]
    fn test_mask_coverage() {
        let heads = [HeadCoord::new(0, 0), HeadCoord::new(1, 3)];
        assert_eq!(compute_mask_coverage(&heads, 2, 4), 0.25);
        assert_eq!(compute_mask_coverage(&heads, 0, 12), 0.0);
    }
}
