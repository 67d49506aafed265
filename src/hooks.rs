//! Activation sites and override directives
//!
//! A [`HookOverride`] names a site in the forward pass and what to do with
//! the activation flowing through it. Backends look up the override for the
//! site they are about to emit and apply it with [`apply_override`]; the
//! directive is plain data, so one pass never affects another.
//!
//! Site names follow the TransformerLens convention:
//!
//! ```
//! use sva_patch::HookSite;
//!
//! let site = HookSite::AttnZ(5);
//! assert_eq!(site.to_string(), "blocks.5.attn.hook_z");
//! assert_eq!("blocks.5.attn.hook_z".parse::<HookSite>().unwrap(), site);
//! ```

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{PatchError, Result};

/// Named location in a forward pass where activations are captured or overridden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookSite {
    /// Per-head attention output of layer `i`, before the output projection.
    ///
    /// Shape: `(batch, seq_len, n_heads, d_head)`.
    AttnZ(usize),
}

impl HookSite {
    /// Layer index of this site
    pub fn layer(&self) -> usize {
        match self {
            HookSite::AttnZ(layer) => *layer,
        }
    }
}

impl fmt::Display for HookSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookSite::AttnZ(i) => write!(f, "blocks.{i}.attn.hook_z"),
        }
    }
}

impl FromStr for HookSite {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        let layer = s
            .strip_prefix("blocks.")
            .and_then(|rest| rest.strip_suffix(".attn.hook_z"))
            .and_then(|layer| layer.parse::<usize>().ok())
            .ok_or_else(|| PatchError::Config(format!("unknown hook site `{s}`")))?;
        Ok(HookSite::AttnZ(layer))
    }
}

/// What to do with the activation at a site
#[derive(Debug, Clone)]
pub enum OverrideDirective {
    /// Replace the whole activation. Must have exactly the live shape.
    Replace(Tensor),
    /// Replace one head's slice of a `(batch, seq, n_heads, d_head)` activation.
    ///
    /// `values` has shape `(batch, seq, 1, d_head)`.
    PatchHead { head: usize, values: Tensor },
}

/// An override directive bound to the site it applies at
#[derive(Debug, Clone)]
pub struct HookOverride {
    pub site: HookSite,
    pub directive: OverrideDirective,
}

impl HookOverride {
    pub fn new(site: HookSite, directive: OverrideDirective) -> Self {
        Self { site, directive }
    }

    /// Patch `head` of the head-output site at `layer` with `values`
    pub fn patch_head(layer: usize, head: usize, values: Tensor) -> Self {
        Self::new(
            HookSite::AttnZ(layer),
            OverrideDirective::PatchHead { head, values },
        )
    }

    /// Check whether this override targets `site`
    pub fn applies_to(&self, site: HookSite) -> bool {
        self.site == site
    }
}

/// Apply an override directive to the live activation at `site`.
///
/// The returned tensor always has the same shape as `activation`; any
/// directive that would change it is rejected with
/// [`PatchError::ShapeMismatch`].
pub fn apply_override(
    activation: &Tensor,
    site: HookSite,
    directive: &OverrideDirective,
) -> Result<Tensor> {
    let live = activation.dims().to_vec();

    let patched = match directive {
        OverrideDirective::Replace(replacement) => {
            if replacement.dims() != live.as_slice() {
                return Err(PatchError::ShapeMismatch {
                    site,
                    expected: live,
                    actual: replacement.dims().to_vec(),
                });
            }
            replacement.to_dtype(activation.dtype())?
        }
        OverrideDirective::PatchHead { head, values } => {
            let (b, seq_len, n_heads, d_head) = activation.dims4()?;
            if *head >= n_heads {
                return Err(PatchError::Config(format!(
                    "head {head} out of range at {site} (n_heads={n_heads})"
                )));
            }
            let expected = vec![b, seq_len, 1, d_head];
            if values.dims() != expected.as_slice() {
                return Err(PatchError::ShapeMismatch {
                    site,
                    expected,
                    actual: values.dims().to_vec(),
                });
            }
            let values = values.to_dtype(activation.dtype())?;
            activation.contiguous()?.slice_assign(
                &[0..b, 0..seq_len, *head..*head + 1, 0..d_head],
                &values,
            )?
        }
    };

    if patched.dims() != live.as_slice() {
        return Err(PatchError::ShapeMismatch {
            site,
            expected: live,
            actual: patched.dims().to_vec(),
        });
    }
    Ok(patched)
}

/// Apply `over` to `activation` if it targets `site`, otherwise pass through
pub fn maybe_override(
    activation: Tensor,
    site: HookSite,
    over: Option<&HookOverride>,
) -> Result<Tensor> {
    match over {
        Some(o) if o.applies_to(site) => apply_override(&activation, site, &o.directive),
        _ => Ok(activation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};

    fn ramp(shape: (usize, usize, usize, usize), offset: f32) -> Tensor {
        let n = shape.0 * shape.1 * shape.2 * shape.3;
        let data: Vec<f32> = (0..n).map(|i| i as f32 + offset).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_site_round_trip() {
        for layer in [0, 7, 11, 31] {
            let site = HookSite::AttnZ(layer);
            let parsed: HookSite = site.to_string().parse().unwrap();
            assert_eq!(parsed, site);
            assert_eq!(parsed.layer(), layer);
        }
        assert!("blocks.x.attn.hook_z".parse::<HookSite>().is_err());
        assert!("blocks.3.hook_resid_post".parse::<HookSite>().is_err());
    }

    #[test]
    fn test_patch_head_touches_one_head() {
        let live = ramp((1, 3, 4, 2), 0.0);
        let clean = ramp((1, 3, 4, 2), 1000.0);
        let values = clean.i((.., .., 2..3, ..)).unwrap();

        let patched = apply_override(
            &live,
            HookSite::AttnZ(0),
            &OverrideDirective::PatchHead { head: 2, values },
        )
        .unwrap();
        assert_eq!(patched.dims(), live.dims());

        for head in 0..4 {
            let got: Vec<f32> = patched
                .i((.., .., head, ..))
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            let source = if head == 2 { &clean } else { &live };
            let want: Vec<f32> = source
                .i((.., .., head, ..))
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            assert_eq!(got, want, "head {head}");
        }
    }

    #[test]
    fn test_patch_head_rejects_wrong_seq_len() {
        let live = ramp((1, 3, 4, 2), 0.0);
        let values = Tensor::zeros((1, 5, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let err = apply_override(
            &live,
            HookSite::AttnZ(1),
            &OverrideDirective::PatchHead { head: 0, values },
        )
        .unwrap_err();
        match err {
            PatchError::ShapeMismatch {
                site,
                expected,
                actual,
            } => {
                assert_eq!(site, HookSite::AttnZ(1));
                assert_eq!(expected, vec![1, 3, 1, 2]);
                assert_eq!(actual, vec![1, 5, 1, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_patch_head_out_of_range() {
        let live = ramp((1, 2, 2, 2), 0.0);
        let values = Tensor::zeros((1, 2, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let result = apply_override(
            &live,
            HookSite::AttnZ(0),
            &OverrideDirective::PatchHead { head: 2, values },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_replace_checks_shape() {
        let live = ramp((1, 2, 2, 2), 0.0);
        let good = ramp((1, 2, 2, 2), 5.0);
        let out = apply_override(
            &live,
            HookSite::AttnZ(0),
            &OverrideDirective::Replace(good.clone()),
        )
        .unwrap();
        let a: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = good.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);

        let bad = ramp((1, 2, 4, 1), 0.0);
        assert!(matches!(
            apply_override(&live, HookSite::AttnZ(0), &OverrideDirective::Replace(bad)),
            Err(PatchError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_maybe_override_other_site_passes_through() {
        let live = ramp((1, 2, 2, 2), 0.0);
        let values = Tensor::zeros((1, 2, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let over = HookOverride::patch_head(3, 0, values);
        let out = maybe_override(live.clone(), HookSite::AttnZ(2), Some(&over)).unwrap();
        let a: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = live.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
