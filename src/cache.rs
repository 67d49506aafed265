//! Activation cache for head-output activations

use std::collections::BTreeMap;

use candle_core::{IndexOp, Tensor};

use crate::error::{PatchError, Result};
use crate::hooks::HookSite;

/// Activations captured during one forward pass, keyed by site
///
/// Each `AttnZ` tensor has shape `(batch, seq_len, n_heads, d_head)`.
#[derive(Debug, Default)]
pub struct ActivationCache {
    activations: BTreeMap<HookSite, Tensor>,
}

impl ActivationCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the activation for a site. Called by backends during capture.
    pub fn store(&mut self, site: HookSite, tensor: Tensor) {
        self.activations.insert(site, tensor);
    }

    /// Get the activation for a site
    pub fn get(&self, site: HookSite) -> Option<&Tensor> {
        self.activations.get(&site)
    }

    /// Get the activation for a site, failing if it was not captured
    pub fn require(&self, site: HookSite) -> Result<&Tensor> {
        self.activations
            .get(&site)
            .ok_or_else(|| PatchError::Config(format!("site `{site}` not in activation cache")))
    }

    /// One head's slice at a layer: shape `(batch, seq_len, 1, d_head)`
    pub fn head_slice(&self, layer: usize, head: usize) -> Result<Tensor> {
        let z = self.require(HookSite::AttnZ(layer))?;
        let n_heads = z.dim(2)?;
        if head >= n_heads {
            return Err(PatchError::Config(format!(
                "head {head} out of range at layer {layer} (n_heads={n_heads})"
            )));
        }
        Ok(z.i((.., .., head..head + 1, ..))?)
    }

    /// Number of cached sites
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Iterate over cached sites in layer order
    pub fn sites(&self) -> impl Iterator<Item = HookSite> + '_ {
        self.activations.keys().copied()
    }
}
