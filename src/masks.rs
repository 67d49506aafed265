//! Causal attention masks shared by all backends
//!
//! Masks are cached by `(seq_len, device kind, dtype)`. A patching sweep runs
//! `n_layers * n_heads` forward passes over the same corrupted sequence, so
//! every pass after the first reuses one mask (shallow clone, no data copy).

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

// A panic while holding the lock cannot leave a half-written entry behind.
fn lock_cache() -> MutexGuard<'static, HashMap<(usize, usize, DType), Tensor>> {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Create or retrieve a cached causal mask of shape `[1, 1, seq_len, seq_len]`
///
/// `0.0` where position `j <= i` may be attended, `-inf` elsewhere:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    if let Some(cached) = lock_cache().get(&cache_key) {
        return Ok(cached.clone());
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    lock_cache().insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}

/// Clear all cached masks
pub fn clear_mask_caches() {
    lock_cache().clear();
}

/// Number of cached masks
pub fn mask_cache_size() -> usize {
    lock_cache().len()
}
