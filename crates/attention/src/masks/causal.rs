//! Builders for causal keep masks.
//!
//! Masks have shape `[batch, q_len, k_len]`; callers add the head axis.

use candle_core::{Device, Result, Tensor};

/// Construct a causal keep mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_keep_mask(
    device: &Device,
    batch: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let row = (0..q_len)
        .flat_map(|q| (0..k_len).map(move |k| u8::from(k <= q + offset)))
        .collect::<Vec<_>>();
    let data = row.repeat(batch);
    Tensor::from_vec(data, (batch, q_len, k_len), device)
}
