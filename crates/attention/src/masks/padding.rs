//! Builders for padding keep masks over key (media slot) positions.
//!
//! Padding masks have shape `[batch, 1, k_len]` so they broadcast across
//! query positions; the head axis is added by the caller.

use candle_core::{bail, DType, Device, Result, Tensor};

use super::KEEP_MASK_DTYPE;

/// Construct padding masks from per-batch valid key lengths.
pub fn padding_keep_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let data = key_lengths
        .iter()
        .flat_map(|&valid| (0..k_len).map(move |k| u8::from(k < valid)))
        .collect::<Vec<_>>();
    Tensor::from_vec(data, (key_lengths.len(), 1, k_len), device)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_keep_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map_or(0, Vec::len);
    if let Some(row) = padding.iter().find(|row| row.len() != k_len) {
        bail!(
            "all boolean padding masks must share k_len: expected {k_len}, got {}",
            row.len()
        );
    }
    let data = padding
        .iter()
        .flat_map(|row| row.iter().map(|&padded| u8::from(!padded)))
        .collect::<Vec<_>>();
    Tensor::from_vec(data, (padding.len(), 1, k_len), device)
}

/// Converts a media validity mask `[batch, slots, n]` (non-zero = real
/// embedding) into a keep mask `[batch, 1, slots * n]`.
pub fn padding_keep_mask_from_media_mask(media_mask: &Tensor) -> Result<Tensor> {
    let (batch, slots, extra) = match media_mask.dims() {
        [b, s, n] => (*b, *s, *n),
        dims => bail!("media_mask expected [batch, slots, 1], got {dims:?}"),
    };
    let keep = media_mask.to_dtype(DType::F32)?.ne(0f32)?;
    debug_assert_eq!(keep.dtype(), KEEP_MASK_DTYPE);
    keep.reshape((batch, 1, slots * extra))
}
