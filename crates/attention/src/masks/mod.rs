//! Keep-mask builders shared by attention implementations.
//!
//! Every mask produced here has dtype [`KEEP_MASK_DTYPE`] with `1` where
//! attention is permitted and `0` where it is not. Masks are combined with a
//! logical AND before they reach the kernel, which then overwrites the
//! disallowed scores with a finite fill value.

pub mod causal;
pub mod media;
pub mod padding;

use candle_core::{DType, Result, Tensor};

/// Dtype shared by all keep masks.
pub const KEEP_MASK_DTYPE: DType = DType::U8;

pub use causal::build_causal_keep_mask;
pub use media::{MediaWindows, TextSegment};
pub use padding::{
    padding_keep_mask_from_booleans, padding_keep_mask_from_lengths,
    padding_keep_mask_from_media_mask,
};

/// Logical AND of two keep masks with broadcasting.
pub fn combine_keep_masks(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let lhs = lhs.to_dtype(KEEP_MASK_DTYPE)?;
    let rhs = rhs.to_dtype(KEEP_MASK_DTYPE)?;
    lhs.broadcast_mul(&rhs)
}

/// Replaces entries of `scores` where `keep == 0` by `value`.
///
/// `keep` must be broadcastable to the shape of `scores`.
pub fn masked_fill(scores: &Tensor, keep: &Tensor, value: f32) -> Result<Tensor> {
    let keep = keep.broadcast_as(scores.shape())?;
    let fill = Tensor::full(value, scores.shape(), scores.device())?.to_dtype(scores.dtype())?;
    keep.where_cond(scores, &fill)
}
