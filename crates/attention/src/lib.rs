//! Scaled dot-product attention and keep-mask builders.
//!
//! Kernels operate on tensors laid out `[batch, n_heads, seq_len, head_dim]`.
//! Queries and keys share `head_dim`; values may use a different width.
//! Scores, softmax and the weighted sum run in `f32`, and the output is cast
//! back to the query dtype.
//!
//! Masks are boolean *keep* masks (`u8`, `1` = may attend) broadcastable to
//! `[batch, n_heads, q_len, k_len]`. Disallowed scores are replaced by
//! [`Config::mask_fill`] before the softmax so several masks can be combined
//! with a logical AND (see [`masks::combine_keep_masks`]) without
//! accumulating infinities.
//!
//! The [`masks::media`] module implements the media window rule that decides,
//! for each text position, which block of audio embeddings it may attend to.

pub mod core;
pub mod masks;
pub mod reference;

pub use crate::core::{Attention, AttentionError, Config};
pub use reference::ExactAttention;
