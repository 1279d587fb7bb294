//! Core traits and types shared across attention implementations.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{Config, CROSS_ATTENTION_MASK_FILL, SELF_ATTENTION_MASK_FILL};
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`, `k` is `[batch, n_heads,
///   k_len, head_dim]` and `v` is `[batch, n_heads, k_len, v_dim]`.
/// * The returned tensor is `[batch, n_heads, q_len, v_dim]` in the dtype of `q`.
/// * Masks, when present, are `u8` keep masks shaped
///   `[batch, 1 or n_heads, q_len, k_len]`.
/// * Dropout is controlled via [`Config::dropout_p`]; callers leave it unset
///   outside training.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
