//! Run-time knobs shared by all attention implementations.

/// Fill value for masked scores in encoder self-attention.
pub const SELF_ATTENTION_MASK_FILL: f32 = -1e9;

/// Fill value for masked scores in media cross-attention: the lowest finite
/// `f32`, so masked slots receive no probability mass even next to large
/// negative scores.
pub const CROSS_ATTENTION_MASK_FILL: f32 = f32::MIN;

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Score written at masked positions before the softmax.
    pub mask_fill: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dropout_p: None,
            mask_fill: SELF_ATTENTION_MASK_FILL,
        }
    }
}

impl Config {
    /// Settings used by the masked cross-attention over media slots.
    pub fn cross_attention() -> Self {
        Self {
            dropout_p: None,
            mask_fill: CROSS_ATTENTION_MASK_FILL,
        }
    }

    pub fn with_dropout(mut self, dropout_p: Option<f32>) -> Self {
        self.dropout_p = dropout_p;
        self
    }
}
