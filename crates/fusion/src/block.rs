use std::fmt;

use candle_core::{DType, Device, Result, Tensor};

use crate::checkpoint::{join, StateDict};
use crate::config::EncoderConfig;
use crate::feed_forward::PositionwiseFeedForward;
use crate::self_attention::MultiHeadAttention;

/// Self-attention followed by the position-wise feed-forward, both post-norm.
pub struct EncoderLayer {
    index: usize,
    slf_attn: MultiHeadAttention,
    pos_ffn: PositionwiseFeedForward,
}

impl fmt::Debug for EncoderLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderLayer")
            .field("index", &self.index)
            .finish()
    }
}

impl EncoderLayer {
    /// Construct layer `index` of an encoder described by `config`.
    pub fn new(index: usize, config: &EncoderConfig, dtype: DType, device: &Device) -> Result<Self> {
        let (attn_seed, ffn_seed) = Self::seeds(index);
        Ok(Self {
            index,
            slf_attn: MultiHeadAttention::new(config, attn_seed, dtype, device)?,
            pos_ffn: PositionwiseFeedForward::new(config, ffn_seed, dtype, device)?,
        })
    }

    /// Loads `{prefix}.slf_attn.*` and `{prefix}.pos_ffn.*`.
    pub fn from_state(
        index: usize,
        config: &EncoderConfig,
        state: &StateDict,
        prefix: &str,
    ) -> Result<Self> {
        let (attn_seed, ffn_seed) = Self::seeds(index);
        Ok(Self {
            index,
            slf_attn: MultiHeadAttention::from_state(
                config,
                state,
                &join(prefix, "slf_attn"),
                attn_seed,
            )?,
            pos_ffn: PositionwiseFeedForward::from_state(
                config,
                state,
                &join(prefix, "pos_ffn"),
                ffn_seed,
            )?,
        })
    }

    fn seeds(index: usize) -> (u64, u64) {
        let base = (index as u64).saturating_mul(2);
        (base, base + 1)
    }

    pub fn set_training(&self, training: bool) {
        self.slf_attn.set_training(training);
        self.pos_ffn.set_training(training);
    }

    /// Returns the layer output and its self-attention map.
    pub fn forward(&self, enc_input: &Tensor, slf_attn_mask: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (attended, attn) =
            self.slf_attn
                .forward(enc_input, enc_input, enc_input, slf_attn_mask)?;
        let output = self.pos_ffn.forward(&attended)?;
        Ok((output, attn))
    }

    pub(crate) fn export(&self, prefix: &str, state: &mut StateDict) {
        self.slf_attn.export(&join(prefix, "slf_attn"), state);
        self.pos_ffn.export(&join(prefix, "pos_ffn"), state);
    }
}
