//! Multi-head self-attention with a post-norm residual.

use std::sync::atomic::{AtomicBool, Ordering};

use attention::{Config as AttentionConfig, ExactAttention};
use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{
    checks,
    norm::ENCODER_EPSILON,
    LayerNorm, Linear, LinearConfig, LinearInit, LinearLayer, NormConfig, NormalizationLayer,
    PrecisionPolicy, Residual, ResidualConfig,
};

use crate::checkpoint::{join, StateDict};
use crate::config::EncoderConfig;

/// Dropout on the attention probabilities while training.
pub const ATTENTION_WEIGHT_DROPOUT: f32 = 0.1;

/// `[batch, seq, heads * dim]` -> `[batch, heads, seq, dim]`.
pub(crate) fn split_heads(tensor: &Tensor, heads: usize, dim: usize) -> Result<Tensor> {
    let (batch, seq, width) = tensor.dims3()?;
    if width != heads * dim {
        bail!("cannot split width {width} into {heads} heads of {dim}");
    }
    tensor
        .reshape((batch, seq, heads, dim))?
        .transpose(1, 2)?
        .contiguous()
}

/// `[batch, heads, seq, dim]` -> `[batch, seq, heads * dim]`.
pub(crate) fn merge_heads(tensor: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq, dim) = tensor.dims4()?;
    tensor
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, seq, heads * dim))
}

#[derive(Debug)]
pub struct MultiHeadAttention {
    n_head: usize,
    d_model: usize,
    d_k: usize,
    d_v: usize,
    policy: PrecisionPolicy,
    w_qs: Linear,
    w_ks: Linear,
    w_vs: Linear,
    fc: Linear,
    attention: ExactAttention,
    residual: Residual,
    layer_norm: LayerNorm,
    training: AtomicBool,
}

impl MultiHeadAttention {
    /// Fresh parameters, evaluation mode.
    pub fn new(config: &EncoderConfig, seed: u64, dtype: DType, device: &Device) -> Result<Self> {
        let init = LinearInit::torch_default();
        let w_qs = Linear::with_init(Self::qk_config(config), &init, device, dtype)?;
        let w_ks = Linear::with_init(Self::qk_config(config), &init, device, dtype)?;
        let w_vs = Linear::with_init(Self::v_config(config), &init, device, dtype)?;
        let fc = Linear::with_init(Self::fc_config(config), &init, device, dtype)?;
        let layer_norm = LayerNorm::ones(Self::norm_config(config), dtype, device)?;
        Ok(Self::assemble(config, seed, dtype, [w_qs, w_ks, w_vs, fc], layer_norm))
    }

    /// Loads `{prefix}.w_qs.weight`, ..., `{prefix}.layer_norm.bias`.
    pub fn from_state(
        config: &EncoderConfig,
        state: &StateDict,
        prefix: &str,
        seed: u64,
    ) -> Result<Self> {
        let w_qs = state.linear(&join(prefix, "w_qs"), Self::qk_config(config))?;
        let w_ks = state.linear(&join(prefix, "w_ks"), Self::qk_config(config))?;
        let w_vs = state.linear(&join(prefix, "w_vs"), Self::v_config(config))?;
        let fc = state.linear(&join(prefix, "fc"), Self::fc_config(config))?;
        let layer_norm = state.layer_norm(&join(prefix, "layer_norm"), Self::norm_config(config))?;
        let dtype = w_qs.weight().dtype();
        Ok(Self::assemble(config, seed, dtype, [w_qs, w_ks, w_vs, fc], layer_norm))
    }

    fn qk_config(config: &EncoderConfig) -> LinearConfig {
        LinearConfig::no_bias(config.d_model, config.n_head * config.d_k)
    }

    fn v_config(config: &EncoderConfig) -> LinearConfig {
        LinearConfig::no_bias(config.d_model, config.n_head * config.d_v)
    }

    fn fc_config(config: &EncoderConfig) -> LinearConfig {
        LinearConfig::no_bias(config.n_head * config.d_v, config.d_model)
    }

    fn norm_config(config: &EncoderConfig) -> NormConfig {
        NormConfig::new(config.d_model).with_epsilon(ENCODER_EPSILON)
    }

    fn assemble(
        config: &EncoderConfig,
        seed: u64,
        dtype: DType,
        [w_qs, w_ks, w_vs, fc]: [Linear; 4],
        layer_norm: LayerNorm,
    ) -> Self {
        let residual = Residual::new(ResidualConfig::new(config.dropout_p()), seed);
        residual.set_training(false);
        Self {
            n_head: config.n_head,
            d_model: config.d_model,
            d_k: config.d_k,
            d_v: config.d_v,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            w_qs,
            w_ks,
            w_vs,
            fc,
            attention: ExactAttention::new(),
            residual,
            layer_norm,
            training: AtomicBool::new(false),
        }
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
        self.residual.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Attends `q` over `k`/`v` (all `[batch, len, d_model]`).
    ///
    /// `mask` is a keep mask `[batch, q_len, k_len]` shared by every head, or
    /// already expanded to `[batch, 1|n_head, q_len, k_len]`. Returns the
    /// normalised output and the attention probabilities
    /// `[batch, n_head, q_len, k_len]`.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        checks::expect_batch_seq_hidden("self_attention.q", q, self.d_model)?;
        checks::expect_batch_seq_hidden("self_attention.k", k, self.d_model)?;
        checks::expect_batch_seq_hidden("self_attention.v", v, self.d_model)?;
        if k.dims()[1] != v.dims()[1] {
            bail!(
                "self_attention: key length {} differs from value length {}",
                k.dims()[1],
                v.dims()[1]
            );
        }

        let q_heads = split_heads(&self.w_qs.forward(q, &self.policy)?, self.n_head, self.d_k)?;
        let k_heads = split_heads(&self.w_ks.forward(k, &self.policy)?, self.n_head, self.d_k)?;
        let v_heads = split_heads(&self.w_vs.forward(v, &self.policy)?, self.n_head, self.d_v)?;

        let mask = match mask {
            Some(mask) if mask.rank() == 3 => Some(mask.unsqueeze(1)?),
            Some(mask) => Some(mask.clone()),
            None => None,
        };

        let dropout = self.is_training().then_some(ATTENTION_WEIGHT_DROPOUT);
        let config = AttentionConfig::default().with_dropout(dropout);
        let (heads_out, attn) =
            self.attention
                .attend_with_weights(&q_heads, &k_heads, &v_heads, mask.as_ref(), &config)?;

        let projected = self.fc.forward(&merge_heads(&heads_out)?, &self.policy)?;
        let added = self.residual.forward(&projected, q, &self.policy)?;
        let output = self.layer_norm.forward(&added, &self.policy)?;
        Ok((output, attn))
    }

    pub(crate) fn export(&self, prefix: &str, state: &mut StateDict) {
        state.insert_linear(&join(prefix, "w_qs"), &self.w_qs);
        state.insert_linear(&join(prefix, "w_ks"), &self.w_ks);
        state.insert_linear(&join(prefix, "w_vs"), &self.w_vs);
        state.insert_linear(&join(prefix, "fc"), &self.fc);
        state.insert_layer_norm(&join(prefix, "layer_norm"), &self.layer_norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> EncoderConfig {
        EncoderConfig {
            d_word_vec: 8,
            d_model: 8,
            n_head: 2,
            d_k: 3,
            d_v: 5,
            d_inner: 16,
            n_layers: 1,
            ..EncoderConfig::default()
        }
    }

    #[test]
    fn heads_split_and_merge_back() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 24.0, &device)?.reshape((1, 3, 8))?;
        let heads = split_heads(&x, 2, 4)?;
        assert_eq!(heads.dims(), &[1, 2, 3, 4]);
        // Head 1 of position 0 holds features 4..8.
        assert_eq!(
            heads.get(0)?.get(1)?.get(0)?.to_vec1::<f32>()?,
            vec![4.0, 5.0, 6.0, 7.0]
        );
        let merged = merge_heads(&heads)?;
        assert_eq!(merged.to_vec3::<f32>()?, x.to_vec3::<f32>()?);
        assert!(split_heads(&x, 3, 4).is_err());
        Ok(())
    }

    #[test]
    fn output_and_attention_shapes() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(&small_config(), 0, DType::F32, &device)?;
        let q = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (2, 6, 8), &device)?;
        let (out, attn) = mha.forward(&q, &kv, &kv, None)?;
        assert_eq!(out.dims(), &[2, 4, 8]);
        assert_eq!(attn.dims(), &[2, 2, 4, 6]);
        Ok(())
    }

    #[test]
    fn output_is_layer_normalised() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(&small_config(), 0, DType::F32, &device)?;
        let x = Tensor::randn(0f32, 3.0, (1, 5, 8), &device)?;
        let (out, _) = mha.forward(&x, &x, &x, None)?;
        let means = out.mean_keepdim(2)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(means.iter().all(|m| m.abs() < 1e-4));
        Ok(())
    }

    #[test]
    fn three_dim_mask_broadcasts_over_heads() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(&small_config(), 0, DType::F32, &device)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?;
        let mask = Tensor::from_vec(vec![1u8, 0, 0, 1, 1, 0, 1, 1, 1], (1, 3, 3), &device)?;
        let (_, attn) = mha.forward(&x, &x, &x, Some(&mask))?;
        for head in attn.get(0)?.to_vec3::<f32>()? {
            assert_eq!(head[0][1], 0.0);
            assert_eq!(head[0][2], 0.0);
            assert_eq!(head[1][2], 0.0);
            assert!((head[0][0] - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn mismatched_width_is_rejected() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mha = MultiHeadAttention::new(&small_config(), 0, DType::F32, &device)?;
        let x = Tensor::zeros((1, 3, 7), DType::F32, &device)?;
        assert!(mha.forward(&x, &x, &x, None).is_err());
        Ok(())
    }
}
