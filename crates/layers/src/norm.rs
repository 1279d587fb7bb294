//! Layer normalisation with unified shape and dtype handling.
//!
//! Inputs follow the `(batch, seq, hidden)` convention and are normalised
//! along the last axis. Mean and variance are gathered in
//! [`PrecisionPolicy::reduction`] before casting back to storage.

use candle_core::{bail, DType, Device, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Epsilon used by the attention and encoder sublayers.
pub const ENCODER_EPSILON: f64 = 1e-6;
/// Epsilon used by the cross-attention and gated feed-forward sublayers.
pub const DEFAULT_EPSILON: f64 = 1e-5;

/// Configuration for a LayerNorm.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: DEFAULT_EPSILON,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Shared interface for normalisation layers.
pub trait NormalizationLayer: Send + Sync {
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// LayerNorm with learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    /// Constructs a LayerNorm from learnt scale and bias parameters.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        if config.hidden_size == 0 {
            bail!("layer norm requires hidden_size > 0");
        }
        for (label, param) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            checks::expect_shape(label, param, &[config.hidden_size])?;
            checks::expect_dtype_in(label, param, &[DType::F16, DType::BF16, DType::F32])?;
            checks::expect_contiguous(label, param)?;
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Freshly initialised LayerNorm (scale one, bias zero).
    pub fn ones(config: NormConfig, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = policy.cast_for_matmul(&centered.broadcast_div(&denom)?)?;
        let dtype = normalized.dtype();
        let scaled = normalized
            .broadcast_mul(&self.weight.to_dtype(dtype)?)?
            .broadcast_add(&self.bias.to_dtype(dtype)?)?;

        policy.cast_to_storage(&scaled)
    }
}
