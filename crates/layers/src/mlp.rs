//! Feed-forward stacks built on top of projections and activations.
//!
//! An MLP maps `(batch, seq, hidden)` to the same layout: an optional
//! LayerNorm, an expansion to `intermediate_size`, the activation, then a
//! contraction back to `hidden`. The gated cross-attention block uses the
//! pre-normalised, bias-free GELU variant ([`FeedForwardConfig::gated_block`]);
//! the encoder uses a plain ReLU stack with biases and handles its residual and
//! post-normalisation itself.

use std::{fmt, sync::Arc};

use candle_core::{bail, DType, Device, Result, Tensor};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    norm::{LayerNorm, NormConfig, NormalizationLayer, DEFAULT_EPSILON},
};

/// Configuration shared by the feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    /// LayerNorm epsilon applied to the input, `None` for no input norm.
    pub pre_norm_epsilon: Option<f64>,
    /// Whether both projections carry a bias.
    pub bias: bool,
}

impl FeedForwardConfig {
    /// Creates a two-projection MLP with biases and no input norm.
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            pre_norm_epsilon: None,
            bias: true,
        }
    }

    /// Expands the hidden size by `ratio`, truncating like `int(dim * mult)`.
    pub fn with_expansion_ratio(hidden_size: usize, ratio: f64, activation: ActivationKind) -> Self {
        let intermediate = (hidden_size as f64 * ratio) as usize;
        Self::new(hidden_size, intermediate, activation)
    }

    /// `LayerNorm -> Linear -> GELU -> Linear`, bias-free, as used inside
    /// the gated cross-attention block.
    pub fn gated_block(hidden_size: usize, mult: f64) -> Self {
        Self {
            pre_norm_epsilon: Some(DEFAULT_EPSILON),
            bias: false,
            ..Self::with_expansion_ratio(hidden_size, mult, ActivationKind::Gelu)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.intermediate_size == 0 {
            bail!(
                "feed-forward dimensions must be non-zero (hidden={}, intermediate={})",
                self.hidden_size,
                self.intermediate_size
            );
        }
        Ok(())
    }
}

/// Shared interface for feed-forward stacks.
pub trait FeedForwardLayer: Send + Sync {
    fn config(&self) -> &FeedForwardConfig;

    /// Performs the forward pass through the MLP.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Two-layer MLP with optional input LayerNorm.
#[derive(Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    norm: Option<LayerNorm>,
    up: Linear,
    down: Linear,
    activation: Arc<dyn Activation>,
}

impl fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedForward")
            .field("config", &self.config)
            .field("norm", &self.norm.is_some())
            .finish()
    }
}

impl FeedForward {
    /// Assembles the MLP from existing sublayers.
    pub fn from_parts(
        config: FeedForwardConfig,
        norm: Option<LayerNorm>,
        up: Linear,
        down: Linear,
    ) -> Result<Self> {
        config.validate()?;
        if norm.is_some() != config.pre_norm_epsilon.is_some() {
            bail!("feed-forward input norm does not match pre_norm_epsilon");
        }
        let expected_up = LinearConfig {
            bias: config.bias,
            ..LinearConfig::new(config.hidden_size, config.intermediate_size)
        };
        let expected_down = LinearConfig {
            bias: config.bias,
            ..LinearConfig::new(config.intermediate_size, config.hidden_size)
        };
        if up.config() != &expected_up {
            bail!("feed-forward up projection mismatch: {:?}", up.config());
        }
        if down.config() != &expected_down {
            bail!("feed-forward down projection mismatch: {:?}", down.config());
        }
        let activation = builtin(config.activation);
        Ok(Self {
            config,
            norm,
            up,
            down,
            activation,
        })
    }

    /// Builds a freshly initialised MLP.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let norm = match config.pre_norm_epsilon {
            Some(epsilon) => Some(LayerNorm::ones(
                NormConfig::new(config.hidden_size).with_epsilon(epsilon),
                dtype,
                device,
            )?),
            None => None,
        };
        let up_cfg = LinearConfig {
            bias: config.bias,
            ..LinearConfig::new(config.hidden_size, config.intermediate_size)
        };
        let down_cfg = LinearConfig {
            bias: config.bias,
            ..LinearConfig::new(config.intermediate_size, config.hidden_size)
        };
        let up = Linear::with_init(up_cfg, init, device, dtype)?;
        let down = Linear::with_init(down_cfg, init, device, dtype)?;
        Self::from_parts(config, norm, up, down)
    }

    pub fn norm(&self) -> Option<&LayerNorm> {
        self.norm.as_ref()
    }

    pub fn up(&self) -> &Linear {
        &self.up
    }

    pub fn down(&self) -> &Linear {
        &self.down
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let normed = match &self.norm {
            Some(norm) => norm.forward(hidden, policy)?,
            None => hidden.clone(),
        };
        let expanded = self.up.forward(&normed, policy)?;
        let activated = self.activation.forward(&expanded, policy)?;
        self.down.forward(&activated, policy)
    }
}
