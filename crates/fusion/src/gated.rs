//! Gated cross-attention block inserted between frozen language-model layers.

use candle_core::{DType, Device, Result, Tensor};
use layers::{
    FeedForward, FeedForwardConfig, FeedForwardLayer, LinearConfig, LinearInit, NormConfig,
    PrecisionPolicy, TanhGate,
};

use crate::checkpoint::StateDict;
use crate::config::GatedCrossAttentionConfig;
use crate::cross_attention::{MaskedCrossAttention, MediaInputs};

/// `x + tanh(attn_gate) * attn(x)` then `x + tanh(ff_gate) * ff(x)`.
///
/// Both gates start at zero, so a fresh block returns its input unchanged.
#[derive(Debug)]
pub struct GatedCrossAttentionBlock {
    config: GatedCrossAttentionConfig,
    policy: PrecisionPolicy,
    attn: MaskedCrossAttention,
    attn_gate: TanhGate,
    ff: FeedForward,
    ff_gate: TanhGate,
}

impl GatedCrossAttentionBlock {
    pub fn new(config: GatedCrossAttentionConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let attn = MaskedCrossAttention::new(config.attention.clone(), dtype, device)?;
        let ff = FeedForward::with_init(
            Self::ff_config(&config),
            &LinearInit::torch_default(),
            device,
            dtype,
        )?;
        Ok(Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            attn_gate: TanhGate::zeros(dtype, device)?,
            ff_gate: TanhGate::zeros(dtype, device)?,
            config,
            attn,
            ff,
        })
    }

    /// Loads `attn.*`, `attn_gate`, `ff.{0,1,3}.*` and `ff_gate`.
    pub fn from_state(config: GatedCrossAttentionConfig, state: &StateDict) -> Result<Self> {
        config.validate()?;
        let attn = MaskedCrossAttention::from_state(config.attention.clone(), state, "attn")?;
        let ff_config = Self::ff_config(&config);
        let norm = state.layer_norm(
            "ff.0",
            NormConfig::new(ff_config.hidden_size).with_epsilon(layers::norm::DEFAULT_EPSILON),
        )?;
        let up = state.linear(
            "ff.1",
            LinearConfig::no_bias(ff_config.hidden_size, ff_config.intermediate_size),
        )?;
        let down = state.linear(
            "ff.3",
            LinearConfig::no_bias(ff_config.intermediate_size, ff_config.hidden_size),
        )?;
        let dtype = up.weight().dtype();
        let ff = FeedForward::from_parts(ff_config, Some(norm), up, down)?;
        Ok(Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            attn_gate: TanhGate::from_tensor(state.get("attn_gate")?)?,
            ff_gate: TanhGate::from_tensor(state.get("ff_gate")?)?,
            config,
            attn,
            ff,
        })
    }

    /// Loads a `.safetensors` checkpoint, casting parameters to `dtype`.
    pub fn from_safetensors(
        config: GatedCrossAttentionConfig,
        path: impl AsRef<std::path::Path>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let state = StateDict::load(path, device)?.to_dtype(dtype)?;
        Self::from_state(config, &state)
    }

    fn ff_config(config: &GatedCrossAttentionConfig) -> FeedForwardConfig {
        FeedForwardConfig::gated_block(config.attention.dim, config.ff_mult)
    }

    pub fn config(&self) -> &GatedCrossAttentionConfig {
        &self.config
    }

    pub fn attn_gate(&self) -> &TanhGate {
        &self.attn_gate
    }

    pub fn ff_gate(&self) -> &TanhGate {
        &self.ff_gate
    }

    /// An empty text chunk passes through unchanged once its media is validated.
    pub fn forward(&self, x: &Tensor, media: &MediaInputs<'_>) -> Result<Tensor> {
        let attended = self.attn.forward(x, media)?;
        if x.dim(1)? == 0 {
            return Ok(x.clone());
        }
        let x = self.attn_gate.forward(&attended, x, &self.policy)?;
        let fed = self.ff.forward(&x, &self.policy)?;
        self.ff_gate.forward(&fed, &x, &self.policy)
    }

    /// Exports parameters under the names accepted by [`from_state`](Self::from_state).
    pub fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        self.attn.export("attn", &mut state);
        state.insert("attn_gate", self.attn_gate.value().clone());
        if let Some(norm) = self.ff.norm() {
            state.insert_layer_norm("ff.0", norm);
        }
        state.insert_linear("ff.1", self.ff.up());
        state.insert_linear("ff.3", self.ff.down());
        state.insert("ff_gate", self.ff_gate.value().clone());
        state
    }
}
