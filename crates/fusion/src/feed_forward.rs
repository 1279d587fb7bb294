//! Position-wise feed-forward with a post-norm residual.

use candle_core::{DType, Device, Result, Tensor};
use layers::{
    norm::ENCODER_EPSILON, ActivationKind, FeedForward, FeedForwardConfig, FeedForwardLayer,
    LayerNorm, LinearConfig, LinearInit, NormConfig, NormalizationLayer, PrecisionPolicy, Residual,
    ResidualConfig,
};

use crate::checkpoint::{join, StateDict};
use crate::config::EncoderConfig;

/// `LayerNorm(x + dropout(w_2(relu(w_1(x)))))`.
#[derive(Debug)]
pub struct PositionwiseFeedForward {
    policy: PrecisionPolicy,
    mlp: FeedForward,
    residual: Residual,
    layer_norm: LayerNorm,
}

impl PositionwiseFeedForward {
    pub fn new(config: &EncoderConfig, seed: u64, dtype: DType, device: &Device) -> Result<Self> {
        let mlp = FeedForward::with_init(
            Self::mlp_config(config),
            &LinearInit::torch_default(),
            device,
            dtype,
        )?;
        let layer_norm = LayerNorm::ones(Self::norm_config(config), dtype, device)?;
        Ok(Self::assemble(config, seed, dtype, mlp, layer_norm))
    }

    /// Loads `{prefix}.w_1`, `{prefix}.w_2` and `{prefix}.layer_norm`.
    pub fn from_state(
        config: &EncoderConfig,
        state: &StateDict,
        prefix: &str,
        seed: u64,
    ) -> Result<Self> {
        let w_1 = state.linear(
            &join(prefix, "w_1"),
            LinearConfig::new(config.d_model, config.d_inner),
        )?;
        let w_2 = state.linear(
            &join(prefix, "w_2"),
            LinearConfig::new(config.d_inner, config.d_model),
        )?;
        let dtype = w_1.weight().dtype();
        let mlp = FeedForward::from_parts(Self::mlp_config(config), None, w_1, w_2)?;
        let layer_norm = state.layer_norm(&join(prefix, "layer_norm"), Self::norm_config(config))?;
        Ok(Self::assemble(config, seed, dtype, mlp, layer_norm))
    }

    fn mlp_config(config: &EncoderConfig) -> FeedForwardConfig {
        FeedForwardConfig::new(config.d_model, config.d_inner, ActivationKind::Relu)
    }

    fn norm_config(config: &EncoderConfig) -> NormConfig {
        NormConfig::new(config.d_model).with_epsilon(ENCODER_EPSILON)
    }

    fn assemble(
        config: &EncoderConfig,
        seed: u64,
        dtype: DType,
        mlp: FeedForward,
        layer_norm: LayerNorm,
    ) -> Self {
        let residual = Residual::new(ResidualConfig::new(config.dropout_p()), seed);
        residual.set_training(false);
        Self {
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            mlp,
            residual,
            layer_norm,
        }
    }

    pub fn set_training(&self, training: bool) {
        self.residual.set_training(training);
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let branch = self.mlp.forward(x, &self.policy)?;
        let added = self.residual.forward(&branch, x, &self.policy)?;
        self.layer_norm.forward(&added, &self.policy)
    }

    pub(crate) fn export(&self, prefix: &str, state: &mut StateDict) {
        state.insert_linear(&join(prefix, "w_1"), self.mlp.up());
        state.insert_linear(&join(prefix, "w_2"), self.mlp.down());
        state.insert_layer_norm(&join(prefix, "layer_norm"), &self.layer_norm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_weights_reduce_to_layer_norm_of_input() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = EncoderConfig {
            d_word_vec: 4,
            d_model: 4,
            d_inner: 6,
            ..EncoderConfig::default()
        };
        let mut state = StateDict::new();
        state.insert("w_1.weight", Tensor::zeros((6, 4), DType::F32, &device)?);
        state.insert("w_1.bias", Tensor::zeros(6, DType::F32, &device)?);
        state.insert("w_2.weight", Tensor::zeros((4, 6), DType::F32, &device)?);
        state.insert("w_2.bias", Tensor::zeros(4, DType::F32, &device)?);
        state.insert("layer_norm.weight", Tensor::ones(4, DType::F32, &device)?);
        state.insert("layer_norm.bias", Tensor::zeros(4, DType::F32, &device)?);
        let ffn = PositionwiseFeedForward::from_state(&config, &state, "", 0)?;

        let x = Tensor::from_vec(vec![1f32, 2., 3., 4.], (1, 1, 4), &device)?;
        let out = ffn.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
        // (x - 2.5) / sqrt(1.25 + 1e-6)
        let expected = [-1.3416, -0.4472, 0.4472, 1.3416];
        for (value, want) in out.iter().zip(expected) {
            assert!((value - want).abs() < 1e-3);
        }

        let mut exported = StateDict::new();
        ffn.export("pos_ffn", &mut exported);
        assert_eq!(exported.len(), 6);
        assert!(exported.contains("pos_ffn.w_2.bias"));
        Ok(())
    }

    #[test]
    fn fresh_layer_preserves_shape() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = EncoderConfig {
            d_word_vec: 8,
            d_model: 8,
            d_inner: 32,
            ..EncoderConfig::default()
        };
        let ffn = PositionwiseFeedForward::new(&config, 1, DType::F32, &device)?;
        let x = Tensor::randn(0f32, 1.0, (3, 5, 8), &device)?;
        assert_eq!(ffn.forward(&x)?.dims(), &[3, 5, 8]);
        Ok(())
    }
}
