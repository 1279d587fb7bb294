//! Post-norm transformer encoder that compresses audio embeddings.

use std::sync::OnceLock;

use attention::masks::build_causal_keep_mask;
use candle_core::{bail, DType, Device, Result, Tensor};
use embedding::PositionalEncoding;
use layers::{
    norm::ENCODER_EPSILON, Dropout, LayerNorm, NormConfig, NormalizationLayer, PrecisionPolicy,
};

use crate::block::EncoderLayer;
use crate::checkpoint::{join, StateDict};
use crate::config::EncoderConfig;

/// Seed for the embedding dropout; layers use `2 * index` and `2 * index + 1`.
const EMBEDDING_DROPOUT_SEED: u64 = u64::MAX;

/// Stack of [`EncoderLayer`]s over `[batch, seq, d_model]` inputs.
#[derive(Debug)]
pub struct TransformerEncoder {
    config: EncoderConfig,
    policy: PrecisionPolicy,
    device: Device,
    position_enc: Option<PositionalEncoding>,
    dropout: Dropout,
    layer_norm: LayerNorm,
    layer_stack: Vec<EncoderLayer>,
    first_forward: OnceLock<()>,
}

impl TransformerEncoder {
    /// Builds an encoder with freshly initialised parameters in evaluation mode.
    pub fn new(config: EncoderConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let layer_norm = LayerNorm::ones(Self::norm_config(&config), dtype, device)?;
        let layer_stack = (0..config.n_layers)
            .map(|index| EncoderLayer::new(index, &config, dtype, device))
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(config, dtype, device, layer_norm, layer_stack)
    }

    /// Builds an encoder from checkpoint tensors named like
    /// `layer_stack.{i}.slf_attn.w_qs.weight` and `layer_norm.weight`.
    ///
    /// A stored `position_enc.pos_table` is ignored; the table is recomputed.
    pub fn from_state(config: EncoderConfig, state: &StateDict, device: &Device) -> Result<Self> {
        config.validate()?;
        if state.contains("position_enc.pos_table") {
            log::debug!("ignoring stored position_enc.pos_table, the table is recomputed");
        }
        let layer_norm = state.layer_norm("layer_norm", Self::norm_config(&config))?;
        let dtype = layer_norm.weight().dtype();
        let layer_stack = (0..config.n_layers)
            .map(|index| {
                EncoderLayer::from_state(index, &config, state, &join("layer_stack", &index.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::assemble(config, dtype, device, layer_norm, layer_stack)
    }

    /// Loads a `.safetensors` checkpoint, casting parameters to `dtype`.
    pub fn from_safetensors(
        config: EncoderConfig,
        path: impl AsRef<std::path::Path>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let state = StateDict::load(path, device)?.to_dtype(dtype)?;
        Self::from_state(config, &state, device)
    }

    fn norm_config(config: &EncoderConfig) -> NormConfig {
        NormConfig::new(config.d_model).with_epsilon(ENCODER_EPSILON)
    }

    fn assemble(
        config: EncoderConfig,
        dtype: DType,
        device: &Device,
        layer_norm: LayerNorm,
        layer_stack: Vec<EncoderLayer>,
    ) -> Result<Self> {
        let position_enc = if config.n_position > 0 {
            Some(PositionalEncoding::new(config.d_word_vec, config.n_position, device)?)
        } else {
            None
        };
        let dropout = Dropout::new(config.dropout_p(), EMBEDDING_DROPOUT_SEED);
        dropout.set_training(false);
        log::info!(
            "transformer encoder: layers={} heads={} d_model={} d_inner={} d_k={} d_v={} n_position={} scale_emb={} causal={} dtype={:?}",
            config.n_layers,
            config.n_head,
            config.d_model,
            config.d_inner,
            config.d_k,
            config.d_v,
            config.n_position,
            config.scale_emb,
            config.causal,
            dtype
        );
        Ok(Self {
            config,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            device: device.clone(),
            position_enc,
            dropout,
            layer_norm,
            layer_stack,
            first_forward: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Toggles every dropout in the stack; encoders start in evaluation mode.
    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
        for layer in &self.layer_stack {
            layer.set_training(training);
        }
    }

    pub fn forward(&self, src_seq: &Tensor) -> Result<Tensor> {
        self.run(src_seq, false).map(|(output, _)| output)
    }

    /// Like [`forward`](Self::forward) but also returns every layer's
    /// attention map `[batch, n_head, seq, seq]`.
    pub fn forward_with_attentions(&self, src_seq: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        self.run(src_seq, true)
    }

    fn run(&self, src_seq: &Tensor, return_attns: bool) -> Result<(Tensor, Vec<Tensor>)> {
        let src_seq = match src_seq.rank() {
            2 => src_seq.unsqueeze(1)?,
            3 => src_seq.clone(),
            rank => bail!(
                "encoder input expected [batch, d_model] or [batch, seq, d_model], got rank {rank}"
            ),
        };
        let (batch, seq, _) = src_seq.dims3()?;
        if self.first_forward.set(()).is_ok() {
            log::debug!("transformer encoder first forward: input {:?}", src_seq.dims());
        }

        let mut enc_output = if self.config.scale_emb {
            src_seq.affine((self.config.d_model as f64).sqrt(), 0.0)?
        } else {
            src_seq
        };
        if let Some(position_enc) = &self.position_enc {
            enc_output = position_enc.forward(&enc_output)?;
        }
        enc_output = self.dropout.forward(&enc_output, &self.policy)?;
        enc_output = self.layer_norm.forward(&enc_output, &self.policy)?;

        let causal_mask = if self.config.causal {
            Some(build_causal_keep_mask(&self.device, batch, seq, seq)?)
        } else {
            None
        };

        let mut attentions = Vec::with_capacity(if return_attns { self.layer_stack.len() } else { 0 });
        for layer in &self.layer_stack {
            let (output, attn) = layer.forward(&enc_output, causal_mask.as_ref())?;
            enc_output = output;
            if return_attns {
                attentions.push(attn);
            }
        }
        Ok((enc_output, attentions))
    }

    /// Exports parameters under the checkpoint names accepted by
    /// [`from_state`](Self::from_state).
    pub fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for (index, layer) in self.layer_stack.iter().enumerate() {
            layer.export(&join("layer_stack", &index.to_string()), &mut state);
        }
        state.insert_layer_norm("layer_norm", &self.layer_norm);
        state
    }
}
