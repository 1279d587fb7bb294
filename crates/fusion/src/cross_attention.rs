//! Cross-attention from text hidden states to audio embeddings, restricted
//! by media markers in the text.

use std::sync::OnceLock;

use attention::masks::{
    combine_keep_masks, media::locations_from_tensor, padding_keep_mask_from_media_mask,
    MediaWindows,
};
use attention::{Config as AttentionConfig, ExactAttention};
use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{
    checks, norm::DEFAULT_EPSILON, LayerNorm, Linear, LinearConfig, LinearInit, LinearLayer,
    NormConfig, NormalizationLayer, PrecisionPolicy,
};

use crate::checkpoint::{join, StateDict};
use crate::config::CrossAttentionConfig;
use crate::self_attention::{merge_heads, split_heads};

/// Audio side inputs of a cross-attention call.
#[derive(Debug, Clone, Copy)]
pub struct MediaInputs<'a> {
    /// Audio embeddings `[batch, slots, 1, dim_audio]`.
    pub media: &'a Tensor,
    /// `[batch, slots, 1]`, non-zero where the slot holds a real embedding.
    pub media_mask: &'a Tensor,
    /// `[batch, text_len]`, non-zero at media marker positions.
    pub media_locations: Option<&'a Tensor>,
    /// Incremental decoding: the text chunk follows every marker seen so far.
    pub use_cached_media: bool,
}

impl<'a> MediaInputs<'a> {
    pub fn new(media: &'a Tensor, media_mask: &'a Tensor) -> Self {
        Self {
            media,
            media_mask,
            media_locations: None,
            use_cached_media: false,
        }
    }

    pub fn with_locations(mut self, media_locations: &'a Tensor) -> Self {
        self.media_locations = Some(media_locations);
        self
    }

    pub fn cached(mut self, use_cached_media: bool) -> Self {
        self.use_cached_media = use_cached_media;
        self
    }
}

#[derive(Debug)]
pub struct MaskedCrossAttention {
    config: CrossAttentionConfig,
    policy: PrecisionPolicy,
    windows: MediaWindows,
    norm: LayerNorm,
    to_q: Linear,
    to_kv: Linear,
    to_out: Linear,
    attention: ExactAttention,
    first_forward: OnceLock<()>,
}

impl MaskedCrossAttention {
    pub fn new(config: CrossAttentionConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let init = LinearInit::torch_default();
        let norm = LayerNorm::ones(Self::norm_config(&config), dtype, device)?;
        let to_q = Linear::with_init(Self::q_config(&config), &init, device, dtype)?;
        let to_kv = Linear::with_init(Self::kv_config(&config), &init, device, dtype)?;
        let to_out = Linear::with_init(Self::out_config(&config), &init, device, dtype)?;
        Self::assemble(config, dtype, norm, to_q, to_kv, to_out)
    }

    /// Loads `{prefix}.norm`, `{prefix}.to_q`, `{prefix}.to_kv` and `{prefix}.to_out`.
    pub fn from_state(config: CrossAttentionConfig, state: &StateDict, prefix: &str) -> Result<Self> {
        config.validate()?;
        let norm = state.layer_norm(&join(prefix, "norm"), Self::norm_config(&config))?;
        let to_q = state.linear(&join(prefix, "to_q"), Self::q_config(&config))?;
        let to_kv = state.linear(&join(prefix, "to_kv"), Self::kv_config(&config))?;
        let to_out = state.linear(&join(prefix, "to_out"), Self::out_config(&config))?;
        let dtype = to_q.weight().dtype();
        Self::assemble(config, dtype, norm, to_q, to_kv, to_out)
    }

    fn norm_config(config: &CrossAttentionConfig) -> NormConfig {
        NormConfig::new(config.dim).with_epsilon(DEFAULT_EPSILON)
    }

    fn q_config(config: &CrossAttentionConfig) -> LinearConfig {
        LinearConfig::no_bias(config.dim, config.inner_dim())
    }

    fn kv_config(config: &CrossAttentionConfig) -> LinearConfig {
        LinearConfig::no_bias(config.dim_audio, config.inner_dim()).fused(2)
    }

    fn out_config(config: &CrossAttentionConfig) -> LinearConfig {
        LinearConfig::no_bias(config.inner_dim(), config.dim)
    }

    fn assemble(
        config: CrossAttentionConfig,
        dtype: DType,
        norm: LayerNorm,
        to_q: Linear,
        to_kv: Linear,
        to_out: Linear,
    ) -> Result<Self> {
        let windows = MediaWindows::new(
            config.max_window_per_audio,
            config.only_attend_immediate_media,
        )?;
        log::info!(
            "masked cross-attention: dim={} dim_audio={} heads={} dim_head={} window={} immediate={} dtype={:?}",
            config.dim,
            config.dim_audio,
            config.heads,
            config.dim_head,
            config.max_window_per_audio,
            config.only_attend_immediate_media,
            dtype
        );
        Ok(Self {
            config,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            windows,
            norm,
            to_q,
            to_kv,
            to_out,
            attention: ExactAttention::new(),
            first_forward: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &CrossAttentionConfig {
        &self.config
    }

    /// Keep mask `[batch, 1, 1|text_len, slots]` and, in immediate mode with
    /// locations, the `[batch, 1, text_len, 1]` presence mask applied after
    /// the softmax.
    fn build_masks(
        &self,
        inputs: &MediaInputs<'_>,
        batch: usize,
        text_len: usize,
        slots: usize,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let padding = padding_keep_mask_from_media_mask(inputs.media_mask)?;
        if padding.dims() != [batch, 1, slots] {
            bail!(
                "media_mask expected [{batch}, {slots}, 1], got {:?}",
                inputs.media_mask.dims()
            );
        }
        let padding = padding.unsqueeze(1)?;

        let Some(media_locations) = inputs.media_locations else {
            return Ok((padding, None));
        };
        let locations = locations_from_tensor(media_locations)?;
        if locations.len() != batch {
            bail!(
                "media_locations batch {} differs from text batch {batch}",
                locations.len()
            );
        }
        if !inputs.use_cached_media && media_locations.dims()[1] != text_len {
            bail!(
                "media_locations shape is {:?} but the text has {text_len} positions",
                media_locations.dims()
            );
        }
        if text_len == 0 {
            return Ok((padding, None));
        }

        let device = media_locations.device();
        let windows = self
            .windows
            .build_keep_mask(device, &locations, text_len, slots, inputs.use_cached_media)?
            .unsqueeze(1)?;
        let keep = combine_keep_masks(&windows, &padding)?;

        let presence = if self.config.only_attend_immediate_media {
            let presence = self
                .windows
                .build_presence_mask(device, &locations, text_len, inputs.use_cached_media)?
                .reshape((batch, 1, text_len, 1))?;
            Some(presence)
        } else {
            None
        };
        Ok((keep, presence))
    }

    /// `x [batch, text_len, dim]` attends over the media slots; returns
    /// `[batch, text_len, dim]`. An empty text chunk is validated against the
    /// media and returns an empty output.
    pub fn forward(&self, x: &Tensor, inputs: &MediaInputs<'_>) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("cross_attention.x", x, self.config.dim)?;
        let (batch, text_len, _) = x.dims3()?;

        let (media_batch, slots, extra, dim_audio) = inputs.media.dims4()?;
        if extra != 1 {
            bail!("media expected a singleton third axis, got {:?}", inputs.media.dims());
        }
        if media_batch != batch {
            bail!("media batch {media_batch} differs from text batch {batch}");
        }
        if dim_audio != self.config.dim_audio {
            bail!(
                "media width {dim_audio} differs from dim_audio {}",
                self.config.dim_audio
            );
        }
        if slots % self.config.max_window_per_audio != 0 {
            bail!(
                "media slots {slots} must be a multiple of max_window_per_audio {}",
                self.config.max_window_per_audio
            );
        }
        if self.first_forward.set(()).is_ok() {
            log::debug!(
                "masked cross-attention first forward: text {:?} media {:?} cached={}",
                x.dims(),
                inputs.media.dims(),
                inputs.use_cached_media
            );
        }

        let (keep, presence) = self.build_masks(inputs, batch, text_len, slots)?;
        if text_len == 0 {
            return Tensor::zeros((batch, 0, self.config.dim), x.dtype(), x.device());
        }

        let normed = self.norm.forward(x, &self.policy)?;
        let q = self.to_q.forward(&normed, &self.policy)?;
        let media = inputs.media.reshape((batch, slots * extra, dim_audio))?;
        let kv = self.to_kv.forward(&media, &self.policy)?;
        let (k, v) = match self.to_kv.split_fused(&kv)?.as_slice() {
            [k, v] => (k.clone(), v.clone()),
            _ => bail!("to_kv must produce exactly two projections"),
        };

        let heads = self.config.heads;
        let dim_head = self.config.dim_head;
        let q = split_heads(&q, heads, dim_head)?;
        let k = split_heads(&k, heads, dim_head)?;
        let v = split_heads(&v, heads, dim_head)?;

        let (mut out, _) = self.attention.attend_with_weights(
            &q,
            &k,
            &v,
            Some(&keep),
            &AttentionConfig::cross_attention(),
        )?;
        if let Some(presence) = presence {
            out = out.broadcast_mul(&presence.to_dtype(out.dtype())?)?;
        }

        self.to_out.forward(&merge_heads(&out)?, &self.policy)
    }

    pub(crate) fn export(&self, prefix: &str, state: &mut StateDict) {
        state.insert_layer_norm(&join(prefix, "norm"), &self.norm);
        state.insert_linear(&join(prefix, "to_q"), &self.to_q);
        state.insert_linear(&join(prefix, "to_kv"), &self.to_kv);
        state.insert_linear(&join(prefix, "to_out"), &self.to_out);
    }
}
