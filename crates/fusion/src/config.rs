//! Serializable hyper-parameters for the encoder and the gated
//! cross-attention block.
//!
//! Dtype and device are runtime choices and are passed to the constructors
//! instead of being stored here.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::FusionError;

/// Hyper-parameters of [`TransformerEncoder`](crate::TransformerEncoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Width of the incoming embeddings (and of the positional table).
    pub d_word_vec: usize,
    pub n_layers: usize,
    pub n_head: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub d_model: usize,
    /// Hidden width of the position-wise feed-forward.
    pub d_inner: usize,
    /// Dropout after the embeddings and on every residual branch.
    pub dropout: f32,
    /// Number of encoded positions; `0` disables the positional encoding.
    pub n_position: usize,
    /// Multiply the input by `sqrt(d_model)` before the positional encoding.
    pub scale_emb: bool,
    /// Restrict self-attention to earlier positions.
    pub causal: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            d_word_vec: 512,
            n_layers: 6,
            n_head: 8,
            d_k: 64,
            d_v: 64,
            d_model: 512,
            d_inner: 2048,
            dropout: 0.0,
            n_position: 16,
            scale_emb: true,
            causal: false,
        }
    }
}

impl EncoderConfig {
    fn collect_errors(&self, prefix: &str, errors: &mut Vec<String>) {
        for (name, value) in [
            ("d_word_vec", self.d_word_vec),
            ("n_layers", self.n_layers),
            ("n_head", self.n_head),
            ("d_k", self.d_k),
            ("d_v", self.d_v),
            ("d_model", self.d_model),
            ("d_inner", self.d_inner),
        ] {
            if value == 0 {
                errors.push(format!("{prefix}{name} must be greater than 0"));
            }
        }
        if self.d_word_vec != self.d_model {
            errors.push(format!(
                "{prefix}d_word_vec ({}) must equal d_model ({})",
                self.d_word_vec, self.d_model
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            errors.push(format!("{prefix}dropout must be in [0, 1)"));
        }
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        finish(|errors| self.collect_errors("", errors))
    }

    /// Optional dropout probability, `None` when disabled.
    pub fn dropout_p(&self) -> Option<f32> {
        (self.dropout > 0.0).then_some(self.dropout)
    }
}

fn default_dim_head() -> usize {
    64
}

fn default_heads() -> usize {
    8
}

fn default_only_attend_immediate_media() -> bool {
    true
}

fn default_ff_mult() -> f64 {
    4.0
}

/// Hyper-parameters of [`MaskedCrossAttention`](crate::MaskedCrossAttention).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossAttentionConfig {
    /// Width of the text hidden states.
    pub dim: usize,
    /// Width of the audio embeddings.
    pub dim_audio: usize,
    /// Number of media slots owned by each media marker.
    pub max_window_per_audio: usize,
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,
    #[serde(default = "default_heads")]
    pub heads: usize,
    #[serde(default = "default_only_attend_immediate_media")]
    pub only_attend_immediate_media: bool,
}

impl CrossAttentionConfig {
    pub fn new(dim: usize, dim_audio: usize, max_window_per_audio: usize) -> Self {
        Self {
            dim,
            dim_audio,
            max_window_per_audio,
            dim_head: default_dim_head(),
            heads: default_heads(),
            only_attend_immediate_media: default_only_attend_immediate_media(),
        }
    }

    pub fn inner_dim(&self) -> usize {
        self.dim_head * self.heads
    }

    fn collect_errors(&self, prefix: &str, errors: &mut Vec<String>) {
        for (name, value) in [
            ("dim", self.dim),
            ("dim_audio", self.dim_audio),
            ("max_window_per_audio", self.max_window_per_audio),
            ("dim_head", self.dim_head),
            ("heads", self.heads),
        ] {
            if value == 0 {
                errors.push(format!("{prefix}{name} must be greater than 0"));
            }
        }
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        finish(|errors| self.collect_errors("", errors))
    }
}

/// Hyper-parameters of [`GatedCrossAttentionBlock`](crate::GatedCrossAttentionBlock).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatedCrossAttentionConfig {
    #[serde(flatten)]
    pub attention: CrossAttentionConfig,
    /// Expansion ratio of the gated feed-forward.
    #[serde(default = "default_ff_mult")]
    pub ff_mult: f64,
}

impl GatedCrossAttentionConfig {
    pub fn new(attention: CrossAttentionConfig) -> Self {
        Self {
            attention,
            ff_mult: default_ff_mult(),
        }
    }

    fn collect_errors(&self, prefix: &str, errors: &mut Vec<String>) {
        self.attention.collect_errors(prefix, errors);
        if !(self.ff_mult > 0.0) || (self.attention.dim as f64 * self.ff_mult) < 1.0 {
            errors.push(format!(
                "{prefix}ff_mult must give a feed-forward width of at least 1"
            ));
        }
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        finish(|errors| self.collect_errors("", errors))
    }
}

/// Top-level file layout: an `[encoder]` table and an optional
/// `[cross_attention]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub cross_attention: Option<GatedCrossAttentionConfig>,
}

impl FusionConfig {
    /// Reads a `.toml` or `.json` file and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FusionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| FusionError::io(path, err))?;
        let config: FusionConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(FusionError::Config(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        log::debug!("loaded fusion config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        finish(|errors| {
            self.encoder.collect_errors("encoder.", errors);
            if let Some(cross) = &self.cross_attention {
                cross.collect_errors("cross_attention.", errors);
            }
        })
    }

    pub fn to_toml_string(&self) -> Result<String, FusionError> {
        toml::to_string_pretty(self).map_err(|err| FusionError::Config(err.to_string()))
    }
}

fn finish(collect: impl FnOnce(&mut Vec<String>)) -> Result<(), FusionError> {
    let mut errors = Vec::new();
    collect(&mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FusionError::validation(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_defaults_match_reference_model() {
        let config = EncoderConfig::default();
        assert_eq!(config.d_model, 512);
        assert_eq!(config.n_layers, 6);
        assert_eq!(config.n_position, 16);
        assert!(config.scale_emb);
        assert!(config.dropout_p().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_collects_every_problem() {
        let config = EncoderConfig {
            n_head: 0,
            d_word_vec: 256,
            dropout: 1.5,
            ..EncoderConfig::default()
        };
        match config.validate() {
            Err(FusionError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn cross_attention_fields_default_when_missing() -> anyhow::Result<()> {
        let config: GatedCrossAttentionConfig =
            toml::from_str("dim = 32\ndim_audio = 16\nmax_window_per_audio = 4\n")?;
        assert_eq!(config.attention.dim_head, 64);
        assert_eq!(config.attention.heads, 8);
        assert!(config.attention.only_attend_immediate_media);
        assert_eq!(config.ff_mult, 4.0);
        Ok(())
    }

    #[test]
    fn required_cross_attention_fields_are_enforced() {
        let parsed: Result<CrossAttentionConfig, _> = toml::from_str("dim = 32\n");
        assert!(parsed.is_err());

        let config = GatedCrossAttentionConfig {
            ff_mult: 0.0,
            ..GatedCrossAttentionConfig::new(CrossAttentionConfig::new(8, 8, 0))
        };
        match config.validate() {
            Err(FusionError::Validation(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
