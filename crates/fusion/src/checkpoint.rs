//! Named parameter maps compatible with the published PyTorch checkpoints.
//!
//! Names follow the module paths of the reference models, e.g.
//! `layer_stack.0.slf_attn.w_qs.weight` for the encoder or `attn.to_kv.weight`
//! and `ff_gate` for a gated cross-attention block.

use std::{collections::HashMap, path::Path};

use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{LayerNorm, Linear, LinearConfig, NormConfig};

use crate::error::FusionError;

/// Joins a module prefix and a parameter name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct StateDict {
    tensors: HashMap<String, Tensor>,
}

impl From<HashMap<String, Tensor>> for StateDict {
    fn from(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every tensor of a `.safetensors` file onto `device`.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> std::result::Result<Self, FusionError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FusionError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
            ));
        }
        let tensors = candle_core::safetensors::load(path, device)?;
        log::info!(
            "loaded {} tensors from {}",
            tensors.len(),
            path.display()
        );
        Ok(Self { tensors })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::result::Result<(), FusionError> {
        if self.tensors.is_empty() {
            return Err(FusionError::Config(
                "refusing to write an empty checkpoint".to_owned(),
            ));
        }
        candle_core::safetensors::save(&self.tensors, path.as_ref())?;
        Ok(())
    }

    /// Casts every floating point tensor to `dtype`.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        let mut tensors = HashMap::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?
            } else {
                tensor.clone()
            };
            tensors.insert(name.clone(), tensor);
        }
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Parameter names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names = self.tensors.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        match self.tensors.get(name) {
            Some(tensor) => Ok(tensor),
            None => bail!("checkpoint is missing tensor '{name}'"),
        }
    }

    pub fn into_inner(self) -> HashMap<String, Tensor> {
        self.tensors
    }

    pub(crate) fn linear(&self, prefix: &str, config: LinearConfig) -> Result<Linear> {
        let weight = self.get(&join(prefix, "weight"))?.contiguous()?;
        let bias = if config.bias {
            Some(self.get(&join(prefix, "bias"))?.contiguous()?)
        } else {
            None
        };
        Linear::new(config, weight, bias)
    }

    pub(crate) fn layer_norm(&self, prefix: &str, config: NormConfig) -> Result<LayerNorm> {
        let weight = self.get(&join(prefix, "weight"))?.contiguous()?;
        let bias = self.get(&join(prefix, "bias"))?.contiguous()?;
        LayerNorm::new(weight, bias, config)
    }

    pub(crate) fn insert_linear(&mut self, prefix: &str, linear: &Linear) {
        self.insert(join(prefix, "weight"), linear.weight().clone());
        if let Some(bias) = linear.bias() {
            self.insert(join(prefix, "bias"), bias.clone());
        }
    }

    pub(crate) fn insert_layer_norm(&mut self, prefix: &str, norm: &LayerNorm) {
        self.insert(join(prefix, "weight"), norm.weight().clone());
        self.insert(join(prefix, "bias"), norm.bias().clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_skips_empty_prefix() {
        assert_eq!(join("", "attn_gate"), "attn_gate");
        assert_eq!(join("layer_stack.1", "pos_ffn"), "layer_stack.1.pos_ffn");
    }

    #[test]
    fn missing_tensor_names_the_key() -> Result<()> {
        let state = StateDict::new();
        let err = state.get("attn.to_q.weight").unwrap_err();
        assert!(err.to_string().contains("attn.to_q.weight"));
        Ok(())
    }

    #[test]
    fn linear_round_trip_through_state() -> Result<()> {
        let device = Device::Cpu;
        let mut state = StateDict::new();
        let linear = Linear::new(
            LinearConfig::new(2, 3),
            Tensor::ones((3, 2), DType::F32, &device)?,
            Some(Tensor::zeros(3, DType::F32, &device)?),
        )?;
        state.insert_linear("fc", &linear);
        assert_eq!(state.names(), vec!["fc.bias", "fc.weight"]);

        let restored = state.linear("fc", LinearConfig::new(2, 3))?;
        assert_eq!(restored.weight().dims(), &[3, 2]);
        assert!(state.linear("fc", LinearConfig::new(3, 3)).is_err());
        Ok(())
    }

    #[test]
    fn to_dtype_casts_float_tensors() -> Result<()> {
        let device = Device::Cpu;
        let mut state = StateDict::new();
        state.insert("w", Tensor::ones(2, DType::F32, &device)?);
        state.insert("ids", Tensor::ones(2, DType::U32, &device)?);
        let cast = state.to_dtype(DType::BF16)?;
        assert_eq!(cast.get("w")?.dtype(), DType::BF16);
        assert_eq!(cast.get("ids")?.dtype(), DType::U32);
        Ok(())
    }
}
