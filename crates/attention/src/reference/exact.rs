//! Reference scaled dot-product attention.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, Config};
use crate::masks::{masked_fill, KEEP_MASK_DTYPE};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs attention and also returns the attention weights
    /// `[batch, n_heads, q_len, k_len]` (after dropout, in `f32`).
    pub fn attend_with_weights(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dropout={:?} mask_fill={:e}",
                config.dropout_p,
                config.mask_fill
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| AttentionError::shape("q must have shape [batch, heads, q_len, head_dim]"))?;
        let (kb, kh, k_len, kd) = k
            .dims4()
            .map_err(|_| AttentionError::shape("k must have shape [batch, heads, k_len, head_dim]"))?;
        let (vb, vh, vk, _) = v
            .dims4()
            .map_err(|_| AttentionError::shape("v must have shape [batch, heads, k_len, v_dim]"))?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, ?] got {:?}",
                v.dims()
            )));
        }
        if head_dim == 0 {
            return Err(AttentionError::shape("head_dim must be non-zero"));
        }

        let q_work = q.to_dtype(DType::F32)?.contiguous()?;
        let k_work = k.to_dtype(DType::F32)?.contiguous()?;
        let v_work = v.to_dtype(DType::F32)?.contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let mut scores = q_work
            .affine(scale, 0.0)?
            .matmul(&k_work.t()?.contiguous()?)?;

        if let Some(mask) = mask {
            if !device.same_device(mask.device()) {
                return Err(AttentionError::shape(
                    "mask must reside on the same device as q",
                ));
            }
            if mask.dtype() != KEEP_MASK_DTYPE {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!(
                        "mask expects dtype {KEEP_MASK_DTYPE:?}, got {:?}",
                        mask.dtype()
                    ),
                });
            }
            let (mb, mh, mq, mk) = mask.dims4().map_err(|_| {
                AttentionError::shape("mask must have shape [batch, heads|1, q_len|1, k_len]")
            })?;
            if mb != batch || mk != k_len || (mq != q_len && mq != 1) || (mh != heads && mh != 1) {
                return Err(AttentionError::shape(format!(
                    "mask shape mismatch: expected [{batch}, 1|{heads}, 1|{q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
                )));
            }
            scores = masked_fill(&scores, mask, config.mask_fill)?;
        }

        let mut weights = softmax_last_dim(&scores.contiguous()?)?;

        if let Some(dropout_p) = config.dropout_p {
            if !(0.0..1.0).contains(&dropout_p) {
                return Err(AttentionError::shape(format!(
                    "dropout probability must be in [0, 1), got {dropout_p}"
                )));
            }
            if dropout_p > 0.0 {
                weights = dropout(&weights, dropout_p)?;
            }
        }

        let output = weights.matmul(&v_work)?.to_dtype(dtype)?;
        Ok((output, weights))
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        self.attend_with_weights(q, k, v, mask, config)
            .map(|(output, _)| output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::build_causal_keep_mask;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.iter().rev().copied().collect::<Vec<_>>(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    fn causal_mask(device: &Device, heads: usize, len: usize) -> CandleResult<Tensor> {
        build_causal_keep_mask(device, 1, len, len)?
            .unsqueeze(1)?
            .repeat((1, heads, 1, 1))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, v_dim) = v.dims4()?;
        let mut output = vec![0f32; batch * heads * q_len * v_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<u8>()?),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();

        for b in 0..batch {
            for h in 0..heads {
                for q_idx in 0..q_len {
                    let mut row = vec![f32::NEG_INFINITY; k_len];
                    for (k_idx, slot) in row.iter_mut().enumerate() {
                        if let Some(mask_vec) = &mask_vec {
                            let mi = ((b * heads + h) * q_len + q_idx) * k_len + k_idx;
                            if mask_vec[mi] == 0 {
                                continue;
                            }
                        }
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                            let ki = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            dot += q_vec[qi] * k_vec[ki];
                        }
                        *slot = dot * scale;
                    }
                    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let exps: Vec<f32> = row.iter().map(|v| (v - max_val).exp()).collect();
                    let denom: f32 = exps.iter().sum();
                    for d in 0..v_dim {
                        let mut acc = 0f32;
                        for (k_idx, e) in exps.iter().enumerate() {
                            let vi = ((b * heads + h) * k_len + k_idx) * v_dim + d;
                            acc += e / denom * v_vec[vi];
                        }
                        output[((b * heads + h) * q_len + q_idx) * v_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, v_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = causal_mask(&device, 2, 4)?;
        let output = ExactAttention::new().attend(&q, &k, &v, Some(&mask), &Config::default())?;
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        assert!(max_diff(&output, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn value_width_may_differ_from_key_width() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 3, 5, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (2, 3, 7, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (2, 3, 7, 6), &device)?;
        let (output, weights) =
            ExactAttention::new().attend_with_weights(&q, &k, &v, None, &Config::default())?;
        assert_eq!(output.dims(), &[2, 3, 5, 6]);
        assert_eq!(weights.dims(), &[2, 3, 5, 7]);
        assert!(max_diff(&output, &naive_attention(&q, &k, &v, None)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn weights_rows_sum_to_one_and_respect_mask() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = causal_mask(&device, 1, 4)?;
        let (_, weights) =
            ExactAttention::new().attend_with_weights(&q, &k, &v, Some(&mask), &Config::default())?;
        let sums = weights.sum_keepdim(3)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        let rows = weights.flatten_all()?.to_vec1::<f32>()?;
        // First query may only see the first key.
        assert_eq!(&rows[1..4], &[0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn broadcast_padding_mask_is_accepted() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = Tensor::from_vec(vec![1u8, 1, 0, 0], (1, 1, 1, 4), &device)?;
        let (_, weights) =
            ExactAttention::new().attend_with_weights(&q, &k, &v, Some(&mask), &Config::default())?;
        let values = weights.flatten_all()?.to_vec1::<f32>()?;
        for row in values.chunks(4) {
            assert_eq!(&row[2..], &[0.0, 0.0]);
        }
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device)?;
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let err = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn mask_shape_and_dtype_validation() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let attention = ExactAttention::new();

        let mask = Tensor::ones((1, 3, 4, 4), DType::U8, &device)?;
        let err = attention
            .attend(&q, &q, &q, Some(&mask), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let mask = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let err = attention
            .attend(&q, &q, &q, Some(&mask), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
        Ok(())
    }

    #[test]
    fn dtype_matrix() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = causal_mask(&device, 2, 4)?;
        let reference = ExactAttention::new().attend(&q, &k, &v, Some(&mask), &Config::default())?;
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = ExactAttention::new().attend(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                Some(&mask),
                &Config::default(),
            )?;
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let out = ExactAttention::new().attend(&q, &k, &v, None, &Config::default())?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn fully_masked_row_stays_finite() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = Tensor::zeros((1, 1, 4, 4), DType::U8, &device)?;
        for config in [Config::default(), Config::cross_attention()] {
            let (out, weights) =
                ExactAttention::new().attend_with_weights(&q, &k, &v, Some(&mask), &config)?;
            let out = out.flatten_all()?.to_vec1::<f32>()?;
            assert!(out.iter().all(|value| value.is_finite()));
            // A row with nothing to attend to degrades to a uniform average.
            let weights = weights.flatten_all()?.to_vec1::<f32>()?;
            assert!(weights.iter().all(|w| (w - 0.25).abs() < 1e-6));
        }
        Ok(())
    }

    #[test]
    fn dropout_zero_probability_is_noop() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = causal_mask(&device, 2, 4)?;
        let config = Config::default().with_dropout(Some(0.0));
        let out = ExactAttention::new().attend(&q, &k, &v, Some(&mask), &config)?;
        let reference = ExactAttention::new().attend(&q, &k, &v, Some(&mask), &Config::default())?;
        assert!(max_diff(&out, &reference)? < 1e-6);

        let invalid = Config::default().with_dropout(Some(1.0));
        assert!(ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &invalid)
            .is_err());
        Ok(())
    }
}
