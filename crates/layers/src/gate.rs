//! Learned tanh gate used to blend a new branch into the residual stream.
//!
//! The gate holds a single scalar `g` and computes `branch * tanh(g) +
//! residual`. Starting from `g = 0` the gated block is an exact identity, so
//! inserting it into a pretrained language model leaves its outputs unchanged
//! until the gate is trained away from zero.

use candle_core::{DType, Device, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy};

#[derive(Debug, Clone)]
pub struct TanhGate {
    value: Var,
}

impl TanhGate {
    /// A trainable gate with shape `[1]`, initialised to zero.
    pub fn zeros(dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self {
            value: Var::zeros(1, dtype, device)?,
        })
    }

    /// Wraps a gate parameter loaded from a checkpoint.
    pub fn from_tensor(value: &Tensor) -> Result<Self> {
        checks::expect_shape("gate", value, &[1])?;
        checks::expect_dtype_in("gate", value, &[DType::F16, DType::BF16, DType::F32])?;
        Ok(Self {
            value: Var::from_tensor(value)?,
        })
    }

    pub fn value(&self) -> &Tensor {
        self.value.as_tensor()
    }

    /// Overwrites the raw gate value.
    pub fn set(&self, value: &Tensor) -> Result<()> {
        checks::expect_shape("gate", value, &[1])?;
        self.value.set(&value.to_dtype(self.value.dtype())?)
    }

    /// `tanh(g)` as a host scalar.
    pub fn factor(&self) -> Result<f32> {
        self.value
            .tanh()?
            .to_dtype(DType::F32)?
            .squeeze(0)?
            .to_vec0::<f32>()
    }

    /// `branch * tanh(g) + residual`.
    pub fn forward(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        checks::expect_shape("gate.branch", branch, residual.dims())?;
        let factor = policy.cast_for_matmul(&self.value.tanh()?)?;
        let gated = policy.cast_for_matmul(branch)?.broadcast_mul(&factor)?;
        let out = gated.add(&policy.cast_for_matmul(residual)?)?;
        policy.cast_to_storage(&out)
    }
}
