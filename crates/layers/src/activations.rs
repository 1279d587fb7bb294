//! Activation catalogue for the feed-forward stacks.
//!
//! * **ReLU** drives the position-wise feed-forward of the audio encoder.
//! * **GELU** uses the exact erf form `0.5 * x * (1 + erf(x / sqrt(2)))` and
//!   drives the feed-forward of the gated cross-attention block.
//!
//! Inputs are promoted to the compute dtype before evaluation and cast back
//! to storage afterwards.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Exact (erf based) GELU.
    Gelu,
    /// Rectified linear unit.
    Relu,
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Gelu => compute.gelu_erf()?,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::Gelu);
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = activation.forward(&input, &policy)?;

        let reference = {
            let inner = (input.affine(1.0 / SQRT_2, 0.0)?.erf()? + 1.0)?;
            input.affine(0.5, 0.0)?.mul(&inner)?
        };

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn relu_zeroes_negatives_and_keeps_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let activation = builtin(ActivationKind::Relu);
        let input =
            Tensor::from_slice(&[-3.0f32, -0.0, 0.5, 2.0], (4,), &device)?.to_dtype(DType::F16)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let output = activation.forward(&input, &policy)?;
        assert_eq!(output.dtype(), DType::F16);
        let values = output.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        assert_eq!(values, vec![0.0, 0.0, 0.5, 2.0]);
        Ok(())
    }
}
