//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `label` naming the tensor being checked so the error
//! message points at the offending parameter or activation. They return
//! `candle_core::Result<()>` so call sites can propagate with `?`.

use candle_core::{bail, DType, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        bail!("{label}: expected shape {expected:?}, got {actual:?}")
    }
}

/// Ensures a tensor has the given number of dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.rank();
    if actual == rank {
        Ok(())
    } else {
        bail!(
            "{label}: expected rank {rank}, got {actual} ({:?})",
            tensor.dims()
        )
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual_hidden] if *actual_hidden == hidden => Ok(()),
        dims => bail!("{label}: expected (batch, seq, {hidden}) layout, got {dims:?}"),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        bail!("{label}: expected dtype in {allowed:?}, got {dtype:?}")
    }
}

/// Checks two tensors share a dtype.
pub fn expect_same_dtype(
    label: &str,
    tensor: &Tensor,
    other_label: &str,
    other: &Tensor,
) -> Result<()> {
    if tensor.dtype() == other.dtype() {
        Ok(())
    } else {
        bail!(
            "{label} has dtype {:?} but {other_label} has dtype {:?}",
            tensor.dtype(),
            other.dtype()
        )
    }
}

/// Parameters are expected to be laid out contiguously.
pub fn expect_contiguous(label: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        bail!("{label}: tensor must be contiguous")
    }
}

/// Rejects casts between float and integer families.
pub fn ensure_cast_supported(label: &str, from: DType, to: DType) -> Result<()> {
    if from == to || (from.is_float() && to.is_float()) {
        Ok(())
    } else {
        bail!("{label}: unsupported cast from {from:?} to {to:?}")
    }
}
