//! Dropout and residual connections.
//!
//! Dropout masks are sampled from a seeded linear congruential generator so
//! training runs are reproducible. Both helpers are no-ops once
//! `set_training(false)` has been called.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use candle_core::{bail, DType, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Dropout policy.
#[derive(Debug)]
pub enum DropoutMode {
    /// Dropout is disabled (evaluation, or probability zero).
    Disabled,
    /// Dropout is active and uses the supplied probability and RNG.
    Enabled { probability: f32, rng: Mutex<Lcg64> },
}

impl Clone for DropoutMode {
    fn clone(&self) -> Self {
        match self {
            DropoutMode::Disabled => DropoutMode::Disabled,
            DropoutMode::Enabled { probability, rng } => {
                let state = match rng.lock() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                DropoutMode::Enabled {
                    probability: *probability,
                    rng: Mutex::new(state),
                }
            }
        }
    }
}

impl DropoutMode {
    /// Builds a mode from an optional probability; `None` or `0.0` disables dropout.
    pub fn from_probability(probability: Option<f32>, seed: u64) -> Self {
        match probability.unwrap_or(0.0) {
            p if p <= 0.0 || p >= 1.0 => DropoutMode::Disabled,
            p => DropoutMode::Enabled {
                probability: p,
                rng: Mutex::new(Lcg64::new(seed)),
            },
        }
    }
}

/// Inverted dropout over tensors of any shape.
pub struct Dropout {
    mode: DropoutMode,
    training: AtomicBool,
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode.clone(),
            training: AtomicBool::new(self.is_training()),
        }
    }
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("mode", &self.mode)
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// Starts in training mode.
    pub fn new(probability: Option<f32>, seed: u64) -> Self {
        Self {
            mode: DropoutMode::from_probability(probability, seed),
            training: AtomicBool::new(true),
        }
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Zeroes elements with the configured probability and rescales the rest.
    pub fn forward(&self, tensor: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (probability, rng) = match &self.mode {
            DropoutMode::Enabled { probability, rng } if self.is_training() => (*probability, rng),
            _ => return Ok(tensor.clone()),
        };
        let keep_prob = 1.0 - probability;
        let device = tensor.device();
        let dtype = policy.compute();
        let total = tensor.elem_count();
        let mask_data = {
            let mut rng = match rng.lock() {
                Ok(guard) => guard,
                Err(_) => bail!("dropout RNG mutex poisoned"),
            };
            (0..total)
                .map(|_| {
                    if rng.next_f32() < keep_prob {
                        1.0f32 / keep_prob
                    } else {
                        0.0
                    }
                })
                .collect::<Vec<_>>()
        };
        checks::ensure_cast_supported("dropout.mask", DType::F32, dtype)?;
        let mask = Tensor::from_vec(mask_data, tensor.dims(), device)?.to_dtype(dtype)?;
        let dropped = policy.cast_for_matmul(tensor)?.mul(&mask)?;
        policy.cast_to_storage(&dropped)
    }
}

/// Configuration describing a residual connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    /// Dropout probability applied to the branch during training.
    pub dropout_p: Option<f32>,
}

impl ResidualConfig {
    pub fn new(dropout_p: Option<f32>) -> Self {
        Self { dropout_p }
    }
}

/// `residual + dropout(branch)`.
#[derive(Debug, Clone)]
pub struct Residual {
    config: ResidualConfig,
    dropout: Dropout,
}

impl Residual {
    /// Creates a residual helper with a deterministic dropout seed.
    pub fn new(config: ResidualConfig, seed: u64) -> Self {
        let dropout = Dropout::new(config.dropout_p, seed);
        Self { config, dropout }
    }

    pub fn config(&self) -> &ResidualConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Applies dropout to `branch` and adds it to `residual`.
    pub fn forward(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let branch = self.dropout.forward(branch, policy)?;
        let added = policy
            .cast_for_matmul(&branch)?
            .add(&policy.cast_for_matmul(residual)?)?;
        policy.cast_to_storage(&added)
    }
}

/// 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
pub struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX multiplier.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
