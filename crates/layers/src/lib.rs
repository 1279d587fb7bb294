//! Building blocks for the fusion transformer layers.
//!
//! Every layer consumes hidden states shaped `(batch, seq, hidden)` and is
//! assembled from Candle primitives. Parameters may be stored in reduced
//! precision; [`dtypes::PrecisionPolicy`] decides where tensors are promoted
//! for matmuls and reductions.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod gate;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::{builtin, Activation, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use gate::TanhGate;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
pub use mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer};
pub use norm::{LayerNorm, NormConfig, NormalizationLayer};
pub use residual::{Dropout, DropoutMode, Residual, ResidualConfig};
