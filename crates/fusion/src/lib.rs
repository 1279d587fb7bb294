//! Audio-conditioned language model components.
//!
//! [`TransformerEncoder`] compresses audio embeddings with a post-norm
//! self-attention stack. [`GatedCrossAttentionBlock`] lets text hidden states
//! attend to those embeddings, restricted by media markers in the text, and
//! blends the result in through zero-initialised tanh gates.

pub mod block;
pub mod checkpoint;
pub mod config;
pub mod cross_attention;
pub mod encoder;
pub mod error;
pub mod feed_forward;
pub mod gated;
pub mod self_attention;

pub use block::EncoderLayer;
pub use checkpoint::StateDict;
pub use config::{CrossAttentionConfig, EncoderConfig, FusionConfig, GatedCrossAttentionConfig};
pub use cross_attention::{MaskedCrossAttention, MediaInputs};
pub use encoder::TransformerEncoder;
pub use error::FusionError;
pub use feed_forward::PositionwiseFeedForward;
pub use gated::GatedCrossAttentionBlock;
pub use self_attention::MultiHeadAttention;
