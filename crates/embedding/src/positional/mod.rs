//! Positional encodings.

pub mod sinusoidal;

pub use sinusoidal::{get_sinusoid_table, sinusoid_table, PositionalEncoding};
