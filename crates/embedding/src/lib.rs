//! Embedding crate
//!
//! The positional module exposes the fixed sinusoidal encoding used by the
//! audio encoder.

pub mod positional;

pub use positional::*;
