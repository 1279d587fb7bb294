//! Portable, exact scaled dot-product attention.
//!
//! This path favours clarity over raw throughput and doubles as the numerical
//! baseline in tests.

pub mod exact;

pub use exact::ExactAttention;
