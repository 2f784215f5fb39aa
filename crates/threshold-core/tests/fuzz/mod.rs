//! Fuzz tests module
//!
//! Property-based testing using proptest:
//! - Field arithmetic and interpolation invariants

pub mod sharing_fuzz;
