//! Test utilities shared by unit and integration tests
//!
//! Compiled for this crate's tests and, through the `test-utils` feature,
//! for the integration tests under `tests/`.

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;
