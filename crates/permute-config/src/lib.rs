//! Runtime configuration shared by the SpiralPermute crates.
//!
//! Two concerns live here: deterministic RNG construction driven by
//! environment variables, and tracing-subscriber initialisation for binaries
//! and experiment drivers.

pub mod determinism;
pub mod tracing;
