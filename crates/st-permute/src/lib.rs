// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralPermute — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Grid-overlap keyed permutation engine for split-input training.
//!
//! An image batch is partitioned into a grid of (optionally overlapping)
//! cells. Each cell owns a deterministic, seed-keyed rearrangement (either a
//! per-channel pixel permutation or a block-wise scrambling cipher) and the
//! engine emits one transformed patch batch per cell so that downstream model
//! heads never observe the plaintext spatial arrangement shared by other
//! cells.
//!
//! The pipeline is strictly layered: [`grid::active_cells`] classifies the
//! half-integer lattice, [`keys::derive_keys`] turns a master seed into
//! per-cell key material, [`transform::build_transform_set`] builds the
//! per-cell bijections, and [`engine`] slices batches and drives the
//! epoch-wrapping generator role consumed by training loops.

pub mod engine;
pub mod grid;
pub mod keys;
pub mod transform;

use thiserror::Error;

/// Errors surfaced by the permutation engine.
#[derive(Debug, Error, PartialEq)]
pub enum PermuteError {
    /// Raised when inputs have mismatched batch, grid, or channel dimensions.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Raised when an invalid configuration value is provided. Detected
    /// eagerly at construction, never deferred into batch production.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal-consistency fault between key material, transforms, and
    /// slicing assumptions. Indicates a logic defect, not a transient
    /// condition; aborts the current call.
    #[error("internal consistency fault: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PermuteError>;

pub use engine::{
    cell_window, extract_patches, Augmenter, GeneratorConfig, PatchBatch, PermutationGenerator,
};
pub use grid::{active_cells, GridCoordinate, OverlapScheme};
pub use keys::{derive_keys, CellKey, KeySet, MAX_KEY};
pub use transform::{
    build_cell_transform, build_transform_set, BlockScramble, CellTransform, PatchShape,
    PermutationScheme, SpatialPermutation, TransformSet,
};
