// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralPermute — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-cell transform construction.
//!
//! Each grid cell owns either a per-channel pixel permutation, a keyed
//! channel-joint block cipher, or nothing at all (identity). Transforms
//! permute positions only; pixel values are never clipped or rescaled.

use crate::grid::{active_cells, GridCoordinate, OverlapScheme};
use crate::keys::{derive_keys, CellKey};
use crate::{PermuteError, Result};
use ndarray::{ArrayView3, ArrayViewMut3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

/// Shape of one extracted sub-region: spatial extent plus channel depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl PatchShape {
    /// Builds a patch shape, rejecting zero-sized axes.
    pub fn new(height: usize, width: usize, channels: usize) -> Result<Self> {
        if height == 0 || width == 0 || channels == 0 {
            return Err(PermuteError::InvalidConfig(format!(
                "patch shape must be non-zero, got {height}x{width}x{channels}"
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
        })
    }

    /// Number of spatial positions in the patch.
    pub fn spatial_len(&self) -> usize {
        self.height * self.width
    }

    /// Total number of elements including channels.
    pub fn len(&self) -> usize {
        self.spatial_len() * self.channels
    }

    /// Returns `true` for an empty patch; never holds for constructed values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configuration tag selecting the rearrangement family applied to keyed
/// cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermutationScheme {
    /// No rearrangement; the unobfuscated control condition.
    Identity,
    /// One flat-index bijection per channel.
    PixelShuffle,
    /// A single keyed block cipher shared by all channels of a cell.
    BlockScramble {
        block_rows: usize,
        block_cols: usize,
    },
}

impl PermutationScheme {
    /// Number of keys drawn per cell: one per channel for the per-channel
    /// families, one total for the channel-joint cipher.
    pub fn repeats(&self, channels: usize) -> usize {
        match self {
            PermutationScheme::Identity | PermutationScheme::PixelShuffle => channels,
            PermutationScheme::BlockScramble { .. } => 1,
        }
    }
}

/// Bijection over the flattened spatial index range of a patch.
///
/// Application uses gather semantics: output position `k` reads input
/// position `indices[k]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpatialPermutation {
    forward: Vec<u32>,
}

impl SpatialPermutation {
    /// Builds a keyed bijection by shuffling the identity sequence with a
    /// generator seeded from `key`.
    pub fn keyed(len: usize, key: u64) -> Self {
        let mut forward: Vec<u32> = (0..len as u32).collect();
        forward.shuffle(&mut StdRng::seed_from_u64(key));
        Self { forward }
    }

    /// Length of the permuted index range.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Returns `true` when the permutation covers an empty range.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Gather indices: output position `k` reads input `indices()[k]`.
    pub fn indices(&self) -> &[u32] {
        &self.forward
    }
}

/// Keyed, channel-joint bijection over block-tiled patch data.
///
/// The patch is tiled into fixed-size blocks spanning all channels; a keyed
/// stream derives a permutation of the block order plus a permutation of the
/// elements inside a block, applied uniformly to every block. Same key, same
/// bijection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockScramble {
    patch: PatchShape,
    block: (usize, usize),
    tiling: (usize, usize),
    block_order: Vec<u32>,
    intra: Vec<u32>,
}

impl BlockScramble {
    /// Builds the cipher for a patch shape and block tile size.
    ///
    /// Block dimensions must be non-zero and divide the patch dimensions;
    /// a partial block would break bijectivity, so violations are rejected
    /// eagerly as configuration errors.
    pub fn new(patch: PatchShape, block: (usize, usize), key: u64) -> Result<Self> {
        if block.0 == 0 || block.1 == 0 {
            return Err(PermuteError::InvalidConfig(format!(
                "block shape must be non-zero, got {}x{}",
                block.0, block.1
            )));
        }
        if patch.height % block.0 != 0 || patch.width % block.1 != 0 {
            return Err(PermuteError::InvalidConfig(format!(
                "block {}x{} does not evenly tile patch {}x{}",
                block.0, block.1, patch.height, patch.width
            )));
        }
        let tiling = (patch.height / block.0, patch.width / block.1);
        let n_blocks = tiling.0 * tiling.1;
        let block_len = block.0 * block.1 * patch.channels;
        let mut rng = ChaCha20Rng::seed_from_u64(key);
        let mut block_order: Vec<u32> = (0..n_blocks as u32).collect();
        block_order.shuffle(&mut rng);
        let mut intra: Vec<u32> = (0..block_len as u32).collect();
        intra.shuffle(&mut rng);
        Ok(Self {
            patch,
            block,
            tiling,
            block_order,
            intra,
        })
    }

    /// Patch shape the cipher is bound to.
    pub fn patch_shape(&self) -> PatchShape {
        self.patch
    }

    /// Block tile size.
    pub fn block_shape(&self) -> (usize, usize) {
        self.block
    }

    fn unflatten(&self, idx: usize) -> (usize, usize, usize) {
        let channels = self.patch.channels;
        let channel = idx % channels;
        let spatial = idx / channels;
        (spatial / self.block.1, spatial % self.block.1, channel)
    }

    fn scramble_into(&self, src: ArrayView3<'_, f32>, dst: &mut ArrayViewMut3<'_, f32>) {
        let (bh, bw) = self.block;
        let tile_cols = self.tiling.1;
        for (out_block, &src_block) in self.block_order.iter().enumerate() {
            let src_block = src_block as usize;
            let (out_row, out_col) = (out_block / tile_cols, out_block % tile_cols);
            let (src_row, src_col) = (src_block / tile_cols, src_block % tile_cols);
            for (dst_idx, &src_idx) in self.intra.iter().enumerate() {
                let (dy, dx, dc) = self.unflatten(dst_idx);
                let (sy, sx, sc) = self.unflatten(src_idx as usize);
                dst[[out_row * bh + dy, out_col * bw + dx, dc]] =
                    src[[src_row * bh + sy, src_col * bw + sx, sc]];
            }
        }
    }
}

/// Built transform for one grid cell, dispatched by tag.
#[derive(Clone, Debug, PartialEq)]
pub enum CellTransform {
    /// Pass the sub-region through unchanged.
    Identity,
    /// One spatial bijection per channel, applied independently.
    PixelShuffle(Vec<SpatialPermutation>),
    /// Keyed channel-joint block cipher.
    BlockScramble(BlockScramble),
}

impl CellTransform {
    /// Returns `true` for the no-op transform.
    pub fn is_identity(&self) -> bool {
        matches!(self, CellTransform::Identity)
    }

    /// Applies the transform to one patch-shaped sample view, writing into
    /// an equally shaped destination view.
    pub fn apply(&self, src: ArrayView3<'_, f32>, mut dst: ArrayViewMut3<'_, f32>) {
        debug_assert_eq!(src.dim(), dst.dim());
        match self {
            CellTransform::Identity => dst.assign(&src),
            CellTransform::PixelShuffle(channels) => {
                let (_, width, depth) = src.dim();
                debug_assert_eq!(channels.len(), depth);
                for (channel, permutation) in channels.iter().enumerate() {
                    for (dst_idx, &src_idx) in permutation.indices().iter().enumerate() {
                        let src_idx = src_idx as usize;
                        dst[[dst_idx / width, dst_idx % width, channel]] =
                            src[[src_idx / width, src_idx % width, channel]];
                    }
                }
            }
            CellTransform::BlockScramble(cipher) => cipher.scramble_into(src, &mut dst),
        }
    }
}

/// Builds the transform for a single cell from its key material.
///
/// The no-key sentinel (and the `Identity` scheme) produce the no-op
/// transform. For keyed cells the key-list cardinality must match the
/// scheme's repeat contract; a mismatch means key derivation and transform
/// construction disagree and is reported as an internal-consistency fault.
pub fn build_cell_transform(
    patch: PatchShape,
    keys: &[CellKey],
    scheme: PermutationScheme,
) -> Result<CellTransform> {
    if keys.is_empty() {
        return Err(PermuteError::Internal(
            "cell carries no key material".to_string(),
        ));
    }
    if keys.iter().all(|key| key.is_none()) {
        return Ok(CellTransform::Identity);
    }
    if keys.iter().any(|key| key.is_none()) {
        return Err(PermuteError::Internal(
            "cell mixes keyed and no-key material".to_string(),
        ));
    }
    match scheme {
        PermutationScheme::Identity => Ok(CellTransform::Identity),
        PermutationScheme::PixelShuffle => {
            if keys.len() != patch.channels {
                return Err(PermuteError::Internal(format!(
                    "pixel shuffle expects one key per channel, got {} keys for {} channels",
                    keys.len(),
                    patch.channels
                )));
            }
            let bijections = keys
                .iter()
                .map(|key| {
                    let key = key.ok_or_else(|| {
                        PermuteError::Internal("missing pixel shuffle key".to_string())
                    })?;
                    Ok(SpatialPermutation::keyed(patch.spatial_len(), key))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(CellTransform::PixelShuffle(bijections))
        }
        PermutationScheme::BlockScramble {
            block_rows,
            block_cols,
        } => {
            if keys.len() != 1 {
                return Err(PermuteError::Internal(format!(
                    "block scramble expects a single channel-joint key, got {}",
                    keys.len()
                )));
            }
            let key = keys[0]
                .ok_or_else(|| PermuteError::Internal("missing block scramble key".to_string()))?;
            Ok(CellTransform::BlockScramble(BlockScramble::new(
                patch,
                (block_rows, block_cols),
                key,
            )?))
        }
    }
}

/// Insertion-ordered map from grid coordinate to built transform, bound to
/// the patch shape the transforms were constructed for.
#[derive(Clone, Debug)]
pub struct TransformSet {
    patch: PatchShape,
    entries: Vec<(GridCoordinate, CellTransform)>,
}

impl TransformSet {
    /// Patch shape every transform in the set is bound to.
    pub fn patch_shape(&self) -> PatchShape {
        self.patch
    }

    /// Number of cells (= number of downstream model heads).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no cells are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in construction order; patch extraction output
    /// follows this order.
    pub fn iter(&self) -> impl Iterator<Item = (&GridCoordinate, &CellTransform)> {
        self.entries.iter().map(|(coord, cell)| (coord, cell))
    }

    /// Coordinates in construction order.
    pub fn coordinates(&self) -> impl Iterator<Item = &GridCoordinate> {
        self.entries.iter().map(|(coord, _)| coord)
    }

    /// Looks up the transform bound to a coordinate.
    pub fn get(&self, coord: &GridCoordinate) -> Option<&CellTransform> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == coord)
            .map(|(_, cell)| cell)
    }

    /// Returns `true` when every cell passes data through unchanged.
    pub fn is_identity(&self) -> bool {
        self.entries.iter().all(|(_, cell)| cell.is_identity())
    }

    pub(crate) fn entries(&self) -> &[(GridCoordinate, CellTransform)] {
        &self.entries
    }
}

/// Derives keys and builds the full per-cell transform set for a
/// configuration.
///
/// Key material is always derived over the FULL overlap topology and then
/// narrowed to the requested scheme's active cells, so experiments sharing a
/// master seed see bit-identical keys for shared coordinates regardless of
/// their overlap scheme. Unused keys are computed and discarded for weaker
/// schemes; that cost is deliberate.
pub fn build_transform_set(
    seed: Option<u64>,
    grid_shape: (usize, usize),
    patch: PatchShape,
    overlap: OverlapScheme,
    scheme: PermutationScheme,
) -> Result<TransformSet> {
    let repeats = scheme.repeats(patch.channels);
    let full_keys = derive_keys(seed, grid_shape, OverlapScheme::Full, repeats)?;
    let active = active_cells(grid_shape, overlap);
    let narrowed = full_keys.narrowed(&active);
    if narrowed.len() != active.len() {
        return Err(PermuteError::Internal(format!(
            "active cells ({}) escape the FULL key superset ({})",
            active.len(),
            narrowed.len()
        )));
    }
    let mut entries = Vec::with_capacity(narrowed.len());
    for (coord, keys) in narrowed.iter() {
        entries.push((*coord, build_cell_transform(patch, keys, scheme)?));
    }
    tracing::debug!(
        cells = entries.len(),
        ?overlap,
        ?scheme,
        seeded = seed.is_some(),
        "built cell transform set"
    );
    Ok(TransformSet { patch, entries })
}
