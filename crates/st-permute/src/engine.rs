// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralPermute — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Patch extraction and the batch-generator role.
//!
//! [`extract_patches`] slices an image batch at every cell window of a
//! [`TransformSet`] and applies the per-cell transforms, yielding one patch
//! batch per downstream model head. [`PermutationGenerator`] wraps that
//! primitive into the pull-based, epoch-wrapping producer consumed by
//! training loops.

use crate::grid::{GridCoordinate, OverlapScheme};
use crate::transform::{build_transform_set, PatchShape, PermutationScheme, TransformSet};
use crate::{PermuteError, Result};
use ndarray::{s, Array2, Array4, ArrayView4, ArrayViewMut3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;

/// Transformed sub-regions for one grid cell across a whole sample batch,
/// laid out `(sample, patch_height, patch_width, channel)`.
pub type PatchBatch = Array4<f32>;

/// Stateless per-image augmentation collaborator, applied before patch
/// extraction. Implementations are expected to preserve the value range of
/// the data; the engine does not check this.
pub trait Augmenter: Send + Sync {
    fn augment(&self, image: ArrayViewMut3<'_, f32>);
}

impl<F> Augmenter for F
where
    F: Fn(ArrayViewMut3<'_, f32>) + Send + Sync,
{
    fn augment(&self, image: ArrayViewMut3<'_, f32>) {
        self(image)
    }
}

/// Row and column pixel ranges covered by a cell window.
///
/// A half-integer coordinate offsets the window by half a patch length,
/// producing the overlapping view between its four neighbouring base cells.
/// Computed in doubled-integer arithmetic so half-cell offsets floor exactly
/// and consistently between training and inference.
pub fn cell_window(coord: GridCoordinate, patch: PatchShape) -> (Range<usize>, Range<usize>) {
    let rows = (coord.row2() * patch.height) / 2..((coord.row2() + 2) * patch.height) / 2;
    let cols = (coord.col2() * patch.width) / 2..((coord.col2() + 2) * patch.width) / 2;
    (rows, cols)
}

/// Slices every sample of the batch at each cell window of the transform set
/// and applies the cell's transform, returning one [`PatchBatch`] per cell
/// in transform-set order.
///
/// Cells are independent and processed in parallel; ordering of the output
/// is unaffected. A window that escapes the image bounds means the transform
/// set was built for a different geometry and is reported as an
/// internal-consistency fault.
pub fn extract_patches(
    images: ArrayView4<'_, f32>,
    transforms: &TransformSet,
) -> Result<Vec<PatchBatch>> {
    let (samples, height, width, channels) = images.dim();
    let patch = transforms.patch_shape();
    if channels != patch.channels {
        return Err(PermuteError::Shape(format!(
            "image batch has {channels} channels, transform set expects {}",
            patch.channels
        )));
    }
    for (coord, _) in transforms.iter() {
        let (rows, cols) = cell_window(*coord, patch);
        if rows.end > height || cols.end > width {
            return Err(PermuteError::Internal(format!(
                "cell {coord} window rows {rows:?} cols {cols:?} escapes {height}x{width} image"
            )));
        }
    }
    let batches = transforms
        .entries()
        .par_iter()
        .map(|(coord, cell)| {
            let (rows, cols) = cell_window(*coord, patch);
            let mut out = Array4::<f32>::zeros((samples, patch.height, patch.width, patch.channels));
            for sample in 0..samples {
                let src = images.slice(s![sample, rows.clone(), cols.clone(), ..]);
                cell.apply(src, out.index_axis_mut(Axis(0), sample));
            }
            out
        })
        .collect();
    Ok(batches)
}

/// Construction parameters for [`PermutationGenerator`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GeneratorConfig {
    /// Grid dimensions `(rows, cols)`.
    pub grid_shape: (usize, usize),
    /// Overlap scheme selecting the active cells.
    pub overlap: OverlapScheme,
    /// Rearrangement family applied to keyed cells.
    pub scheme: PermutationScheme,
    /// Master seed; absent for the unobfuscated identity baseline.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Samples per produced batch.
    pub batch_size: usize,
    /// Whether the visitation order is reshuffled every epoch.
    #[serde(default)]
    pub shuffle: bool,
}

impl GeneratorConfig {
    /// Validates configuration values that do not depend on the data.
    pub fn validate(&self) -> Result<()> {
        if self.grid_shape.0 == 0 || self.grid_shape.1 == 0 {
            return Err(PermuteError::InvalidConfig(format!(
                "grid shape must be non-zero, got {}x{}",
                self.grid_shape.0, self.grid_shape.1
            )));
        }
        if self.batch_size == 0 {
            return Err(PermuteError::InvalidConfig(
                "batch_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(config: &str) -> Result<Self> {
        let parsed: GeneratorConfig = toml::from_str(config).map_err(|err| {
            PermuteError::InvalidConfig(format!("failed to parse generator config: {err}"))
        })?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reads and parses a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).map_err(|err| {
            PermuteError::InvalidConfig(format!(
                "failed to read generator config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&data)
    }
}

/// Pull-based producer of per-cell patch batches.
///
/// Owns the sample source, the per-cell transform set, and an optional
/// augmentation collaborator. Each [`next_batch`](Self::next_batch) call
/// gathers one raw batch in epoch order, augments it, extracts the per-cell
/// patches, and returns them alongside the untouched label rows. Epoch
/// length floors to `samples / batch_size`; the final partial batch is
/// dropped. On exhaustion the index wraps and a shuffling generator reorders
/// its visitation sequence.
pub struct PermutationGenerator {
    images: Array4<f32>,
    labels: Array2<f32>,
    transforms: TransformSet,
    augmenter: Option<Box<dyn Augmenter>>,
    batch_size: usize,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
}

impl fmt::Debug for PermutationGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermutationGenerator")
            .field("samples", &self.images.dim().0)
            .field("heads", &self.transforms.len())
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl PermutationGenerator {
    /// Builds a generator over an in-memory image/label source.
    ///
    /// All configuration errors surface here, never during batch
    /// production: zero grid or batch dimensions, a grid coarser than the
    /// image, label/image count mismatch, and a batch size exceeding the
    /// sample count are rejected eagerly.
    pub fn new(
        images: Array4<f32>,
        labels: Array2<f32>,
        config: &GeneratorConfig,
        augmenter: Option<Box<dyn Augmenter>>,
    ) -> Result<Self> {
        config.validate()?;
        let (samples, height, width, channels) = images.dim();
        if samples == 0 {
            return Err(PermuteError::InvalidConfig(
                "image batch source is empty".to_string(),
            ));
        }
        if labels.nrows() != samples {
            return Err(PermuteError::Shape(format!(
                "labels carry {} rows for {} samples",
                labels.nrows(),
                samples
            )));
        }
        let patch = PatchShape::new(
            height / config.grid_shape.0,
            width / config.grid_shape.1,
            channels,
        )
        .map_err(|_| {
            PermuteError::InvalidConfig(format!(
                "grid {}x{} is coarser than the {height}x{width} image",
                config.grid_shape.0, config.grid_shape.1
            ))
        })?;
        if samples / config.batch_size == 0 {
            return Err(PermuteError::InvalidConfig(format!(
                "batch size {} exceeds the {samples}-sample source",
                config.batch_size
            )));
        }
        let transforms = build_transform_set(
            config.seed,
            config.grid_shape,
            patch,
            config.overlap,
            config.scheme,
        )?;
        let mut rng = permute_config::determinism::rng_from_label("st-permute/epoch-shuffle");
        let mut order: Vec<usize> = (0..samples).collect();
        if config.shuffle {
            order.shuffle(&mut rng);
        }
        tracing::debug!(
            samples,
            heads = transforms.len(),
            batch_size = config.batch_size,
            "permutation generator ready"
        );
        Ok(Self {
            images,
            labels,
            transforms,
            augmenter,
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            order,
            cursor: 0,
            epoch: 0,
            rng,
        })
    }

    /// Number of batches produced per epoch; the final partial batch is
    /// dropped.
    pub fn batches_per_epoch(&self) -> usize {
        self.images.dim().0 / self.batch_size
    }

    /// Samples per produced batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of grid cells, i.e. downstream model heads.
    pub fn heads(&self) -> usize {
        self.transforms.len()
    }

    /// Shape of the sub-regions routed to each head.
    pub fn patch_shape(&self) -> PatchShape {
        self.transforms.patch_shape()
    }

    /// The per-cell transform set driving extraction.
    pub fn transform_set(&self) -> &TransformSet {
        &self.transforms
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Produces the next batch: one transformed [`PatchBatch`] per cell plus
    /// the pass-through label rows for the batch samples.
    pub fn next_batch(&mut self) -> Result<(Vec<PatchBatch>, Array2<f32>)> {
        let (_, height, width, channels) = self.images.dim();
        let start = self.cursor * self.batch_size;
        let indices = &self.order[start..start + self.batch_size];

        let mut batch = Array4::<f32>::zeros((self.batch_size, height, width, channels));
        let mut labels = Array2::<f32>::zeros((self.batch_size, self.labels.ncols()));
        for (slot, &index) in indices.iter().enumerate() {
            batch
                .index_axis_mut(Axis(0), slot)
                .assign(&self.images.index_axis(Axis(0), index));
            labels.row_mut(slot).assign(&self.labels.row(index));
        }
        if let Some(augmenter) = &self.augmenter {
            for slot in 0..self.batch_size {
                augmenter.augment(batch.index_axis_mut(Axis(0), slot));
            }
        }
        let patches = extract_patches(batch.view(), &self.transforms)?;
        self.advance();
        Ok((patches, labels))
    }

    fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.batches_per_epoch() {
            self.cursor = 0;
            self.epoch += 1;
            if self.shuffle {
                self.order.shuffle(&mut self.rng);
            }
            tracing::debug!(epoch = self.epoch, "epoch wrapped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::active_cells;
    use rand::{Rng, SeedableRng};

    fn patch(height: usize, width: usize, channels: usize) -> PatchShape {
        PatchShape::new(height, width, channels).unwrap()
    }

    fn synthetic_images(seed: u64, samples: usize, side: usize, channels: usize) -> Array4<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_fn((samples, side, side, channels), |_| {
            rng.gen_range(0.0f32..1.0f32)
        })
    }

    fn one_hot_labels(samples: usize, classes: usize) -> Array2<f32> {
        Array2::from_shape_fn((samples, classes), |(row, col)| {
            if row % classes == col {
                1.0
            } else {
                0.0
            }
        })
    }

    fn identity_config(batch_size: usize) -> GeneratorConfig {
        GeneratorConfig {
            grid_shape: (2, 2),
            overlap: OverlapScheme::None,
            scheme: PermutationScheme::Identity,
            seed: None,
            batch_size,
            shuffle: false,
        }
    }

    #[test]
    fn centre_overlap_window_is_offset_by_half_a_patch() {
        let (rows, cols) = cell_window(GridCoordinate::from_doubled(1, 1), patch(14, 14, 3));
        assert_eq!(rows, 7..21);
        assert_eq!(cols, 7..21);
    }

    #[test]
    fn base_cell_windows_tile_the_image() {
        let shape = patch(14, 14, 3);
        let (rows, cols) = cell_window(GridCoordinate::base(0, 0), shape);
        assert_eq!((rows, cols), (0..14, 0..14));
        let (rows, cols) = cell_window(GridCoordinate::base(1, 1), shape);
        assert_eq!((rows, cols), (14..28, 14..28));
    }

    #[test]
    fn identity_baseline_reproduces_direct_slicing() {
        let images = synthetic_images(11, 3, 8, 3);
        let shape = patch(4, 4, 3);
        let set = build_transform_set(
            None,
            (2, 2),
            shape,
            OverlapScheme::Full,
            PermutationScheme::PixelShuffle,
        )
        .unwrap();
        let batches = extract_patches(images.view(), &set).unwrap();
        assert_eq!(batches.len(), 9);
        for ((coord, _), batch) in set.iter().zip(&batches) {
            let (rows, cols) = cell_window(*coord, shape);
            let direct = images.slice(s![.., rows, cols, ..]);
            assert_eq!(batch, &direct.to_owned());
        }
    }

    #[test]
    fn extraction_rejects_channel_mismatch() {
        let images = synthetic_images(3, 2, 8, 1);
        let set = build_transform_set(
            None,
            (2, 2),
            patch(4, 4, 3),
            OverlapScheme::None,
            PermutationScheme::Identity,
        )
        .unwrap();
        assert!(matches!(
            extract_patches(images.view(), &set),
            Err(PermuteError::Shape(_))
        ));
    }

    #[test]
    fn escaping_windows_are_internal_faults() {
        // A transform set built for 8x8 patches cannot slice an 8x8 image
        // with a 2x2 grid.
        let images = synthetic_images(3, 2, 8, 1);
        let set = build_transform_set(
            None,
            (2, 2),
            patch(8, 8, 1),
            OverlapScheme::None,
            PermutationScheme::Identity,
        )
        .unwrap();
        assert!(matches!(
            extract_patches(images.view(), &set),
            Err(PermuteError::Internal(_))
        ));
    }

    #[test]
    fn epoch_length_floors_partial_batches() {
        let images = synthetic_images(5, 100, 8, 1);
        let labels = one_hot_labels(100, 10);
        let generator =
            PermutationGenerator::new(images, labels, &identity_config(32), None).unwrap();
        assert_eq!(generator.batches_per_epoch(), 3);
    }

    #[test]
    fn batches_preserve_sample_order_and_labels() {
        let images = synthetic_images(7, 6, 8, 2);
        let labels = one_hot_labels(6, 3);
        let mut generator = PermutationGenerator::new(
            images.clone(),
            labels.clone(),
            &identity_config(2),
            None,
        )
        .unwrap();
        let shape = generator.patch_shape();
        let cells = active_cells((2, 2), OverlapScheme::None);
        for step in 0..generator.batches_per_epoch() {
            let (patches, batch_labels) = generator.next_batch().unwrap();
            assert_eq!(patches.len(), 4);
            for (cell_idx, coord) in cells.iter().enumerate() {
                let (rows, cols) = cell_window(*coord, shape);
                for slot in 0..2 {
                    let sample = step * 2 + slot;
                    let expected = images.slice(s![sample, rows.clone(), cols.clone(), ..]);
                    assert_eq!(
                        patches[cell_idx].index_axis(Axis(0), slot),
                        expected,
                        "cell {coord} sample {sample}"
                    );
                }
            }
            for slot in 0..2 {
                assert_eq!(batch_labels.row(slot), labels.row(step * 2 + slot));
            }
        }
        assert_eq!(generator.epoch(), 1);
    }

    #[test]
    fn shuffled_epochs_cover_samples_without_repetition() {
        let samples = 10;
        let mut images = Array4::<f32>::zeros((samples, 4, 4, 1));
        for sample in 0..samples {
            images[[sample, 0, 0, 0]] = sample as f32;
        }
        let labels = one_hot_labels(samples, 2);
        let config = GeneratorConfig {
            grid_shape: (1, 1),
            overlap: OverlapScheme::None,
            scheme: PermutationScheme::Identity,
            seed: None,
            batch_size: 3,
            shuffle: true,
        };
        let mut generator = PermutationGenerator::new(images, labels, &config, None).unwrap();
        let mut seen = Vec::new();
        for _ in 0..generator.batches_per_epoch() {
            let (patches, _) = generator.next_batch().unwrap();
            for slot in 0..3 {
                seen.push(patches[0][[slot, 0, 0, 0]] as usize);
            }
        }
        assert_eq!(seen.len(), 9);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 9, "epoch revisited a sample");
        assert!(seen.iter().all(|&v| v < samples));
    }

    #[test]
    fn augmenter_runs_before_extraction() {
        let images = synthetic_images(13, 4, 8, 1);
        let labels = one_hot_labels(4, 2);
        let augmenter: Box<dyn Augmenter> = Box::new(|mut image: ArrayViewMut3<'_, f32>| {
            image.fill(0.25);
        });
        let mut generator =
            PermutationGenerator::new(images, labels, &identity_config(2), Some(augmenter))
                .unwrap();
        let (patches, _) = generator.next_batch().unwrap();
        for batch in &patches {
            assert!(batch.iter().all(|&value| value == 0.25));
        }
    }

    #[test]
    fn construction_rejects_bad_configurations() {
        let images = synthetic_images(17, 4, 8, 1);
        let labels = one_hot_labels(4, 2);

        let mut config = identity_config(8);
        assert!(matches!(
            PermutationGenerator::new(images.clone(), labels.clone(), &config, None),
            Err(PermuteError::InvalidConfig(_))
        ));

        config = identity_config(2);
        config.grid_shape = (0, 2);
        assert!(matches!(
            PermutationGenerator::new(images.clone(), labels.clone(), &config, None),
            Err(PermuteError::InvalidConfig(_))
        ));

        config = identity_config(2);
        config.grid_shape = (16, 16);
        assert!(matches!(
            PermutationGenerator::new(images.clone(), labels.clone(), &config, None),
            Err(PermuteError::InvalidConfig(_))
        ));

        let short_labels = one_hot_labels(3, 2);
        assert!(matches!(
            PermutationGenerator::new(images, short_labels, &identity_config(2), None),
            Err(PermuteError::Shape(_))
        ));
    }

    #[test]
    fn generator_config_parses_from_toml() {
        let config = GeneratorConfig::from_toml_str(
            r#"
                grid_shape = [2, 2]
                overlap = "full"
                seed = 42
                batch_size = 32
                shuffle = true

                [scheme.block_scramble]
                block_rows = 4
                block_cols = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.grid_shape, (2, 2));
        assert_eq!(config.overlap, OverlapScheme::Full);
        assert_eq!(
            config.scheme,
            PermutationScheme::BlockScramble {
                block_rows: 4,
                block_cols: 4
            }
        );
        assert_eq!(config.seed, Some(42));
        assert!(config.shuffle);

        let identity = GeneratorConfig::from_toml_str(
            r#"
                grid_shape = [2, 2]
                overlap = "none"
                scheme = "identity"
                batch_size = 16
            "#,
        )
        .unwrap();
        assert_eq!(identity.seed, None);
        assert!(!identity.shuffle);

        assert!(matches!(
            GeneratorConfig::from_toml_str(
                r#"
                    grid_shape = [0, 2]
                    overlap = "none"
                    scheme = "identity"
                    batch_size = 16
                "#,
            ),
            Err(PermuteError::InvalidConfig(_))
        ));
    }
}
