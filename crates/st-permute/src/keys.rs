// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralPermute — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Deterministic per-cell key derivation.
//!
//! A master seed is expanded into one key list per active grid cell. The
//! generator is a locally scoped [`StdRng`]; no ambient random state is read
//! or written, so unrelated randomness (fold splitting, batch shuffling)
//! is never perturbed by a derivation call.

use crate::grid::{active_cells, GridCoordinate, OverlapScheme};
use crate::{PermuteError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Exclusive upper bound of the per-cell key range. Keys are drawn from
/// `[1, MAX_KEY)`.
pub const MAX_KEY: u64 = 10_000_000;

/// Key material for one repeat of one cell. `None` is the no-key sentinel
/// that degenerates the cell's transform to identity.
pub type CellKey = Option<u64>;

/// Insertion-ordered map from grid coordinate to per-repeat key material.
///
/// Iteration follows derivation order; equality is order-independent (map
/// semantics), so two derivations of the same configuration compare equal
/// regardless of how their entries were assembled.
#[derive(Clone, Debug, Default)]
pub struct KeySet {
    entries: Vec<(GridCoordinate, Vec<CellKey>)>,
}

impl KeySet {
    /// Number of cells carrying key material.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no cells are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in derivation order.
    pub fn iter(&self) -> impl Iterator<Item = (&GridCoordinate, &[CellKey])> {
        self.entries.iter().map(|(coord, keys)| (coord, &keys[..]))
    }

    /// Coordinates in derivation order.
    pub fn coordinates(&self) -> impl Iterator<Item = &GridCoordinate> {
        self.entries.iter().map(|(coord, _)| coord)
    }

    /// Looks up the key list for a coordinate.
    pub fn get(&self, coord: &GridCoordinate) -> Option<&[CellKey]> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == coord)
            .map(|(_, keys)| &keys[..])
    }

    /// Returns a copy narrowed to the coordinates present in `keep`,
    /// preserving this set's derivation order. Used to cut a FULL-topology
    /// derivation down to a weaker overlap scheme without disturbing the
    /// keys of the surviving cells.
    pub fn narrowed(&self, keep: &[GridCoordinate]) -> KeySet {
        let wanted: std::collections::HashSet<_> = keep.iter().copied().collect();
        KeySet {
            entries: self
                .entries
                .iter()
                .filter(|(coord, _)| wanted.contains(coord))
                .cloned()
                .collect(),
        }
    }

    fn push(&mut self, coord: GridCoordinate, keys: Vec<CellKey>) {
        self.entries.push((coord, keys));
    }
}

impl PartialEq for KeySet {
    fn eq(&self, other: &Self) -> bool {
        let lhs: BTreeMap<_, _> = self.entries.iter().map(|(c, k)| (c, k)).collect();
        let rhs: BTreeMap<_, _> = other.entries.iter().map(|(c, k)| (c, k)).collect();
        lhs == rhs
    }
}

impl Eq for KeySet {}

/// Derives per-cell key material from an optional master seed.
///
/// Without a seed every active coordinate maps to `repeats` no-key
/// sentinels, which downstream construction turns into identity transforms
/// (the unobfuscated baseline). With a seed, a scoped generator seeded from
/// it draws `repeats` keys per coordinate while walking the active cells in
/// canonical order, so re-invocation with identical arguments reproduces the
/// key set bit for bit.
pub fn derive_keys(
    seed: Option<u64>,
    grid_shape: (usize, usize),
    scheme: OverlapScheme,
    repeats: usize,
) -> Result<KeySet> {
    if grid_shape.0 == 0 || grid_shape.1 == 0 {
        return Err(PermuteError::InvalidConfig(format!(
            "grid shape must be non-zero, got {}x{}",
            grid_shape.0, grid_shape.1
        )));
    }
    if repeats == 0 {
        return Err(PermuteError::InvalidConfig(
            "repeat count must be > 0".to_string(),
        ));
    }
    let cells = active_cells(grid_shape, scheme);
    let mut keys = KeySet::default();
    match seed {
        None => {
            for cell in cells {
                keys.push(cell, vec![None; repeats]);
            }
        }
        Some(seed) => {
            let mut rng = StdRng::seed_from_u64(seed);
            for cell in cells {
                let material = (0..repeats)
                    .map(|_| Some(rng.gen_range(1..MAX_KEY)))
                    .collect();
                keys.push(cell, material);
            }
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn derivation_is_reproducible() {
        let first = derive_keys(Some(42), (2, 2), OverlapScheme::Full, 3).unwrap();
        let second = derive_keys(Some(42), (2, 2), OverlapScheme::Full, 3).unwrap();
        assert_eq!(first, second);
        let order_first: Vec<_> = first.coordinates().copied().collect();
        let order_second: Vec<_> = second.coordinates().copied().collect();
        assert_eq!(order_first, order_second);
    }

    #[test]
    fn different_seeds_produce_different_material() {
        let first = derive_keys(Some(42), (2, 2), OverlapScheme::Full, 3).unwrap();
        let second = derive_keys(Some(43), (2, 2), OverlapScheme::Full, 3).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn absent_seed_degenerates_to_no_key_sentinels() {
        let keys = derive_keys(None, (2, 2), OverlapScheme::Full, 3).unwrap();
        assert_eq!(keys.len(), 9);
        for (_, material) in keys.iter() {
            assert_eq!(material, vec![None; 3].as_slice());
        }
    }

    #[test]
    fn keys_stay_in_bounded_positive_range() {
        let keys = derive_keys(Some(7), (3, 3), OverlapScheme::Full, 2).unwrap();
        for (_, material) in keys.iter() {
            assert_eq!(material.len(), 2);
            for key in material {
                let key = key.expect("seeded derivation yields concrete keys");
                assert!((1..MAX_KEY).contains(&key));
            }
        }
    }

    #[test]
    fn narrowing_preserves_shared_key_material() {
        let full = derive_keys(Some(42), (2, 2), OverlapScheme::Full, 3).unwrap();
        let base = active_cells((2, 2), OverlapScheme::None);
        let narrowed = full.narrowed(&base);
        assert_eq!(narrowed.len(), 4);
        for coord in &base {
            assert_eq!(narrowed.get(coord), full.get(coord));
        }
    }

    #[test]
    fn derivation_does_not_disturb_unrelated_randomness() {
        // An unrelated seeded draw must be identical whether or not a
        // derivation call ran in between.
        let mut control_rng = StdRng::seed_from_u64(1234);
        let mut control: Vec<u32> = (0..16).collect();
        control.shuffle(&mut control_rng);

        let mut observed_rng = StdRng::seed_from_u64(1234);
        let _ = derive_keys(Some(42), (4, 4), OverlapScheme::Full, 3).unwrap();
        let mut observed: Vec<u32> = (0..16).collect();
        observed.shuffle(&mut observed_rng);

        assert_eq!(control, observed);
    }

    #[test]
    fn rejects_degenerate_configuration() {
        assert!(matches!(
            derive_keys(Some(1), (0, 2), OverlapScheme::None, 1),
            Err(PermuteError::InvalidConfig(_))
        ));
        assert!(matches!(
            derive_keys(Some(1), (2, 2), OverlapScheme::None, 0),
            Err(PermuteError::InvalidConfig(_))
        ));
    }

    #[test]
    fn equality_ignores_entry_order() {
        let forward = derive_keys(Some(9), (2, 2), OverlapScheme::None, 1).unwrap();
        let mut reversed = KeySet::default();
        for (coord, material) in forward.iter().collect::<Vec<_>>().into_iter().rev() {
            reversed.push(*coord, material.to_vec());
        }
        assert_eq!(forward, reversed);
    }
}
