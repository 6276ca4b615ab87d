// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralPermute — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Half-integer grid lattice and overlap topology evaluation.
//!
//! Base cells sit at integer grid coordinates; overlap cells sit at
//! half-integer positions strictly interior to the grid. Coordinates are
//! stored as doubled integers so that half-integer cells carry exact
//! `Eq`/`Hash`/`Ord` semantics instead of relying on float equality.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Radius (in cell units) of the circular region used by
/// [`OverlapScheme::Center`]. Tight enough that only the exact central
/// corner cell qualifies on evenly-sized grids.
const CENTER_RADIUS: f64 = 0.1;

/// Lattice position of a grid cell.
///
/// Both axes are stored doubled: even values are integer (base) positions,
/// odd values are half-integer (overlap) positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCoordinate {
    row2: usize,
    col2: usize,
}

impl GridCoordinate {
    /// Builds a base-grid coordinate from integer row/column indices.
    pub fn base(row: usize, col: usize) -> Self {
        Self {
            row2: row * 2,
            col2: col * 2,
        }
    }

    /// Builds a coordinate directly from doubled lattice positions.
    pub fn from_doubled(row2: usize, col2: usize) -> Self {
        Self { row2, col2 }
    }

    /// Doubled row position.
    pub fn row2(&self) -> usize {
        self.row2
    }

    /// Doubled column position.
    pub fn col2(&self) -> usize {
        self.col2
    }

    /// Row position in cell units (integer or half-integer).
    pub fn row(&self) -> f64 {
        self.row2 as f64 / 2.0
    }

    /// Column position in cell units (integer or half-integer).
    pub fn col(&self) -> f64 {
        self.col2 as f64 / 2.0
    }

    /// True for integer (non-overlap) grid positions.
    pub fn is_base(&self) -> bool {
        self.row2 % 2 == 0 && self.col2 % 2 == 0
    }

    /// True for edge-midpoint overlap cells (exactly one half-integer axis).
    pub fn is_edge(&self) -> bool {
        (self.row2 % 2 == 1) != (self.col2 % 2 == 1)
    }

    /// True for corner overlap cells (both axes half-integer).
    pub fn is_corner(&self) -> bool {
        self.row2 % 2 == 1 && self.col2 % 2 == 1
    }
}

impl fmt::Display for GridCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn axis(f: &mut fmt::Formatter<'_>, doubled: usize) -> fmt::Result {
            if doubled % 2 == 0 {
                write!(f, "{}", doubled / 2)
            } else {
                write!(f, "{}.5", doubled / 2)
            }
        }
        write!(f, "(")?;
        axis(f, self.row2)?;
        write!(f, ", ")?;
        axis(f, self.col2)?;
        write!(f, ")")
    }
}

/// Policy selecting which half-offset cells join the base grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapScheme {
    /// Base grid only.
    None,
    /// Base grid plus overlap cells within [`CENTER_RADIUS`] of the grid
    /// centre.
    Center,
    /// Base grid plus a plus-shaped band of overlap cells along the grid
    /// mid-lines.
    Cross,
    /// Base grid plus edge-midpoint overlap cells.
    Edges,
    /// Base grid plus corner overlap cells.
    Corners,
    /// Base grid plus all corner and edge overlap cells.
    Full,
}

/// Accumulates cells in canonical order while rejecting duplicates.
struct CellAccumulator {
    cells: Vec<GridCoordinate>,
    seen: HashSet<GridCoordinate>,
}

impl CellAccumulator {
    fn new() -> Self {
        Self {
            cells: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn push(&mut self, cell: GridCoordinate) {
        if self.seen.insert(cell) {
            self.cells.push(cell);
        }
    }

    /// Scans the half-integer lattice row-major and records every cell the
    /// predicate accepts. Positions already present (e.g. the base grid) are
    /// skipped, so predicates need not exclude integer positions themselves.
    fn add_overlap(
        &mut self,
        grid_shape: (usize, usize),
        condition: impl Fn(usize, usize) -> bool,
    ) {
        let (rows, cols) = grid_shape;
        for row2 in 0..=2 * (rows - 1) {
            for col2 in 0..=2 * (cols - 1) {
                if condition(row2, col2) {
                    self.push(GridCoordinate::from_doubled(row2, col2));
                }
            }
        }
    }
}

fn center_condition(grid_shape: (usize, usize)) -> impl Fn(usize, usize) -> bool {
    // Grid centre in doubled units is exactly (rows - 1, cols - 1).
    let centre = (grid_shape.0 as f64 - 1.0, grid_shape.1 as f64 - 1.0);
    move |row2, col2| {
        let dr = (row2 as f64 - centre.0) / 2.0;
        let dc = (col2 as f64 - centre.1) / 2.0;
        (dr * dr + dc * dc).sqrt() <= CENTER_RADIUS
    }
}

fn cross_condition(grid_shape: (usize, usize)) -> impl Fn(usize, usize) -> bool {
    let (rows, cols) = grid_shape;
    let mid = (rows as isize - 1, cols as isize - 1);
    // Span is measured in cells from the centre along each arm.
    let span = (2 * (rows as isize / 2), 2 * (cols as isize / 2));
    move |row2, col2| {
        let (r, c) = (row2 as isize, col2 as isize);
        (r == mid.0 && (c - mid.1).abs() <= span.1) || (c == mid.1 && (r - mid.0).abs() <= span.0)
    }
}

fn edge_condition(row2: usize, col2: usize) -> bool {
    (row2 % 2 == 1) != (col2 % 2 == 1)
}

fn corner_condition(row2: usize, col2: usize) -> bool {
    row2 % 2 == 1 && col2 % 2 == 1
}

/// Returns the active cell coordinates for a grid shape under an overlap
/// scheme, in canonical order: the base grid row-major, then overlap cells
/// in half-lattice scan order. For [`OverlapScheme::Full`] corner cells are
/// recorded before edge cells; key derivation depends on this order.
///
/// Pure geometric classification; no side effects. An empty grid yields an
/// empty set.
pub fn active_cells(grid_shape: (usize, usize), scheme: OverlapScheme) -> Vec<GridCoordinate> {
    let (rows, cols) = grid_shape;
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    let mut acc = CellAccumulator::new();
    for row in 0..rows {
        for col in 0..cols {
            acc.push(GridCoordinate::base(row, col));
        }
    }
    match scheme {
        OverlapScheme::None => {}
        OverlapScheme::Center => acc.add_overlap(grid_shape, center_condition(grid_shape)),
        OverlapScheme::Cross => acc.add_overlap(grid_shape, cross_condition(grid_shape)),
        OverlapScheme::Edges => acc.add_overlap(grid_shape, edge_condition),
        OverlapScheme::Corners => acc.add_overlap(grid_shape, corner_condition),
        OverlapScheme::Full => {
            acc.add_overlap(grid_shape, corner_condition);
            acc.add_overlap(grid_shape, edge_condition);
        }
    }
    acc.cells
}
