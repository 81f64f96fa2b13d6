//! Quadtree tessellation with z/x/y tile addressing
//!
//! Indices are 1-based and `z = 1` is the coarsest level, holding one tile.
//! Every tile splits into four children, listed top-left, top-right,
//! bottom-right, bottom-left:
//!
//! ```text
//! 1/1/1
//!       2/1/1  2/2/1
//!       2/1/2  2/2/2
//!                    3/1/1  3/2/1   3/3/1  3/4/1
//!                    3/1/2  3/2/2   3/3/2  3/4/2
//!
//!                    3/1/3  3/2/3   3/3/3  3/4/3
//!                    3/1/4  3/2/4   3/3/4  3/4/4
//! ```

use super::{Cell, Grid, GridConfig};
use crate::error::{PyramidError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deepest level addressable with `u32` tile indices
pub const MAX_QUAD_RESOLUTION: u8 = 31;

/// A tile of the quadtree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCell {
    /// Zoom level (1 = whole extent)
    pub z: u8,
    /// Column, 1-based, growing to the right
    pub x: u32,
    /// Row, 1-based, growing downwards
    pub y: u32,
}

impl TileCell {
    /// Create a new tile
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// The single tile covering the whole extent
    pub fn root() -> Self {
        Self::new(1, 1, 1)
    }

    /// The four tiles one level down, in tl, tr, br, bl order
    ///
    /// `None` for tiles that are not [well formed](Self::is_well_formed) or
    /// already sit at [`MAX_QUAD_RESOLUTION`].
    pub fn children(&self) -> Option<[TileCell; 4]> {
        if !self.is_well_formed() || self.z >= MAX_QUAD_RESOLUTION {
            return None;
        }
        let br = TileCell::new(self.z + 1, 2 * self.x, 2 * self.y);
        let bl = TileCell::new(br.z, br.x - 1, br.y);
        let tl = TileCell::new(br.z, br.x - 1, br.y - 1);
        let tr = TileCell::new(br.z, br.x, br.y - 1);
        Some([tl, tr, br, bl])
    }

    /// The tile one level up, if any
    pub fn parent(&self) -> Option<TileCell> {
        if self.z <= 1 {
            return None;
        }
        Some(TileCell::new(self.z - 1, self.x.div_ceil(2), self.y.div_ceil(2)))
    }

    /// The tile at level `z` containing this one
    ///
    /// `None` above the tile's own level and for zero (unaddressable) indices.
    pub fn ancestor_at(&self, z: u8) -> Option<TileCell> {
        if z == 0 || z > self.z {
            return None;
        }
        let shift = u32::from(self.z - z);
        let up = |index: u32| index.checked_sub(1).map(|i| i.checked_shr(shift).unwrap_or(0) + 1);
        Some(TileCell::new(z, up(self.x)?, up(self.y)?))
    }

    /// Whether this tile covers `other` (a tile covers itself)
    pub fn contains(&self, other: &TileCell) -> bool {
        other.ancestor_at(self.z) == Some(*self)
    }

    /// Which child quadrant of this tile `other` falls into
    pub fn quadrant_of(&self, other: &TileCell) -> Option<Quadrant> {
        if other.z <= self.z || !self.contains(other) {
            return None;
        }
        let child = other.ancestor_at(self.z + 1)?;
        let dx = i64::from(child.x) + 1 - 2 * i64::from(self.x);
        let dy = i64::from(child.y) + 1 - 2 * i64::from(self.y);
        match (dx, dy) {
            (0, 0) => Some(Quadrant::TopLeft),
            (1, 0) => Some(Quadrant::TopRight),
            (1, 1) => Some(Quadrant::BottomRight),
            (0, 1) => Some(Quadrant::BottomLeft),
            _ => None,
        }
    }

    /// Whether the indices are valid for the tile's own level
    pub fn is_well_formed(&self) -> bool {
        if self.z == 0 || self.z > MAX_QUAD_RESOLUTION {
            return false;
        }
        let side = 1u32 << (self.z - 1);
        (1..=side).contains(&self.x) && (1..=side).contains(&self.y)
    }
}

impl Cell for TileCell {
    fn resolution(&self) -> u8 {
        self.z
    }
}

impl fmt::Display for TileCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Child position within a parent tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quadrant {
    /// Upper left child
    TopLeft,
    /// Upper right child
    TopRight,
    /// Lower right child
    BottomRight,
    /// Lower left child
    BottomLeft,
}

/// Quadtree grid bounded by a [`GridConfig`]
#[derive(Debug, Clone)]
pub struct QuadGrid {
    config: GridConfig,
}

impl QuadGrid {
    /// Create a grid spanning `min_resolution..=max_resolution`
    pub fn new(min_resolution: u8, max_resolution: u8) -> Result<Self> {
        Self::from_config(GridConfig::new(min_resolution, max_resolution)?)
    }

    /// Create a grid rooted at `z = 1` with `levels` levels
    pub fn with_levels(levels: u8) -> Result<Self> {
        Self::new(1, levels)
    }

    /// Create a grid from an existing config
    pub fn from_config(config: GridConfig) -> Result<Self> {
        config.validate()?;
        if config.min_resolution == 0 {
            return Err(PyramidError::config("quadtree levels start at 1"));
        }
        if config.max_resolution > MAX_QUAD_RESOLUTION {
            return Err(PyramidError::config(format!(
                "max_resolution {} exceeds the quadtree limit of {}",
                config.max_resolution, MAX_QUAD_RESOLUTION
            )));
        }
        Ok(Self { config })
    }

    /// Resolution bounds
    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Finest level
    pub fn max_resolution(&self) -> u8 {
        self.config.max_resolution
    }

    /// Whether `cell` belongs to this grid
    pub fn supports(&self, cell: &TileCell) -> bool {
        cell.is_well_formed() && self.config.supports_resolution(cell.z)
    }

    /// Number of tiles at level `z`
    pub fn tiles_at_level(&self, z: u8) -> u64 {
        match z {
            0 => 0,
            _ => 1u64 << (2 * u32::from(z - 1)),
        }
    }

    /// Rows (and columns) of the square tile layout at level `z`
    pub fn rows_cols_at_level(&self, z: u8) -> u32 {
        match z {
            0 => 0,
            _ => 1u32 << (z - 1),
        }
    }

    /// Number of bottom tiles under `cell`
    pub fn count_bottom_under(&self, cell: &TileCell) -> u64 {
        if cell.z > self.config.max_resolution {
            return 0;
        }
        1u64 << (2 * u32::from(self.config.max_resolution - cell.z))
    }

    /// Every tile at the coarsest level, row by row
    pub fn root_cells(&self) -> Vec<TileCell> {
        let z = self.config.min_resolution;
        let side = self.rows_cols_at_level(z);
        (1..=side)
            .flat_map(|y| (1..=side).map(move |x| TileCell::new(z, x, y)))
            .collect()
    }
}

impl Grid<TileCell> for QuadGrid {
    fn is_bottom(&self, cell: &TileCell) -> bool {
        self.config.is_bottom_resolution(cell.z)
    }

    fn children(&self, cell: &TileCell) -> Result<Vec<TileCell>> {
        if self.is_bottom(cell) {
            return Err(PyramidError::invalid_cell(
                cell,
                format!("no children below level {}", self.config.max_resolution),
            ));
        }
        if !self.supports(cell) {
            return Err(PyramidError::unsupported_cell(cell));
        }
        cell.children()
            .map(|children| children.to_vec())
            .ok_or_else(|| PyramidError::unsupported_cell(cell))
    }
}
