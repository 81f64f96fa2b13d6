//! Raster-backed quadtree pyramids
//!
//! A [`Raster`] holds the bottom-level values of a [`QuadGrid`] row by row;
//! [`Pyramid::from_raster`] turns it into a pyramid whose leaves read the
//! raster and whose inner tiles combine their four quadrants.

use crate::builder::PyramidBuilder;
use crate::engine::{Pyramid, Value};
use crate::error::{PyramidError, Result};
use crate::grid::{QuadGrid, TileCell};
use crate::types::Contributions;
use std::sync::Arc;

/// Square grid of values addressed by 1-based tile indices
#[derive(Debug, Clone, PartialEq)]
pub struct Raster<T> {
    side: u32,
    cells: Vec<T>,
}

impl<T> Raster<T> {
    /// Create a raster from rows of equal length, as many rows as columns
    pub fn new(rows: Vec<Vec<T>>) -> Result<Self> {
        let side = rows.len();
        if side == 0 {
            return Err(PyramidError::config("raster must not be empty"));
        }
        if let Some((index, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != side) {
            return Err(PyramidError::config(format!(
                "raster must be square: row {} has {} values, expected {}",
                index + 1,
                row.len(),
                side
            )));
        }
        let side = u32::try_from(side)
            .map_err(|_| PyramidError::config(format!("raster side {} is too large", side)))?;

        Ok(Self {
            side,
            cells: rows.into_iter().flatten().collect(),
        })
    }

    /// Create a `side` x `side` raster from a function of `(x, y)`
    pub fn from_fn(side: u32, f: impl Fn(u32, u32) -> T) -> Self {
        let cells = (1..=side)
            .flat_map(|y| (1..=side).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Self { side, cells }
    }

    /// Number of rows (and columns)
    pub fn side(&self) -> u32 {
        self.side
    }

    /// Value at column `x`, row `y` (both 1-based)
    pub fn get(&self, x: u32, y: u32) -> Option<&T> {
        if x == 0 || y == 0 || x > self.side || y > self.side {
            return None;
        }
        let index = (y - 1) as usize * self.side as usize + (x - 1) as usize;
        self.cells.get(index)
    }

    /// Value under a bottom tile
    pub fn at(&self, tile: &TileCell) -> Option<&T> {
        self.get(tile.x, tile.y)
    }
}

impl<T: Value + Clone> Pyramid<TileCell, T> {
    /// Build a pyramid whose bottom tiles read `raster`
    ///
    /// The raster side must match the tile layout of the grid's finest level.
    pub fn from_raster<F>(
        name: impl Into<String>,
        grid: Arc<QuadGrid>,
        raster: Raster<T>,
        aggregate: F,
    ) -> Result<Self>
    where
        F: Fn(&Contributions<'_, TileCell, T>, &TileCell) -> anyhow::Result<T>
            + Send
            + Sync
            + 'static,
    {
        Self::raster_builder(name, grid, raster)?
            .aggregate_fn(aggregate)
            .build()
    }

    /// Start a raster-backed builder, leaving the aggregate and options open
    pub fn raster_builder(
        name: impl Into<String>,
        grid: Arc<QuadGrid>,
        raster: Raster<T>,
    ) -> Result<PyramidBuilder<TileCell, T>> {
        let expected = grid.rows_cols_at_level(grid.max_resolution());
        if raster.side() != expected {
            return Err(PyramidError::config(format!(
                "raster side {} does not match {} tiles per row at level {}",
                raster.side(),
                expected,
                grid.max_resolution()
            )));
        }

        Ok(Pyramid::builder(name, grid).map_fn(move |_, tile: &TileCell| {
            raster
                .at(tile)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("tile {} lies outside the raster", tile))
        }))
    }
}
