//! Hierarchical spatial addressing
//!
//! ## Table of Contents
//! - **Cell**: Trait for cell identifiers of a tessellation
//! - **Grid**: Capability trait the engine walks (bottom test, children)
//! - **GridConfig**: Resolution bounds shared by grid implementations
//! - **QuadGrid**: Reference quadtree tessellation with z/x/y tiles

pub mod quad;

pub use quad::{QuadGrid, Quadrant, TileCell};

use crate::error::{PyramidError, Result};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// An addressable region at one resolution level
pub trait Cell: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Resolution level; children always have a strictly higher one
    fn resolution(&self) -> u8;
}

/// Parent/child capability of a tessellation
///
/// Implementations must be pure: the same cell always yields the same
/// children in the same order.
///
/// # Example
///
/// ```rust,ignore
/// use estimate_pyramid::grid::{Cell, Grid};
///
/// struct BinaryGrid { max: u8 }
///
/// impl Grid<Interval> for BinaryGrid {
///     fn is_bottom(&self, cell: &Interval) -> bool {
///         cell.resolution() >= self.max
///     }
///
///     fn children(&self, cell: &Interval) -> Result<Vec<Interval>> {
///         Ok(vec![cell.lower_half(), cell.upper_half()])
///     }
/// }
/// ```
pub trait Grid<C: Cell>: Send + Sync {
    /// Whether `cell` is at or finer than the finest resolution
    fn is_bottom(&self, cell: &C) -> bool;

    /// Immediate finer cells covering `cell`
    fn children(&self, cell: &C) -> Result<Vec<C>>;

    /// Completeness weight of `child` within `parent`
    ///
    /// Override this for non-uniform tessellations; used by
    /// [`DegreePolicy::WeightedMean`](crate::engine::DegreePolicy::WeightedMean).
    fn child_weight(&self, _parent: &C, _child: &C) -> f64 {
        1.0
    }
}

/// Shared grid handle
pub type SharedGrid<C> = Arc<dyn Grid<C>>;

/// Resolution bounds of a grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridConfig {
    /// Coarsest supported resolution (root level)
    pub min_resolution: u8,
    /// Finest resolution; cells at or below it are bottom cells
    pub max_resolution: u8,
}

impl GridConfig {
    /// Create a new grid config
    pub fn new(min_resolution: u8, max_resolution: u8) -> Result<Self> {
        let config = Self {
            min_resolution,
            max_resolution,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the resolution bounds
    pub fn validate(&self) -> Result<()> {
        if self.min_resolution > self.max_resolution {
            return Err(PyramidError::config(format!(
                "min_resolution {} exceeds max_resolution {}",
                self.min_resolution, self.max_resolution
            )));
        }
        Ok(())
    }

    /// Whether a resolution is at or below the finest level
    pub fn is_bottom_resolution(&self, resolution: u8) -> bool {
        resolution >= self.max_resolution
    }

    /// Whether a resolution lies within the bounds
    pub fn supports_resolution(&self, resolution: u8) -> bool {
        (self.min_resolution..=self.max_resolution).contains(&resolution)
    }

    /// Number of levels between the root and the bottom, inclusive
    pub fn levels(&self) -> u8 {
        self.max_resolution - self.min_resolution + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_config_bounds() {
        let config = GridConfig::new(1, 4).unwrap();
        assert_eq!(config.levels(), 4);
        assert!(config.is_bottom_resolution(4));
        assert!(config.is_bottom_resolution(5));
        assert!(!config.is_bottom_resolution(3));
        assert!(config.supports_resolution(1));
        assert!(!config.supports_resolution(5));
    }

    #[test]
    fn test_grid_config_rejects_inverted_bounds() {
        assert!(matches!(GridConfig::new(5, 2), Err(PyramidError::Config(_))));
    }
}
