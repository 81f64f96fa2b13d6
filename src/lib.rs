//! # Estimate Pyramid
//!
//! Progressive hierarchical estimation over multi-resolution spatial grids.
//!
//! A [`Pyramid`] pairs a map function, evaluated at the finest cells, with an
//! aggregate function that combines child values at coarser cells. Asking for
//! a cell returns an [`EstimateStream`]: a sequence of estimates whose degree
//! of completeness strictly increases and ends at [`MAX_DEGREE`].
//!
//! ## Features
//!
//! - **Concurrent fan-out**: every child and input runs in its own tokio task
//! - **Progressive results**: coarse answers first, refined as children finish
//! - **Composable**: pyramids consume other pyramids as named inputs
//! - **Cancellation**: dropping a stream stops the whole subtree
//! - **Metrics**: Prometheus counters for emissions, failures and live tasks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use estimate_pyramid::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> estimate_pyramid::Result<()> {
//!     let grid = Arc::new(QuadGrid::with_levels(4)?);
//!
//!     let population = Pyramid::builder("population", grid)
//!         .map_fn(|_, tile: &TileCell| Ok(f64::from(tile.x + tile.y)))
//!         .aggregate_fn(sum_of_children)
//!         .with_partial_aggregation(true)
//!         .build()?;
//!
//!     let mut estimates = population.estimate_stream_at(&TileCell::root());
//!     while let Some(estimate) = estimates.next().await {
//!         let estimate = estimate?;
//!         println!("{:.2} -> {}", estimate.degree, estimate.value);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod aggregates;
pub mod builder;
pub mod engine;
pub mod error;
pub mod grid;
pub mod metrics;
pub mod raster;
pub mod stream;
pub mod types;

// Re-exports for ergonomic API
pub use builder::{PyramidBuilder, PyramidConfig, MAX_BUFFER_SIZE};
pub use engine::{
    AggregateFn, DegreePolicy, EstimateSource, FnSource, MapFn, MappedSource, Pyramid,
    SharedSource, Value,
};
pub use error::{PyramidError, Result};
pub use grid::{Cell, Grid, GridConfig, QuadGrid, Quadrant, SharedGrid, TileCell};
pub use metrics::{PyramidMetrics, TaskGuard};
pub use raster::Raster;
pub use stream::{Drained, EstimateSender, EstimateStream, DEFAULT_BUFFER_SIZE};
pub use types::{Contributions, Estimate, PyramidId, Slot, MAX_DEGREE};

/// Prelude for common imports
pub mod prelude {
    pub use crate::aggregates::{mean_of_children, sum_of_children};
    pub use crate::builder::PyramidConfig;
    pub use crate::engine::{DegreePolicy, EstimateSource, FnSource, MappedSource, Pyramid};
    pub use crate::error::{PyramidError, Result};
    pub use crate::grid::{Cell, Grid, QuadGrid, TileCell};
    pub use crate::raster::Raster;
    pub use crate::stream::EstimateStream;
    pub use crate::types::{Contributions, Estimate, MAX_DEGREE};
    pub use futures::StreamExt;
}
