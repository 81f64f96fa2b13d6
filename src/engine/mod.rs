//! Pyramid evaluation engine
//!
//! ## Table of Contents
//! - **EstimateSource**: Anything that yields an estimate stream per cell
//! - **Pyramid**: Map/aggregate definition evaluated over a grid
//! - **DegreePolicy**: How child degrees combine into a parent degree
//! - **FnSource / MappedSource**: Adapters over raw data and foreign value types
//!
//! Every `estimate_stream_at` call spawns one tokio task. A task at a bottom
//! cell runs the leaf evaluator; any other task fans out one stream per child
//! and input, then fans their updates back in through a single loop that owns
//! the table of latest estimates.

mod aggregate;
pub mod degree;
pub mod inputs;
mod leaf;

pub use degree::DegreePolicy;
pub use inputs::{FnSource, MappedSource};

use crate::builder::{PyramidBuilder, PyramidConfig};
use crate::error::PyramidError;
use crate::grid::{Cell, Grid, SharedGrid};
use crate::metrics::PyramidMetrics;
use crate::stream::{EstimateSender, EstimateStream};
use crate::types::{Contributions, PyramidId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, debug_span, warn, Instrument};

/// Bounds required of estimated values
pub trait Value: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Value for T {}

/// Function evaluated at bottom cells over the resolved inputs
pub type MapFn<C, T> =
    Arc<dyn Fn(&Contributions<'_, C, T>, &C) -> anyhow::Result<T> + Send + Sync>;

/// Function combining child (and input) values at non-bottom cells
///
/// Must not depend on the order in which children reported.
pub type AggregateFn<C, T> =
    Arc<dyn Fn(&Contributions<'_, C, T>, &C) -> anyhow::Result<T> + Send + Sync>;

/// Shared estimate source handle
pub type SharedSource<C, T> = Arc<dyn EstimateSource<C, T>>;

/// Anything that produces a progressive estimate stream for a cell
///
/// Implemented by [`Pyramid`] and by adapters over raw data. Each call returns
/// a fresh stream with a single producer.
pub trait EstimateSource<C: Cell, T>: Send + Sync {
    /// Open a new estimate stream at `cell`
    fn estimate_stream_at(&self, cell: &C) -> EstimateStream<T>;

    /// Source name for logging
    fn name(&self) -> &str {
        "source"
    }

    /// Adapt this source to another value type, keeping degrees and errors
    fn map_values<U, F>(self, convert: F) -> MappedSource<C, T, U>
    where
        Self: Sized + 'static,
        T: Value,
        U: Value,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        MappedSource::new(self, convert)
    }
}

impl<C: Cell, T, S: EstimateSource<C, T> + ?Sized> EstimateSource<C, T> for Arc<S> {
    fn estimate_stream_at(&self, cell: &C) -> EstimateStream<T> {
        (**self).estimate_stream_at(cell)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

pub(crate) struct PyramidInner<C: Cell, T> {
    pub(crate) id: PyramidId,
    pub(crate) name: String,
    pub(crate) grid: SharedGrid<C>,
    pub(crate) map_fn: MapFn<C, T>,
    pub(crate) aggregate_fn: AggregateFn<C, T>,
    pub(crate) inputs: Vec<(String, SharedSource<C, T>)>,
    pub(crate) config: PyramidConfig,
    pub(crate) metrics: Option<Arc<PyramidMetrics>>,
}

/// A reusable map/aggregate computation over a grid
///
/// Cloning is cheap; clones share one immutable definition. A pyramid keeps no
/// per-query state, every call to [`estimate_stream_at`] evaluates afresh.
///
/// [`estimate_stream_at`]: EstimateSource::estimate_stream_at
pub struct Pyramid<C: Cell, T> {
    inner: Arc<PyramidInner<C, T>>,
}

impl<C: Cell, T> Clone for Pyramid<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Cell, T: Value> Pyramid<C, T> {
    /// Start building a pyramid over `grid`
    ///
    /// Use [`PyramidBuilder::new`] to pass an already type-erased [`SharedGrid`].
    pub fn builder<G>(name: impl Into<String>, grid: Arc<G>) -> PyramidBuilder<C, T>
    where
        G: Grid<C> + 'static,
    {
        PyramidBuilder::new(name, grid)
    }

    pub(crate) fn from_inner(inner: PyramidInner<C, T>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Unique id of this definition
    pub fn id(&self) -> PyramidId {
        self.inner.id
    }

    /// Name given at construction
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Evaluation settings
    pub fn config(&self) -> &PyramidConfig {
        &self.inner.config
    }

    /// Grid the pyramid walks
    pub fn grid(&self) -> &SharedGrid<C> {
        &self.inner.grid
    }

    /// Names of the input sources, in declaration order
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inner.inputs.iter().map(|(name, _)| name.as_str())
    }

    /// Metrics sink, if configured
    pub fn metrics(&self) -> Option<&Arc<PyramidMetrics>> {
        self.inner.metrics.as_ref()
    }

    async fn produce(self, cell: C, mut tx: EstimateSender<T>) {
        let _task = self
            .inner
            .metrics
            .as_ref()
            .map(|m| m.track_task(&self.inner.name));

        let outcome = if self.inner.grid.is_bottom(&cell) {
            debug!("Evaluating bottom cell");
            leaf::evaluate(&self.inner, &cell, &mut tx).await
        } else {
            aggregate::run(&self, &cell, &mut tx).await
        };

        match outcome {
            Ok(()) => debug!(degree = ?tx.last_degree(), "Estimate stream complete"),
            Err(PyramidError::Cancelled) => {
                debug!("Evaluation cancelled by consumer");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_cancellation(&self.inner.name);
                }
            }
            Err(err) => {
                warn!(error = %err, "Evaluation failed");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_failure(&self.inner.name);
                }
                let _ = tx.fail(err).await;
            }
        }
    }
}

impl<C: Cell, T: Value> EstimateSource<C, T> for Pyramid<C, T> {
    /// Spawn the evaluation of `cell` and return its stream
    ///
    /// Must be called within a tokio runtime.
    fn estimate_stream_at(&self, cell: &C) -> EstimateStream<T> {
        let (tx, stream) = EstimateStream::channel(self.inner.config.buffer_size);
        let span = debug_span!(
            "pyramid",
            name = %self.inner.name,
            id = %self.inner.id,
            cell = %cell
        );
        let node = self.clone();
        let cell = cell.clone();
        tokio::spawn(node.produce(cell, tx).instrument(span));
        stream
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<C: Cell, T> fmt::Debug for Pyramid<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pyramid")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("inputs", &self.inner.inputs.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests;
