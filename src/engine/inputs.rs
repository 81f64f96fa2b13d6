//! Input resolution and source adapters
//!
//! Inputs are other [`EstimateSource`]s evaluated at the same cell. At a
//! bottom cell they are drained to their final estimate before the map
//! function runs; at other cells they join the children in the merged-wait
//! set (see the aggregator).

use super::{EstimateSource, PyramidInner, SharedSource, Value};
use crate::error::{PyramidError, Result};
use crate::grid::Cell;
use crate::stream::{EstimateSender, EstimateStream};
use crate::types::{Estimate, Slot};
use futures::future::try_join_all;
use futures::stream;
use std::sync::Arc;
use tracing::trace;

/// Open one stream per input of `node` at `cell`, in declaration order
pub(crate) fn open<C: Cell, T: Value>(
    node: &PyramidInner<C, T>,
    cell: &C,
) -> Vec<(Slot<C>, EstimateStream<T>)> {
    node.inputs
        .iter()
        .map(|(name, source)| (Slot::Input(name.clone()), source.estimate_stream_at(cell)))
        .collect()
}

/// Drain every input at `cell` concurrently, keeping each final value
///
/// Stops early with `Cancelled` if the consumer of `tx` goes away.
pub(crate) async fn resolve_final<C: Cell, T: Value>(
    node: &PyramidInner<C, T>,
    cell: &C,
    tx: &EstimateSender<T>,
) -> Result<Vec<(Slot<C>, T)>> {
    if node.inputs.is_empty() {
        return Ok(Vec::new());
    }

    let pending = try_join_all(open(node, cell).into_iter().map(|(slot, stream)| async move {
        match stream.final_estimate().await {
            Ok(estimate) => {
                trace!(input = %slot, degree = estimate.degree, "Input resolved");
                Ok((slot, estimate.value))
            }
            Err(PyramidError::StreamClosed { .. }) => {
                let closed = PyramidError::StreamClosed {
                    cell: slot.to_string(),
                };
                Err(PyramidError::aggregation(cell, &slot, closed))
            }
            Err(err) => Err(PyramidError::aggregation(cell, &slot, err)),
        }
    }));

    // The first failing input drops the remaining ones.
    tokio::select! {
        biased;
        _ = tx.closed() => Err(PyramidError::Cancelled),
        resolved = pending => resolved,
    }
}

/// Source backed by a plain function over raw data
///
/// Yields a single final estimate per cell, computed on first poll.
pub struct FnSource<C, T> {
    name: String,
    func: Arc<dyn Fn(&C) -> anyhow::Result<T> + Send + Sync>,
}

impl<C: Cell, T: Value> FnSource<C, T> {
    /// Create a new function-backed source
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&C) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl<C: Cell, T: Value> EstimateSource<C, T> for FnSource<C, T> {
    fn estimate_stream_at(&self, cell: &C) -> EstimateStream<T> {
        let func = Arc::clone(&self.func);
        let cell = cell.clone();
        EstimateStream::from_stream(stream::once(async move {
            func(&cell)
                .map(Estimate::complete)
                .map_err(|e| PyramidError::MapEvaluation {
                    cell: cell.to_string(),
                    message: format!("{:#}", e),
                })
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Source converting another source's values into a different type
///
/// Lets a pyramid over `T` depend on a pyramid over `U`. Degrees and errors
/// pass through unchanged.
pub struct MappedSource<C: Cell, U, T> {
    name: String,
    source: SharedSource<C, U>,
    convert: Arc<dyn Fn(U) -> T + Send + Sync>,
}

impl<C: Cell, U: Value, T: Value> MappedSource<C, U, T> {
    /// Wrap `source`, converting each value with `convert`
    pub fn new<S, F>(source: S, convert: F) -> Self
    where
        S: EstimateSource<C, U> + 'static,
        F: Fn(U) -> T + Send + Sync + 'static,
    {
        Self {
            name: source.name().to_string(),
            source: Arc::new(source),
            convert: Arc::new(convert),
        }
    }
}

impl<C: Cell, U: Value, T: Value> EstimateSource<C, T> for MappedSource<C, U, T> {
    fn estimate_stream_at(&self, cell: &C) -> EstimateStream<T> {
        let convert = Arc::clone(&self.convert);
        self.source
            .estimate_stream_at(cell)
            .map_values(move |value| convert(value))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
