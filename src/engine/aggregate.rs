//! Fan-out / fan-in aggregation at non-bottom cells

use super::{inputs, DegreePolicy, EstimateSource, Pyramid, PyramidInner, Value};
use crate::error::{PyramidError, Result};
use crate::grid::Cell;
use crate::stream::EstimateSender;
use crate::types::{Contributions, Estimate, Slot, MAX_DEGREE};
use futures::stream::{self, select_all};
use futures::StreamExt;
use tracing::{debug, trace};

/// Event of one slot's stream in the merged-wait set
enum SlotEvent<T> {
    Update(usize, Result<Estimate<T>>),
    Closed(usize),
}

/// Latest estimate per slot, owned by the single fan-in loop
struct LatestTable<C, T> {
    slots: Vec<Slot<C>>,
    weights: Vec<f64>,
    latest: Vec<Option<Estimate<T>>>,
    closed: Vec<bool>,
}

impl<C, T> LatestTable<C, T> {
    fn new(slots: Vec<Slot<C>>, weights: Vec<f64>) -> Self {
        let n = slots.len();
        Self {
            slots,
            weights,
            latest: (0..n).map(|_| None).collect(),
            closed: vec![false; n],
        }
    }

    fn update(&mut self, index: usize, estimate: Estimate<T>) {
        self.latest[index] = Some(estimate);
    }

    /// Mark a slot's stream as ended; false if it never reported
    fn close(&mut self, index: usize) -> bool {
        self.closed[index] = true;
        self.latest[index].is_some()
    }

    fn reported(&self) -> usize {
        self.latest.iter().filter(|e| e.is_some()).count()
    }

    fn is_full(&self) -> bool {
        self.reported() == self.slots.len()
    }

    fn all_complete(&self) -> bool {
        self.latest.iter().zip(&self.closed).all(|(estimate, closed)| match estimate {
            Some(estimate) => *closed || estimate.is_complete(),
            None => false,
        })
    }

    fn degree(&self, policy: DegreePolicy) -> f64 {
        policy.combine(
            self.weights
                .iter()
                .zip(&self.latest)
                .map(|(weight, estimate)| (*weight, estimate.as_ref().map(|e| e.degree))),
        )
    }

    fn contributions(&self) -> Contributions<'_, C, T> {
        Contributions::new(
            self.slots
                .iter()
                .zip(&self.latest)
                .filter_map(|(slot, estimate)| estimate.as_ref().map(|e| (slot, &e.value)))
                .collect(),
        )
    }
}

/// Aggregate `cell` from its children and inputs, emitting improving estimates
pub(super) async fn run<C: Cell, T: Value>(
    pyramid: &Pyramid<C, T>,
    cell: &C,
    tx: &mut EstimateSender<T>,
) -> Result<()> {
    let node = &pyramid.inner;
    let policy = node.config.degree_policy;

    let children = node.grid.children(cell)?;
    if children.is_empty() {
        return Err(PyramidError::EmptyChildSet {
            cell: cell.to_string(),
        });
    }

    let mut slots = Vec::with_capacity(children.len() + node.inputs.len());
    let mut weights = Vec::with_capacity(slots.capacity());
    let mut streams = Vec::with_capacity(slots.capacity());
    for child in children {
        let weight = match policy {
            DegreePolicy::WeightedMean => node.grid.child_weight(cell, &child),
            _ => 1.0,
        };
        streams.push(pyramid.estimate_stream_at(&child));
        slots.push(Slot::Child(child));
        weights.push(weight);
    }
    for (slot, stream) in inputs::open(node, cell) {
        streams.push(stream);
        slots.push(slot);
        weights.push(1.0);
    }

    debug!(
        children = slots.iter().filter(|s| s.is_child()).count(),
        inputs = node.inputs.len(),
        "Fanning out"
    );

    let mut merged = select_all(streams.into_iter().enumerate().map(|(index, source)| {
        source
            .map(move |item| SlotEvent::Update(index, item))
            .chain(stream::once(async move { SlotEvent::Closed(index) }))
            .boxed()
    }));
    let mut table = LatestTable::new(slots, weights);

    loop {
        let event = tokio::select! {
            biased;
            _ = tx.closed() => return Err(PyramidError::Cancelled),
            event = merged.next() => event,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            SlotEvent::Update(index, Ok(estimate)) => {
                trace!(slot = %table.slots[index], degree = estimate.degree, "Slot updated");
                table.update(index, estimate);
            }
            SlotEvent::Update(index, Err(err)) => {
                return Err(PyramidError::aggregation(cell, &table.slots[index], err));
            }
            SlotEvent::Closed(index) => {
                if !table.close(index) {
                    let slot = &table.slots[index];
                    let closed = PyramidError::StreamClosed {
                        cell: slot.to_string(),
                    };
                    return Err(PyramidError::aggregation(cell, slot, closed));
                }
            }
        }

        if table.all_complete() {
            break;
        }
        emit_if_improved(node, cell, &table, tx).await?;
    }

    // Every slot is final: the aggregate over final values closes the stream.
    if tx.last_degree().map_or(true, |last| last < MAX_DEGREE) {
        let value = aggregate(node, cell, &table)?;
        emit(node, tx, Estimate::complete(value)).await?;
    }
    Ok(())
}

/// Emit the current aggregate if its degree beats the last emitted one
async fn emit_if_improved<C: Cell, T: Value>(
    node: &PyramidInner<C, T>,
    cell: &C,
    table: &LatestTable<C, T>,
    tx: &mut EstimateSender<T>,
) -> Result<()> {
    let ready = if node.config.partial_aggregation {
        table.reported() > 0
    } else {
        table.is_full()
    };
    if !ready {
        return Ok(());
    }

    // The maximum degree is reserved for the aggregate over final values.
    let degree = table.degree(node.config.degree_policy);
    if degree >= MAX_DEGREE {
        return Ok(());
    }
    if tx.last_degree().is_some_and(|last| degree <= last) {
        trace!(degree, "Suppressed non-improving estimate");
        if let Some(metrics) = &node.metrics {
            metrics.record_suppressed(&node.name);
        }
        return Ok(());
    }

    let value = aggregate(node, cell, table)?;
    emit(node, tx, Estimate::new(degree, value)).await
}

fn aggregate<C: Cell, T: Value>(
    node: &PyramidInner<C, T>,
    cell: &C,
    table: &LatestTable<C, T>,
) -> Result<T> {
    (node.aggregate_fn)(&table.contributions(), cell).map_err(|e| {
        PyramidError::AggregateEvaluation {
            cell: cell.to_string(),
            message: format!("{:#}", e),
        }
    })
}

async fn emit<C: Cell, T: Value>(
    node: &PyramidInner<C, T>,
    tx: &mut EstimateSender<T>,
    estimate: Estimate<T>,
) -> Result<()> {
    let degree = estimate.degree;
    tx.emit(estimate).await?;
    if let Some(metrics) = &node.metrics {
        metrics.record_emitted(&node.name, "aggregate");
    }
    debug!(degree, "Aggregate estimate emitted");
    Ok(())
}
