//! Leaf evaluation at bottom cells

use super::{inputs, PyramidInner, Value};
use crate::error::{PyramidError, Result};
use crate::grid::Cell;
use crate::stream::EstimateSender;
use crate::types::{Contributions, Estimate};
use tracing::debug;

/// Resolve the inputs, apply the map function and emit one final estimate
pub(super) async fn evaluate<C: Cell, T: Value>(
    node: &PyramidInner<C, T>,
    cell: &C,
    tx: &mut EstimateSender<T>,
) -> Result<()> {
    let resolved = inputs::resolve_final(node, cell, tx).await?;
    let contributions = Contributions::new(resolved.iter().map(|(slot, value)| (slot, value)).collect());

    let value = (node.map_fn)(&contributions, cell).map_err(|e| PyramidError::MapEvaluation {
        cell: cell.to_string(),
        message: format!("{:#}", e),
    })?;

    tx.emit(Estimate::complete(value)).await?;
    if let Some(metrics) = &node.metrics {
        metrics.record_emitted(&node.name, "leaf");
    }
    debug!(inputs = resolved.len(), "Leaf estimate emitted");
    Ok(())
}
