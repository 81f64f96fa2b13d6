//! Ready-made aggregate functions and numeric helpers
//!
//! The `*_of_children` functions have the aggregate function signature and can
//! be passed straight to [`PyramidBuilder::aggregate_fn`](crate::PyramidBuilder::aggregate_fn).

use crate::grid::Cell;
use crate::types::Contributions;
use anyhow::{bail, Result};

/// Arithmetic mean of the child values, ignoring inputs
pub fn mean_of_children<C: Cell>(contributions: &Contributions<'_, C, f64>, cell: &C) -> Result<f64> {
    let (count, total) = contributions
        .child_values()
        .fold((0usize, 0.0), |(n, sum), value| (n + 1, sum + value));
    if count == 0 {
        bail!("no child values at {}", cell);
    }
    Ok(total / count as f64)
}

/// Sum of the child values, ignoring inputs
pub fn sum_of_children<C: Cell>(contributions: &Contributions<'_, C, f64>, cell: &C) -> Result<f64> {
    if contributions.children().next().is_none() {
        bail!("no child values at {}", cell);
    }
    Ok(sum(contributions.child_values().copied()))
}

/// Sum of `values`
pub fn sum(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().sum()
}

/// Sum of `weights[i] * values[i]`
pub fn weighted_sum(values: &[f64], weights: &[f64]) -> Result<f64> {
    if values.len() != weights.len() {
        bail!(
            "{} values but {} weights",
            values.len(),
            weights.len()
        );
    }
    Ok(values.iter().zip(weights).map(|(v, w)| v * w).sum())
}

/// Weighted mean of `values`, normalised by the total weight
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> Result<f64> {
    let total = weights.iter().sum::<f64>();
    if total <= 0.0 {
        bail!("total weight must be positive, got {}", total);
    }
    Ok(weighted_sum(values, weights)? / total)
}
