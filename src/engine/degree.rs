//! Degree combination policies

use crate::types::MAX_DEGREE;

/// How a parent's degree is derived from its slots' degrees
///
/// Slots that have not reported yet count as degree `0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegreePolicy {
    /// Arithmetic mean over all slots
    #[default]
    Mean,
    /// Mean weighted by [`Grid::child_weight`](crate::grid::Grid::child_weight);
    /// inputs weigh 1.0
    WeightedMean,
    /// The least resolved slot
    Min,
}

impl DegreePolicy {
    /// Combine `(weight, degree)` pairs into one degree in `0.0..=MAX_DEGREE`
    pub fn combine<I>(&self, slots: I) -> f64
    where
        I: IntoIterator<Item = (f64, Option<f64>)>,
    {
        let combined = match self {
            Self::Mean => {
                let (count, total) = slots
                    .into_iter()
                    .fold((0usize, 0.0), |(n, sum), (_, degree)| {
                        (n + 1, sum + degree.unwrap_or(0.0))
                    });
                if count == 0 {
                    0.0
                } else {
                    total / count as f64
                }
            }
            Self::WeightedMean => {
                let (weights, total) = slots
                    .into_iter()
                    .fold((0.0, 0.0), |(w_sum, sum), (weight, degree)| {
                        let weight = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
                        (w_sum + weight, sum + weight * degree.unwrap_or(0.0))
                    });
                if weights > 0.0 {
                    total / weights
                } else {
                    0.0
                }
            }
            Self::Min => slots
                .into_iter()
                .map(|(_, degree)| degree.unwrap_or(0.0))
                .reduce(f64::min)
                .unwrap_or(0.0),
        };
        if combined.is_nan() {
            return 0.0;
        }
        combined.clamp(0.0, MAX_DEGREE)
    }
}
