//! Error types for pyramid evaluation
//!
//! ## Table of Contents
//! - **PyramidError**: Main error enum covering all failure modes
//! - **Result**: Type alias for `Result<T, PyramidError>`

use thiserror::Error;

/// Result type alias for pyramid operations
pub type Result<T> = std::result::Result<T, PyramidError>;

/// Main error type for pyramid evaluation
///
/// Cells are carried in their `Display` form so the error stays independent of
/// the concrete cell type of the grid that produced it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PyramidError {
    /// Cell violates the grid invariants (e.g. asking a bottom cell for children)
    #[error("invalid cell {cell}: {reason}")]
    InvalidCell {
        /// Offending cell
        cell: String,
        /// Why the cell was rejected
        reason: String,
    },

    /// Cell does not belong to this grid's tessellation
    #[error("cell {cell} is not part of this grid")]
    UnsupportedCell {
        /// Offending cell
        cell: String,
    },

    /// Grid reported no children for a non-bottom cell
    #[error("grid returned no children for non-bottom cell {cell}")]
    EmptyChildSet {
        /// Cell without children
        cell: String,
    },

    /// The map function failed at a bottom cell
    #[error("map function failed at {cell}: {message}")]
    MapEvaluation {
        /// Bottom cell being evaluated
        cell: String,
        /// Error chain reported by the map function
        message: String,
    },

    /// The aggregate function failed at a non-bottom cell
    #[error("aggregate function failed at {cell}: {message}")]
    AggregateEvaluation {
        /// Cell being aggregated
        cell: String,
        /// Error chain reported by the aggregate function
        message: String,
    },

    /// A child or input stream of `cell` failed
    #[error("aggregation at {cell} failed in {source_slot}: {cause}")]
    Aggregation {
        /// Cell whose stream is closing
        cell: String,
        /// Child cell or input name the failure came from
        source_slot: String,
        /// The failure reported by that slot
        #[source]
        cause: Box<PyramidError>,
    },

    /// A child or input stream ended without producing any estimate
    #[error("stream for {cell} closed before producing an estimate")]
    StreamClosed {
        /// Cell or input whose stream ended early
        cell: String,
    },

    /// The consumer cancelled the stream
    #[error("estimate stream cancelled")]
    Cancelled,

    /// Configuration error during builder setup
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics registration or export failure
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl PyramidError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a metrics error
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Create an invalid cell error
    pub fn invalid_cell(cell: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidCell {
            cell: cell.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported cell error
    pub fn unsupported_cell(cell: impl ToString) -> Self {
        Self::UnsupportedCell {
            cell: cell.to_string(),
        }
    }

    /// Wrap a slot failure into an aggregation error at `cell`
    pub fn aggregation(cell: impl ToString, source_slot: impl ToString, cause: PyramidError) -> Self {
        Self::Aggregation {
            cell: cell.to_string(),
            source_slot: source_slot.to_string(),
            cause: Box::new(cause),
        }
    }

    /// Whether the stream ended because its consumer cancelled it
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Innermost error of an aggregation chain
    pub fn origin(&self) -> &PyramidError {
        let mut current = self;
        while let Self::Aggregation { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// Cells and inputs traversed from the outermost aggregation down to the origin
    pub fn path(&self) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = self;
        while let Self::Aggregation {
            cell,
            source_slot,
            cause,
        } = current
        {
            if path.is_empty() {
                path.push(cell.as_str());
            }
            path.push(source_slot.as_str());
            current = cause;
        }
        path
    }
}

impl From<prometheus::Error> for PyramidError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
