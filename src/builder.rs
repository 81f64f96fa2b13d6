//! PyramidBuilder for configuring and constructing pyramids
//!
//! ## Table of Contents
//! - **PyramidConfig**: Evaluation settings (buffering, partial aggregation, degree policy)
//! - **PyramidBuilder**: Builder pattern for pyramid definitions

use crate::engine::{
    AggregateFn, DegreePolicy, EstimateSource, MapFn, Pyramid, PyramidInner, SharedSource, Value,
};
use crate::error::{PyramidError, Result};
use crate::grid::{Cell, SharedGrid};
use crate::metrics::PyramidMetrics;
use crate::stream::DEFAULT_BUFFER_SIZE;
use crate::types::{Contributions, PyramidId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Largest number of pending estimates a stream may buffer
pub const MAX_BUFFER_SIZE: usize = 4;

/// Evaluation settings of a pyramid
#[derive(Debug, Clone)]
pub struct PyramidConfig {
    /// Pending estimates buffered per stream before the producer pauses
    pub buffer_size: usize,
    /// Emit as soon as any child or input has reported, aggregating the subset
    pub partial_aggregation: bool,
    /// How child degrees combine into the parent degree
    pub degree_policy: DegreePolicy,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            partial_aggregation: false,
            degree_policy: DegreePolicy::Mean,
        }
    }
}

impl PyramidConfig {
    /// Create a new config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-stream buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Enable or disable best-effort aggregation over partial slot sets
    pub fn partial_aggregation(mut self, enabled: bool) -> Self {
        self.partial_aggregation = enabled;
        self
    }

    /// Set the degree policy
    pub fn degree_policy(mut self, policy: DegreePolicy) -> Self {
        self.degree_policy = policy;
        self
    }

    /// Check the settings
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(PyramidError::config(format!(
                "buffer_size must be between 1 and {}, got {}",
                MAX_BUFFER_SIZE, self.buffer_size
            )));
        }
        Ok(())
    }
}

/// Builder for pyramid definitions
pub struct PyramidBuilder<C: Cell, T> {
    name: String,
    grid: SharedGrid<C>,
    map_fn: Option<MapFn<C, T>>,
    aggregate_fn: Option<AggregateFn<C, T>>,
    inputs: Vec<(String, SharedSource<C, T>)>,
    config: PyramidConfig,
    metrics: Option<Arc<PyramidMetrics>>,
}

impl<C: Cell, T: Value> PyramidBuilder<C, T> {
    /// Create a new builder over `grid`
    pub fn new(name: impl Into<String>, grid: SharedGrid<C>) -> Self {
        Self {
            name: name.into(),
            grid,
            map_fn: None,
            aggregate_fn: None,
            inputs: Vec::new(),
            config: PyramidConfig::default(),
            metrics: None,
        }
    }

    /// Set the function evaluated at bottom cells
    pub fn map_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Contributions<'_, C, T>, &C) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.map_fn = Some(Arc::new(f));
        self
    }

    /// Set the function combining children at non-bottom cells
    pub fn aggregate_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Contributions<'_, C, T>, &C) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.aggregate_fn = Some(Arc::new(f));
        self
    }

    /// Add a named input evaluated at the same cells
    pub fn with_input<S>(self, name: impl Into<String>, source: S) -> Self
    where
        S: EstimateSource<C, T> + 'static,
    {
        self.with_shared_input(name, Arc::new(source))
    }

    /// Add a named input that is already shared
    pub fn with_shared_input(mut self, name: impl Into<String>, source: SharedSource<C, T>) -> Self {
        self.inputs.push((name.into(), source));
        self
    }

    /// Replace the whole evaluation config
    pub fn with_config(mut self, config: PyramidConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable or disable partial aggregation
    pub fn with_partial_aggregation(mut self, enabled: bool) -> Self {
        self.config.partial_aggregation = enabled;
        self
    }

    /// Set the per-stream buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Set the degree policy
    pub fn with_degree_policy(mut self, policy: DegreePolicy) -> Self {
        self.config.degree_policy = policy;
        self
    }

    /// Record evaluation metrics into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<PyramidMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the pyramid
    pub fn build(self) -> Result<Pyramid<C, T>> {
        self.config.validate()?;

        if self.name.trim().is_empty() {
            return Err(PyramidError::config("pyramid name must not be empty"));
        }
        let map_fn = self
            .map_fn
            .ok_or_else(|| PyramidError::config(format!("pyramid '{}' has no map function", self.name)))?;
        let aggregate_fn = self.aggregate_fn.ok_or_else(|| {
            PyramidError::config(format!("pyramid '{}' has no aggregate function", self.name))
        })?;

        let mut seen = HashSet::new();
        for (input, _) in &self.inputs {
            if input.is_empty() {
                return Err(PyramidError::config(format!(
                    "pyramid '{}' has an unnamed input",
                    self.name
                )));
            }
            if !seen.insert(input.as_str()) {
                return Err(PyramidError::config(format!(
                    "pyramid '{}' declares input '{}' twice",
                    self.name, input
                )));
            }
        }

        let id = PyramidId::new();
        info!(
            pyramid = %self.name,
            id = %id,
            inputs = self.inputs.len(),
            partial = self.config.partial_aggregation,
            policy = ?self.config.degree_policy,
            "Building pyramid"
        );

        Ok(Pyramid::from_inner(PyramidInner {
            id,
            name: self.name,
            grid: self.grid,
            map_fn,
            aggregate_fn,
            inputs: self.inputs,
            config: self.config,
            metrics: self.metrics,
        }))
    }
}
