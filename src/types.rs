//! Core value types for pyramid evaluation
//!
//! ## Table of Contents
//! - **Estimate**: A value paired with its completeness degree
//! - **PyramidId**: Unique identifier for a pyramid definition
//! - **Slot**: Key of a child cell or named input in the merged-wait set
//! - **Contributions**: Name-keyed view over slot values handed to user functions

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Degree of an estimate whose whole subtree has been resolved
pub const MAX_DEGREE: f64 = 1.0;

/// A progressively refined value
///
/// `degree` lies in `0.0..=MAX_DEGREE` and tells how much of the subtree
/// feeding this value has been resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimate<T> {
    /// Completeness of the estimate (0.0 - 1.0)
    pub degree: f64,
    /// The estimated quantity
    pub value: T,
}

impl<T> Estimate<T> {
    /// Create a new estimate, clamping the degree into range
    pub fn new(degree: f64, value: T) -> Self {
        Self {
            degree: degree.clamp(0.0, MAX_DEGREE),
            value,
        }
    }

    /// Create a fully resolved estimate
    pub fn complete(value: T) -> Self {
        Self {
            degree: MAX_DEGREE,
            value,
        }
    }

    /// Whether the estimate has reached the maximum degree
    pub fn is_complete(&self) -> bool {
        self.degree >= MAX_DEGREE
    }

    /// Transform the value, keeping the degree
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Estimate<U> {
        Estimate {
            degree: self.degree,
            value: f(self.value),
        }
    }
}

/// Unique identifier for a pyramid definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PyramidId(Uuid);

impl PyramidId {
    /// Create a new random PyramidId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PyramidId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PyramidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pyr-{}", &self.0.to_string()[..8])
    }
}

/// Key of one entry in an aggregation node's merged-wait set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot<C> {
    /// A finer cell under the cell being aggregated
    Child(C),
    /// An input source, by its stable name
    Input(String),
}

impl<C> Slot<C> {
    /// Whether this slot is a child cell
    pub fn is_child(&self) -> bool {
        matches!(self, Self::Child(_))
    }

    /// The child cell, if this slot is one
    pub fn as_child(&self) -> Option<&C> {
        match self {
            Self::Child(cell) => Some(cell),
            Self::Input(_) => None,
        }
    }

    /// The input name, if this slot is one
    pub fn as_input(&self) -> Option<&str> {
        match self {
            Self::Child(_) => None,
            Self::Input(name) => Some(name),
        }
    }
}

impl<C: fmt::Display> fmt::Display for Slot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Child(cell) => write!(f, "{}", cell),
            Self::Input(name) => write!(f, "input '{}'", name),
        }
    }
}

/// The values visible to a map or aggregate function
///
/// Entries keep the deterministic slot order of the node (children in grid
/// order, then inputs in declaration order). With partial aggregation enabled
/// only slots that have reported are present.
#[derive(Debug)]
pub struct Contributions<'a, C, T> {
    entries: Vec<(&'a Slot<C>, &'a T)>,
}

impl<'a, C, T> Contributions<'a, C, T> {
    pub(crate) fn new(entries: Vec<(&'a Slot<C>, &'a T)>) -> Self {
        Self { entries }
    }

    /// Values from child cells, in grid order
    pub fn children(&self) -> impl Iterator<Item = (&'a C, &'a T)> + '_ {
        self.entries
            .iter()
            .filter_map(|&(slot, value)| slot.as_child().map(|cell| (cell, value)))
    }

    /// Value of the named input
    pub fn input(&self, name: &str) -> Option<&'a T> {
        self.entries
            .iter()
            .find(|(slot, _)| slot.as_input() == Some(name))
            .map(|(_, value)| *value)
    }

    /// Value of the named input, or an error naming the missing input
    pub fn require(&self, name: &str) -> anyhow::Result<&'a T> {
        self.input(name)
            .ok_or_else(|| anyhow::anyhow!("missing required input '{}'", name))
    }

    /// Iterate over every slot and value
    pub fn iter(&self) -> impl Iterator<Item = (&'a Slot<C>, &'a T)> + '_ {
        self.entries.iter().copied()
    }

    /// Values of the child slots only
    pub fn child_values(&self) -> impl Iterator<Item = &'a T> + '_ {
        self.children().map(|(_, value)| value)
    }

    /// Every value regardless of slot kind
    pub fn values(&self) -> impl Iterator<Item = &'a T> + '_ {
        self.entries.iter().map(|(_, value)| *value)
    }

    /// Number of slots present
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no slot is present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
