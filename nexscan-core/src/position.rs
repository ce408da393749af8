//! Scan position model.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value and dataset index of a single axis at one scan point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisValue {
    /// Axis (positioner) name.
    pub name: String,
    /// Demand value of the axis at this point.
    pub value: f64,
    /// Index of this point along the axis' scan dimension.
    pub index: usize,
}

impl AxisValue {
    /// Creates a new axis value.
    pub fn new(name: impl Into<String>, value: f64, index: usize) -> Self {
        Self {
            name: name.into(),
            value,
            index,
        }
    }
}

/// Immutable description of one scan point.
///
/// Axes are kept in generator order (slowest first). Every axis belongs to
/// exactly one dimension group; axes sharing a group vary together and
/// therefore share an index (e.g. both axes of a folded grid).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PositionRecord")]
pub struct Position {
    axes: Vec<AxisValue>,
    step_index: usize,
    dimension_groups: Vec<Vec<String>>,
}

/// Serialized form of a [`Position`], checked on the way in.
#[derive(Deserialize)]
struct PositionRecord {
    axes: Vec<AxisValue>,
    step_index: usize,
    dimension_groups: Vec<Vec<String>>,
}

impl TryFrom<PositionRecord> for Position {
    type Error = Error;

    fn try_from(record: PositionRecord) -> Result<Self> {
        Position::new(record.step_index, record.axes, record.dimension_groups)
    }
}

impl Position {
    /// Creates a position, checking the dimension-group invariants.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPosition`] if an axis is missing from the
    /// groups, appears in more than one group, a group names an unknown axis,
    /// or axes of one group disagree on their index.
    pub fn new(
        step_index: usize,
        axes: Vec<AxisValue>,
        dimension_groups: Vec<Vec<String>>,
    ) -> Result<Self> {
        for (i, axis) in axes.iter().enumerate() {
            if axes[..i].iter().any(|other| other.name == axis.name) {
                return Err(Error::InvalidPosition(format!(
                    "axis '{}' appears twice",
                    axis.name
                )));
            }
            let owners = dimension_groups
                .iter()
                .filter(|group| group.iter().any(|name| name == &axis.name))
                .count();
            if owners != 1 {
                return Err(Error::InvalidPosition(format!(
                    "axis '{}' belongs to {owners} dimension groups, expected exactly one",
                    axis.name
                )));
            }
        }

        for group in &dimension_groups {
            if group.is_empty() {
                return Err(Error::InvalidPosition(
                    "empty dimension group".to_string(),
                ));
            }
            let mut group_index = None;
            for name in group {
                let axis = axes.iter().find(|a| &a.name == name).ok_or_else(|| {
                    Error::InvalidPosition(format!("dimension group names unknown axis '{name}'"))
                })?;
                match group_index {
                    None => group_index = Some(axis.index),
                    Some(index) if index != axis.index => {
                        return Err(Error::InvalidPosition(format!(
                            "axes of group {group:?} disagree on their index"
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self {
            axes,
            step_index,
            dimension_groups,
        })
    }

    /// Assembles a position the generator already knows to be consistent.
    pub(crate) fn from_parts(
        step_index: usize,
        axes: Vec<AxisValue>,
        dimension_groups: Vec<Vec<String>>,
    ) -> Self {
        Self {
            axes,
            step_index,
            dimension_groups,
        }
    }

    /// A point with no moving axes (rank 0 scan).
    pub fn static_point(step_index: usize) -> Self {
        Self {
            axes: Vec::new(),
            step_index,
            dimension_groups: Vec::new(),
        }
    }

    /// Dense 0-based counter over delivered positions.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// Unique key recorded for this point; 0 is reserved for "not written".
    pub fn unique_key(&self) -> usize {
        self.step_index + 1
    }

    /// Number of scan dimensions this position addresses.
    pub fn rank(&self) -> usize {
        self.dimension_groups.len()
    }

    /// Axes in generator order.
    pub fn axes(&self) -> &[AxisValue] {
        &self.axes
    }

    /// Axis names in generator order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|a| a.name.as_str())
    }

    /// Dimension groups, slowest dimension first.
    pub fn dimension_groups(&self) -> &[Vec<String>] {
        &self.dimension_groups
    }

    /// Demand value of the named axis.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.axis(name).map(|a| a.value)
    }

    /// Index of the named axis.
    pub fn index(&self, name: &str) -> Option<usize> {
        self.axis(name).map(|a| a.index)
    }

    /// Per-dimension index of this point, one entry per dimension group.
    pub fn scan_indices(&self) -> Vec<usize> {
        self.dimension_groups
            .iter()
            .map(|group| {
                group
                    .first()
                    .and_then(|name| self.index(name))
                    .unwrap_or_default()
            })
            .collect()
    }

    fn axis(&self, name: &str) -> Option<&AxisValue> {
        self.axes.iter().find(|a| a.name == name)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Position(step={}", self.step_index)?;
        for axis in &self.axes {
            write!(f, ", {}={} [{}]", axis.name, axis.value, axis.index)?;
        }
        write!(f, ")")
    }
}
