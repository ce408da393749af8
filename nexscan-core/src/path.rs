//! Scan paths: the coordinate source consumed by the planner and the scan file.
//!
//! [`CoordinateSource`] is the seam a point generator implements. [`ScanPath`]
//! is the concrete compound generator shipped with the crate: nested step
//! axes, multi-segment axes and 2-D grids (optionally snaked, optionally
//! restricted to a region and folded into a single dimension).

use crate::position::{AxisValue, Position};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Linearly spaced values along one axis, `points` inclusive of both ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub start: f64,
    pub stop: f64,
    pub points: usize,
}

impl AxisRange {
    /// Creates a new range.
    pub fn new(start: f64, stop: f64, points: usize) -> Self {
        Self {
            start,
            stop,
            points,
        }
    }

    /// Value of the `i`-th point.
    #[allow(clippy::cast_precision_loss)]
    pub fn value(&self, i: usize) -> f64 {
        if self.points <= 1 {
            self.start
        } else {
            self.start + (self.stop - self.start) * i as f64 / (self.points - 1) as f64
        }
    }
}

/// Region restricting a grid to a non-rectangular set of points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Region {
    /// Points within `radius` of `centre` (`[fast, slow]`).
    Circle { centre: [f64; 2], radius: f64 },
    /// Points inside the box spanned by `min` and `max` (`[fast, slow]`).
    Rectangle { min: [f64; 2], max: [f64; 2] },
}

impl Region {
    /// Whether the grid point `(fast, slow)` lies inside the region.
    pub fn contains(&self, fast: f64, slow: f64) -> bool {
        match self {
            Region::Circle { centre, radius } => {
                let dx = fast - centre[0];
                let dy = slow - centre[1];
                dx * dx + dy * dy <= radius * radius
            }
            Region::Rectangle { min, max } => {
                fast >= min[0] && fast <= max[0] && slow >= min[1] && slow <= max[1]
            }
        }
    }
}

/// One level of a compound scan path, outermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathDimension {
    /// A single axis stepped over a linear range.
    Step {
        axis: String,
        start: f64,
        stop: f64,
        points: usize,
    },
    /// A single axis visiting several ranges back to back.
    Segmented {
        axis: String,
        segments: Vec<AxisRange>,
    },
    /// A 2-D grid, slow axis outer.
    Grid {
        slow_axis: String,
        fast_axis: String,
        slow: AxisRange,
        fast: AxisRange,
        #[serde(default)]
        snake: bool,
        #[serde(default)]
        region: Option<Region>,
    },
}

/// Per-dimension size information declared by a coordinate source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredDimension {
    /// A single dimension of the given size.
    Axis { size: usize },
    /// A dimension made of consecutive segments.
    Segmented { lengths: Vec<usize> },
    /// A rectangular grid; `folded_points` is set when a region applies.
    Grid {
        rows: usize,
        cols: usize,
        folded_points: Option<usize>,
    },
}

/// Topology flags of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Topology {
    pub snake: bool,
    pub folded: bool,
    pub nested: bool,
    pub segmented: bool,
}

/// An ordered, finite source of scan positions plus its declared metadata.
pub trait CoordinateSource {
    /// Axis names in generator order (slowest first).
    fn axis_names(&self) -> Vec<String>;

    /// Dimension groups, slowest dimension first.
    fn dimension_groups(&self) -> Vec<Vec<String>>;

    /// Declared sizes, outermost first.
    fn declared_dimensions(&self) -> Vec<DeclaredDimension>;

    /// Topology flags.
    fn topology(&self) -> Topology;

    /// Positions in acquisition order.
    fn positions(&self) -> Box<dyn Iterator<Item = Position> + '_>;

    /// Number of positions delivered.
    fn point_count(&self) -> usize {
        self.positions().count()
    }
}

/// Concrete compound scan path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanPath {
    pub dimensions: Vec<PathDimension>,
}

impl ScanPath {
    /// Creates a path from its dimensions, outermost first.
    pub fn new(dimensions: Vec<PathDimension>) -> Self {
        Self { dimensions }
    }

    /// A path with no moving axes: a single static point.
    pub fn static_point() -> Self {
        Self::default()
    }

    /// Checks the path can be iterated.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for empty dimensions, duplicate axis
    /// names or regions containing no grid point.
    pub fn validate(&self) -> Result<()> {
        let names = self.axis_names();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(Error::InvalidConfig(format!(
                    "axis '{name}' is scanned twice"
                )));
            }
        }

        for dimension in &self.dimensions {
            match dimension {
                PathDimension::Step { axis, points, .. } => {
                    if *points == 0 {
                        return Err(Error::InvalidConfig(format!("axis '{axis}' has no points")));
                    }
                }
                PathDimension::Segmented { axis, segments } => {
                    if segments.is_empty() || segments.iter().any(|s| s.points == 0) {
                        return Err(Error::InvalidConfig(format!(
                            "axis '{axis}' has an empty segment"
                        )));
                    }
                }
                PathDimension::Grid {
                    slow_axis,
                    fast_axis,
                    slow,
                    fast,
                    region,
                    ..
                } => {
                    if slow.points == 0 || fast.points == 0 {
                        return Err(Error::InvalidConfig(format!(
                            "grid '{slow_axis}'x'{fast_axis}' has no points"
                        )));
                    }
                    if region.is_some() && folded_order(slow, fast, false, region.as_ref(), 0).is_empty()
                    {
                        return Err(Error::InvalidConfig(format!(
                            "region of grid '{slow_axis}'x'{fast_axis}' contains no points"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn levels(&self) -> Vec<Level<'_>> {
        self.dimensions.iter().map(Level::new).collect()
    }
}

impl CoordinateSource for ScanPath {
    fn axis_names(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .flat_map(|dimension| match dimension {
                PathDimension::Step { axis, .. } | PathDimension::Segmented { axis, .. } => {
                    vec![axis.clone()]
                }
                PathDimension::Grid {
                    slow_axis,
                    fast_axis,
                    ..
                } => vec![slow_axis.clone(), fast_axis.clone()],
            })
            .collect()
    }

    fn dimension_groups(&self) -> Vec<Vec<String>> {
        self.dimensions.iter().flat_map(dimension_groups).collect()
    }

    fn declared_dimensions(&self) -> Vec<DeclaredDimension> {
        self.dimensions
            .iter()
            .map(|dimension| match dimension {
                PathDimension::Step { points, .. } => DeclaredDimension::Axis { size: *points },
                PathDimension::Segmented { segments, .. } => DeclaredDimension::Segmented {
                    lengths: segments.iter().map(|s| s.points).collect(),
                },
                PathDimension::Grid {
                    slow,
                    fast,
                    region,
                    ..
                } => DeclaredDimension::Grid {
                    rows: slow.points,
                    cols: fast.points,
                    folded_points: region
                        .as_ref()
                        .map(|r| folded_order(slow, fast, false, Some(r), 0).len()),
                },
            })
            .collect()
    }

    fn topology(&self) -> Topology {
        let mut topology = Topology {
            nested: self.dimensions.len() > 1,
            ..Topology::default()
        };
        for dimension in &self.dimensions {
            match dimension {
                PathDimension::Grid { snake, region, .. } => {
                    topology.snake |= *snake;
                    topology.folded |= region.is_some();
                }
                PathDimension::Segmented { .. } => topology.segmented = true,
                PathDimension::Step { .. } => {}
            }
        }
        topology
    }

    fn positions(&self) -> Box<dyn Iterator<Item = Position> + '_> {
        Box::new(Positions::new(self))
    }

    fn point_count(&self) -> usize {
        self.levels().iter().map(Level::len).product()
    }
}

fn dimension_groups(dimension: &PathDimension) -> Vec<Vec<String>> {
    match dimension {
        PathDimension::Step { axis, .. } | PathDimension::Segmented { axis, .. } => {
            vec![vec![axis.clone()]]
        }
        PathDimension::Grid {
            slow_axis,
            fast_axis,
            region: None,
            ..
        } => vec![vec![slow_axis.clone()], vec![fast_axis.clone()]],
        PathDimension::Grid {
            slow_axis,
            fast_axis,
            ..
        } => vec![vec![slow_axis.clone(), fast_axis.clone()]],
    }
}

/// Grid points in acquisition order; rows snake when `snake` is set and
/// `(outer * rows + row)` is odd. Out-of-region points are skipped.
fn folded_order(
    slow: &AxisRange,
    fast: &AxisRange,
    snake: bool,
    region: Option<&Region>,
    outer: usize,
) -> Vec<(usize, usize)> {
    let mut points = Vec::new();
    for row in 0..slow.points {
        let reversed = snake && (outer * slow.points + row) % 2 == 1;
        for k in 0..fast.points {
            let col = if reversed { fast.points - 1 - k } else { k };
            let inside = region.map_or(true, |r| r.contains(fast.value(col), slow.value(row)));
            if inside {
                points.push((row, col));
            }
        }
    }
    points
}

/// Iteration state for one path dimension.
struct Level<'a> {
    dimension: &'a PathDimension,
    /// Folded grid order for even and odd outer parity.
    folded: Option<[Vec<(usize, usize)>; 2]>,
}

impl<'a> Level<'a> {
    fn new(dimension: &'a PathDimension) -> Self {
        let folded = match dimension {
            PathDimension::Grid {
                slow,
                fast,
                snake,
                region: Some(region),
                ..
            } => Some([
                folded_order(slow, fast, *snake, Some(region), 0),
                folded_order(slow, fast, *snake, Some(region), 1),
            ]),
            _ => None,
        };
        Self { dimension, folded }
    }

    fn len(&self) -> usize {
        match (self.dimension, &self.folded) {
            (_, Some(orders)) => orders[0].len(),
            (PathDimension::Step { points, .. }, None) => *points,
            (PathDimension::Segmented { segments, .. }, None) => {
                segments.iter().map(|s| s.points).sum()
            }
            (PathDimension::Grid { slow, fast, .. }, None) => slow.points * fast.points,
        }
    }

    /// Axis values of the `k`-th local point, given the flat index of all
    /// enclosing levels.
    fn point(&self, k: usize, outer: usize, out: &mut Vec<AxisValue>) {
        match self.dimension {
            PathDimension::Step {
                axis,
                start,
                stop,
                points,
            } => {
                let range = AxisRange::new(*start, *stop, *points);
                out.push(AxisValue::new(axis.clone(), range.value(k), k));
            }
            PathDimension::Segmented { axis, segments } => {
                let mut offset = 0;
                for segment in segments {
                    if k < offset + segment.points {
                        out.push(AxisValue::new(axis.clone(), segment.value(k - offset), k));
                        return;
                    }
                    offset += segment.points;
                }
            }
            PathDimension::Grid {
                slow_axis,
                fast_axis,
                slow,
                fast,
                snake,
                ..
            } => {
                if let Some(orders) = &self.folded {
                    let (row, col) = orders[outer % 2][k];
                    out.push(AxisValue::new(slow_axis.clone(), slow.value(row), k));
                    out.push(AxisValue::new(fast_axis.clone(), fast.value(col), k));
                } else {
                    let row = k / fast.points;
                    let step = k % fast.points;
                    let reversed = *snake && (outer * slow.points + row) % 2 == 1;
                    let col = if reversed { fast.points - 1 - step } else { step };
                    out.push(AxisValue::new(slow_axis.clone(), slow.value(row), row));
                    out.push(AxisValue::new(fast_axis.clone(), fast.value(col), col));
                }
            }
        }
    }
}

/// Iterator over the positions of a [`ScanPath`].
pub struct Positions<'a> {
    levels: Vec<Level<'a>>,
    groups: Vec<Vec<String>>,
    total: usize,
    step: usize,
}

impl<'a> Positions<'a> {
    fn new(path: &'a ScanPath) -> Self {
        let levels = path.levels();
        let total = levels.iter().map(Level::len).product();
        Self {
            levels,
            groups: path.dimension_groups(),
            total,
            step: 0,
        }
    }
}

impl Iterator for Positions<'_> {
    type Item = Position;

    fn next(&mut self) -> Option<Position> {
        if self.step >= self.total {
            return None;
        }

        // Mixed-radix decomposition, last level fastest.
        let mut counters = vec![0; self.levels.len()];
        let mut rem = self.step;
        for (i, level) in self.levels.iter().enumerate().rev() {
            counters[i] = rem % level.len();
            rem /= level.len();
        }

        let mut axes = Vec::new();
        let mut outer = 0;
        for (level, &k) in self.levels.iter().zip(&counters) {
            level.point(k, outer, &mut axes);
            outer = outer * level.len() + k;
        }

        let position = Position::from_parts(self.step, axes, self.groups.clone());
        self.step += 1;
        Some(position)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.step;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Positions<'_> {}
