//! Scan shape and rank planning.

use crate::path::{CoordinateSource, DeclaredDimension};
use crate::{Error, Result};
use log::info;

/// Shape of a scan, optionally extended by a device's intrinsic dimensions.
///
/// `outer_rank` counts the scan dimensions; any trailing dimensions beyond it
/// belong to the device (e.g. image rows and columns).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanShape {
    sizes: Vec<usize>,
    outer_rank: usize,
}

impl ScanShape {
    /// Creates a scan shape with no device dimensions.
    pub fn new(sizes: Vec<usize>) -> Self {
        let outer_rank = sizes.len();
        Self { sizes, outer_rank }
    }

    /// Shape of a device array: the scan dimensions followed by `intrinsic`.
    #[must_use]
    pub fn with_intrinsic(&self, intrinsic: &[usize]) -> Self {
        let mut sizes = self.scan_sizes().to_vec();
        sizes.extend_from_slice(intrinsic);
        Self {
            sizes,
            outer_rank: self.outer_rank,
        }
    }

    /// Total rank including device dimensions.
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Number of scan dimensions.
    pub fn outer_rank(&self) -> usize {
        self.outer_rank
    }

    /// All dimension sizes.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Sizes of the scan dimensions only.
    pub fn scan_sizes(&self) -> &[usize] {
        &self.sizes[..self.outer_rank]
    }

    /// Sizes of the device dimensions only.
    pub fn intrinsic_sizes(&self) -> &[usize] {
        &self.sizes[self.outer_rank..]
    }

    /// Number of scan points.
    pub fn point_count(&self) -> usize {
        self.scan_sizes().iter().product()
    }

    /// Rank of the arrays actually allocated: a rank 0 scan still gets one
    /// dimension of size 1.
    pub fn allocated_outer_rank(&self) -> usize {
        self.outer_rank.max(1)
    }

    /// Shape of the arrays actually allocated.
    pub fn allocation_shape(&self) -> Vec<usize> {
        if self.outer_rank == 0 {
            let mut shape = vec![1];
            shape.extend_from_slice(self.intrinsic_sizes());
            shape
        } else {
            self.sizes.clone()
        }
    }

    /// Default chunk shape: every scan dimension is 1 except the fastest,
    /// which spans its full size. Device dimensions are chunked whole, in
    /// which case every scan dimension is 1.
    pub fn chunk_shape(&self) -> Vec<usize> {
        let allocated = self.allocation_shape();
        let outer = self.allocated_outer_rank();
        let mut chunk = vec![1; allocated.len()];
        if allocated.len() > outer {
            chunk[outer..].copy_from_slice(&allocated[outer..]);
        } else if let Some(last) = allocated.last() {
            chunk[outer - 1] = *last;
        }
        chunk
    }

    /// Start of the 1-sized slice addressed by `indices` in allocated space.
    ///
    /// # Errors
    /// Returns [`Error::ConfigurationMismatch`] if the number of indices is
    /// not the scan rank, or [`Error::IndexOutOfRange`] if an index exceeds
    /// its dimension.
    pub fn point_start(&self, indices: &[usize]) -> Result<Vec<usize>> {
        if indices.len() != self.outer_rank {
            return Err(Error::ConfigurationMismatch(format!(
                "position addresses {} dimensions but the scan rank is {}",
                indices.len(),
                self.outer_rank
            )));
        }
        for (dimension, (&index, &size)) in indices.iter().zip(self.scan_sizes()).enumerate() {
            if index >= size {
                return Err(Error::IndexOutOfRange {
                    dimension,
                    index,
                    size,
                });
            }
        }
        if self.outer_rank == 0 {
            Ok(vec![0])
        } else {
            Ok(indices.to_vec())
        }
    }
}

/// Derives the scan shape from a coordinate source.
pub struct ShapePlanner;

impl ShapePlanner {
    /// Plans the scan shape.
    ///
    /// Declared dimensions are walked outermost first. A folded grid
    /// contributes a single dimension sized to its in-region point count;
    /// a segmented axis contributes the sum of its segment lengths.
    ///
    /// # Errors
    /// Returns [`Error::ConfigurationMismatch`] if the planned rank disagrees
    /// with the source's dimension groups, a dimension is empty, or the
    /// planned point count disagrees with the number of positions.
    pub fn plan(source: &dyn CoordinateSource) -> Result<ScanShape> {
        let mut sizes = Vec::new();
        for dimension in source.declared_dimensions() {
            match dimension {
                DeclaredDimension::Axis { size } => sizes.push(size),
                DeclaredDimension::Segmented { lengths } => sizes.push(lengths.iter().sum()),
                DeclaredDimension::Grid {
                    folded_points: Some(points),
                    ..
                } => sizes.push(points),
                DeclaredDimension::Grid { rows, cols, .. } => {
                    sizes.push(rows);
                    sizes.push(cols);
                }
            }
        }

        let groups = source.dimension_groups();
        if groups.len() != sizes.len() {
            return Err(Error::ConfigurationMismatch(format!(
                "planned rank {} but the source declares {} dimension groups",
                sizes.len(),
                groups.len()
            )));
        }
        if let Some(dimension) = sizes.iter().position(|&size| size == 0) {
            return Err(Error::ConfigurationMismatch(format!(
                "dimension {dimension} has no points"
            )));
        }

        let shape = ScanShape::new(sizes);
        let delivered = source.point_count();
        if shape.point_count() != delivered {
            return Err(Error::ConfigurationMismatch(format!(
                "shape {:?} holds {} points but the source delivers {delivered}",
                shape.sizes(),
                shape.point_count()
            )));
        }

        info!(
            "Estimated scan shape {:?} (rank {}, {:?})",
            shape.sizes(),
            shape.rank(),
            source.topology()
        );
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{AxisRange, PathDimension, Region, ScanPath};

    fn step(axis: &str, points: usize) -> PathDimension {
        PathDimension::Step {
            axis: axis.to_string(),
            start: 10.0,
            stop: 20.0,
            points,
        }
    }

    fn grid(rows: usize, cols: usize, region: Option<Region>) -> PathDimension {
        PathDimension::Grid {
            slow_axis: "y".to_string(),
            fast_axis: "x".to_string(),
            slow: AxisRange::new(0.0, 2.0, rows),
            fast: AxisRange::new(0.0, 4.0, cols),
            snake: false,
            region,
        }
    }

    #[test]
    fn test_chunk_shape_fastest_dimension_full() {
        let shape = ScanShape::new(vec![8, 5]);
        assert_eq!(shape.chunk_shape(), vec![1, 5]);
        let shape = ScanShape::new(vec![2, 3, 4, 7]);
        assert_eq!(shape.chunk_shape(), vec![1, 1, 1, 7]);
    }

    #[test]
    fn test_detector_shape_and_chunk() {
        let detector = ScanShape::new(vec![8, 5]).with_intrinsic(&[64, 64]);
        assert_eq!(detector.sizes(), &[8, 5, 64, 64]);
        assert_eq!(detector.outer_rank(), 2);
        assert_eq!(detector.intrinsic_sizes(), &[64, 64]);
        assert_eq!(detector.chunk_shape(), vec![1, 1, 64, 64]);
    }

    #[test]
    fn test_rank_zero_allocates_one_point() {
        let shape = ScanShape::new(Vec::new());
        assert_eq!(shape.point_count(), 1);
        assert_eq!(shape.allocation_shape(), vec![1]);
        assert_eq!(shape.chunk_shape(), vec![1]);
        assert_eq!(shape.point_start(&[]).unwrap(), vec![0]);

        let detector = shape.with_intrinsic(&[16]);
        assert_eq!(detector.allocation_shape(), vec![1, 16]);
        assert_eq!(detector.chunk_shape(), vec![1, 16]);
    }

    #[test]
    fn test_point_start_checks_range() {
        let shape = ScanShape::new(vec![8, 5]);
        assert_eq!(shape.point_start(&[7, 4]).unwrap(), vec![7, 4]);
        assert!(matches!(
            shape.point_start(&[2, 5]),
            Err(Error::IndexOutOfRange {
                dimension: 1,
                index: 5,
                size: 5
            })
        ));
        assert!(matches!(
            shape.point_start(&[2]),
            Err(Error::ConfigurationMismatch(_))
        ));
    }

    #[test]
    fn test_plan_grid() {
        let path = ScanPath::new(vec![grid(8, 5, None)]);
        let shape = ShapePlanner::plan(&path).unwrap();
        assert_eq!(shape.sizes(), &[8, 5]);
        assert_eq!(shape.chunk_shape(), vec![1, 5]);
    }

    #[test]
    fn test_plan_folded_grid_drops_rank() {
        // 3x5 grid restricted to 7 points, nested in a 3-point step
        let region = Region::Rectangle {
            min: [0.0, 0.0],
            max: [2.0, 1.0],
        };
        let path = ScanPath::new(vec![step("z", 3), grid(3, 5, Some(region))]);
        let shape = ShapePlanner::plan(&path).unwrap();
        assert_eq!(shape.rank(), 2);
        assert_eq!(shape.sizes()[0], 3);
        assert_eq!(shape.sizes()[1], path.point_count() / 3);
    }

    #[test]
    fn test_plan_segmented_sums_segments() {
        let path = ScanPath::new(vec![PathDimension::Segmented {
            axis: "theta".to_string(),
            segments: vec![
                AxisRange::new(0.0, 0.0, 4),
                AxisRange::new(0.0, 180.0, 10),
                AxisRange::new(0.0, 0.0, 2),
            ],
        }]);
        let shape = ShapePlanner::plan(&path).unwrap();
        assert_eq!(shape.sizes(), &[16]);
    }

    #[test]
    fn test_plan_nested_steps() {
        let path = ScanPath::new(vec![step("a", 2), step("b", 3), grid(4, 6, None)]);
        let shape = ShapePlanner::plan(&path).unwrap();
        assert_eq!(shape.sizes(), &[2, 3, 4, 6]);
        assert_eq!(shape.point_count(), path.point_count());
    }

    #[test]
    fn test_plan_static_scan() {
        let shape = ShapePlanner::plan(&ScanPath::static_point()).unwrap();
        assert_eq!(shape.rank(), 0);
        assert_eq!(shape.allocation_shape(), vec![1]);
    }

    #[test]
    fn test_plan_rejects_empty_dimension() {
        let path = ScanPath::new(vec![step("a", 0)]);
        assert!(matches!(
            ShapePlanner::plan(&path),
            Err(Error::ConfigurationMismatch(_))
        ));
    }
}
