//! Per-point writes into the metadata collection.

use crate::clock::{timestamp, Clock};
use crate::instrument::unique_key;
use crate::metadata::ScanMetadata;
use crate::tree::{NexusTree, Slice, Values};
use crate::Result;
use log::debug;
use nexscan_core::{Error as CoreError, Position, ScanShape};
use std::collections::HashMap;
use std::sync::Arc;

/// When the unique key of a point is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTiming {
    /// After the point's end timestamp, once every device has written.
    OnCompletion,
    /// As soon as the point is delivered, and again after its end
    /// timestamp. Only safe when every detector records its own keys.
    OnDelivery,
}

/// Writes point timestamps and unique keys.
///
/// Each point addresses its own 1-sized slice, so points never touch each
/// other's data. For a given point the writes land start, end, then key;
/// an early key written on delivery is reissued after the end timestamp.
pub struct PointUpdater {
    shape: ScanShape,
    unique_keys: Option<String>,
    point_start_times: String,
    point_end_times: String,
    timing: KeyTiming,
    clock: Arc<dyn Clock>,
    keyed: HashMap<Vec<usize>, usize>,
}

impl PointUpdater {
    /// Updater for the collection behind `metadata`.
    pub fn new(metadata: &ScanMetadata, timing: KeyTiming, clock: Arc<dyn Clock>) -> Self {
        Self {
            shape: metadata.shape().clone(),
            unique_keys: metadata.unique_keys(),
            point_start_times: metadata.point_start_times(),
            point_end_times: metadata.point_end_times(),
            timing,
            clock,
            keyed: HashMap::new(),
        }
    }

    /// Number of points whose key has been written.
    pub fn keyed_points(&self) -> usize {
        self.keyed.len()
    }

    /// Called once per delivered position, before its devices write.
    ///
    /// # Errors
    /// Returns `ConfigurationMismatch` if the position's rank disagrees with
    /// the scan, `IndexOutOfRange` if it lies outside the planned shape, or
    /// any tree error.
    pub fn on_point_delivered(&mut self, tree: &mut dyn NexusTree, position: &Position) -> Result<()> {
        let slice = self.slice(position)?;
        let now = timestamp(self.clock.now());
        debug!("Point {} started at {now}", position.step_index());
        tree.write_slice(&self.point_start_times, &slice, &Values::Text(vec![now]))?;
        if self.timing == KeyTiming::OnDelivery {
            self.write_key(tree, position, &slice)?;
        }
        Ok(())
    }

    /// Called once per position after every device has written it.
    ///
    /// # Errors
    /// Same as [`PointUpdater::on_point_delivered`].
    pub fn on_point_completed(&mut self, tree: &mut dyn NexusTree, position: &Position) -> Result<()> {
        let slice = self.slice(position)?;
        let now = timestamp(self.clock.now());
        debug!("Point {} completed at {now}", position.step_index());
        tree.write_slice(&self.point_end_times, &slice, &Values::Text(vec![now]))?;
        self.write_key(tree, position, &slice)
    }

    fn slice(&self, position: &Position) -> Result<Slice> {
        let start = self.shape.point_start(&position.scan_indices())?;
        Ok(Slice::point(start))
    }

    fn write_key(&mut self, tree: &mut dyn NexusTree, position: &Position, slice: &Slice) -> Result<()> {
        if let Some(&previous) = self.keyed.get(&slice.start) {
            if previous != position.step_index() {
                return Err(CoreError::ConfigurationMismatch(format!(
                    "steps {previous} and {} both address slice {:?}",
                    position.step_index(),
                    slice.start
                ))
                .into());
            }
        }
        if let Some(path) = &self.unique_keys {
            let key = unique_key(position)?;
            tree.write_slice(path, slice, &Values::Int(vec![key]))?;
            debug!("Wrote unique key {key} at {:?}", slice.start);
        }
        self.keyed.insert(slice.start.clone(), position.step_index());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::layout::EntryLayout;
    use crate::memory::MemoryTree;
    use crate::metadata::MetadataBuilder;
    use crate::tree::{AttrValue, DatasetLayout, NodeKind};
    use crate::Error;
    use chrono::{DateTime, Utc};
    use nexscan_core::{AxisValue, CoordinateSource, PathDimension, ScanPath, ShapePlanner, WriterRegistry};

    fn setup(path: &ScanPath, timing: KeyTiming) -> (PointUpdater, MemoryTree, ScanMetadata) {
        let start = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let layout = EntryLayout::default();
        let shape = ShapePlanner::plan(path).unwrap();
        let registry = WriterRegistry::build(Vec::new()).unwrap();
        let mut tree = MemoryTree::new();
        tree.create_group("/entry", "NXentry").unwrap();
        let metadata = MetadataBuilder::new(&layout, &shape, &registry)
            .build(&mut tree, start)
            .unwrap();
        let clock = Arc::new(ManualClock::new(start));
        (PointUpdater::new(&metadata, timing, clock), tree, metadata)
    }

    fn step(axis: &str, points: usize) -> PathDimension {
        PathDimension::Step {
            axis: axis.to_string(),
            start: 0.0,
            stop: 1.0,
            points,
        }
    }

    #[test]
    fn test_key_written_on_completion() {
        let path = ScanPath::new(vec![step("a", 2), step("b", 3)]);
        let (mut updater, mut tree, metadata) = setup(&path, KeyTiming::OnCompletion);
        let keys = metadata.unique_keys().unwrap();

        let first = path.positions().next().unwrap();
        updater.on_point_delivered(&mut tree, &first).unwrap();
        assert_eq!(tree.read(&keys).unwrap().as_int().unwrap()[0], 0);
        updater.on_point_completed(&mut tree, &first).unwrap();
        assert_eq!(tree.read(&keys).unwrap().as_int().unwrap()[0], 1);

        let start = tree.read(&metadata.point_start_times()).unwrap();
        assert_eq!(start.as_text().unwrap()[0], "2024-03-01T10:00:00+00:00");
        assert_eq!(start.as_text().unwrap()[1], "");
    }

    #[test]
    fn test_key_written_on_delivery() {
        let path = ScanPath::new(vec![step("a", 4)]);
        let (mut updater, mut tree, metadata) = setup(&path, KeyTiming::OnDelivery);
        let third = path.positions().nth(2).unwrap();
        updater.on_point_delivered(&mut tree, &third).unwrap();
        assert_eq!(
            tree.read(&metadata.unique_keys().unwrap()).unwrap(),
            Values::Int(vec![0, 0, 3, 0])
        );
        assert_eq!(updater.keyed_points(), 1);
    }

    /// Records every slice write, in order, on top of a memory tree.
    struct RecordingTree {
        inner: MemoryTree,
        writes: Vec<(String, Vec<usize>)>,
    }

    impl NexusTree for RecordingTree {
        fn create_group(&mut self, path: &str, nx_class: &str) -> Result<()> {
            self.inner.create_group(path, nx_class)
        }
        fn create_dataset(&mut self, path: &str, layout: &DatasetLayout) -> Result<()> {
            self.inner.create_dataset(path, layout)
        }
        fn write_slice(&mut self, path: &str, slice: &Slice, values: &Values) -> Result<()> {
            self.writes.push((path.to_string(), slice.start.clone()));
            self.inner.write_slice(path, slice, values)
        }
        fn create_link(&mut self, target: &str, link: &str) -> Result<()> {
            self.inner.create_link(target, link)
        }
        fn create_external_link(&mut self, link: &str, file: &str, target: &str) -> Result<()> {
            self.inner.create_external_link(link, file, target)
        }
        fn set_attr(&mut self, path: &str, name: &str, value: &AttrValue) -> Result<()> {
            self.inner.set_attr(path, name, value)
        }
        fn attr(&self, path: &str, name: &str) -> Result<Option<AttrValue>> {
            self.inner.attr(path, name)
        }
        fn exists(&self, path: &str) -> bool {
            self.inner.exists(path)
        }
        fn kind(&self, path: &str) -> Result<NodeKind> {
            self.inner.kind(path)
        }
        fn children(&self, path: &str) -> Result<Vec<String>> {
            self.inner.children(path)
        }
        fn shape(&self, path: &str) -> Result<Vec<usize>> {
            self.inner.shape(path)
        }
        fn read(&self, path: &str) -> Result<Values> {
            self.inner.read(path)
        }
        fn flush(&mut self) -> Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn test_key_follows_end_time_for_both_timings() {
        let path = ScanPath::new(vec![step("a", 3)]);
        for timing in [KeyTiming::OnCompletion, KeyTiming::OnDelivery] {
            let (mut updater, inner, metadata) = setup(&path, timing);
            let mut tree = RecordingTree {
                inner,
                writes: Vec::new(),
            };
            let second = path.positions().nth(1).unwrap();
            updater.on_point_delivered(&mut tree, &second).unwrap();
            updater.on_point_completed(&mut tree, &second).unwrap();

            let order: Vec<&str> = tree
                .writes
                .iter()
                .filter(|(_, start)| start == &vec![1])
                .map(|(p, _)| p.as_str())
                .collect();
            let start = metadata.point_start_times();
            let end = metadata.point_end_times();
            let keys = metadata.unique_keys().unwrap();
            let end_at = order.iter().position(|p| *p == end).unwrap();
            assert_eq!(order[0], start);
            assert_eq!(order.last().copied(), Some(keys.as_str()));
            assert!(order[end_at + 1..].contains(&keys.as_str()));
            assert_eq!(updater.keyed_points(), 1);
            assert_eq!(tree.read(&keys).unwrap(), Values::Int(vec![0, 2, 0]));
        }
    }

    #[test]
    fn test_out_of_range_position() {
        let path = ScanPath::new(vec![step("a", 4)]);
        let (mut updater, mut tree, _) = setup(&path, KeyTiming::OnCompletion);
        let stray = Position::new(
            9,
            vec![AxisValue::new("a", 0.0, 4)],
            vec![vec!["a".to_string()]],
        )
        .unwrap();
        assert!(matches!(
            updater.on_point_delivered(&mut tree, &stray),
            Err(Error::Core(CoreError::IndexOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_rank_mismatch() {
        let path = ScanPath::new(vec![step("a", 2), step("b", 2)]);
        let (mut updater, mut tree, _) = setup(&path, KeyTiming::OnCompletion);
        let flat = Position::new(0, vec![AxisValue::new("a", 0.0, 0)], vec![vec!["a".to_string()]])
            .unwrap();
        assert!(matches!(
            updater.on_point_completed(&mut tree, &flat),
            Err(Error::Core(CoreError::ConfigurationMismatch(_)))
        ));
    }

    #[test]
    fn test_two_steps_on_one_slice_rejected() {
        let path = ScanPath::new(vec![step("a", 2)]);
        let (mut updater, mut tree, _) = setup(&path, KeyTiming::OnCompletion);
        let groups = vec![vec!["a".to_string()]];
        let first = Position::new(0, vec![AxisValue::new("a", 0.0, 1)], groups.clone()).unwrap();
        let second = Position::new(1, vec![AxisValue::new("a", 0.0, 1)], groups).unwrap();
        updater.on_point_completed(&mut tree, &first).unwrap();
        assert!(updater.on_point_completed(&mut tree, &second).is_err());
    }
}
