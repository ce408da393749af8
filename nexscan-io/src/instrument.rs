//! Device side of the scan file: `/<entry>/instrument/<device>`.
//!
//! Every in-process device gets one dataset per data field, shaped as the
//! scan followed by the field's own dimensions. Positioners also get a
//! one-dimensional `value_set` holding the demand value along their scan
//! dimension. A device owning an in-process unique-key dataset gets it at
//! its key path. Devices writing their own files get external links in
//! place of datasets.

use crate::layout::EntryLayout;
use crate::tree::{join, DataType, DatasetLayout, NexusTree, Slice, Values};
use crate::{Error, Result};
use log::debug;
use nexscan_core::device::{FIELD_VALUE, FIELD_VALUE_SET};
use nexscan_core::{DeviceDeclaration, DeviceRole, Position, ScanShape};

/// Writes the instrument tree and per-point device data.
#[derive(Debug, Clone)]
pub struct InstrumentWriter {
    layout: EntryLayout,
    shape: ScanShape,
    devices: Vec<DeviceDeclaration>,
    /// Scan dimension of each scanned axis, by axis name.
    axis_dimensions: Vec<(String, usize)>,
}

impl InstrumentWriter {
    /// Creates a writer for `devices` over a scan of `shape` whose axes are
    /// grouped into `dimension_groups`.
    pub fn new(
        layout: EntryLayout,
        shape: ScanShape,
        devices: Vec<DeviceDeclaration>,
        dimension_groups: &[Vec<String>],
    ) -> Self {
        let axis_dimensions = dimension_groups
            .iter()
            .enumerate()
            .flat_map(|(d, group)| group.iter().map(move |axis| (axis.clone(), d)))
            .collect();
        Self {
            layout,
            shape,
            devices,
            axis_dimensions,
        }
    }

    /// Declared devices.
    pub fn devices(&self) -> &[DeviceDeclaration] {
        &self.devices
    }

    /// Looks a device up by name.
    pub fn device(&self, name: &str) -> Option<&DeviceDeclaration> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Scan dimension an axis varies along, if it is scanned.
    pub fn axis_dimension(&self, axis: &str) -> Option<usize> {
        self.axis_dimensions
            .iter()
            .find(|(name, _)| name == axis)
            .map(|&(_, d)| d)
    }

    /// Creates `/<entry>/instrument` and every device group.
    ///
    /// # Errors
    /// Returns an error if a node already exists or the tree fails.
    pub fn build(&self, tree: &mut dyn NexusTree) -> Result<()> {
        tree.create_group(&self.layout.instrument(), "NXinstrument")?;
        for device in &self.devices {
            self.build_device(tree, device)?;
        }
        Ok(())
    }

    fn build_device(&self, tree: &mut dyn NexusTree, device: &DeviceDeclaration) -> Result<()> {
        let group = self.layout.device(&device.name);
        tree.create_group(&group, device.role.nx_class())?;

        if let Some(file) = device.external_files.iter().next() {
            for field in device.data_fields() {
                let path = join(&group, &field.name);
                tree.create_external_link(&path, file, &path)?;
            }
            return Ok(());
        }

        for field in device.data_fields() {
            let shape = self.shape.with_intrinsic(&field.shape);
            let layout = DatasetLayout::new(DataType::Float64, shape.allocation_shape())
                .chunked(shape.chunk_shape());
            tree.create_dataset(&join(&group, &field.name), &layout)?;
        }

        if device.writes_set_value() {
            if let Some(d) = self.axis_dimension(&device.name) {
                let size = self.shape.scan_sizes()[d];
                tree.create_dataset(
                    &join(&group, FIELD_VALUE_SET),
                    &DatasetLayout::new(DataType::Float64, vec![size]),
                )?;
            }
        }

        if let Some(key_path) = &device.unique_keys_path {
            let path = join(&group, key_path);
            ensure_parent_groups(tree, &group, &path)?;
            let layout = DatasetLayout::new(DataType::Int32, self.shape.allocation_shape())
                .chunked(self.shape.chunk_shape());
            tree.create_dataset(&path, &layout)?;
        }
        Ok(())
    }

    /// Writes one point's slice of a device field. `values` holds the
    /// field's own dimensions, row-major.
    ///
    /// # Errors
    /// Returns [`Error::NodeNotFound`] for unknown devices or fields and
    /// propagates slice errors.
    pub fn write_point(
        &self,
        tree: &mut dyn NexusTree,
        device: &str,
        field: &str,
        position: &Position,
        values: Values,
    ) -> Result<()> {
        let declaration = self
            .device(device)
            .ok_or_else(|| Error::NodeNotFound(self.layout.device(device)))?;
        let declared = declaration
            .data_fields()
            .into_iter()
            .find(|f| f.name == field)
            .ok_or_else(|| Error::NodeNotFound(self.layout.device_field(device, field)))?;

        let mut start = self.shape.point_start(&position.scan_indices())?;
        let mut count = vec![1; start.len()];
        start.extend(std::iter::repeat_n(0, declared.shape.len()));
        count.extend_from_slice(&declared.shape);
        let slice = Slice {
            start,
            shape: count,
        };
        let path = self.layout.device_field(device, field);
        debug!("Writing {path} at {:?} for {position}", slice.start);
        tree.write_slice(&path, &slice, &values)
    }

    /// Writes the actual and demand values of every in-process positioner
    /// scanned at `position`, and every in-process device key.
    ///
    /// # Errors
    /// Propagates slice errors.
    pub fn write_positions(&self, tree: &mut dyn NexusTree, position: &Position) -> Result<()> {
        for device in &self.devices {
            if device.is_external() {
                continue;
            }
            if device.role == DeviceRole::Positioner {
                if let Some(value) = position.value(&device.name) {
                    self.write_point(tree, &device.name, FIELD_VALUE, position, Values::Float(vec![value]))?;
                    if device.writes_set_value() {
                        if let Some(index) = position.index(&device.name) {
                            tree.write_slice(
                                &self.layout.device_field(&device.name, FIELD_VALUE_SET),
                                &Slice::point(vec![index]),
                                &Values::Float(vec![value]),
                            )?;
                        }
                    }
                }
            }
            if let Some(key_path) = &device.unique_keys_path {
                let start = self.shape.point_start(&position.scan_indices())?;
                tree.write_slice(
                    &join(&self.layout.device(&device.name), key_path),
                    &Slice::point(start),
                    &Values::Int(vec![unique_key(position)?]),
                )?;
            }
        }
        Ok(())
    }
}

/// Unique key of a position as stored on disk.
pub(crate) fn unique_key(position: &Position) -> Result<i32> {
    i32::try_from(position.unique_key()).map_err(|_| {
        Error::InvalidFormat(format!(
            "unique key {} does not fit a 32-bit dataset",
            position.unique_key()
        ))
    })
}

/// Creates the `NXcollection` groups between `root` and the parent of `path`.
fn ensure_parent_groups(tree: &mut dyn NexusTree, root: &str, path: &str) -> Result<()> {
    let Some(relative) = path.strip_prefix(root) else {
        return Ok(());
    };
    let parts: Vec<&str> = relative.split('/').filter(|p| !p.is_empty()).collect();
    let mut current = root.to_string();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        current = join(&current, part);
        if !tree.exists(&current) {
            tree.create_group(&current, "NXcollection")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTree;
    use nexscan_core::{AxisValue, DataField};

    fn writer(devices: Vec<DeviceDeclaration>) -> (InstrumentWriter, MemoryTree) {
        let mut tree = MemoryTree::new();
        tree.create_group("/entry", "NXentry").unwrap();
        let writer = InstrumentWriter::new(
            EntryLayout::default(),
            ScanShape::new(vec![3, 4]),
            devices,
            &[vec!["y".to_string()], vec!["x".to_string()]],
        );
        writer.build(&mut tree).unwrap();
        (writer, tree)
    }

    fn position(step: usize, y: usize, x: usize) -> Position {
        Position::new(
            step,
            vec![
                AxisValue::new("y", y as f64, y),
                AxisValue::new("x", x as f64 * 0.5, x),
            ],
            vec![vec!["y".to_string()], vec!["x".to_string()]],
        )
        .unwrap()
    }

    #[test]
    fn test_device_datasets() {
        let (_, tree) = writer(vec![
            DeviceDeclaration::positioner("y"),
            DeviceDeclaration::positioner("x").without_set_value(),
            DeviceDeclaration::detector("det", vec![DataField::new("data", vec![8, 8])])
                .with_unique_keys_path("keys/uniqueKeys"),
        ]);
        assert_eq!(tree.shape("/entry/instrument/y/value").unwrap(), vec![3, 4]);
        assert_eq!(tree.shape("/entry/instrument/y/value_set").unwrap(), vec![3]);
        assert!(!tree.exists("/entry/instrument/x/value_set"));
        assert_eq!(
            tree.shape("/entry/instrument/det/data").unwrap(),
            vec![3, 4, 8, 8]
        );
        assert_eq!(
            tree.shape("/entry/instrument/det/keys/uniqueKeys").unwrap(),
            vec![3, 4]
        );
        assert_eq!(
            tree.attr("/entry/instrument/det", "NX_class").unwrap(),
            Some("NXdetector".into())
        );
    }

    #[test]
    fn test_external_device_gets_links_only() {
        let (_, tree) = writer(vec![DeviceDeclaration::detector(
            "det2",
            vec![DataField::scalar("data")],
        )
        .with_external_file("detector2.h5")
        .with_unique_keys_path("/entry/NDAttributes/NDArrayUniqueId")]);
        assert!(tree.exists("/entry/instrument/det2/data"));
        assert!(tree
            .shape("/entry/instrument/det2/data")
            .unwrap_err()
            .is_unresolved_link());
        assert!(!tree.exists("/entry/instrument/det2/entry"));
    }

    #[test]
    fn test_write_positions_and_detector_frame() {
        let (writer, mut tree) = writer(vec![
            DeviceDeclaration::positioner("y"),
            DeviceDeclaration::positioner("x"),
            DeviceDeclaration::detector("det", vec![DataField::new("data", vec![2])])
                .with_unique_keys_path("uniqueKeys"),
        ]);
        let pos = position(6, 1, 2);
        writer.write_positions(&mut tree, &pos).unwrap();
        writer
            .write_point(&mut tree, "det", "data", &pos, Values::Float(vec![5.0, 6.0]))
            .unwrap();

        let x = tree.read("/entry/instrument/x/value").unwrap();
        assert!((x.as_float().unwrap()[4 + 2] - 1.0).abs() < f64::EPSILON);
        let x_set = tree.read("/entry/instrument/x/value_set").unwrap();
        assert!((x_set.as_float().unwrap()[2] - 1.0).abs() < f64::EPSILON);
        let keys = tree.read("/entry/instrument/det/uniqueKeys").unwrap();
        assert_eq!(keys.as_int().unwrap()[6], 7);
        let data = tree.read("/entry/instrument/det/data").unwrap();
        assert_eq!(&data.as_float().unwrap()[12..14], &[5.0, 6.0]);
    }

    #[test]
    fn test_write_point_unknown_field() {
        let (writer, mut tree) = writer(vec![DeviceDeclaration::detector("det", Vec::new())]);
        let err = writer
            .write_point(&mut tree, "det", "spectrum", &position(0, 0, 0), Values::Float(vec![0.0]))
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }
}
