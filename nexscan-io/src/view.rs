//! Data views: one `NXdata` group per detector field.
//!
//! Each view links (never copies) the detector field as its signal and the
//! scanned positioners' arrays as axes. `@axes` has one entry per dimension
//! of the signal: the demand-value field of the axis representing each scan
//! dimension, then a placeholder for every dimension intrinsic to the
//! detector. When several axes share a dimension (a folded grid), the last
//! one in generator order represents it and the others are elided from
//! `@axes` and carry no indices; their actual-value fields are still linked.

use crate::layout::{EntryLayout, PLACEHOLDER_AXIS};
use crate::tree::{join, link_state, AttrValue, LinkState, NexusTree};
use crate::updater::KeyTiming;
use crate::{Error, Result};
use log::{debug, warn};
use nexscan_core::device::{FIELD_VALUE, FIELD_VALUE_SET};
use nexscan_core::{DeviceDeclaration, DeviceRole, KeyTarget, ScanShape, WriterRegistry};
use std::collections::{BTreeMap, BTreeSet};

/// Axis indices of one linked field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisIndices {
    /// A demand-value field spanning one scan dimension.
    Single(usize),
    /// An actual-value field spanning every scan dimension.
    Full(Vec<usize>),
}

impl AxisIndices {
    fn attr(&self) -> Result<AttrValue> {
        let to_i32 = |d: usize| {
            i32::try_from(d).map_err(|_| Error::InvalidFormat(format!("dimension {d} too large")))
        };
        Ok(match self {
            AxisIndices::Single(d) => AttrValue::Int(to_i32(*d)?),
            AxisIndices::Full(dims) => {
                AttrValue::IntList(dims.iter().map(|&d| to_i32(d)).collect::<Result<_>>()?)
            }
        })
    }
}

/// A built data view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataViewGroup {
    pub name: String,
    pub path: String,
    pub signal: String,
    pub axes: Vec<String>,
    pub indices: BTreeMap<String, AxisIndices>,
    pub linked_fields: BTreeSet<String>,
}

/// Builds the data views once every device has declared its arrays.
pub struct DataViewAssembler<'a> {
    layout: &'a EntryLayout,
    shape: &'a ScanShape,
    devices: &'a [DeviceDeclaration],
    dimension_groups: &'a [Vec<String>],
}

impl<'a> DataViewAssembler<'a> {
    /// Assembler for `devices` over a scan of `shape`.
    pub fn new(
        layout: &'a EntryLayout,
        shape: &'a ScanShape,
        devices: &'a [DeviceDeclaration],
        dimension_groups: &'a [Vec<String>],
    ) -> Self {
        Self {
            layout,
            shape,
            devices,
            dimension_groups,
        }
    }

    /// Creates one view per detector field, primary field first.
    ///
    /// # Errors
    /// Returns [`Error::NodeExists`] if a view name is taken, or any tree
    /// error.
    pub fn assemble(&self, tree: &mut dyn NexusTree) -> Result<Vec<DataViewGroup>> {
        let mut views = Vec::new();
        for detector in self.devices.iter().filter(|d| d.role == DeviceRole::Detector) {
            for (field, name) in detector.data_fields().iter().zip(detector.view_names()) {
                let view = self.plan_view(detector, &field.name, field.shape.len(), name);
                self.write_view(tree, &view)?;
                views.push(view);
            }
        }
        Ok(views)
    }

    /// Works out the attributes and links of one view without touching the
    /// tree.
    pub fn plan_view(
        &self,
        detector: &DeviceDeclaration,
        field: &str,
        intrinsic_rank: usize,
        name: String,
    ) -> DataViewGroup {
        let path = self.layout.view(&name);
        let mut axes = Vec::new();
        let mut indices = BTreeMap::new();
        let mut linked_fields = BTreeSet::new();
        linked_fields.insert(self.layout.device_field(&detector.name, field));

        let rank = self.shape.outer_rank();
        if rank == 0 {
            axes.push(PLACEHOLDER_AXIS.to_string());
        }
        let full: Vec<usize> = (0..rank).collect();

        for (d, group) in self.dimension_groups.iter().enumerate() {
            let representative = group.last();
            let mut entry = PLACEHOLDER_AXIS.to_string();
            for axis in group {
                let Some(positioner) = self.positioner(axis) else {
                    continue;
                };
                linked_fields.insert(self.layout.device_field(axis, FIELD_VALUE));
                if Some(axis) != representative {
                    // Elided: linked for reference but left out of the axes.
                    continue;
                }
                let value = format!("{axis}_{FIELD_VALUE}");
                indices.insert(value, AxisIndices::Full(full.clone()));

                if positioner.writes_set_value() {
                    let value_set = format!("{axis}_{FIELD_VALUE_SET}");
                    linked_fields.insert(self.layout.device_field(axis, FIELD_VALUE_SET));
                    indices.insert(value_set.clone(), AxisIndices::Single(d));
                    entry = value_set;
                }
            }
            axes.push(entry);
        }
        axes.extend(std::iter::repeat_n(PLACEHOLDER_AXIS.to_string(), intrinsic_rank));

        DataViewGroup {
            name,
            path,
            signal: field.to_string(),
            axes,
            indices,
            linked_fields,
        }
    }

    fn positioner(&self, axis: &str) -> Option<&DeviceDeclaration> {
        self.devices
            .iter()
            .find(|d| d.name == axis && d.role == DeviceRole::Positioner)
    }

    fn write_view(&self, tree: &mut dyn NexusTree, view: &DataViewGroup) -> Result<()> {
        tree.create_group(&view.path, "NXdata")?;
        tree.set_attr(&view.path, "signal", &AttrValue::Text(view.signal.clone()))?;
        tree.set_attr(&view.path, "axes", &AttrValue::TextList(view.axes.clone()))?;

        for target in &view.linked_fields {
            let link = join(&view.path, &self.link_name(target));
            tree.create_link(target, &link)?;
        }
        for (field, indices) in &view.indices {
            tree.set_attr(&view.path, &format!("{field}_indices"), &indices.attr()?)?;
        }
        debug!("Data view {} axes {:?}", view.path, view.axes);
        Ok(())
    }

    /// Name of a linked field inside a view: the signal keeps its own
    /// name, positioner fields become `<axis>_<field>`.
    fn link_name(&self, target: &str) -> String {
        let mut parts = target.rsplit('/');
        let field = parts.next().unwrap_or_default();
        let device = parts.next().unwrap_or_default();
        if self.positioner(device).is_some() {
            format!("{device}_{field}")
        } else {
            field.to_string()
        }
    }
}

/// Checks every keys-collection link once all writers have declared their
/// arrays.
///
/// A missing key dataset falls back on the global unique keys only when
/// they exist in `tree` and are written after each point completes. Keys
/// written on delivery say nothing about when a detector finished, so
/// without its own keys a detector has no completion record at all.
/// External links are expected to be unresolved until their writers run.
///
/// # Errors
/// Returns `ConfigurationMismatch` for a missing key dataset with no
/// fallback.
pub fn validate_key_links(
    tree: &dyn NexusTree,
    layout: &EntryLayout,
    registry: &WriterRegistry,
    timing: KeyTiming,
) -> Result<()> {
    let fallback = timing == KeyTiming::OnCompletion && tree.exists(&layout.unique_keys());
    for link in registry.key_links() {
        let path = join(&layout.keys(), &link.name);
        let missing = match (&link.target, link_state(tree, &path)) {
            (_, Ok(LinkState::Resolved { .. })) => continue,
            (KeyTarget::External { file, path }, Ok(LinkState::Placeholder { .. })) => {
                debug!("Keys of '{}' will appear in {file}:{path}", link.writer);
                continue;
            }
            (KeyTarget::Internal { path }, Ok(LinkState::Placeholder { .. }) | Err(Error::NodeNotFound(_))) => {
                layout.device_field(&link.writer, path)
            }
            (KeyTarget::External { file, path }, Err(Error::NodeNotFound(_))) => {
                format!("{file}:{path}")
            }
            (_, Err(err)) => return Err(err),
        };
        if !fallback {
            return Err(nexscan_core::Error::ConfigurationMismatch(format!(
                "unique keys of '{}' not found at {missing} and no completion-time global keys to fall back on",
                link.writer
            ))
            .into());
        }
        warn!(
            "Unique keys of '{}' not found at {missing}; global unique keys remain",
            link.writer
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::InstrumentWriter;
    use crate::memory::MemoryTree;
    use nexscan_core::{DataField, WriterDescriptor};

    fn groups(names: &[&[&str]]) -> Vec<Vec<String>> {
        names
            .iter()
            .map(|g| g.iter().map(|s| (*s).to_string()).collect())
            .collect()
    }

    fn build(
        shape: ScanShape,
        devices: Vec<DeviceDeclaration>,
        dimension_groups: &[Vec<String>],
    ) -> (MemoryTree, Vec<DataViewGroup>) {
        let layout = EntryLayout::default();
        let mut tree = MemoryTree::new();
        tree.create_group("/entry", "NXentry").unwrap();
        InstrumentWriter::new(layout.clone(), shape.clone(), devices.clone(), dimension_groups)
            .build(&mut tree)
            .unwrap();
        let views = DataViewAssembler::new(&layout, &shape, &devices, dimension_groups)
            .assemble(&mut tree)
            .unwrap();
        (tree, views)
    }

    #[test]
    fn test_grid_view_with_image() {
        let dims = groups(&[&["axis1"], &["axis2"]]);
        let (tree, views) = build(
            ScanShape::new(vec![8, 5]),
            vec![
                DeviceDeclaration::positioner("axis1"),
                DeviceDeclaration::positioner("axis2"),
                DeviceDeclaration::detector("det", vec![DataField::new("data", vec![64, 64])]),
            ],
            &dims,
        );
        assert_eq!(views.len(), 1);
        let view = &views[0];
        assert_eq!(view.name, "det");
        assert_eq!(view.axes, vec!["axis1_value_set", "axis2_value_set", ".", "."]);
        assert_eq!(tree.shape("/entry/det/data").unwrap(), vec![8, 5, 64, 64]);
        assert_eq!(
            tree.attr("/entry/det", "signal").unwrap(),
            Some(AttrValue::from("data"))
        );
        assert_eq!(
            tree.attr("/entry/det", "axis2_value_set_indices").unwrap(),
            Some(AttrValue::Int(1))
        );
        assert_eq!(
            tree.attr("/entry/det", "axis1_value_indices").unwrap(),
            Some(AttrValue::IntList(vec![0, 1]))
        );
        assert_eq!(tree.shape("/entry/det/axis1_value_set").unwrap(), vec![8]);
        assert_eq!(tree.shape("/entry/det/axis2_value").unwrap(), vec![8, 5]);
    }

    #[test]
    fn test_additional_fields_get_own_views() {
        let dims = groups(&[&["x"]]);
        let (tree, views) = build(
            ScanShape::new(vec![4]),
            vec![
                DeviceDeclaration::positioner("x"),
                DeviceDeclaration::detector(
                    "mandelbrot",
                    vec![
                        DataField::new("data", vec![16, 16]),
                        DataField::new("spectrum", vec![32]),
                        DataField::scalar("total"),
                    ],
                ),
            ],
            &dims,
        );
        let names: Vec<&str> = views.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["mandelbrot", "mandelbrot_spectrum", "mandelbrot_total"]
        );
        assert_eq!(views[1].axes, vec!["x_value_set", "."]);
        assert_eq!(views[2].axes, vec!["x_value_set"]);
        assert_eq!(views[1].signal, "spectrum");
        assert_eq!(tree.shape("/entry/mandelbrot_total/total").unwrap(), vec![4]);
    }

    #[test]
    fn test_axis_without_set_value_is_placeholder() {
        let dims = groups(&[&["y"], &["x"]]);
        let (tree, views) = build(
            ScanShape::new(vec![2, 3]),
            vec![
                DeviceDeclaration::positioner("y").without_set_value(),
                DeviceDeclaration::positioner("x"),
                DeviceDeclaration::detector("det", Vec::new()),
            ],
            &dims,
        );
        assert_eq!(views[0].axes, vec![".", "x_value_set"]);
        assert!(tree.exists("/entry/det/y_value"));
        assert!(!tree.exists("/entry/det/y_value_set"));
        assert!(tree
            .attr("/entry/det", "y_value_set_indices")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_folded_grid_elides_slow_axis() {
        let dims = groups(&[&["z"], &["y", "x"]]);
        let (tree, views) = build(
            ScanShape::new(vec![3, 7]),
            vec![
                DeviceDeclaration::positioner("z"),
                DeviceDeclaration::positioner("y"),
                DeviceDeclaration::positioner("x"),
                DeviceDeclaration::detector("det", vec![DataField::new("data", vec![10])]),
            ],
            &dims,
        );
        let view = &views[0];
        assert_eq!(view.axes, vec!["z_value_set", "x_value_set", "."]);
        assert!(!view.indices.contains_key("y_value_set"));
        assert_eq!(view.indices["x_value_set"], AxisIndices::Single(1));
        assert!(!view.indices.contains_key("y_value"));
        assert_eq!(view.indices["x_value"], AxisIndices::Full(vec![0, 1]));
        assert!(!tree.exists("/entry/det/y_value_set"));
        assert!(tree.exists("/entry/det/y_value"));
        assert!(tree.attr("/entry/det", "y_value_indices").unwrap().is_none());
    }

    #[test]
    fn test_rank_zero_prepends_placeholder() {
        let (tree, views) = build(
            ScanShape::new(Vec::new()),
            vec![DeviceDeclaration::detector("det", vec![DataField::new("data", vec![5, 5])])],
            &[],
        );
        assert_eq!(views[0].axes, vec![".", ".", "."]);
        assert_eq!(tree.shape("/entry/det/data").unwrap(), vec![1, 5, 5]);
    }

    /// Keys collection with a dangling link for an in-process writer `det`.
    fn dangling_key_link() -> (MemoryTree, WriterRegistry) {
        let mut tree = MemoryTree::new();
        tree.create_groups("/entry/scan_metadata/keys", "NXcollection")
            .unwrap();
        let registry = WriterRegistry::build(vec![WriterDescriptor {
            unique_keys_path: Some("uniqueKeys".to_string()),
            ..WriterDescriptor::new("det")
        }])
        .unwrap();
        tree.create_link(
            "/entry/instrument/det/uniqueKeys",
            "/entry/scan_metadata/keys/det",
        )
        .unwrap();
        (tree, registry)
    }

    fn add_global_keys(tree: &mut MemoryTree) {
        tree.create_dataset(
            "/entry/scan_metadata/keys/uniqueKeys",
            &crate::tree::DatasetLayout::new(crate::tree::DataType::Int32, vec![4]),
        )
        .unwrap();
    }

    #[test]
    fn test_missing_key_dataset_with_fallback_warns() {
        let layout = EntryLayout::default();
        let (mut tree, registry) = dangling_key_link();
        add_global_keys(&mut tree);
        assert!(validate_key_links(&tree, &layout, &registry, KeyTiming::OnCompletion).is_ok());
    }

    #[test]
    fn test_missing_key_dataset_without_global_keys_fails() {
        let layout = EntryLayout::default();
        let (tree, registry) = dangling_key_link();
        assert!(matches!(
            validate_key_links(&tree, &layout, &registry, KeyTiming::OnCompletion),
            Err(Error::Core(nexscan_core::Error::ConfigurationMismatch(_)))
        ));
    }

    #[test]
    fn test_missing_key_dataset_with_keys_on_delivery_fails() {
        let layout = EntryLayout::default();
        let (mut tree, registry) = dangling_key_link();
        add_global_keys(&mut tree);
        assert!(matches!(
            validate_key_links(&tree, &layout, &registry, KeyTiming::OnDelivery),
            Err(Error::Core(nexscan_core::Error::ConfigurationMismatch(_)))
        ));
    }

    #[test]
    fn test_resolved_key_link() {
        let layout = EntryLayout::default();
        let mut tree = MemoryTree::new();
        tree.create_groups("/entry/scan_metadata/keys", "NXcollection")
            .unwrap();
        tree.create_groups("/entry/instrument/det", "NXdetector")
            .unwrap();
        tree.create_dataset(
            "/entry/instrument/det/uniqueKeys",
            &crate::tree::DatasetLayout::new(crate::tree::DataType::Int32, vec![4]),
        )
        .unwrap();
        let registry = WriterRegistry::build(vec![WriterDescriptor {
            unique_keys_path: Some("uniqueKeys".to_string()),
            ..WriterDescriptor::new("det")
        }])
        .unwrap();
        tree.create_link(
            "/entry/instrument/det/uniqueKeys",
            "/entry/scan_metadata/keys/det",
        )
        .unwrap();
        assert!(validate_key_links(&tree, &layout, &registry, KeyTiming::OnDelivery).is_ok());
    }

    #[test]
    fn test_external_key_link_placeholder_is_fine() {
        let layout = EntryLayout::default();
        let mut tree = MemoryTree::new();
        tree.create_groups("/entry/scan_metadata/keys", "NXcollection")
            .unwrap();
        let registry = WriterRegistry::build(vec![WriterDescriptor {
            external_file_names: BTreeSet::from(["detector2.h5".to_string()]),
            unique_keys_path: Some("/entry/NDAttributes/NDArrayUniqueId".to_string()),
            ..WriterDescriptor::new("det2")
        }])
        .unwrap();
        tree.create_external_link(
            "/entry/scan_metadata/keys/detector2.h5",
            "detector2.h5",
            "/entry/NDAttributes/NDArrayUniqueId",
        )
        .unwrap();
        assert!(validate_key_links(&tree, &layout, &registry, KeyTiming::OnDelivery).is_ok());
    }
}
