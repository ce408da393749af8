//! Scan metadata collection.
//!
//! Layout under `/<entry>/<metadata group>` (an `NXcollection`):
//!
//! | field | type | written |
//! |---|---|---|
//! | `scan_rank`, `scan_shape` | int | at build |
//! | `scan_command`, `scan_axes`, `scan_request` | string | at build |
//! | `scan_estimated_duration` | float, `s` | at build |
//! | `start_time` | string | at build |
//! | `scan_finished` | bool `[1]` | false at build, true at successful finish |
//! | `point_start_times`, `point_end_times` | string, scan shape | per point |
//! | `end_time`, `scan_duration`, `scan_dead_time`, `scan_dead_time_percent` | | at successful finish |
//! | `keys/uniqueKeys` | int, scan shape | per point |
//! | `keys/<writer or file>` | link | at build |

use crate::clock::timestamp;
use crate::layout::{
    EntryLayout, FIELD_POINT_END_TIMES, FIELD_POINT_START_TIMES, FIELD_SCAN_AXES,
    FIELD_SCAN_COMMAND, FIELD_SCAN_ESTIMATED_DURATION, FIELD_SCAN_FINISHED, FIELD_SCAN_RANK,
    FIELD_SCAN_REQUEST, FIELD_SCAN_SHAPE, FIELD_START_TIME,
};
use crate::tree::{join, AttrValue, DataType, DatasetLayout, NexusTree, Slice, Values};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::info;
use nexscan_core::{KeyTarget, ScanShape, WriterRegistry};

/// Handle on a built metadata collection.
#[derive(Debug, Clone)]
pub struct ScanMetadata {
    layout: EntryLayout,
    shape: ScanShape,
    estimated_duration_s: f64,
    writes_global_keys: bool,
    key_links: Vec<String>,
}

impl ScanMetadata {
    /// Entry layout the collection lives in.
    pub fn layout(&self) -> &EntryLayout {
        &self.layout
    }

    /// Planned scan shape.
    pub fn shape(&self) -> &ScanShape {
        &self.shape
    }

    /// Estimated duration in seconds.
    pub fn estimated_duration_s(&self) -> f64 {
        self.estimated_duration_s
    }

    /// Path of the global unique keys, unless every writer suppressed them.
    pub fn unique_keys(&self) -> Option<String> {
        self.writes_global_keys.then(|| self.layout.unique_keys())
    }

    /// Paths of the per-writer entries of the keys collection.
    pub fn key_links(&self) -> &[String] {
        &self.key_links
    }

    /// Path of the per-point start timestamps.
    pub fn point_start_times(&self) -> String {
        self.layout.metadata_field(FIELD_POINT_START_TIMES)
    }

    /// Path of the per-point end timestamps.
    pub fn point_end_times(&self) -> String {
        self.layout.metadata_field(FIELD_POINT_END_TIMES)
    }
}

/// Builds the metadata collection skeleton before any point is written.
#[derive(Debug, Clone)]
pub struct MetadataBuilder<'a> {
    layout: &'a EntryLayout,
    shape: &'a ScanShape,
    registry: &'a WriterRegistry,
    estimated_duration_s: f64,
    command: String,
    axes: Vec<String>,
    request: Option<String>,
}

impl<'a> MetadataBuilder<'a> {
    /// Starts a builder with no command, axes or request and a zero
    /// duration estimate.
    pub fn new(layout: &'a EntryLayout, shape: &'a ScanShape, registry: &'a WriterRegistry) -> Self {
        Self {
            layout,
            shape,
            registry,
            estimated_duration_s: 0.0,
            command: String::new(),
            axes: Vec::new(),
            request: None,
        }
    }

    /// Estimated duration in seconds.
    #[must_use]
    pub fn estimated_duration(mut self, seconds: f64) -> Self {
        self.estimated_duration_s = seconds;
        self
    }

    /// Command that started the scan.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Axis names in generator order.
    #[must_use]
    pub fn axes(mut self, axes: Vec<String>) -> Self {
        self.axes = axes;
        self
    }

    /// Scan request, recorded verbatim.
    #[must_use]
    pub fn request(mut self, request: Option<String>) -> Self {
        self.request = request;
        self
    }

    /// Creates the collection. Only valid against a fresh entry: building
    /// twice fails on the first existing node.
    ///
    /// # Errors
    /// Returns [`Error::NodeExists`] if the collection already exists, or
    /// any tree error.
    pub fn build(&self, tree: &mut dyn NexusTree, start_time: DateTime<Utc>) -> Result<ScanMetadata> {
        let group = self.layout.metadata();
        tree.create_group(&group, "NXcollection")?;

        let rank = to_i32(self.shape.rank())?;
        write_new(tree, &join(&group, FIELD_SCAN_RANK), Vec::new(), Values::Int(vec![rank]))?;
        let sizes = self
            .shape
            .sizes()
            .iter()
            .map(|&s| to_i32(s))
            .collect::<Result<Vec<_>>>()?;
        write_new(
            tree,
            &join(&group, FIELD_SCAN_SHAPE),
            vec![sizes.len()],
            Values::Int(sizes),
        )?;
        write_new(
            tree,
            &join(&group, FIELD_SCAN_COMMAND),
            Vec::new(),
            Values::Text(vec![self.command.clone()]),
        )?;
        write_new(
            tree,
            &join(&group, FIELD_SCAN_AXES),
            vec![self.axes.len()],
            Values::Text(self.axes.clone()),
        )?;
        if let Some(request) = &self.request {
            write_new(
                tree,
                &join(&group, FIELD_SCAN_REQUEST),
                Vec::new(),
                Values::Text(vec![request.clone()]),
            )?;
        }

        let estimated = join(&group, FIELD_SCAN_ESTIMATED_DURATION);
        write_new(tree, &estimated, Vec::new(), Values::Float(vec![self.estimated_duration_s]))?;
        tree.set_attr(&estimated, "units", &AttrValue::from("s"))?;
        info!(
            "Estimated scan time {}",
            crate::finalizer::format_duration(self.estimated_duration_s)
        );

        write_new(
            tree,
            &join(&group, FIELD_START_TIME),
            Vec::new(),
            Values::Text(vec![timestamp(start_time)]),
        )?;
        write_new(
            tree,
            &join(&group, FIELD_SCAN_FINISHED),
            vec![1],
            Values::Bool(vec![false]),
        )?;

        let per_point = DatasetLayout::new(DataType::Text, self.shape.allocation_shape())
            .chunked(self.shape.chunk_shape());
        tree.create_dataset(&join(&group, FIELD_POINT_START_TIMES), &per_point)?;
        tree.create_dataset(&join(&group, FIELD_POINT_END_TIMES), &per_point)?;

        let key_links = self.build_keys(tree)?;
        Ok(ScanMetadata {
            layout: self.layout.clone(),
            shape: self.shape.clone(),
            estimated_duration_s: self.estimated_duration_s,
            writes_global_keys: self.registry.writes_global_keys(),
            key_links,
        })
    }

    fn build_keys(&self, tree: &mut dyn NexusTree) -> Result<Vec<String>> {
        let keys = self.layout.keys();
        tree.create_group(&keys, "NXcollection")?;

        if self.registry.writes_global_keys() {
            let layout = DatasetLayout::new(DataType::Int32, self.shape.allocation_shape())
                .chunked(self.shape.chunk_shape());
            tree.create_dataset(&self.layout.unique_keys(), &layout)?;
        } else {
            info!("Every writer suppresses the global unique keys; relying on per-writer keys");
        }

        let mut links = Vec::new();
        for link in self.registry.key_links() {
            let path = join(&keys, &link.name);
            match &link.target {
                KeyTarget::Internal { path: key_path } => {
                    let target = join(&self.layout.device(&link.writer), key_path);
                    tree.create_link(&target, &path)?;
                }
                KeyTarget::External { file, path: key_path } => {
                    tree.create_external_link(&path, file, key_path)?;
                }
            }
            links.push(path);
        }
        Ok(links)
    }
}

pub(crate) fn write_new(tree: &mut dyn NexusTree, path: &str, shape: Vec<usize>, values: Values) -> Result<()> {
    let layout = DatasetLayout::new(values.dtype(), shape);
    tree.create_dataset(path, &layout)?;
    if !layout.is_empty() {
        tree.write_slice(path, &Slice::whole(&layout.shape), &values)?;
    }
    Ok(())
}

fn to_i32(value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidFormat(format!("{value} does not fit a 32-bit dataset")))
}
