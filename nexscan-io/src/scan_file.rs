//! One scan written into one tree.
//!
//! [`ScanPlan`] does every configuration-time check without touching a
//! tree. [`ScanFile::create`] then lays out the instrument tree, the
//! metadata collection and the data views, after which positions are fed
//! through it until [`ScanFile::finish`].

use crate::clock::Clock;
use crate::finalizer::{Finalizer, ScanOutcome, ScanSummary};
use crate::instrument::InstrumentWriter;
use crate::layout::EntryLayout;
use crate::metadata::{MetadataBuilder, ScanMetadata};
use crate::tree::{NexusTree, Values};
use crate::updater::{KeyTiming, PointUpdater};
use crate::view::{validate_key_links, DataViewAssembler, DataViewGroup};
use crate::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};
use nexscan_core::{
    CoordinateSource, DeviceDeclaration, DeviceRole, Position, ScanConfig, ScanShape,
    ShapePlanner, WriterRegistry,
};
use std::sync::Arc;

/// A validated scan configuration, ready to be laid out.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub layout: EntryLayout,
    pub shape: ScanShape,
    pub registry: WriterRegistry,
    pub devices: Vec<DeviceDeclaration>,
    pub axis_names: Vec<String>,
    pub dimension_groups: Vec<Vec<String>>,
    pub command: String,
    pub request: Option<String>,
    pub estimated_duration_s: f64,
}

impl ScanPlan {
    /// Validates `config` and plans the scan shape.
    ///
    /// # Errors
    /// Returns configuration, planner and writer registry errors.
    pub fn new(config: &ScanConfig) -> Result<Self> {
        config.validate()?;
        let shape = ShapePlanner::plan(&config.path)?;
        let registry = config.writer_registry()?;
        let devices = config.resolved_devices();
        Ok(Self {
            layout: EntryLayout::from_config(config),
            shape,
            registry,
            devices,
            axis_names: config.path.axis_names(),
            dimension_groups: config.path.dimension_groups(),
            command: config.command.clone(),
            request: config.request.as_ref().map(serde_json::Value::to_string),
            estimated_duration_s: config.estimated_duration_s,
        })
    }

    /// Keys are written on delivery only when every detector records its
    /// own keys; otherwise they wait for the point to complete.
    pub fn key_timing(&self) -> KeyTiming {
        let mut detectors = self
            .devices
            .iter()
            .filter(|d| d.role == DeviceRole::Detector)
            .peekable();
        if detectors.peek().is_some() && detectors.all(|d| d.unique_keys_path.is_some()) {
            KeyTiming::OnDelivery
        } else {
            KeyTiming::OnCompletion
        }
    }
}

/// A scan being written into a tree.
pub struct ScanFile<T: NexusTree> {
    tree: T,
    label: String,
    plan: ScanPlan,
    instrument: InstrumentWriter,
    metadata: ScanMetadata,
    updater: PointUpdater,
    views: Vec<DataViewGroup>,
    clock: Arc<dyn Clock>,
    start_time: DateTime<Utc>,
    completed: usize,
}

impl<T: NexusTree> ScanFile<T> {
    /// Plans `config` and lays it out in `tree`.
    ///
    /// # Errors
    /// See [`ScanPlan::new`] and [`ScanFile::create`].
    pub fn configure(
        tree: T,
        label: impl Into<String>,
        config: &ScanConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let plan = ScanPlan::new(config)?;
        Self::create(tree, label, plan, clock)
    }

    /// Lays out the entry: instrument tree, metadata collection, data
    /// views. Key links are checked once the views exist.
    ///
    /// # Errors
    /// Returns tree errors, or `ConfigurationMismatch` when a key dataset
    /// is missing and the global keys cannot stand in for it.
    pub fn create(
        mut tree: T,
        label: impl Into<String>,
        plan: ScanPlan,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let label = label.into();
        let start_time = clock.now();
        info!(
            "Configuring scan {label}: shape {:?}, axes {:?}",
            plan.shape.scan_sizes(),
            plan.axis_names
        );

        tree.create_group(&plan.layout.entry(), "NXentry")?;
        let instrument = InstrumentWriter::new(
            plan.layout.clone(),
            plan.shape.clone(),
            plan.devices.clone(),
            &plan.dimension_groups,
        );
        instrument.build(&mut tree)?;

        let metadata = MetadataBuilder::new(&plan.layout, &plan.shape, &plan.registry)
            .command(plan.command.clone())
            .axes(plan.axis_names.clone())
            .request(plan.request.clone())
            .estimated_duration(plan.estimated_duration_s)
            .build(&mut tree, start_time)?;

        let views =
            DataViewAssembler::new(&plan.layout, &plan.shape, &plan.devices, &plan.dimension_groups)
                .assemble(&mut tree)?;
        let timing = plan.key_timing();
        validate_key_links(&tree, &plan.layout, &plan.registry, timing)?;
        debug!("Unique keys written {timing:?}");
        let updater = PointUpdater::new(&metadata, timing, Arc::clone(&clock));
        Ok(Self {
            tree,
            label,
            plan,
            instrument,
            metadata,
            updater,
            views,
            clock,
            start_time,
            completed: 0,
        })
    }

    /// Tree being written.
    pub fn tree(&self) -> &T {
        &self.tree
    }

    /// Mutable access for writers that bypass the scan file.
    pub fn tree_mut(&mut self) -> &mut T {
        &mut self.tree
    }

    /// Plan the file was laid out from.
    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    /// Planned scan shape.
    pub fn shape(&self) -> &ScanShape {
        &self.plan.shape
    }

    /// Handle on the metadata collection.
    pub fn metadata(&self) -> &ScanMetadata {
        &self.metadata
    }

    /// Data views built at creation.
    pub fn views(&self) -> &[DataViewGroup] {
        &self.views
    }

    /// Writer of the instrument tree.
    pub fn instrument(&self) -> &InstrumentWriter {
        &self.instrument
    }

    /// Points completed so far.
    pub fn completed_points(&self) -> usize {
        self.completed
    }

    /// Records a delivered position: its start time, the positioners'
    /// values and in-process device keys.
    ///
    /// # Errors
    /// Per-point errors are fatal to the rest of the scan.
    pub fn on_point_delivered(&mut self, position: &Position) -> Result<()> {
        self.updater.on_point_delivered(&mut self.tree, position)?;
        self.instrument.write_positions(&mut self.tree, position)
    }

    /// Writes one device field for `position`.
    ///
    /// # Errors
    /// See [`InstrumentWriter::write_point`].
    pub fn write_device(
        &mut self,
        device: &str,
        field: &str,
        position: &Position,
        values: Values,
    ) -> Result<()> {
        self.instrument
            .write_point(&mut self.tree, device, field, position, values)
    }

    /// Records a completed position: its end time, then its unique key.
    ///
    /// # Errors
    /// Per-point errors are fatal to the rest of the scan.
    pub fn on_point_completed(&mut self, position: &Position) -> Result<()> {
        self.updater.on_point_completed(&mut self.tree, position)?;
        self.completed += 1;
        Ok(())
    }

    /// Runs one position through the file as a simulated acquisition:
    /// every in-process detector and monitor field is filled with the
    /// point's unique key.
    ///
    /// # Errors
    /// Per-point errors are fatal to the rest of the scan.
    #[allow(clippy::cast_precision_loss)]
    pub fn simulate_point(&mut self, position: &Position) -> Result<()> {
        self.on_point_delivered(position)?;
        let fill = position.unique_key() as f64;
        let writes: Vec<(String, String, usize)> = self
            .plan
            .devices
            .iter()
            .filter(|d| d.role != DeviceRole::Positioner && !d.is_external())
            .flat_map(|d| {
                d.data_fields()
                    .into_iter()
                    .map(move |f| (d.name.clone(), f.name, f.shape.iter().product()))
            })
            .collect();
        for (device, field, len) in writes {
            self.write_device(&device, &field, position, Values::Float(vec![fill; len]))?;
        }
        self.on_point_completed(position)
    }

    /// Simulates every position of `source`, stopping after `limit` points
    /// when given. Returns the number of points written.
    ///
    /// # Errors
    /// Stops at the first per-point error.
    pub fn simulate(&mut self, source: &dyn CoordinateSource, limit: Option<usize>) -> Result<usize> {
        let mut written = 0;
        for position in source.positions().take(limit.unwrap_or(usize::MAX)) {
            self.simulate_point(&position)?;
            written += 1;
        }
        Ok(written)
    }

    /// Finalizes the scan and hands the tree back.
    ///
    /// # Errors
    /// Returns tree errors from writing the end-of-scan fields of a
    /// completed scan. Aborted scans never fail here.
    pub fn finish(mut self, outcome: ScanOutcome) -> Result<(T, ScanSummary)> {
        let end_time = self.clock.now();
        info!(
            "Scan {} wrote {} of {} points",
            self.label,
            self.completed,
            self.plan.shape.point_count()
        );
        let summary = Finalizer::new(self.metadata, self.label).finish(
            &mut self.tree,
            outcome,
            self.start_time,
            end_time,
        )?;
        Ok((self.tree, summary))
    }
}
