//! Node names and paths of a scan file.

use crate::tree::join;
use nexscan_core::ScanConfig;

pub const GROUP_INSTRUMENT: &str = nexscan_core::INSTRUMENT_GROUP;
pub const GROUP_KEYS: &str = "keys";

pub const FIELD_SCAN_RANK: &str = "scan_rank";
pub const FIELD_SCAN_SHAPE: &str = "scan_shape";
pub const FIELD_SCAN_COMMAND: &str = "scan_command";
pub const FIELD_SCAN_AXES: &str = "scan_axes";
pub const FIELD_SCAN_REQUEST: &str = "scan_request";
pub const FIELD_SCAN_ESTIMATED_DURATION: &str = "scan_estimated_duration";
pub const FIELD_SCAN_DURATION: &str = "scan_duration";
pub const FIELD_SCAN_DEAD_TIME: &str = "scan_dead_time";
pub const FIELD_SCAN_DEAD_TIME_PERCENT: &str = "scan_dead_time_percent";
pub const FIELD_SCAN_FINISHED: &str = "scan_finished";
pub const FIELD_START_TIME: &str = "start_time";
pub const FIELD_END_TIME: &str = "end_time";
pub const FIELD_POINT_START_TIMES: &str = "point_start_times";
pub const FIELD_POINT_END_TIMES: &str = "point_end_times";

/// `@axes` entry for a dimension with no axis field.
pub const PLACEHOLDER_AXIS: &str = ".";

/// Paths of the well-known groups of one scan entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLayout {
    entry: String,
    metadata_group: String,
}

impl EntryLayout {
    /// Layout of entry `/<entry>` with its metadata under `metadata_group`.
    pub fn new(entry: impl Into<String>, metadata_group: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            metadata_group: metadata_group.into(),
        }
    }

    /// Layout named by a scan configuration.
    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(config.entry_name.clone(), config.metadata_group.clone())
    }

    /// `/<entry>`
    pub fn entry(&self) -> String {
        join("/", &self.entry)
    }

    /// `/<entry>/instrument`
    pub fn instrument(&self) -> String {
        join(&self.entry(), GROUP_INSTRUMENT)
    }

    /// `/<entry>/instrument/<device>`
    pub fn device(&self, device: &str) -> String {
        join(&self.instrument(), device)
    }

    /// `/<entry>/instrument/<device>/<field>`
    pub fn device_field(&self, device: &str, field: &str) -> String {
        join(&self.device(device), field)
    }

    /// `/<entry>/<metadata group>`
    pub fn metadata(&self) -> String {
        join(&self.entry(), &self.metadata_group)
    }

    /// `/<entry>/<metadata group>/<field>`
    pub fn metadata_field(&self, field: &str) -> String {
        join(&self.metadata(), field)
    }

    /// `/<entry>/<metadata group>/keys`
    pub fn keys(&self) -> String {
        join(&self.metadata(), GROUP_KEYS)
    }

    /// `/<entry>/<metadata group>/keys/uniqueKeys`
    pub fn unique_keys(&self) -> String {
        join(&self.keys(), nexscan_core::UNIQUE_KEYS)
    }

    /// `/<entry>/<view>`
    pub fn view(&self, name: &str) -> String {
        join(&self.entry(), name)
    }
}

impl Default for EntryLayout {
    fn default() -> Self {
        Self::new("entry", "scan_metadata")
    }
}
