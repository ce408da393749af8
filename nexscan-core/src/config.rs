//! JSON scan configuration.

use crate::device::{DeviceDeclaration, DeviceRole};
use crate::path::{CoordinateSource, ScanPath};
use crate::writer::WriterRegistry;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::collections::BTreeSet;
use std::path::Path;

/// Name of the group holding every device inside the entry.
pub const INSTRUMENT_GROUP: &str = "instrument";

/// Everything needed to lay out a scan file.
///
/// Every field has a default, so partial configurations are accepted:
///
/// ```json
/// {
///   "command": "grid y 0 2 8 x 0 4 5 det",
///   "estimated_duration_s": 40.0,
///   "path": [
///     {"type": "grid", "slow_axis": "y", "fast_axis": "x",
///      "slow": {"start": 0, "stop": 2, "points": 8},
///      "fast": {"start": 0, "stop": 4, "points": 5}}
///   ],
///   "devices": [
///     {"name": "det", "role": "detector",
///      "fields": [{"name": "data", "shape": [64, 64]}]}
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Name of the root entry group.
    pub entry_name: String,
    /// Name of the scan metadata collection inside the entry.
    pub metadata_group: String,
    /// Command that started the scan, recorded verbatim.
    pub command: String,
    /// Estimated scan duration in seconds.
    pub estimated_duration_s: f64,
    /// Free-form scan request, recorded verbatim when present.
    pub request: Option<serde_json::Value>,
    /// Scan path, outermost dimension first.
    pub path: ScanPath,
    /// Participating devices.
    pub devices: Vec<DeviceDeclaration>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            entry_name: "entry".to_string(),
            metadata_group: "scan_metadata".to_string(),
            command: String::new(),
            estimated_duration_s: 0.0,
            request: None,
            path: ScanPath::default(),
            devices: Vec::new(),
        }
    }
}

impl ScanConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the string cannot be parsed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Declared devices plus a default positioner for every scanned axis
    /// not declared explicitly. Scanned axes come first, in generator order.
    pub fn resolved_devices(&self) -> Vec<DeviceDeclaration> {
        let mut devices: Vec<DeviceDeclaration> = Vec::new();
        for axis in self.path.axis_names() {
            let declared = self.devices.iter().find(|d| d.name == axis);
            devices.push(
                declared
                    .cloned()
                    .unwrap_or_else(|| DeviceDeclaration::positioner(axis)),
            );
        }
        for device in &self.devices {
            if !devices.iter().any(|d| d.name == device.name) {
                devices.push(device.clone());
            }
        }
        devices
    }

    /// Builds the writer registry for the resolved devices.
    ///
    /// # Errors
    /// Propagates [`WriterRegistry::build`] errors.
    pub fn writer_registry(&self) -> Result<WriterRegistry> {
        WriterRegistry::build(
            self.resolved_devices()
                .iter()
                .map(DeviceDeclaration::writer_descriptor)
                .collect(),
        )
    }

    /// Checks the configuration is consistent.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for bad names, durations or paths,
    /// for a scanned axis declared as something other than a positioner
    /// and for data view names that collide with each other or with the
    /// entry's own groups. Returns [`Error::DuplicateWriterName`] for a
    /// device declared twice, and any writer registry error.
    pub fn validate(&self) -> Result<()> {
        for (what, name) in [("entry", &self.entry_name), ("metadata group", &self.metadata_group)] {
            if name.is_empty() || name.contains('/') {
                return Err(Error::InvalidConfig(format!("invalid {what} name '{name}'")));
            }
        }
        if self.metadata_group == INSTRUMENT_GROUP {
            return Err(Error::InvalidConfig(format!(
                "metadata group cannot be named '{INSTRUMENT_GROUP}'"
            )));
        }
        if !self.estimated_duration_s.is_finite() || self.estimated_duration_s < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "estimated duration {} is not a non-negative number of seconds",
                self.estimated_duration_s
            )));
        }
        self.path.validate()?;

        for (i, device) in self.devices.iter().enumerate() {
            if self.devices[..i].iter().any(|d| d.name == device.name) {
                return Err(Error::DuplicateWriterName(device.name.clone()));
            }
        }

        for axis in self.path.axis_names() {
            if let Some(device) = self.devices.iter().find(|d| d.name == axis) {
                if device.role != DeviceRole::Positioner {
                    return Err(Error::InvalidConfig(format!(
                        "scanned axis '{axis}' is declared as a {:?}",
                        device.role
                    )));
                }
            }
        }

        let devices = self.resolved_devices();
        for device in &devices {
            device.validate()?;
        }
        self.check_view_names(&devices)?;
        self.writer_registry()?;
        Ok(())
    }

    /// Data views sit next to the instrument and metadata groups, so their
    /// names must be unique within the entry.
    fn check_view_names(&self, devices: &[DeviceDeclaration]) -> Result<()> {
        let mut taken = BTreeSet::from([INSTRUMENT_GROUP.to_string(), self.metadata_group.clone()]);
        for device in devices {
            for view in device.view_names() {
                if !taken.insert(view.clone()) {
                    return Err(Error::InvalidConfig(format!(
                        "data view '{view}' of device '{}' collides with another node of entry '{}'",
                        device.name, self.entry_name
                    )));
                }
            }
        }
        Ok(())
    }
}
