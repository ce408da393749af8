//! Detector and positioner declarations.

use crate::writer::WriterDescriptor;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Actual-value field of a positioner.
pub const FIELD_VALUE: &str = "value";
/// Demand-value field of a positioner.
pub const FIELD_VALUE_SET: &str = "value_set";
/// Default data field of a detector.
pub const FIELD_DATA: &str = "data";

/// Role a device plays in the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Acquires data at each point.
    Detector,
    /// Moves (or reads back) a scan axis.
    Positioner,
    /// Records a value at each point without moving.
    Monitor,
}

impl DeviceRole {
    /// NeXus base class of the device's group.
    pub fn nx_class(self) -> &'static str {
        match self {
            DeviceRole::Detector => "NXdetector",
            DeviceRole::Positioner => "NXpositioner",
            DeviceRole::Monitor => "NXmonitor",
        }
    }
}

/// A data field a device writes, with its dimensions beyond the scan rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataField {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<usize>,
}

impl DataField {
    /// Creates a field with the given intrinsic shape.
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Creates a field holding one scalar per point.
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }
}

fn default_true() -> bool {
    true
}

/// Declaration of a device taking part in a scan.
///
/// Besides the data fields it writes, a device carries the writer
/// properties consumed by the writer registry: the external files it owns,
/// the path of its own unique-key dataset and whether it opts out of the
/// global unique keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDeclaration {
    pub name: String,
    pub role: DeviceRole,
    /// Declared fields, primary first. Positioners default to `value`.
    #[serde(default)]
    pub fields: Vec<DataField>,
    /// Whether a positioner records its demand value (`value_set`).
    #[serde(default = "default_true")]
    pub has_set_value: bool,
    #[serde(default)]
    pub external_files: BTreeSet<String>,
    #[serde(default)]
    pub unique_keys_path: Option<String>,
    #[serde(default)]
    pub suppress_global_keys: bool,
}

impl DeviceDeclaration {
    fn new(name: impl Into<String>, role: DeviceRole, fields: Vec<DataField>) -> Self {
        Self {
            name: name.into(),
            role,
            fields,
            has_set_value: true,
            external_files: BTreeSet::new(),
            unique_keys_path: None,
            suppress_global_keys: false,
        }
    }

    /// Declares a detector writing `fields`, primary first.
    pub fn detector(name: impl Into<String>, fields: Vec<DataField>) -> Self {
        Self::new(name, DeviceRole::Detector, fields)
    }

    /// Declares a positioner with `value` and `value_set` fields.
    pub fn positioner(name: impl Into<String>) -> Self {
        Self::new(name, DeviceRole::Positioner, Vec::new())
    }

    /// Declares a monitor writing `fields`.
    pub fn monitor(name: impl Into<String>, fields: Vec<DataField>) -> Self {
        Self::new(name, DeviceRole::Monitor, fields)
    }

    /// Marks the device as writing `file` itself.
    #[must_use]
    pub fn with_external_file(mut self, file: impl Into<String>) -> Self {
        self.external_files.insert(file.into());
        self
    }

    /// Sets the path of the device's own unique-key dataset.
    #[must_use]
    pub fn with_unique_keys_path(mut self, path: impl Into<String>) -> Self {
        self.unique_keys_path = Some(path.into());
        self
    }

    /// Opts the device out of the global unique keys.
    #[must_use]
    pub fn suppressing_global_keys(mut self) -> Self {
        self.suppress_global_keys = true;
        self
    }

    /// Positioner whose hardware cannot report a demand value.
    #[must_use]
    pub fn without_set_value(mut self) -> Self {
        self.has_set_value = false;
        self
    }

    /// Whether the device writes into files of its own.
    pub fn is_external(&self) -> bool {
        !self.external_files.is_empty()
    }

    /// Data fields in declaration order, with role defaults applied.
    pub fn data_fields(&self) -> Vec<DataField> {
        if !self.fields.is_empty() {
            return self.fields.clone();
        }
        match self.role {
            DeviceRole::Positioner => vec![DataField::scalar(FIELD_VALUE)],
            DeviceRole::Detector | DeviceRole::Monitor => vec![DataField::scalar(FIELD_DATA)],
        }
    }

    /// Names of the data views built for this device: one per field of a
    /// detector, the primary field named after the device and the others
    /// `<device>_<field>`. Other roles get none.
    pub fn view_names(&self) -> Vec<String> {
        if self.role != DeviceRole::Detector {
            return Vec::new();
        }
        self.data_fields()
            .iter()
            .enumerate()
            .map(|(i, field)| {
                if i == 0 {
                    self.name.clone()
                } else {
                    format!("{}_{}", self.name, field.name)
                }
            })
            .collect()
    }

    /// Whether the device has a demand-value field.
    pub fn writes_set_value(&self) -> bool {
        self.role == DeviceRole::Positioner && self.has_set_value
    }

    /// Writer properties of this device.
    pub fn writer_descriptor(&self) -> WriterDescriptor {
        WriterDescriptor {
            name: self.name.clone(),
            external_file_names: self.external_files.clone(),
            unique_keys_path: self.unique_keys_path.clone(),
            suppress_global_keys: self.suppress_global_keys,
        }
    }

    /// Checks names and fields.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for empty names, names containing
    /// `/`, duplicate field names, or a positioner without a `value` field.
    pub fn validate(&self) -> Result<()> {
        check_node_name(&self.name, "device")?;
        let fields = self.data_fields();
        for (i, field) in fields.iter().enumerate() {
            check_node_name(&field.name, "field")?;
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::InvalidConfig(format!(
                    "device '{}' declares field '{}' twice",
                    self.name, field.name
                )));
            }
            if field.shape.contains(&0) {
                return Err(Error::InvalidConfig(format!(
                    "field '{}' of device '{}' has an empty dimension",
                    field.name, self.name
                )));
            }
            if field.name == FIELD_VALUE_SET && self.writes_set_value() {
                return Err(Error::InvalidConfig(format!(
                    "positioner '{}' declares reserved field '{FIELD_VALUE_SET}'",
                    self.name
                )));
            }
        }
        if self.role == DeviceRole::Positioner && !fields.iter().any(|f| f.name == FIELD_VALUE) {
            return Err(Error::InvalidConfig(format!(
                "positioner '{}' has no '{FIELD_VALUE}' field",
                self.name
            )));
        }
        if let Some(key_path) = self.unique_keys_path.as_deref().filter(|_| !self.is_external()) {
            let key_path = key_path.trim_start_matches('/');
            let clashes = fields.iter().any(|f| f.name == key_path)
                || (self.writes_set_value() && key_path == FIELD_VALUE_SET);
            if key_path.is_empty() || clashes {
                return Err(Error::InvalidConfig(format!(
                    "unique keys path '{key_path}' of device '{}' clashes with its fields",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

fn check_node_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." {
        return Err(Error::InvalidConfig(format!("invalid {what} name '{name}'")));
    }
    Ok(())
}
