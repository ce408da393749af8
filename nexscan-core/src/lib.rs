//! nexscan-core: Scan model for NeXus scan files.
//!
//! This crate provides the I/O-free pieces of a scan: positions and scan
//! paths, shape and chunk planning, device declarations, the writer registry
//! deciding who owns which unique-key source, and JSON scan configuration.
//!

pub mod config;
pub mod device;
pub mod error;
pub mod path;
pub mod position;
pub mod shape;
pub mod writer;

pub use config::{ScanConfig, INSTRUMENT_GROUP};
pub use device::{DataField, DeviceDeclaration, DeviceRole};
pub use error::{Error, Result};
pub use path::{
    AxisRange, CoordinateSource, DeclaredDimension, PathDimension, Region, ScanPath, Topology,
};
pub use position::{AxisValue, Position};
pub use shape::{ScanShape, ShapePlanner};
pub use writer::{KeyLink, KeyTarget, WriterDescriptor, WriterKind, WriterRegistry, UNIQUE_KEYS};
