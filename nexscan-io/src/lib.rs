//! nexscan-io: NeXus tree writing for nexscan.
//!
//! This crate lays a scan out in a hierarchical tree: the instrument
//! groups, the scan metadata collection with its unique keys, and one data
//! view per detector field. Trees are written through the [`NexusTree`]
//! trait, implemented in memory and, with the `hdf5` feature, on disk.
//!

pub mod clock;
mod error;
pub mod finalizer;
#[cfg(feature = "hdf5")]
pub mod hdf5;
pub mod instrument;
pub mod layout;
pub mod memory;
pub mod metadata;
pub mod scan_file;
pub mod tree;
pub mod updater;
pub mod view;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use finalizer::{format_duration, Finalizer, ScanOutcome, ScanSummary};
#[cfg(feature = "hdf5")]
pub use hdf5::Hdf5Tree;
pub use instrument::InstrumentWriter;
pub use layout::EntryLayout;
pub use memory::MemoryTree;
pub use metadata::{MetadataBuilder, ScanMetadata};
pub use scan_file::{ScanFile, ScanPlan};
pub use tree::{
    dump_layout, link_state, AttrValue, DataType, DatasetLayout, LinkState, NexusTree, NodeKind,
    Slice, Values,
};
pub use updater::{KeyTiming, PointUpdater};
pub use view::{validate_key_links, AxisIndices, DataViewAssembler, DataViewGroup};
