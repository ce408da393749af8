//! Tree and scan file error types.

use thiserror::Error;

/// Result type for tree and scan file operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Tree and scan file error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error.
    #[error(transparent)]
    Core(#[from] nexscan_core::Error),

    /// A link into a file written by another process cannot be followed yet.
    #[error("external link {link} -> {file}:{path} is not resolvable yet")]
    UnresolvedExternalLink {
        link: String,
        file: String,
        path: String,
    },

    /// No node exists at the path.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node already exists at the path.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// Values do not match the dataset's element type or selection.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HDF5 library error.
    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

impl Error {
    /// Whether this error means an external writer has not produced its
    /// dataset yet, rather than a broken tree.
    pub fn is_unresolved_link(&self) -> bool {
        matches!(self, Error::UnresolvedExternalLink { .. })
    }
}
