//! Error types for nexscan-core.

use thiserror::Error;

/// Result type alias for nexscan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for scan configuration and position handling.
#[derive(Error, Debug)]
pub enum Error {
    /// Declared shape or rank disagrees with what the scan delivers.
    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    /// A position index lies outside the declared dimension size.
    #[error("index {index} out of range for dimension {dimension} of size {size}")]
    IndexOutOfRange {
        dimension: usize,
        index: usize,
        size: usize,
    },

    /// Two writers resolve their unique keys to the same location.
    #[error("writers '{first}' and '{second}' both claim unique keys at {location}")]
    DuplicateWriterKey {
        first: String,
        second: String,
        location: String,
    },

    /// Two writers were registered under the same name.
    #[error("duplicate writer name: {0}")]
    DuplicateWriterName(String),

    /// A position violates the position model invariants.
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
