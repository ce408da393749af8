//! Hierarchical file primitives.
//!
//! [`NexusTree`] is the seam between the scan logic and storage: every
//! component decides what to write and where, and issues these primitives.
//! Paths are absolute and `/`-separated.

use crate::{Error, Result};
use std::fmt;

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int32,
    Float64,
    Bool,
    Text,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int32 => "int32",
            DataType::Float64 => "float64",
            DataType::Bool => "bool",
            DataType::Text => "string",
        };
        f.write_str(name)
    }
}

/// Shape, chunking and element type of a dataset to create.
///
/// An empty `shape` is a scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub chunk: Option<Vec<usize>>,
}

impl DatasetLayout {
    /// Unchunked dataset of the given shape.
    pub fn new(dtype: DataType, shape: Vec<usize>) -> Self {
        Self {
            dtype,
            shape,
            chunk: None,
        }
    }

    /// Scalar dataset.
    pub fn scalar(dtype: DataType) -> Self {
        Self::new(dtype, Vec::new())
    }

    /// Sets the chunk shape.
    #[must_use]
    pub fn chunked(mut self, chunk: Vec<usize>) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the dataset holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hyperslab selection: `shape` elements starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub start: Vec<usize>,
    pub shape: Vec<usize>,
}

impl Slice {
    /// The 1-sized slice at `start`.
    pub fn point(start: Vec<usize>) -> Self {
        let shape = vec![1; start.len()];
        Self { start, shape }
    }

    /// Selection covering a whole dataset of `shape`.
    pub fn whole(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            shape: shape.to_vec(),
        }
    }

    /// Number of selected elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether nothing is selected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the selection fits in a dataset of `shape`.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] on a rank mismatch and
    /// `IndexOutOfRange` when the selection runs past a dimension.
    pub fn check_within(&self, path: &str, shape: &[usize]) -> Result<()> {
        if self.start.len() != shape.len() || self.shape.len() != shape.len() {
            return Err(Error::TypeMismatch(format!(
                "selection of rank {} on {path} of rank {}",
                self.start.len(),
                shape.len()
            )));
        }
        for (dimension, ((&start, &count), &size)) in
            self.start.iter().zip(&self.shape).zip(shape).enumerate()
        {
            if start + count > size {
                return Err(nexscan_core::Error::IndexOutOfRange {
                    dimension,
                    index: start + count - 1,
                    size,
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Flat, row-major dataset contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Int(Vec<i32>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
    Text(Vec<String>),
}

impl Values {
    /// Fill values for a freshly allocated dataset of `len` elements.
    pub fn filled(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::Int32 => Values::Int(vec![0; len]),
            DataType::Float64 => Values::Float(vec![0.0; len]),
            DataType::Bool => Values::Bool(vec![false; len]),
            DataType::Text => Values::Text(vec![String::new(); len]),
        }
    }

    /// Element type of the values.
    pub fn dtype(&self) -> DataType {
        match self {
            Values::Int(_) => DataType::Int32,
            Values::Float(_) => DataType::Float64,
            Values::Bool(_) => DataType::Bool,
            Values::Text(_) => DataType::Text,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Values::Int(v) => v.len(),
            Values::Float(v) => v.len(),
            Values::Bool(v) => v.len(),
            Values::Text(v) => v.len(),
        }
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Integer contents, if any.
    pub fn as_int(&self) -> Option<&[i32]> {
        match self {
            Values::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Float contents, if any.
    pub fn as_float(&self) -> Option<&[f64]> {
        match self {
            Values::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean contents, if any.
    pub fn as_bool(&self) -> Option<&[bool]> {
        match self {
            Values::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Text contents, if any.
    pub fn as_text(&self) -> Option<&[String]> {
        match self {
            Values::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    TextList(Vec<String>),
    Int(i32),
    IntList(Vec<i32>),
}

impl AttrValue {
    /// Text contents, if the attribute is a scalar string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

/// What a path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Dataset { dtype: DataType, shape: Vec<usize> },
    SoftLink { target: String },
    ExternalLink { file: String, target: String },
}

/// State of a link target, checked lazily by whoever reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Declared, but the target has not been produced yet.
    Placeholder { file: String, path: String },
    /// The target exists.
    Resolved { shape: Vec<usize> },
}

impl LinkState {
    /// Whether the target exists.
    pub fn is_resolved(&self) -> bool {
        matches!(self, LinkState::Resolved { .. })
    }
}

/// Hierarchical file primitives used by the scan writers.
pub trait NexusTree {
    /// Creates a group with an `NX_class` attribute. The parent must exist.
    ///
    /// # Errors
    /// Returns [`Error::NodeExists`] if the path is taken and
    /// [`Error::NodeNotFound`] if the parent is missing.
    fn create_group(&mut self, path: &str, nx_class: &str) -> Result<()>;

    /// Creates a fixed-shape dataset filled with zeros (empty strings for
    /// text).
    ///
    /// # Errors
    /// Same as [`NexusTree::create_group`].
    fn create_dataset(&mut self, path: &str, layout: &DatasetLayout) -> Result<()>;

    /// Writes `values` into `slice` of the dataset at `path`.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the values do not fit the dataset
    /// and `IndexOutOfRange` if the slice exceeds its shape.
    fn write_slice(&mut self, path: &str, slice: &Slice, values: &Values) -> Result<()>;

    /// Creates a soft link at `link` pointing at `target` in this file.
    ///
    /// # Errors
    /// Returns [`Error::NodeExists`] if `link` is taken.
    fn create_link(&mut self, target: &str, link: &str) -> Result<()>;

    /// Creates an external link at `link` pointing at `target` in `file`.
    /// The target need not exist yet.
    ///
    /// # Errors
    /// Returns [`Error::NodeExists`] if `link` is taken.
    fn create_external_link(&mut self, link: &str, file: &str, target: &str) -> Result<()>;

    /// Sets (or replaces) an attribute on a group or dataset.
    ///
    /// # Errors
    /// Returns [`Error::NodeNotFound`] if nothing exists at `path`.
    fn set_attr(&mut self, path: &str, name: &str, value: &AttrValue) -> Result<()>;

    /// Reads an attribute.
    ///
    /// # Errors
    /// Returns [`Error::NodeNotFound`] if nothing exists at `path`.
    fn attr(&self, path: &str, name: &str) -> Result<Option<AttrValue>>;

    /// Whether a node or link exists at `path`. Links count even when their
    /// target does not.
    fn exists(&self, path: &str) -> bool;

    /// What `path` is, without following links.
    ///
    /// # Errors
    /// Returns [`Error::NodeNotFound`] if nothing exists at `path`.
    fn kind(&self, path: &str) -> Result<NodeKind>;

    /// Names of the children of the group at `path`, sorted.
    ///
    /// # Errors
    /// Returns [`Error::NodeNotFound`] if `path` is not a group.
    fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Shape of the dataset at `path`, following links.
    ///
    /// # Errors
    /// Returns [`Error::UnresolvedExternalLink`] if an external link on the
    /// way cannot be followed yet.
    fn shape(&self, path: &str) -> Result<Vec<usize>>;

    /// Full contents of the dataset at `path`, following links.
    ///
    /// # Errors
    /// Same as [`NexusTree::shape`].
    fn read(&self, path: &str) -> Result<Values>;

    /// Pushes buffered writes to storage.
    ///
    /// # Errors
    /// Returns an error if the backend fails to flush.
    fn flush(&mut self) -> Result<()>;
}

/// Lazily checks the state of the link at `path`.
///
/// # Errors
/// Returns any error other than an unresolved external link.
pub fn link_state(tree: &dyn NexusTree, path: &str) -> Result<LinkState> {
    match tree.shape(path) {
        Ok(shape) => Ok(LinkState::Resolved { shape }),
        Err(Error::UnresolvedExternalLink { file, path, .. }) => {
            Ok(LinkState::Placeholder { file, path })
        }
        Err(err) => Err(err),
    }
}

/// Joins a group path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// One line per node below `root`, depth first, e.g.
/// `/entry/scan_metadata/keys/uniqueKeys  int32 [8, 5]`.
///
/// # Errors
/// Returns an error if `root` cannot be listed.
pub fn dump_layout(tree: &dyn NexusTree, root: &str) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    dump_node(tree, root, &mut lines)?;
    Ok(lines)
}

fn dump_node(tree: &dyn NexusTree, path: &str, lines: &mut Vec<String>) -> Result<()> {
    match tree.kind(path)? {
        NodeKind::Group => {
            let class = tree
                .attr(path, "NX_class")?
                .and_then(|v| v.as_text().map(str::to_string))
                .unwrap_or_default();
            lines.push(format!("{path}  <{class}>"));
            for child in tree.children(path)? {
                dump_node(tree, &join(path, &child), lines)?;
            }
        }
        NodeKind::Dataset { dtype, shape } => {
            lines.push(format!("{path}  {dtype} {shape:?}"));
        }
        NodeKind::SoftLink { target } => lines.push(format!("{path}  -> {target}")),
        NodeKind::ExternalLink { file, target } => {
            let state = match link_state(tree, path)? {
                LinkState::Resolved { shape } => format!("{shape:?}"),
                LinkState::Placeholder { .. } => "(unresolved)".to_string(),
            };
            lines.push(format!("{path}  -> {file}:{target} {state}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_slice() {
        let slice = Slice::point(vec![3, 4]);
        assert_eq!(slice.shape, vec![1, 1]);
        assert_eq!(slice.len(), 1);
        assert!(slice.check_within("/k", &[8, 5]).is_ok());
        assert!(Slice::point(vec![8, 0]).check_within("/k", &[8, 5]).is_err());
        assert!(matches!(
            slice.check_within("/k", &[8]),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_out_of_range_maps_to_core_error() {
        let err = Slice::point(vec![0, 5]).check_within("/k", &[8, 5]).unwrap_err();
        assert!(matches!(
            err,
            Error::Core(nexscan_core::Error::IndexOutOfRange {
                dimension: 1,
                index: 5,
                size: 5
            })
        ));
    }

    #[test]
    fn test_layout_len() {
        assert_eq!(DatasetLayout::scalar(DataType::Int32).len(), 1);
        assert_eq!(DatasetLayout::new(DataType::Text, vec![3, 7]).len(), 21);
        assert!(DatasetLayout::new(DataType::Text, vec![0]).is_empty());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "entry"), "/entry");
        assert_eq!(join("/entry", "x"), "/entry/x");
        assert_eq!(join("/entry", "/x"), "/entry/x");
    }

    #[test]
    fn test_filled_values() {
        assert_eq!(Values::filled(DataType::Int32, 2), Values::Int(vec![0, 0]));
        assert_eq!(Values::filled(DataType::Bool, 1).dtype(), DataType::Bool);
        assert_eq!(
            Values::filled(DataType::Text, 2).as_text().unwrap(),
            &[String::new(), String::new()]
        );
    }
}
