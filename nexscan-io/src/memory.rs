//! In-memory tree.
//!
//! Used by tests, by the CLI when no HDF5 output is requested, and to stand
//! in for files produced by external writers: a second [`MemoryTree`] can be
//! mounted under a file name so external links into it resolve.

use crate::tree::{join, AttrValue, DataType, DatasetLayout, NexusTree, NodeKind, Slice, Values};
use crate::{Error, Result};
use std::collections::BTreeMap;

const MAX_LINK_DEPTH: usize = 16;

#[derive(Debug, Clone)]
enum Node {
    Group,
    Dataset { shape: Vec<usize>, data: Values },
    SoftLink { target: String },
    ExternalLink { file: String, target: String },
}

/// A NeXus tree held in memory.
#[derive(Debug, Clone)]
pub struct MemoryTree {
    nodes: BTreeMap<String, Node>,
    attrs: BTreeMap<String, BTreeMap<String, AttrValue>>,
    mounted: BTreeMap<String, MemoryTree>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTree {
    /// Creates an empty tree containing only the root group.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Group);
        Self {
            nodes,
            attrs: BTreeMap::new(),
            mounted: BTreeMap::new(),
        }
    }

    /// Makes `tree` the contents of the external file `file`.
    pub fn mount_external(&mut self, file: impl Into<String>, tree: MemoryTree) {
        self.mounted.insert(file.into(), tree);
    }

    /// Mutable access to a mounted external file.
    pub fn external_mut(&mut self, file: &str) -> Option<&mut MemoryTree> {
        self.mounted.get_mut(file)
    }

    /// Element type of the dataset at `path`, following links.
    ///
    /// # Errors
    /// Same as [`NexusTree::read`].
    pub fn dtype(&self, path: &str) -> Result<DataType> {
        self.read(path).map(|v| v.dtype())
    }

    /// Creates every missing group along `path`, with the given class.
    ///
    /// # Errors
    /// Returns [`Error::NodeExists`] if a component exists but is not a group.
    pub fn create_groups(&mut self, path: &str, nx_class: &str) -> Result<()> {
        let path = normalize(path);
        let mut current = String::from("/");
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join(&current, part);
            match self.nodes.get(&current) {
                Some(Node::Group) => {}
                Some(_) => return Err(Error::NodeExists(current)),
                None => self.create_group(&current, nx_class)?,
            }
        }
        Ok(())
    }

    fn insert(&mut self, path: &str, node: Node) -> Result<()> {
        let path = normalize(path);
        if self.nodes.contains_key(&path) {
            return Err(Error::NodeExists(path));
        }
        let parent = parent(&path);
        match self.nodes.get(parent) {
            Some(Node::Group) => {}
            _ => return Err(Error::NodeNotFound(parent.to_string())),
        }
        self.nodes.insert(path, node);
        Ok(())
    }

    /// Dataset at `path` after following links, with the tree holding it.
    fn resolve<'a>(&'a self, path: &str, depth: usize) -> Result<(&'a [usize], &'a Values)> {
        if depth > MAX_LINK_DEPTH {
            return Err(Error::InvalidFormat(format!("link cycle at {path}")));
        }
        let path = normalize(path);
        match self.nodes.get(&path) {
            Some(Node::Dataset { shape, data }) => Ok((shape, data)),
            Some(Node::SoftLink { target }) => self.resolve(target, depth + 1),
            Some(Node::ExternalLink { file, target }) => match self.mounted.get(file) {
                Some(external) => external.resolve(target, depth + 1).map_err(|err| match err {
                    Error::NodeNotFound(_) => unresolved(&path, file, target),
                    other => other,
                }),
                None => Err(unresolved(&path, file, target)),
            },
            Some(Node::Group) => Err(Error::TypeMismatch(format!("{path} is a group"))),
            None => Err(Error::NodeNotFound(path)),
        }
    }
}

impl NexusTree for MemoryTree {
    fn create_group(&mut self, path: &str, nx_class: &str) -> Result<()> {
        self.insert(path, Node::Group)?;
        self.set_attr(path, "NX_class", &AttrValue::from(nx_class))
    }

    fn create_dataset(&mut self, path: &str, layout: &DatasetLayout) -> Result<()> {
        self.insert(
            path,
            Node::Dataset {
                shape: layout.shape.clone(),
                data: Values::filled(layout.dtype, layout.len()),
            },
        )
    }

    fn write_slice(&mut self, path: &str, slice: &Slice, values: &Values) -> Result<()> {
        let path = normalize(path);
        let Some(Node::Dataset { shape, data }) = self.nodes.get_mut(&path) else {
            return Err(Error::NodeNotFound(path));
        };
        if values.dtype() != data.dtype() {
            return Err(Error::TypeMismatch(format!(
                "cannot write {} values to {} dataset {path}",
                values.dtype(),
                data.dtype()
            )));
        }
        if values.len() != slice.len() {
            return Err(Error::TypeMismatch(format!(
                "{} values for a selection of {} on {path}",
                values.len(),
                slice.len()
            )));
        }
        slice.check_within(&path, shape)?;

        let offsets = row_major_offsets(shape, slice);
        match (data, values) {
            (Values::Int(dst), Values::Int(src)) => scatter(dst, &offsets, src),
            (Values::Float(dst), Values::Float(src)) => scatter(dst, &offsets, src),
            (Values::Bool(dst), Values::Bool(src)) => scatter(dst, &offsets, src),
            (Values::Text(dst), Values::Text(src)) => scatter(dst, &offsets, src),
            (data, _) => {
                return Err(Error::TypeMismatch(format!(
                    "{} dataset {path} cannot hold {} values",
                    data.dtype(),
                    values.dtype()
                )))
            }
        }
        Ok(())
    }

    fn create_link(&mut self, target: &str, link: &str) -> Result<()> {
        self.insert(
            link,
            Node::SoftLink {
                target: normalize(target),
            },
        )
    }

    fn create_external_link(&mut self, link: &str, file: &str, target: &str) -> Result<()> {
        self.insert(
            link,
            Node::ExternalLink {
                file: file.to_string(),
                target: normalize(target),
            },
        )
    }

    fn set_attr(&mut self, path: &str, name: &str, value: &AttrValue) -> Result<()> {
        let path = normalize(path);
        if !self.nodes.contains_key(&path) {
            return Err(Error::NodeNotFound(path));
        }
        self.attrs
            .entry(path)
            .or_default()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    fn attr(&self, path: &str, name: &str) -> Result<Option<AttrValue>> {
        let path = normalize(path);
        if !self.nodes.contains_key(&path) {
            return Err(Error::NodeNotFound(path));
        }
        Ok(self.attrs.get(&path).and_then(|a| a.get(name)).cloned())
    }

    fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&normalize(path))
    }

    fn kind(&self, path: &str) -> Result<NodeKind> {
        let path = normalize(path);
        match self.nodes.get(&path) {
            Some(Node::Group) => Ok(NodeKind::Group),
            Some(Node::Dataset { shape, data }) => Ok(NodeKind::Dataset {
                dtype: data.dtype(),
                shape: shape.clone(),
            }),
            Some(Node::SoftLink { target }) => Ok(NodeKind::SoftLink {
                target: target.clone(),
            }),
            Some(Node::ExternalLink { file, target }) => Ok(NodeKind::ExternalLink {
                file: file.clone(),
                target: target.clone(),
            }),
            None => Err(Error::NodeNotFound(path)),
        }
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let path = normalize(path);
        if !matches!(self.nodes.get(&path), Some(Node::Group)) {
            return Err(Error::NodeNotFound(path));
        }
        Ok(self
            .nodes
            .keys()
            .filter(|p| p.as_str() != "/" && parent(p) == path)
            .filter_map(|p| p.rsplit('/').next().map(str::to_string))
            .collect())
    }

    fn shape(&self, path: &str) -> Result<Vec<usize>> {
        self.resolve(path, 0).map(|(shape, _)| shape.to_vec())
    }

    fn read(&self, path: &str) -> Result<Values> {
        self.resolve(path, 0).map(|(_, data)| data.clone())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn unresolved(link: &str, file: &str, target: &str) -> Error {
    Error::UnresolvedExternalLink {
        link: link.to_string(),
        file: file.to_string(),
        path: target.to_string(),
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Flat offsets of every element of `slice`, in row-major order.
fn row_major_offsets(shape: &[usize], slice: &Slice) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }

    let mut offsets = Vec::with_capacity(slice.len());
    let mut counter = vec![0; shape.len()];
    for _ in 0..slice.len() {
        offsets.push(
            counter
                .iter()
                .zip(&slice.start)
                .zip(&strides)
                .map(|((c, s), stride)| (c + s) * stride)
                .sum(),
        );
        for d in (0..counter.len()).rev() {
            counter[d] += 1;
            if counter[d] < slice.shape[d] {
                break;
            }
            counter[d] = 0;
        }
    }
    offsets
}

fn scatter<T: Clone>(dst: &mut [T], offsets: &[usize], src: &[T]) {
    for (&offset, value) in offsets.iter().zip(src) {
        dst[offset] = value.clone();
    }
}
