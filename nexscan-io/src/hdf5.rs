//! HDF5 tree backed by `hdf5-metno`.

use crate::tree::{AttrValue, DataType, DatasetLayout, NexusTree, NodeKind, Slice, Values};
use crate::{Error, Result};
use hdf5::types::{H5Type, TypeDescriptor, VarLenUnicode};
use hdf5::{Dataset, Extents, File, Location};
use ndarray::{ArrayD, ArrayView1, IxDyn, SliceInfo, SliceInfoElem};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

const MAX_LINK_DEPTH: usize = 8;

/// A NeXus tree in an HDF5 file.
///
/// Links created through this handle are remembered so that a failing read
/// through an external link can be reported as unresolved rather than as a
/// generic library error.
///
/// A handle from [`Hdf5Tree::open`] starts with no such record: reads still
/// follow links natively, but `kind` describes a linked node as its target
/// and a link that cannot be followed fails with [`Error::Hdf5`] instead of
/// [`Error::UnresolvedExternalLink`].
pub struct Hdf5Tree {
    file: File,
    soft_links: BTreeMap<String, String>,
    external_links: BTreeMap<String, (String, String)>,
}

impl Hdf5Tree {
    /// Create (truncate) a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_file(File::create(path)?))
    }

    /// Open an existing file read-only, e.g. to inspect a finished scan.
    /// Link bookkeeping is not rebuilt; see [`Hdf5Tree`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_file(File::open(path)?))
    }

    fn from_file(file: File) -> Self {
        Self {
            file,
            soft_links: BTreeMap::new(),
            external_links: BTreeMap::new(),
        }
    }

    /// Underlying file handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    fn check_free(&self, path: &str) -> Result<()> {
        if self.file.link_exists(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        let parent = match path.rfind('/') {
            Some(0) | None => "/",
            Some(i) => &path[..i],
        };
        if parent != "/" && self.file.group(parent).is_err() {
            return Err(Error::NodeNotFound(parent.to_string()));
        }
        Ok(())
    }

    /// Opens the dataset at `path`, following links created through this
    /// handle to report dangling or unresolved targets precisely.
    fn dataset(&self, path: &str) -> Result<Dataset> {
        let mut current = path;
        for _ in 0..=MAX_LINK_DEPTH {
            let err = match self.file.dataset(current) {
                Ok(dataset) => return Ok(dataset),
                Err(err) => err,
            };
            if let Some((file, target)) = self.external_links.get(current) {
                return Err(Error::UnresolvedExternalLink {
                    link: current.to_string(),
                    file: file.clone(),
                    path: target.clone(),
                });
            }
            match self.soft_links.get(current) {
                Some(target) => current = target,
                None if self.file.link_exists(current) => return Err(err.into()),
                None => return Err(Error::NodeNotFound(current.to_string())),
            }
        }
        Err(Error::InvalidFormat(format!("link cycle at {path}")))
    }
}

impl NexusTree for Hdf5Tree {
    fn create_group(&mut self, path: &str, nx_class: &str) -> Result<()> {
        self.check_free(path)?;
        let group = self.file.create_group(path)?;
        set_attr_str(&group, "NX_class", nx_class)
    }

    fn create_dataset(&mut self, path: &str, layout: &DatasetLayout) -> Result<()> {
        self.check_free(path)?;
        match layout.dtype {
            DataType::Int32 => create_fixed_dataset::<i32>(&self.file, path, layout),
            DataType::Float64 => create_fixed_dataset::<f64>(&self.file, path, layout),
            DataType::Bool => create_fixed_dataset::<bool>(&self.file, path, layout),
            DataType::Text => create_fixed_dataset::<VarLenUnicode>(&self.file, path, layout),
        }
    }

    fn write_slice(&mut self, path: &str, slice: &Slice, values: &Values) -> Result<()> {
        let dataset = self.dataset(path)?;
        let dtype = descriptor_type(&dataset.dtype()?.to_descriptor()?)?;
        if dtype != values.dtype() {
            return Err(Error::TypeMismatch(format!(
                "cannot write {} values to {dtype} dataset {path}",
                values.dtype()
            )));
        }
        if values.len() != slice.len() {
            return Err(Error::TypeMismatch(format!(
                "{} values for a selection of {} on {path}",
                values.len(),
                slice.len()
            )));
        }
        slice.check_within(path, &dataset.shape())?;

        match values {
            Values::Int(v) => write_selection(&dataset, slice, v.clone()),
            Values::Float(v) => write_selection(&dataset, slice, v.clone()),
            Values::Bool(v) => write_selection(&dataset, slice, v.clone()),
            Values::Text(v) => {
                let text = v
                    .iter()
                    .map(|s| to_var_len_unicode(s))
                    .collect::<Result<Vec<_>>>()?;
                write_selection(&dataset, slice, text)
            }
        }
    }

    fn create_link(&mut self, target: &str, link: &str) -> Result<()> {
        self.check_free(link)?;
        self.file.link_soft(target, link)?;
        self.soft_links.insert(link.to_string(), target.to_string());
        Ok(())
    }

    fn create_external_link(&mut self, link: &str, file: &str, target: &str) -> Result<()> {
        self.check_free(link)?;
        self.file.link_external(file, target, link)?;
        self.external_links
            .insert(link.to_string(), (file.to_string(), target.to_string()));
        Ok(())
    }

    fn set_attr(&mut self, path: &str, name: &str, value: &AttrValue) -> Result<()> {
        if let Ok(group) = self.file.group(path) {
            return write_attr(&group, name, value);
        }
        let dataset = self.dataset(path)?;
        write_attr(&dataset, name, value)
    }

    fn attr(&self, path: &str, name: &str) -> Result<Option<AttrValue>> {
        if let Ok(group) = self.file.group(path) {
            return read_attr_opt(&group, name);
        }
        let dataset = self.dataset(path)?;
        read_attr_opt(&dataset, name)
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.file.link_exists(path)
    }

    fn kind(&self, path: &str) -> Result<NodeKind> {
        if let Some(target) = self.soft_links.get(path) {
            return Ok(NodeKind::SoftLink {
                target: target.clone(),
            });
        }
        if let Some((file, target)) = self.external_links.get(path) {
            return Ok(NodeKind::ExternalLink {
                file: file.clone(),
                target: target.clone(),
            });
        }
        if self.file.group(path).is_ok() {
            return Ok(NodeKind::Group);
        }
        let dataset = self.dataset(path)?;
        Ok(NodeKind::Dataset {
            dtype: descriptor_type(&dataset.dtype()?.to_descriptor()?)?,
            shape: dataset.shape(),
        })
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        let group = self
            .file
            .group(path)
            .map_err(|_| Error::NodeNotFound(path.to_string()))?;
        let mut names = group.member_names()?;
        names.sort();
        Ok(names)
    }

    fn shape(&self, path: &str) -> Result<Vec<usize>> {
        Ok(self.dataset(path)?.shape())
    }

    fn read(&self, path: &str) -> Result<Values> {
        let dataset = self.dataset(path)?;
        match descriptor_type(&dataset.dtype()?.to_descriptor()?)? {
            DataType::Int32 => Ok(Values::Int(dataset.read_raw::<i32>()?)),
            DataType::Float64 => Ok(Values::Float(dataset.read_raw::<f64>()?)),
            DataType::Bool => Ok(Values::Bool(dataset.read_raw::<bool>()?)),
            DataType::Text => Ok(Values::Text(
                dataset
                    .read_raw::<VarLenUnicode>()?
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            )),
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

fn create_fixed_dataset<T: H5Type>(file: &File, path: &str, layout: &DatasetLayout) -> Result<()> {
    let extents = if layout.shape.is_empty() {
        Extents::Scalar
    } else {
        Extents::from(layout.shape.clone())
    };
    let mut builder = file.new_dataset::<T>().shape(extents);

    if let Some(chunk) = &layout.chunk {
        builder = builder.chunk(chunk.clone());
    }

    builder.create(path)?;
    Ok(())
}

fn write_selection<T: H5Type>(dataset: &Dataset, slice: &Slice, data: Vec<T>) -> Result<()> {
    if slice.start.is_empty() {
        let value = data
            .into_iter()
            .next()
            .ok_or_else(|| Error::TypeMismatch("no value for scalar dataset".to_string()))?;
        dataset.write_scalar(&value)?;
        return Ok(());
    }

    let array = ArrayD::from_shape_vec(IxDyn(&slice.shape), data)
        .map_err(|e| Error::TypeMismatch(format!("selection shape: {e}")))?;
    let elems = slice
        .start
        .iter()
        .zip(&slice.shape)
        .map(|(&start, &count)| {
            Ok(SliceInfoElem::Slice {
                start: to_isize(start)?,
                end: Some(to_isize(start + count)?),
                step: 1,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let selection = SliceInfo::<Vec<SliceInfoElem>, IxDyn, IxDyn>::try_from(elems)
        .map_err(|e| Error::InvalidFormat(format!("invalid selection: {e}")))?;
    dataset.write_slice(array.view(), selection)?;
    Ok(())
}

fn to_isize(value: usize) -> Result<isize> {
    isize::try_from(value).map_err(|_| Error::InvalidFormat(format!("index {value} too large")))
}

fn descriptor_type(descriptor: &TypeDescriptor) -> Result<DataType> {
    match descriptor {
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => Ok(DataType::Int32),
        TypeDescriptor::Float(_) => Ok(DataType::Float64),
        TypeDescriptor::Boolean => Ok(DataType::Bool),
        TypeDescriptor::VarLenUnicode => Ok(DataType::Text),
        other => Err(Error::InvalidFormat(format!(
            "unsupported element type {other:?}"
        ))),
    }
}

fn write_attr(location: &Location, name: &str, value: &AttrValue) -> Result<()> {
    if location.attr(name).is_ok() {
        location.delete_attr(name)?;
    }
    match value {
        AttrValue::Text(text) => set_attr_str(location, name, text),
        AttrValue::TextList(items) => {
            let values: Vec<VarLenUnicode> = items
                .iter()
                .map(|item| to_var_len_unicode(item))
                .collect::<Result<Vec<_>>>()?;
            let attr = location
                .new_attr::<VarLenUnicode>()
                .shape((values.len(),))
                .create(name)?;
            attr.write(ArrayView1::from(values.as_slice()))?;
            Ok(())
        }
        AttrValue::Int(v) => {
            location.new_attr::<i32>().create(name)?.write_scalar(v)?;
            Ok(())
        }
        AttrValue::IntList(items) => {
            let attr = location
                .new_attr::<i32>()
                .shape((items.len(),))
                .create(name)?;
            attr.write(ArrayView1::from(items.as_slice()))?;
            Ok(())
        }
    }
}

fn set_attr_str(location: &Location, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    location
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn read_attr_opt(location: &Location, name: &str) -> Result<Option<AttrValue>> {
    let Ok(attr) = location.attr(name) else {
        return Ok(None);
    };
    let scalar = attr.ndim() == 0;
    let value = match descriptor_type(&attr.dtype()?.to_descriptor()?)? {
        DataType::Text if scalar => {
            let value: VarLenUnicode = attr.read_scalar()?;
            AttrValue::Text(value.to_string())
        }
        DataType::Text => AttrValue::TextList(
            attr.read_raw::<VarLenUnicode>()?
                .iter()
                .map(ToString::to_string)
                .collect(),
        ),
        DataType::Int32 if scalar => AttrValue::Int(attr.read_scalar::<i32>()?),
        DataType::Int32 => AttrValue::IntList(attr.read_raw::<i32>()?),
        other => {
            return Err(Error::InvalidFormat(format!(
                "unsupported {other} attribute {name}"
            )))
        }
    };
    Ok(Some(value))
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::link_state;
    use tempfile::NamedTempFile;

    fn tree_with_keys(file: &NamedTempFile) -> Hdf5Tree {
        let mut tree = Hdf5Tree::create(file.path()).unwrap();
        tree.create_group("/entry", "NXentry").unwrap();
        tree.create_dataset(
            "/entry/keys",
            &DatasetLayout::new(DataType::Int32, vec![3, 4]).chunked(vec![1, 4]),
        )
        .unwrap();
        tree
    }

    #[test]
    fn test_hdf5_point_writes() {
        let file = NamedTempFile::new().unwrap();
        let mut tree = tree_with_keys(&file);
        tree.write_slice("/entry/keys", &Slice::point(vec![1, 2]), &Values::Int(vec![7]))
            .unwrap();
        let data = tree.read("/entry/keys").unwrap();
        let ints = data.as_int().unwrap();
        assert_eq!(ints.len(), 12);
        assert_eq!(ints[6], 7);
        assert_eq!(ints.iter().filter(|&&k| k != 0).count(), 1);
        assert!(tree
            .write_slice("/entry/keys", &Slice::point(vec![3, 0]), &Values::Int(vec![1]))
            .is_err());
    }

    #[test]
    fn test_hdf5_attrs_and_links() {
        let file = NamedTempFile::new().unwrap();
        let mut tree = tree_with_keys(&file);
        tree.set_attr(
            "/entry",
            "axes",
            &AttrValue::TextList(vec!["x_value_set".to_string(), ".".to_string()]),
        )
        .unwrap();
        tree.set_attr("/entry", "x_value_set_indices", &AttrValue::Int(0))
            .unwrap();
        tree.create_link("/entry/keys", "/entry/alias").unwrap();

        assert_eq!(
            tree.attr("/entry", "NX_class").unwrap(),
            Some(AttrValue::from("NXentry"))
        );
        assert_eq!(
            tree.attr("/entry", "x_value_set_indices").unwrap(),
            Some(AttrValue::Int(0))
        );
        assert_eq!(tree.shape("/entry/alias").unwrap(), vec![3, 4]);
        assert!(tree.create_group("/entry", "NXentry").is_err());
    }

    #[test]
    fn test_hdf5_dangling_link_not_found() {
        let file = NamedTempFile::new().unwrap();
        let mut tree = tree_with_keys(&file);
        tree.create_link("/entry/missing", "/entry/alias").unwrap();
        assert!(matches!(
            tree.shape("/entry/alias"),
            Err(Error::NodeNotFound(path)) if path == "/entry/missing"
        ));
        assert!(matches!(tree.read("/entry/nothing"), Err(Error::NodeNotFound(_))));
    }

    #[test]
    fn test_hdf5_reopened_file_follows_links() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut tree = tree_with_keys(&file);
            tree.write_slice("/entry/keys", &Slice::point(vec![0, 1]), &Values::Int(vec![2]))
                .unwrap();
            tree.create_link("/entry/keys", "/entry/alias").unwrap();
            tree.flush().unwrap();
        }

        let tree = Hdf5Tree::open(file.path()).unwrap();
        assert!(tree.exists("/entry/alias"));
        assert_eq!(tree.read("/entry/alias").unwrap(), tree.read("/entry/keys").unwrap());
        assert!(matches!(
            tree.kind("/entry/alias").unwrap(),
            NodeKind::Dataset { shape, .. } if shape == vec![3, 4]
        ));
        assert_eq!(tree.children("/entry").unwrap(), vec!["alias", "keys"]);
    }

    #[test]
    fn test_hdf5_scalar_and_text() {
        let file = NamedTempFile::new().unwrap();
        let mut tree = tree_with_keys(&file);
        tree.create_dataset("/entry/rank", &DatasetLayout::scalar(DataType::Int32))
            .unwrap();
        tree.write_slice("/entry/rank", &Slice::whole(&[]), &Values::Int(vec![2]))
            .unwrap();
        tree.create_dataset("/entry/command", &DatasetLayout::new(DataType::Text, vec![1]))
            .unwrap();
        tree.write_slice(
            "/entry/command",
            &Slice::point(vec![0]),
            &Values::Text(vec!["grid x y".to_string()]),
        )
        .unwrap();
        tree.flush().unwrap();

        assert_eq!(tree.read("/entry/rank").unwrap(), Values::Int(vec![2]));
        assert_eq!(
            tree.read("/entry/command").unwrap(),
            Values::Text(vec!["grid x y".to_string()])
        );
    }

    #[test]
    fn test_hdf5_external_link_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let external_path = dir.path().join("detector2.h5");
        let external_name = external_path.to_string_lossy().to_string();
        let main = NamedTempFile::new().unwrap();
        let mut tree = tree_with_keys(&main);
        tree.create_external_link("/entry/det2", &external_name, "/entry/uid")
            .unwrap();

        let state = link_state(&tree, "/entry/det2").unwrap();
        assert!(!state.is_resolved());

        {
            let mut external = Hdf5Tree::create(&external_path).unwrap();
            external.create_group("/entry", "NXentry").unwrap();
            external
                .create_dataset("/entry/uid", &DatasetLayout::new(DataType::Int32, vec![3, 4]))
                .unwrap();
            external.flush().unwrap();
        }
        assert_eq!(tree.shape("/entry/det2").unwrap(), vec![3, 4]);
    }
}
