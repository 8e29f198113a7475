//! In-process storage backend.
//!
//! `MemoryBackend` keeps the written tree in memory behind an
//! `Arc<Mutex<_>>`. Clones share state, so a test can hand one clone to the
//! writer thread and inspect the result through another after closing.

use crate::backend::{DatasetSpec, ElementType, Handle, StorageBackend};
use crate::{Error, Result};
use imswrite_core::pixel::PixelBuffer;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A stored attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Text(String),
    U32(u32),
}

impl Attribute {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::U32(_) => None,
        }
    }
}

/// A stored dataset. Samples of every element type are widened to `u64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDataset {
    pub spec: DatasetSpec,
    pub values: Vec<u64>,
    /// Number of write calls that touched the dataset.
    pub writes: usize,
}

impl StoredDataset {
    /// Reads one element of a 3-D dataset.
    #[must_use]
    pub fn get(&self, z: usize, y: usize, x: usize) -> Option<u64> {
        let [_, rows, cols] = self.spec.shape[..] else {
            return None;
        };
        self.values.get((z * rows + y) * cols + x).copied()
    }

    /// Returns one `height × width` plane of a 3-D dataset.
    #[must_use]
    pub fn plane(&self, z: usize, height: usize, width: usize) -> Vec<u64> {
        (0..height)
            .flat_map(|y| (0..width).map(move |x| (y, x)))
            .filter_map(|(y, x)| self.get(z, y, x))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Node {
    attributes: BTreeMap<String, Attribute>,
    dataset: Option<StoredDataset>,
}

#[derive(Debug, Default)]
struct MemoryState {
    path: Option<PathBuf>,
    nodes: BTreeMap<String, Node>,
    open: HashMap<Handle, String>,
    next_handle: u64,
    file_closed: bool,
    writes: usize,
    fail_after_writes: Option<usize>,
}

impl MemoryState {
    fn allocate(&mut self, path: String) -> Handle {
        self.next_handle += 1;
        let handle = Handle::new(self.next_handle);
        self.open.insert(handle, path);
        handle
    }

    fn resolve(&self, handle: Handle) -> Result<String> {
        self.open
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("handle {handle} is not open")))
    }

    fn group_path(&self, handle: Handle) -> Result<String> {
        let path = self.resolve(handle)?;
        match self.nodes.get(&path) {
            Some(node) if node.dataset.is_none() => Ok(path),
            _ => Err(Error::Backend(format!("{path} is not a group"))),
        }
    }

    fn create_node(&mut self, parent: Handle, name: &str, node: Node) -> Result<Handle> {
        let parent = self.group_path(parent)?;
        let path = child_path(&parent, name);
        if self.nodes.contains_key(&path) {
            return Err(Error::Backend(format!("{path} already exists")));
        }
        self.nodes.insert(path.clone(), node);
        Ok(self.allocate(path))
    }

    fn set_attribute(&mut self, object: Handle, name: &str, value: Attribute) -> Result<()> {
        let path = self.resolve(object)?;
        let node = self
            .nodes
            .get_mut(&path)
            .ok_or_else(|| Error::Backend(format!("{path} does not exist")))?;
        if node.attributes.contains_key(name) {
            return Err(Error::Backend(format!("attribute {name} exists on {path}")));
        }
        node.attributes.insert(name.to_string(), value);
        Ok(())
    }

    fn dataset_mut(&mut self, handle: Handle) -> Result<&mut StoredDataset> {
        let path = self.resolve(handle)?;
        if let Some(limit) = self.fail_after_writes {
            if self.writes >= limit {
                return Err(Error::Backend(format!(
                    "injected failure writing {path} after {limit} writes"
                )));
            }
        }
        self.writes += 1;
        self.nodes
            .get_mut(&path)
            .and_then(|node| node.dataset.as_mut())
            .ok_or_else(|| Error::Backend(format!("{path} is not a dataset")))
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Storage backend that records everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose dataset writes fail once `writes` of them succeeded.
    ///
    /// Test helper for exercising writer-thread failures. Files written
    /// through it are incomplete by construction.
    #[doc(hidden)]
    #[must_use]
    pub fn failing_after(writes: usize) -> Self {
        let backend = Self::new();
        backend.state().fail_after_writes = Some(writes);
        backend
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path passed to the last `create_file`.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.state().path.clone()
    }

    /// Returns true once the file handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().file_closed
    }

    /// Number of handles that were opened and never closed.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.state().open.len()
    }

    /// Returns true if a group or dataset exists at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.state().nodes.contains_key(path)
    }

    /// Names of the direct children of a group, sorted.
    #[must_use]
    pub fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_path(path, "");
        self.state()
            .nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    #[must_use]
    pub fn attribute(&self, path: &str, name: &str) -> Option<Attribute> {
        self.state()
            .nodes
            .get(path)
            .and_then(|node| node.attributes.get(name).cloned())
    }

    /// Reads a string attribute.
    #[must_use]
    pub fn text_attribute(&self, path: &str, name: &str) -> Option<String> {
        self.attribute(path, name)
            .and_then(|attribute| attribute.as_text().map(str::to_string))
    }

    #[must_use]
    pub fn dataset(&self, path: &str) -> Option<StoredDataset> {
        self.state()
            .nodes
            .get(path)
            .and_then(|node| node.dataset.clone())
    }
}

impl StorageBackend for MemoryBackend {
    fn create_file(&mut self, path: &Path) -> Result<Handle> {
        let mut state = self.state();
        if state.path.is_some() && !state.file_closed {
            return Err(Error::Backend("a file is already open".to_string()));
        }
        state.path = Some(path.to_path_buf());
        state.nodes.clear();
        state.file_closed = false;
        state.nodes.insert("/".to_string(), Node::default());
        Ok(state.allocate("/".to_string()))
    }

    fn create_group(&mut self, parent: Handle, name: &str) -> Result<Handle> {
        self.state().create_node(parent, name, Node::default())
    }

    fn create_dataset(
        &mut self,
        parent: Handle,
        name: &str,
        spec: &DatasetSpec,
    ) -> Result<Handle> {
        if let Some(chunk) = &spec.chunk {
            if chunk.len() != spec.shape.len() || chunk.contains(&0) {
                return Err(Error::Backend(format!(
                    "chunk {chunk:?} does not match shape {:?}",
                    spec.shape
                )));
            }
        }
        let node = Node {
            attributes: BTreeMap::new(),
            dataset: Some(StoredDataset {
                spec: spec.clone(),
                values: vec![0; spec.len()],
                writes: 0,
            }),
        };
        self.state().create_node(parent, name, node)
    }

    fn write_attribute(&mut self, object: Handle, name: &str, value: &str) -> Result<()> {
        self.state()
            .set_attribute(object, name, Attribute::Text(value.to_string()))
    }

    fn write_attribute_u32(&mut self, object: Handle, name: &str, value: u32) -> Result<()> {
        self.state().set_attribute(object, name, Attribute::U32(value))
    }

    fn write_hyperslab(
        &mut self,
        dataset: Handle,
        z: usize,
        height: usize,
        width: usize,
        pixels: &PixelBuffer,
    ) -> Result<()> {
        let mut state = self.state();
        let stored = state.dataset_mut(dataset)?;
        let [depth, rows, cols] = stored.spec.shape[..] else {
            return Err(Error::Backend(format!(
                "hyperslab write into rank-{} dataset",
                stored.spec.shape.len()
            )));
        };
        if z >= depth || height > rows || width > cols {
            return Err(Error::Backend(format!(
                "plane {height}x{width} at z={z} exceeds dataset {:?}",
                stored.spec.shape
            )));
        }
        if pixels.len() != height * width {
            return Err(Error::Backend(format!(
                "plane holds {} samples, expected {}",
                pixels.len(),
                height * width
            )));
        }
        if ElementType::from(pixels.byte_depth()) != stored.spec.element {
            return Err(Error::Backend(format!(
                "{} plane written into {:?} dataset",
                pixels.byte_depth(),
                stored.spec.element
            )));
        }
        for y in 0..height {
            let row = (z * rows + y) * cols;
            for x in 0..width {
                stored.values[row + x] = u64::from(pixels.sample(y * width + x));
            }
        }
        stored.writes += 1;
        Ok(())
    }

    fn write_whole(&mut self, dataset: Handle, values: &[u64]) -> Result<()> {
        let mut state = self.state();
        let stored = state.dataset_mut(dataset)?;
        if stored.spec.element != ElementType::U64 || values.len() != stored.spec.len() {
            return Err(Error::Backend(format!(
                "{} u64 values written into {:?} dataset of shape {:?}",
                values.len(),
                stored.spec.element,
                stored.spec.shape
            )));
        }
        stored.values.copy_from_slice(values);
        stored.writes += 1;
        Ok(())
    }

    fn close(&mut self, handle: Handle) -> Result<()> {
        let mut state = self.state();
        let path = state
            .open
            .remove(&handle)
            .ok_or_else(|| Error::Backend(format!("handle {handle} is not open")))?;
        if path == "/" {
            state.file_closed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_and_attributes() {
        let mut backend = MemoryBackend::new();
        let view = backend.clone();

        let root = backend.create_file(Path::new("out.ims")).unwrap();
        let group = backend.create_group(root, "DataSet").unwrap();
        backend.write_attribute(group, "Name", "stack").unwrap();
        backend.write_attribute_u32(root, "NumberOfDataSets", 1).unwrap();

        assert!(view.contains("/DataSet"));
        assert_eq!(view.children("/"), vec!["DataSet".to_string()]);
        assert_eq!(view.text_attribute("/DataSet", "Name").as_deref(), Some("stack"));
        assert_eq!(
            view.attribute("/", "NumberOfDataSets"),
            Some(Attribute::U32(1))
        );
        assert!(backend.write_attribute(group, "Name", "again").is_err());
        assert!(backend.create_group(root, "DataSet").is_err());

        backend.close(group).unwrap();
        assert!(backend.create_group(group, "Child").is_err());
        backend.close(root).unwrap();
        assert!(view.is_closed());
        assert_eq!(view.open_handles(), 0);
        assert_eq!(view.path(), Some(PathBuf::from("out.ims")));
    }

    #[test]
    fn test_hyperslab_write_into_container() {
        let mut backend = MemoryBackend::new();
        let root = backend.create_file(Path::new("out.ims")).unwrap();
        let spec = DatasetSpec::chunked(vec![2, 4, 4], ElementType::U8, vec![2, 4, 4], Some(2));
        let data = backend.create_dataset(root, "Data", &spec).unwrap();

        let plane = PixelBuffer::from(vec![1u8, 2, 3, 4, 5, 6]);
        backend.write_hyperslab(data, 1, 2, 3, &plane).unwrap();

        let stored = backend.dataset("/Data").unwrap();
        assert_eq!(stored.get(1, 0, 0), Some(1));
        assert_eq!(stored.get(1, 1, 2), Some(6));
        assert_eq!(stored.get(1, 0, 3), Some(0));
        assert_eq!(stored.plane(1, 2, 3), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stored.writes, 1);

        assert!(backend.write_hyperslab(data, 2, 2, 3, &plane).is_err());
        let wide = PixelBuffer::from(vec![0u16; 6]);
        assert!(backend.write_hyperslab(data, 0, 2, 3, &wide).is_err());
    }

    #[test]
    fn test_write_whole_checks_length() {
        let mut backend = MemoryBackend::new();
        let root = backend.create_file(Path::new("out.ims")).unwrap();
        let spec = DatasetSpec::contiguous(vec![4], ElementType::U64);
        let histogram = backend.create_dataset(root, "Histogram", &spec).unwrap();
        assert!(backend.write_whole(histogram, &[1, 2, 3]).is_err());
        backend.write_whole(histogram, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.dataset("/Histogram").unwrap().values, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_injected_failure() {
        let mut backend = MemoryBackend::failing_after(1);
        let root = backend.create_file(Path::new("out.ims")).unwrap();
        let spec = DatasetSpec::contiguous(vec![1], ElementType::U64);
        let dataset = backend.create_dataset(root, "Values", &spec).unwrap();
        backend.write_whole(dataset, &[7]).unwrap();
        assert!(matches!(
            backend.write_whole(dataset, &[8]),
            Err(Error::Backend(_))
        ));
    }
}
