//! Storage backend abstraction.
//!
//! The pyramid writer only needs a handful of hierarchical-storage
//! primitives: groups, chunked datasets, string attributes and single-plane
//! hyperslab writes. Backends hand out opaque [`Handle`]s that stay valid
//! until passed to [`StorageBackend::close`].

use crate::Result;
use imswrite_core::pixel::{ByteDepth, PixelBuffer};
use std::fmt;
use std::path::Path;

/// Opaque reference to an open file, group or dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    U8,
    U16,
    U64,
}

impl From<ByteDepth> for ElementType {
    fn from(depth: ByteDepth) -> Self {
        match depth {
            ByteDepth::U8 => Self::U8,
            ByteDepth::U16 => Self::U16,
        }
    }
}

/// Shape and storage options of a new dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    pub shape: Vec<usize>,
    pub element: ElementType,
    /// Chunk extents, same rank as `shape`; `None` for contiguous storage.
    pub chunk: Option<Vec<usize>>,
    /// DEFLATE level; only honoured for chunked datasets.
    pub compression: Option<u8>,
}

impl DatasetSpec {
    /// A contiguous, uncompressed dataset.
    #[must_use]
    pub fn contiguous(shape: Vec<usize>, element: ElementType) -> Self {
        Self {
            shape,
            element,
            chunk: None,
            compression: None,
        }
    }

    /// A chunked dataset with optional DEFLATE compression.
    #[must_use]
    pub fn chunked(
        shape: Vec<usize>,
        element: ElementType,
        chunk: Vec<usize>,
        compression: Option<u8>,
    ) -> Self {
        Self {
            shape,
            element,
            chunk: Some(chunk),
            compression,
        }
    }

    /// Number of elements in the dataset.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hierarchical storage used by the pyramid writer.
///
/// All calls happen on the writer thread, so implementations only need to be
/// `Send`.
pub trait StorageBackend: Send {
    /// Creates (truncating) a file and returns its root group handle.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    fn create_file(&mut self, path: &Path) -> Result<Handle>;

    /// Creates a child group.
    ///
    /// # Errors
    /// Returns an error if `parent` is not an open group or the name exists.
    fn create_group(&mut self, parent: Handle, name: &str) -> Result<Handle>;

    /// Creates a dataset inside a group.
    ///
    /// # Errors
    /// Returns an error if `parent` is not an open group, the name exists, or
    /// the dataset layout is not supported.
    fn create_dataset(&mut self, parent: Handle, name: &str, spec: &DatasetSpec)
        -> Result<Handle>;

    /// Attaches a string attribute to a group or dataset.
    ///
    /// # Errors
    /// Returns an error if `object` is not open or the attribute exists.
    fn write_attribute(&mut self, object: Handle, name: &str, value: &str) -> Result<()>;

    /// Attaches a one-element `u32` array attribute.
    ///
    /// # Errors
    /// Returns an error if `object` is not open or the attribute exists.
    fn write_attribute_u32(&mut self, object: Handle, name: &str, value: u32) -> Result<()>;

    /// Writes one `height × width` plane at Z index `z` of a 3-D dataset.
    ///
    /// # Errors
    /// Returns an error if the plane does not fit the dataset or its element
    /// type differs.
    fn write_hyperslab(
        &mut self,
        dataset: Handle,
        z: usize,
        height: usize,
        width: usize,
        pixels: &PixelBuffer,
    ) -> Result<()>;

    /// Writes the full contents of a `u64` dataset.
    ///
    /// # Errors
    /// Returns an error if the length or element type differs.
    fn write_whole(&mut self, dataset: Handle, values: &[u64]) -> Result<()>;

    /// Releases a handle. Closing the file handle finalizes the file.
    ///
    /// # Errors
    /// Returns an error if the handle is not open or flushing fails.
    fn close(&mut self, handle: Handle) -> Result<()>;
}
