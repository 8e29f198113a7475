//! HDF5 storage backend.
//!
//! Maps the [`StorageBackend`] primitives onto `hdf5` files, groups and
//! datasets. String attributes use the Imaris convention of a 1-D array of
//! one-character ASCII strings.

use crate::backend::{DatasetSpec, ElementType, Handle, StorageBackend};
use crate::{Error, Result};
use hdf5::types::{FixedAscii, H5Type};
use hdf5::{Dataset, File, Group, Location};
use imswrite_core::pixel::PixelBuffer;
use ndarray::{s, ArrayView1, ArrayView3};
use std::collections::HashMap;
use std::path::Path;

enum Object {
    File(File),
    Group(Group),
    Dataset(Dataset),
}

/// Storage backend writing real HDF5 files.
#[derive(Default)]
pub struct Hdf5Backend {
    objects: HashMap<Handle, Object>,
    next_handle: u64,
}

impl Hdf5Backend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, object: Object) -> Handle {
        self.next_handle += 1;
        let handle = Handle::new(self.next_handle);
        self.objects.insert(handle, object);
        handle
    }

    fn object(&self, handle: Handle) -> Result<&Object> {
        self.objects
            .get(&handle)
            .ok_or_else(|| Error::Backend(format!("handle {handle} is not open")))
    }

    fn group(&self, handle: Handle) -> Result<&Group> {
        match self.object(handle)? {
            Object::File(file) => Ok(file),
            Object::Group(group) => Ok(group),
            Object::Dataset(_) => Err(Error::Backend(format!("handle {handle} is a dataset"))),
        }
    }

    fn location(&self, handle: Handle) -> Result<&Location> {
        match self.object(handle)? {
            Object::File(file) => Ok(file),
            Object::Group(group) => Ok(group),
            Object::Dataset(dataset) => Ok(dataset),
        }
    }

    fn dataset(&self, handle: Handle) -> Result<&Dataset> {
        match self.object(handle)? {
            Object::Dataset(dataset) => Ok(dataset),
            _ => Err(Error::Backend(format!("handle {handle} is not a dataset"))),
        }
    }
}

impl StorageBackend for Hdf5Backend {
    fn create_file(&mut self, path: &Path) -> Result<Handle> {
        let file = File::create(path)?;
        log::debug!("created HDF5 file {}", path.display());
        Ok(self.insert(Object::File(file)))
    }

    fn create_group(&mut self, parent: Handle, name: &str) -> Result<Handle> {
        let group = self.group(parent)?.create_group(name)?;
        Ok(self.insert(Object::Group(group)))
    }

    fn create_dataset(
        &mut self,
        parent: Handle,
        name: &str,
        spec: &DatasetSpec,
    ) -> Result<Handle> {
        let group = self.group(parent)?;
        let dataset = match spec.element {
            ElementType::U8 => create_dataset::<u8>(group, name, spec)?,
            ElementType::U16 => create_dataset::<u16>(group, name, spec)?,
            ElementType::U64 => create_dataset::<u64>(group, name, spec)?,
        };
        Ok(self.insert(Object::Dataset(dataset)))
    }

    fn write_attribute(&mut self, object: Handle, name: &str, value: &str) -> Result<()> {
        let chars = value
            .bytes()
            .map(|byte| FixedAscii::<1>::from_ascii(&[byte]))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| {
                Error::InvalidFormat(format!("attribute {name}={value:?} is not ASCII: {err}"))
            })?;
        let attr = self
            .location(object)?
            .new_attr::<FixedAscii<1>>()
            .shape((chars.len(),))
            .create(name)?;
        attr.write(ArrayView1::from(chars.as_slice()))?;
        Ok(())
    }

    fn write_attribute_u32(&mut self, object: Handle, name: &str, value: u32) -> Result<()> {
        let attr = self
            .location(object)?
            .new_attr::<u32>()
            .shape((1,))
            .create(name)?;
        attr.write(ArrayView1::from(&[value][..]))?;
        Ok(())
    }

    fn write_hyperslab(
        &mut self,
        dataset: Handle,
        z: usize,
        height: usize,
        width: usize,
        pixels: &PixelBuffer,
    ) -> Result<()> {
        let dataset = self.dataset(dataset)?;
        match pixels {
            PixelBuffer::U8(values) => write_plane(dataset, z, height, width, values),
            PixelBuffer::U16(values) => write_plane(dataset, z, height, width, values),
        }
    }

    fn write_whole(&mut self, dataset: Handle, values: &[u64]) -> Result<()> {
        self.dataset(dataset)?.write(ArrayView1::from(values))?;
        Ok(())
    }

    fn close(&mut self, handle: Handle) -> Result<()> {
        match self.objects.remove(&handle) {
            Some(Object::File(file)) => {
                file.close()?;
                Ok(())
            }
            Some(Object::Group(_) | Object::Dataset(_)) => Ok(()),
            None => Err(Error::Backend(format!("handle {handle} is not open"))),
        }
    }
}

fn create_dataset<T: H5Type>(group: &Group, name: &str, spec: &DatasetSpec) -> Result<Dataset> {
    let builder = group.new_dataset::<T>();
    let mut builder = match (spec.shape.as_slice(), spec.chunk.as_deref()) {
        (&[len], None) => builder.shape((len,)),
        (&[len], Some(&[chunk])) => builder.shape((len,)).chunk((chunk,)),
        (&[z, y, x], None) => builder.shape((z, y, x)),
        (&[z, y, x], Some(&[cz, cy, cx])) => builder.shape((z, y, x)).chunk((cz, cy, cx)),
        _ => {
            return Err(Error::InvalidFormat(format!(
                "unsupported dataset shape {:?} with chunk {:?}",
                spec.shape, spec.chunk
            )))
        }
    };
    if let (Some(_), Some(level)) = (&spec.chunk, spec.compression) {
        builder = builder.deflate(level);
    }
    Ok(builder.create(name)?)
}

fn write_plane<T: H5Type>(
    dataset: &Dataset,
    z: usize,
    height: usize,
    width: usize,
    values: &[T],
) -> Result<()> {
    let view = ArrayView3::from_shape((1, height, width), values).map_err(|err| {
        Error::InvalidFormat(format!(
            "plane of {} samples is not {height}x{width}: {err}",
            values.len()
        ))
    })?;
    dataset.write_slice(view, s![z..=z, 0..height, 0..width])?;
    Ok(())
}
