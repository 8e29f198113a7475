//! imswrite-io: Threaded Imaris writer for imswrite.
//!
//! This crate turns a stream of whole planes into a multi-resolution
//! Imaris (`.ims`) file. Planes are downsampled on the caller's thread and
//! written by a dedicated writer thread through a [`StorageBackend`]: the
//! in-memory [`MemoryBackend`], or HDF5 with the `hdf5` feature.
//!

pub mod backend;
pub mod config;
mod error;
#[cfg(feature = "hdf5")]
pub mod hdf5;
pub mod memory;
pub mod pipeline;
pub mod writer;

pub use backend::{DatasetSpec, ElementType, Handle, StorageBackend};
pub use config::{ChannelColor, WriterConfig, DEFAULT_CHANNEL_COLORS};
pub use error::{Error, Result};
#[cfg(feature = "hdf5")]
pub use hdf5::Hdf5Backend;
pub use memory::{Attribute, MemoryBackend, StoredDataset};
pub use pipeline::{DeliveryOrder, ImsWriter};
pub use writer::PyramidFileWriter;
