//! imswrite-core: Core types for multi-resolution Imaris writing.
//!
//! This crate provides the resolution pyramid planner, chunk layout
//! optimisation, pixel buffer types and the batch structures exchanged
//! between the downsampler and the file writer.
//!

pub mod batch;
pub mod error;
pub mod geometry;
pub mod pixel;

pub use batch::{PixelBatch, SourceSlice};
pub use error::{Error, Result};
pub use geometry::{
    plan_chunk_layout, plan_levels, plan_levels_with_limit, ChunkLayout, ChunkShape, Extents,
    ResolutionLevel, CHUNK_BYTE_BUDGET, LEVEL_BYTE_LIMIT,
};
pub use pixel::{histogram_bin, ByteDepth, Histogram, PixelBuffer, HISTOGRAM_BINS};
