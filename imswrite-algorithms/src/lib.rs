//! imswrite-algorithms: Pyramid downsampling for streamed Z stacks.
//!
//! This crate provides:
//! - **`SliceDownsampler`** - box-filters a batch of slices into every resolution level
//! - **`HistogramAccumulator`** - per-channel, per-level intensity histograms
//!
#![warn(missing_docs)]

mod downsample;
mod histogram;

pub use downsample::SliceDownsampler;
pub use histogram::HistogramAccumulator;

// Re-export core batch types
pub use imswrite_core::batch::{PixelBatch, SourceSlice};
