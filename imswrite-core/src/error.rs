//! Error types for imswrite-core.

use crate::pixel::ByteDepth;
use thiserror::Error;

/// Result type alias for imswrite core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for pyramid planning and downsampling.
#[derive(Error, Debug)]
pub enum Error {
    /// Image extents that cannot form a pyramid.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// Bit depth outside 1..=16.
    #[error("unsupported bit depth: {0} (expected 1 to 16 bits)")]
    UnsupportedBitDepth(u8),

    /// Plane buffer does not cover the whole image plane.
    #[error("plane has {actual} pixels, expected a whole plane of {expected}")]
    PlaneSizeMismatch { expected: usize, actual: usize },

    /// Plane buffer has the wrong sample type.
    #[error("plane holds {actual} samples, writer is configured for {expected}")]
    PixelTypeMismatch {
        expected: ByteDepth,
        actual: ByteDepth,
    },

    /// A batch must start with a real slice.
    #[error("batch for channel {channel} starting at slice {slice} begins with a padding slice")]
    PaddingFirstSlice { channel: usize, slice: usize },

    /// Padding slices may only trail the real slices of a batch.
    #[error("real slice {slice} of channel {channel} follows a padding slice")]
    InterleavedPadding { channel: usize, slice: usize },

    /// Batch does not match the coarsest level's Z reduction factor.
    #[error("batch holds {actual} slices, expected {expected}")]
    BatchLength { expected: usize, actual: usize },

    /// Histogram accumulator is missing for a channel mid-frame.
    #[error("no histogram accumulator for channel {channel} in frame {frame}")]
    MissingHistogram { channel: usize, frame: usize },
}
