//! Pixel buffers and intensity histograms.
//!
//! Planes arrive either as 8-bit or 16-bit unsigned samples. `PixelBuffer`
//! carries both variants so the downsampler and writer can dispatch on the
//! sample type with a `match` instead of inspecting types at runtime.

use crate::{Error, Result};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of bins in every per-level intensity histogram.
pub const HISTOGRAM_BINS: usize = 256;

/// Per-level intensity histogram.
pub type Histogram = [u64; HISTOGRAM_BINS];

/// Storage width of one pixel sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ByteDepth {
    /// Unsigned 8-bit samples.
    U8,
    /// Unsigned 16-bit samples.
    U16,
}

impl ByteDepth {
    /// Derives the storage width from a significant bit depth.
    ///
    /// Depths of 1..=8 bits are stored as bytes, 9..=16 bits as `u16`.
    ///
    /// # Errors
    /// Returns an error for a bit depth of 0 or above 16.
    pub fn from_bit_depth(bit_depth: u8) -> Result<Self> {
        match bit_depth {
            1..=8 => Ok(Self::U8),
            9..=16 => Ok(Self::U16),
            other => Err(Error::UnsupportedBitDepth(other)),
        }
    }

    /// Number of bytes per sample.
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
        }
    }
}

impl fmt::Display for ByteDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8 => f.write_str("8-bit"),
            Self::U16 => f.write_str("16-bit"),
        }
    }
}

/// A plane of unsigned pixel samples in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelBuffer {
    /// 8-bit samples.
    U8(Vec<u8>),
    /// 16-bit samples.
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Creates a zero-filled buffer.
    #[must_use]
    pub fn zeros(depth: ByteDepth, len: usize) -> Self {
        match depth {
            ByteDepth::U8 => Self::U8(vec![0; len]),
            ByteDepth::U16 => Self::U16(vec![0; len]),
        }
    }

    /// Creates a buffer filled with a single value, truncated to the sample width.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn filled(depth: ByteDepth, len: usize, value: u32) -> Self {
        match depth {
            ByteDepth::U8 => Self::U8(vec![value as u8; len]),
            ByteDepth::U16 => Self::U16(vec![value as u16; len]),
        }
    }

    /// Returns the number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::U8(values) => values.len(),
            Self::U16(values) => values.len(),
        }
    }

    /// Returns true if the buffer holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the sample width.
    #[must_use]
    pub fn byte_depth(&self) -> ByteDepth {
        match self {
            Self::U8(_) => ByteDepth::U8,
            Self::U16(_) => ByteDepth::U16,
        }
    }

    /// Reads one sample as an unsigned value.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    #[inline]
    #[must_use]
    pub fn sample(&self, index: usize) -> u32 {
        match self {
            Self::U8(values) => u32::from(values[index]),
            Self::U16(values) => u32::from(values[index]),
        }
    }

    /// Stores one sample, truncating to the sample width.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_sample(&mut self, index: usize, value: u64) {
        match self {
            Self::U8(values) => values[index] = value as u8,
            Self::U16(values) => values[index] = value as u16,
        }
    }

    /// Checks that this buffer is a whole plane of the expected sample type.
    ///
    /// # Errors
    /// Returns an error if the sample type or the sample count differ.
    pub fn validate_plane(&self, depth: ByteDepth, pixels_per_plane: usize) -> Result<()> {
        if self.byte_depth() != depth {
            return Err(Error::PixelTypeMismatch {
                expected: depth,
                actual: self.byte_depth(),
            });
        }
        if self.len() != pixels_per_plane {
            return Err(Error::PlaneSizeMismatch {
                expected: pixels_per_plane,
                actual: self.len(),
            });
        }
        Ok(())
    }
}

impl From<Vec<u8>> for PixelBuffer {
    fn from(values: Vec<u8>) -> Self {
        Self::U8(values)
    }
}

impl From<Vec<u16>> for PixelBuffer {
    fn from(values: Vec<u16>) -> Self {
        Self::U16(values)
    }
}

/// Maps a raw sample to its histogram bin: `floor(255 * value / 2^bit_depth)`.
///
/// Samples above the nominal bit depth land in the last bin.
#[inline]
#[must_use]
pub fn histogram_bin(value: u32, bit_depth: u8) -> usize {
    let bin = (u64::from(value) * 255) >> bit_depth;
    usize::try_from(bin).map_or(HISTOGRAM_BINS - 1, |bin| bin.min(HISTOGRAM_BINS - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_depth_from_bits() {
        assert_eq!(ByteDepth::from_bit_depth(8).unwrap(), ByteDepth::U8);
        assert_eq!(ByteDepth::from_bit_depth(1).unwrap(), ByteDepth::U8);
        assert_eq!(ByteDepth::from_bit_depth(12).unwrap(), ByteDepth::U16);
        assert_eq!(ByteDepth::from_bit_depth(16).unwrap(), ByteDepth::U16);
        assert!(matches!(
            ByteDepth::from_bit_depth(0),
            Err(Error::UnsupportedBitDepth(0))
        ));
        assert!(ByteDepth::from_bit_depth(32).is_err());
    }

    #[test]
    fn test_histogram_bin() {
        assert_eq!(histogram_bin(0, 8), 0);
        assert_eq!(histogram_bin(40, 8), 39);
        assert_eq!(histogram_bin(255, 8), 254);
        assert_eq!(histogram_bin(65_535, 16), 254);
        assert_eq!(histogram_bin(4_095, 12), 254);
        // out-of-range samples for a 12-bit camera are clamped
        assert_eq!(histogram_bin(65_535, 12), 255);
    }

    #[test]
    fn test_validate_plane() {
        let plane = PixelBuffer::from(vec![0u16; 12]);
        assert!(plane.validate_plane(ByteDepth::U16, 12).is_ok());
        assert!(matches!(
            plane.validate_plane(ByteDepth::U8, 12),
            Err(Error::PixelTypeMismatch { .. })
        ));
        assert!(matches!(
            plane.validate_plane(ByteDepth::U16, 16),
            Err(Error::PlaneSizeMismatch {
                expected: 16,
                actual: 12
            })
        ));
    }

    #[test]
    fn test_sample_roundtrip_truncates() {
        let mut buffer = PixelBuffer::zeros(ByteDepth::U8, 2);
        buffer.set_sample(0, 300);
        buffer.set_sample(1, 7);
        assert_eq!(buffer.sample(0), 44);
        assert_eq!(buffer.sample(1), 7);
    }
}
