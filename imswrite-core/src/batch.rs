//! Batches exchanged between the pipeline, the downsampler and the writer.

use crate::pixel::{Histogram, PixelBuffer};

/// One staged input plane, or a synthesized padding slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSlice {
    /// Pixels of the plane; `None` for padding appended after the last real slice.
    pub pixels: Option<PixelBuffer>,
    /// Base-level Z index.
    pub slice: usize,
    pub channel: usize,
    pub frame: usize,
    /// Acquisition timestamp, "YYYY-MM-DD HH:MM:SS.XXX".
    pub timestamp: Option<String>,
}

impl SourceSlice {
    /// Creates a real plane.
    #[must_use]
    pub fn new(
        pixels: PixelBuffer,
        slice: usize,
        channel: usize,
        frame: usize,
        timestamp: Option<String>,
    ) -> Self {
        Self {
            pixels: Some(pixels),
            slice,
            channel,
            frame,
            timestamp,
        }
    }

    /// Creates a padding slice used to complete the last batch of a stack.
    #[must_use]
    pub fn padding(slice: usize, channel: usize, frame: usize) -> Self {
        Self {
            pixels: None,
            slice,
            channel,
            frame,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn is_padding(&self) -> bool {
        self.pixels.is_none()
    }
}

/// A batch of consecutive slices of one channel at every resolution level.
///
/// `levels[r][i]` holds the level-`r` slice that starts at batch offset `i`.
/// Coarser levels only populate offsets that are multiples of their Z
/// reduction factor; the remaining entries are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBatch {
    pub channel: usize,
    /// Base-level Z index of the first slice in the batch.
    pub start_slice: usize,
    pub frame: usize,
    pub timestamp: Option<String>,
    /// Number of real (non-padding) slices in the batch.
    pub real_slices: usize,
    pub levels: Vec<Vec<Option<PixelBuffer>>>,
    /// Finished per-level histograms, attached to the last batch of a channel's frame.
    pub histograms: Option<Vec<Histogram>>,
}

impl PixelBatch {
    /// Number of base-level slices covered by the batch, padding included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates the present slices of one level as `(batch offset, pixels)`.
    pub fn level_slices(&self, level: usize) -> impl Iterator<Item = (usize, &PixelBuffer)> {
        self.levels
            .get(level)
            .into_iter()
            .flat_map(|slices| slices.iter().enumerate())
            .filter_map(|(offset, slice)| slice.as_ref().map(|pixels| (offset, pixels)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_slices_skips_absent() {
        let batch = PixelBatch {
            channel: 0,
            start_slice: 4,
            frame: 0,
            timestamp: None,
            real_slices: 2,
            levels: vec![
                vec![
                    Some(PixelBuffer::from(vec![1u8])),
                    Some(PixelBuffer::from(vec![2u8])),
                ],
                vec![Some(PixelBuffer::from(vec![3u8])), None],
            ],
            histograms: None,
        };
        assert_eq!(batch.len(), 2);
        let offsets: Vec<_> = batch.level_slices(1).map(|(offset, _)| offset).collect();
        assert_eq!(offsets, vec![0]);
        assert_eq!(batch.level_slices(0).count(), 2);
        assert_eq!(batch.level_slices(5).count(), 0);
    }

    #[test]
    fn test_padding_slice() {
        let slice = SourceSlice::padding(7, 1, 0);
        assert!(slice.is_padding());
        assert!(slice.timestamp.is_none());
    }
}
