//! Box-filter downsampling of slice batches into every resolution level.

use crate::histogram::HistogramAccumulator;
use imswrite_core::batch::{PixelBatch, SourceSlice};
use imswrite_core::error::{Error, Result};
use imswrite_core::geometry::{Extents, ResolutionLevel};
use imswrite_core::pixel::{histogram_bin, Histogram, PixelBuffer, HISTOGRAM_BINS};
use rayon::prelude::*;
use std::sync::Arc;

/// Turns batches of full-resolution slices into pyramid batches.
///
/// A batch is the smallest run of consecutive slices of one channel that
/// yields one slice of the coarsest level, so its length equals that level's
/// Z reduction factor.
#[derive(Debug, Clone)]
pub struct SliceDownsampler {
    levels: Arc<[ResolutionLevel]>,
    bit_depth: u8,
}

impl SliceDownsampler {
    /// Creates a downsampler for a planned pyramid.
    ///
    /// # Errors
    /// Returns an error if `levels` is empty or `bit_depth` does not match
    /// the levels' sample width.
    pub fn new(levels: Arc<[ResolutionLevel]>, bit_depth: u8) -> Result<Self> {
        let Some(base) = levels.first() else {
            return Err(Error::InvalidDimensions(
                "pyramid has no resolution levels".to_string(),
            ));
        };
        let depth = imswrite_core::pixel::ByteDepth::from_bit_depth(bit_depth)?;
        if depth != base.byte_depth {
            return Err(Error::PixelTypeMismatch {
                expected: base.byte_depth,
                actual: depth,
            });
        }
        Ok(Self { levels, bit_depth })
    }

    /// Number of slices per batch (the coarsest level's Z reduction factor).
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.levels.last().map_or(1, |level| level.reduction.z)
    }

    /// The resolution levels this downsampler produces.
    #[must_use]
    pub fn levels(&self) -> &[ResolutionLevel] {
        &self.levels
    }

    /// Downsamples one batch and updates the channel's histograms.
    ///
    /// Histograms for the channel are started when the batch holds slice 0
    /// and are attached to the returned batch, and removed from
    /// `histograms`, once the batch reaches the last slice of the stack.
    ///
    /// # Errors
    /// Returns an error if the batch has the wrong length, starts with or
    /// interleaves padding, holds planes of the wrong size or type, or
    /// continues a channel whose histograms were never started.
    pub fn process(
        &self,
        histograms: &mut HistogramAccumulator,
        slices: Vec<SourceSlice>,
    ) -> Result<PixelBatch> {
        self.validate(&slices)?;
        let base = self.levels[0].image;
        let first = &slices[0];
        let (channel, start_slice, frame) = (first.channel, first.slice, first.frame);

        if start_slice == 0 {
            histograms.begin(channel, self.levels.len());
        }
        let running = histograms
            .get_mut(channel)
            .ok_or(Error::MissingHistogram { channel, frame })?;

        let coarse: Vec<(Vec<Option<PixelBuffer>>, Histogram)> = self.levels[1..]
            .par_iter()
            .map(|level| downsample_level(level, base, &slices, self.bit_depth))
            .collect();

        let mut base_histogram = [0u64; HISTOGRAM_BINS];
        for pixels in slices.iter().filter_map(|slice| slice.pixels.as_ref()) {
            match pixels {
                PixelBuffer::U8(values) => {
                    for &value in values {
                        base_histogram[histogram_bin(u32::from(value), self.bit_depth)] += 1;
                    }
                }
                PixelBuffer::U16(values) => {
                    for &value in values {
                        base_histogram[histogram_bin(u32::from(value), self.bit_depth)] += 1;
                    }
                }
            }
        }

        add_histogram(&mut running[0], &base_histogram);
        for (level, (_, histogram)) in coarse.iter().enumerate() {
            add_histogram(&mut running[level + 1], histogram);
        }

        let timestamp = first.timestamp.clone();
        let real_slices = slices.iter().filter(|slice| !slice.is_padding()).count();
        let batch_len = slices.len();

        let mut levels = Vec::with_capacity(self.levels.len());
        levels.push(slices.into_iter().map(|slice| slice.pixels).collect());
        levels.extend(coarse.into_iter().map(|(pixels, _)| pixels));

        let finished = start_slice + batch_len >= base.z;
        let histograms = if finished {
            log::debug!("channel {channel} frame {frame}: histograms complete");
            histograms.take(channel)
        } else {
            None
        };

        Ok(PixelBatch {
            channel,
            start_slice,
            frame,
            timestamp,
            real_slices,
            levels,
            histograms,
        })
    }

    fn validate(&self, slices: &[SourceSlice]) -> Result<()> {
        let expected = self.batch_size();
        if slices.len() != expected {
            return Err(Error::BatchLength {
                expected,
                actual: slices.len(),
            });
        }
        let first = &slices[0];
        if first.is_padding() {
            return Err(Error::PaddingFirstSlice {
                channel: first.channel,
                slice: first.slice,
            });
        }

        let base = &self.levels[0];
        let mut seen_padding = false;
        for slice in slices {
            debug_assert_eq!(slice.channel, first.channel);
            debug_assert_eq!(slice.frame, first.frame);
            match &slice.pixels {
                Some(pixels) => {
                    if seen_padding {
                        return Err(Error::InterleavedPadding {
                            channel: slice.channel,
                            slice: slice.slice,
                        });
                    }
                    pixels.validate_plane(base.byte_depth, base.image.plane_len())?;
                }
                None => seen_padding = true,
            }
        }
        Ok(())
    }
}

fn add_histogram(total: &mut Histogram, part: &Histogram) {
    for (bin, count) in total.iter_mut().zip(part) {
        *bin += count;
    }
}

/// Averages a batch into one coarser level.
///
/// Each output cell sums the base pixels that map onto it and is finalized
/// when its last contributing sample has been added. Cells on the image
/// border or at the end of the batch average over the samples that exist.
/// Padding slices reuse the first slice's pixels so the last coarse slice of
/// a stack is not darkened.
fn downsample_level(
    level: &ResolutionLevel,
    base: Extents,
    slices: &[SourceSlice],
    bit_depth: u8,
) -> (Vec<Option<PixelBuffer>>, Histogram) {
    let red = level.reduction;
    let (out_w, out_h) = (level.image.x, level.image.y);
    let plane_len = out_w * out_h;
    let n = slices.len();

    let mut sums: Vec<Option<Vec<u64>>> = (0..n)
        .map(|i| (i % red.z == 0).then(|| vec![0u64; plane_len]))
        .collect();
    let mut outputs: Vec<Option<PixelBuffer>> = (0..n)
        .map(|i| (i % red.z == 0).then(|| PixelBuffer::zeros(level.byte_depth, plane_len)))
        .collect();
    let mut histogram = [0u64; HISTOGRAM_BINS];

    let Some(first) = slices.first().and_then(|slice| slice.pixels.as_ref()) else {
        return (outputs, histogram);
    };

    for (i, slice) in slices.iter().enumerate() {
        let dst = i - i % red.z;
        let z_last = i % red.z == red.z - 1 || i == n - 1;
        let z_count = (n - dst).min(red.z) as u64;
        let (pixels, real) = match &slice.pixels {
            Some(pixels) => (pixels, true),
            None => (first, false),
        };
        let (Some(sum), Some(out)) = (sums[dst].as_mut(), outputs[dst].as_mut()) else {
            continue;
        };

        for y in 0..base.y {
            let dy = y / red.y;
            if dy >= out_h {
                break;
            }
            let y_last = y % red.y == red.y - 1 || y == base.y - 1;
            let y_count = (base.y - dy * red.y).min(red.y) as u64;
            let row = y * base.x;

            for x in 0..base.x {
                let dx = x / red.x;
                if dx >= out_w {
                    break;
                }
                let value = pixels.sample(row + x);
                if real {
                    histogram[histogram_bin(value, bit_depth)] += 1;
                }
                let cell = dy * out_w + dx;
                sum[cell] += u64::from(value);

                if z_last && y_last && (x % red.x == red.x - 1 || x == base.x - 1) {
                    let x_count = (base.x - dx * red.x).min(red.x) as u64;
                    let count = x_count * y_count * z_count;
                    out.set_sample(cell, (sum[cell] + count / 2) / count);
                }
            }
        }
    }

    (outputs, histogram)
}
