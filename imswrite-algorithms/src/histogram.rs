//! Per-channel histogram accumulation across the batches of a frame.

use imswrite_core::pixel::{Histogram, HISTOGRAM_BINS};
use std::collections::BTreeMap;

/// Running per-level histograms, keyed by channel.
///
/// An entry exists from the batch holding slice 0 of a channel's frame
/// until the batch that reaches the channel's last slice, which takes it.
#[derive(Debug, Default)]
pub struct HistogramAccumulator {
    channels: BTreeMap<usize, Vec<Histogram>>,
}

impl HistogramAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts fresh histograms for a channel, replacing any unfinished ones.
    pub fn begin(&mut self, channel: usize, num_levels: usize) {
        self.channels
            .insert(channel, vec![[0; HISTOGRAM_BINS]; num_levels]);
    }

    /// Returns the running histograms of a channel.
    pub fn get_mut(&mut self, channel: usize) -> Option<&mut Vec<Histogram>> {
        self.channels.get_mut(&channel)
    }

    /// Removes and returns the histograms of a channel.
    pub fn take(&mut self, channel: usize) -> Option<Vec<Histogram>> {
        self.channels.remove(&channel)
    }

    /// Returns true if a channel has running histograms.
    #[must_use]
    pub fn contains(&self, channel: usize) -> bool {
        self.channels.contains_key(&channel)
    }

    /// Number of channels with running histograms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channel has running histograms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_take_cycle() {
        let mut acc = HistogramAccumulator::new();
        assert!(acc.is_empty());

        acc.begin(2, 3);
        acc.get_mut(2).unwrap()[1][5] += 4;
        assert!(acc.contains(2));
        assert!(!acc.contains(0));

        let finished = acc.take(2).unwrap();
        assert_eq!(finished.len(), 3);
        assert_eq!(finished[1][5], 4);
        assert!(acc.is_empty());
        assert!(acc.take(2).is_none());
    }

    #[test]
    fn test_begin_resets() {
        let mut acc = HistogramAccumulator::new();
        acc.begin(0, 1);
        acc.get_mut(0).unwrap()[0][0] = 9;
        acc.begin(0, 1);
        assert_eq!(acc.get_mut(0).unwrap()[0][0], 0);
        assert_eq!(acc.len(), 1);
    }
}
