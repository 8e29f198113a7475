//! Writer configuration.

use crate::{Error, Result};
use imswrite_core::geometry::{plan_levels_with_limit, ResolutionLevel, LEVEL_BYTE_LIMIT};
use imswrite_core::pixel::ByteDepth;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Display colour of a channel, 8 bits per component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl ChannelColor {
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Formats the colour as three normalized components, e.g. `"0.294 0 0.51"`.
    #[must_use]
    pub fn to_attribute(self) -> String {
        [self.r, self.g, self.b]
            .iter()
            .map(|&component| format_decimal(f64::from(component) / 255.0))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Palette cycled through when no channel colours are configured.
pub const DEFAULT_CHANNEL_COLORS: [ChannelColor; 8] = [
    ChannelColor::new(75, 0, 130),
    ChannelColor::new(0, 0, 255),
    ChannelColor::new(0, 255, 0),
    ChannelColor::new(255, 255, 0),
    ChannelColor::new(255, 0, 0),
    ChannelColor::new(255, 175, 175),
    ChannelColor::new(255, 200, 0),
    ChannelColor::new(255, 0, 255),
];

/// Dimensions and output options of one `.ims` file.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WriterConfig {
    /// Plane width in pixels.
    pub width: usize,
    /// Plane height in pixels.
    pub height: usize,
    /// Z slices per channel and frame.
    pub slices: usize,
    pub channels: usize,
    /// Number of time points.
    pub frames: usize,
    /// Significant bits per sample (1..=16).
    pub bit_depth: u8,
    /// Pixel spacing in X and Y, in micrometres.
    pub pixel_size_xy: f64,
    /// Slice spacing in micrometres.
    pub pixel_size_z: f64,
    /// Per-channel display colours; `None` cycles [`DEFAULT_CHANNEL_COLORS`].
    pub channel_colors: Option<Vec<ChannelColor>>,
    /// DEFLATE level for pixel data; `None` stores it uncompressed.
    pub compression: Option<u8>,
    /// Bounded hand-off queue depth between the caller and the writer thread.
    pub queue_depth: usize,
    /// A level larger than this many bytes gets a coarser child level.
    pub max_level_bytes: u64,
    /// Value of the `Creator` attribute.
    pub creator: String,
}

impl WriterConfig {
    /// Creates a single-channel, single-frame, 8-bit configuration.
    #[must_use]
    pub fn new(width: usize, height: usize, slices: usize) -> Self {
        Self {
            width,
            height,
            slices,
            channels: 1,
            frames: 1,
            bit_depth: 8,
            pixel_size_xy: 1.0,
            pixel_size_z: 1.0,
            channel_colors: None,
            compression: Some(2),
            queue_depth: 2,
            max_level_bytes: LEVEL_BYTE_LIMIT,
            creator: "imswrite".to_string(),
        }
    }

    #[must_use]
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    #[must_use]
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    /// Set the significant bit depth. Checked by [`Self::validate`].
    #[must_use]
    pub fn with_bit_depth(mut self, bit_depth: u8) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    /// Set the pixel spacing in micrometres.
    #[must_use]
    pub fn with_pixel_size(mut self, xy: f64, z: f64) -> Self {
        self.pixel_size_xy = xy;
        self.pixel_size_z = z;
        self
    }

    #[must_use]
    pub fn with_channel_colors(mut self, colors: Vec<ChannelColor>) -> Self {
        self.channel_colors = Some(colors);
        self
    }

    /// Set the DEFLATE level, or `None` to disable compression.
    #[must_use]
    pub fn with_compression(mut self, level: Option<u8>) -> Self {
        self.compression = level;
        self
    }

    /// Set the bounded queue depth.
    ///
    /// Values less than 1 are clamped to 1. Use [`Self::try_with_queue_depth`]
    /// to surface invalid values as an error instead.
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Set the level size above which a coarser level is added.
    #[must_use]
    pub fn with_max_level_bytes(mut self, bytes: u64) -> Self {
        self.max_level_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    /// Fallible variant of [`Self::with_queue_depth`].
    ///
    /// # Errors
    /// Returns an error if `depth` is 0.
    pub fn try_with_queue_depth(mut self, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(Error::InvalidInput(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        self.queue_depth = depth;
        Ok(self)
    }

    /// Fallible variant of [`Self::with_bit_depth`].
    ///
    /// # Errors
    /// Returns an error if `bit_depth` is outside 1..=16.
    pub fn try_with_bit_depth(mut self, bit_depth: u8) -> Result<Self> {
        ByteDepth::from_bit_depth(bit_depth)?;
        self.bit_depth = bit_depth;
        Ok(self)
    }

    /// Storage width derived from the bit depth.
    ///
    /// # Errors
    /// Returns an error if the bit depth is outside 1..=16.
    pub fn byte_depth(&self) -> Result<ByteDepth> {
        Ok(ByteDepth::from_bit_depth(self.bit_depth)?)
    }

    /// Number of planes that make up one frame.
    #[must_use]
    pub fn planes_per_frame(&self) -> usize {
        self.slices * self.channels
    }

    /// Largest representable sample value, `2^bit_depth - 1`.
    #[must_use]
    pub fn max_sample_value(&self) -> u32 {
        (1u32 << self.bit_depth.min(16)) - 1
    }

    /// Display colour of a channel.
    #[must_use]
    pub fn channel_color(&self, channel: usize) -> ChannelColor {
        match &self.channel_colors {
            Some(colors) if !colors.is_empty() => colors[channel % colors.len()],
            _ => DEFAULT_CHANNEL_COLORS[channel % DEFAULT_CHANNEL_COLORS.len()],
        }
    }

    /// Checks the configuration before any thread or file is created.
    ///
    /// # Errors
    /// Returns an error for zero extents, an unsupported bit depth, a zero
    /// queue depth, or non-positive pixel spacing.
    pub fn validate(&self) -> Result<()> {
        let extents = [
            ("width", self.width),
            ("height", self.height),
            ("slices", self.slices),
            ("channels", self.channels),
            ("frames", self.frames),
        ];
        for (name, value) in extents {
            if value == 0 {
                return Err(Error::InvalidInput(format!("{name} must be at least 1")));
            }
        }
        self.byte_depth()?;
        if self.queue_depth == 0 {
            return Err(Error::InvalidInput(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        if !(self.pixel_size_xy > 0.0 && self.pixel_size_z > 0.0) {
            return Err(Error::InvalidInput(format!(
                "pixel sizes must be positive (xy={}, z={})",
                self.pixel_size_xy, self.pixel_size_z
            )));
        }
        if let Some(level) = self.compression {
            if level > 9 {
                return Err(Error::InvalidInput(format!(
                    "DEFLATE level must be 0..=9, got {level}"
                )));
            }
        }
        Ok(())
    }

    /// Plans the resolution pyramid for this configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn plan_levels(&self) -> Result<Vec<ResolutionLevel>> {
        self.validate()?;
        Ok(plan_levels_with_limit(
            self.width,
            self.height,
            self.slices,
            self.frames,
            self.byte_depth()?,
            self.max_level_bytes,
        )?)
    }
}

/// Formats a value with at most three decimals and no trailing zeros.
///
/// `0.5098` becomes `"0.51"`, `1.0` becomes `"1"`.
#[must_use]
pub fn format_decimal(value: f64) -> String {
    let text = format!("{value:.3}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WriterConfig::new(512, 256, 10);
        assert_eq!(config.channels, 1);
        assert_eq!(config.frames, 1);
        assert_eq!(config.compression, Some(2));
        assert_eq!(config.queue_depth, 2);
        assert_eq!(config.max_level_bytes, LEVEL_BYTE_LIMIT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(WriterConfig::new(0, 4, 4).validate().is_err());
        assert!(WriterConfig::new(4, 4, 4).with_channels(0).validate().is_err());
        assert!(WriterConfig::new(4, 4, 4).with_bit_depth(17).validate().is_err());
        assert!(WriterConfig::new(4, 4, 4).with_bit_depth(0).validate().is_err());
        assert!(WriterConfig::new(4, 4, 4)
            .with_pixel_size(0.0, 1.0)
            .validate()
            .is_err());
        assert!(WriterConfig::new(4, 4, 4)
            .with_compression(Some(12))
            .validate()
            .is_err());
    }

    #[test]
    fn test_queue_depth_builders() {
        let config = WriterConfig::new(4, 4, 4).with_queue_depth(0);
        assert_eq!(config.queue_depth, 1);
        assert!(WriterConfig::new(4, 4, 4).try_with_queue_depth(0).is_err());
        assert_eq!(
            WriterConfig::new(4, 4, 4)
                .try_with_queue_depth(5)
                .unwrap()
                .queue_depth,
            5
        );
        assert!(WriterConfig::new(4, 4, 4).try_with_bit_depth(20).is_err());
    }

    #[test]
    fn test_byte_depth_and_max_value() {
        let config = WriterConfig::new(4, 4, 4).with_bit_depth(12);
        assert_eq!(config.byte_depth().unwrap(), ByteDepth::U16);
        assert_eq!(config.max_sample_value(), 4_095);
        assert_eq!(WriterConfig::new(4, 4, 4).max_sample_value(), 255);
    }

    #[test]
    fn test_channel_colors_cycle() {
        let config = WriterConfig::new(4, 4, 4);
        assert_eq!(config.channel_color(0), ChannelColor::new(75, 0, 130));
        assert_eq!(config.channel_color(8), ChannelColor::new(75, 0, 130));

        let config = config.with_channel_colors(vec![ChannelColor::new(1, 2, 3)]);
        assert_eq!(config.channel_color(3), ChannelColor::new(1, 2, 3));
    }

    #[test]
    fn test_color_attribute() {
        assert_eq!(ChannelColor::new(75, 0, 130).to_attribute(), "0.294 0 0.51");
        assert_eq!(ChannelColor::new(255, 200, 0).to_attribute(), "1 0.784 0");
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(0.0), "0");
        assert_eq!(format_decimal(51.2), "51.2");
        assert_eq!(format_decimal(1.0), "1");
        assert_eq!(format_decimal(0.333_33), "0.333");
        assert_eq!(format_decimal(120.0), "120");
    }

    #[test]
    fn test_plan_levels_uses_limit() {
        let levels = WriterConfig::new(4, 4, 4)
            .with_max_level_bytes(1)
            .plan_levels()
            .unwrap();
        assert_eq!(levels.len(), 3);
        assert!(WriterConfig::new(4, 4, 0).plan_levels().is_err());
    }
}
