//! Imaris file layout on top of a [`StorageBackend`].
//!
//! `PyramidFileWriter` runs on the writer thread. It builds the file
//! skeleton when the first batch arrives, opens one TimePoint per frame,
//! writes every slice of every level as a one-slice hyperslab and closes
//! the TimePoint once all planes of the frame have been written.

use crate::backend::{DatasetSpec, ElementType, Handle, StorageBackend};
use crate::config::{format_decimal, WriterConfig};
use crate::{Error, Result};
use imswrite_core::batch::PixelBatch;
use imswrite_core::geometry::ResolutionLevel;
use imswrite_core::pixel::HISTOGRAM_BINS;
use std::path::PathBuf;
use std::sync::Arc;

const IMARIS_VERSION: &str = "7.6";
const IMARIS_FILE_VERSION: &str = "5.5.0";
const NOT_SPECIFIED_DESCRIPTION: &str = "(description not specified)";
const NOT_SPECIFIED_NAME: &str = "(name not specified)";

struct FileHandles {
    root: Handle,
    time_info: Handle,
    levels: Vec<Handle>,
}

struct ChannelDatasets {
    data: Handle,
    /// `None` once the histogram has been written and closed.
    histogram: Option<Handle>,
}

/// The open `TimePoint <f>` groups of a frame, indexed `[level][channel]`.
struct TimePoint {
    frame: usize,
    channels: Vec<Vec<ChannelDatasets>>,
    slices_written: usize,
}

/// Writes downsampled batches into the Imaris group hierarchy.
pub struct PyramidFileWriter<B: StorageBackend> {
    backend: B,
    path: PathBuf,
    config: WriterConfig,
    levels: Arc<[ResolutionLevel]>,
    handles: Option<FileHandles>,
    time_point: Option<TimePoint>,
    frames_completed: usize,
}

impl<B: StorageBackend> PyramidFileWriter<B> {
    /// Creates a writer. Nothing is written until the first batch.
    #[must_use]
    pub fn new(
        backend: B,
        path: impl Into<PathBuf>,
        config: WriterConfig,
        levels: Arc<[ResolutionLevel]>,
    ) -> Self {
        Self {
            backend,
            path: path.into(),
            config,
            levels,
            handles: None,
            time_point: None,
            frames_completed: 0,
        }
    }

    /// Number of frames whose TimePoint has been closed.
    #[must_use]
    pub fn frames_completed(&self) -> usize {
        self.frames_completed
    }

    /// Writes one batch, creating the file and TimePoint as needed.
    ///
    /// # Errors
    /// Returns an error if the backend fails, the batch belongs to a frame
    /// other than the open one, a histogram arrives twice, or a frame
    /// completes without all of its histograms.
    pub fn consume(&mut self, batch: PixelBatch) -> Result<()> {
        if self.handles.is_none() {
            self.create_file(batch.timestamp.as_deref())?;
        }
        if self.time_point.is_none() {
            self.open_time_point(batch.frame, batch.timestamp.as_deref())?;
        }
        let Some(time_point) = self.time_point.as_mut() else {
            return Err(Error::Sequencing("no open TimePoint".to_string()));
        };
        if time_point.frame != batch.frame {
            return Err(Error::Sequencing(format!(
                "batch for frame {} arrived while frame {} is open",
                batch.frame, time_point.frame
            )));
        }
        let channel = batch.channel;
        if channel >= self.config.channels || batch.levels.len() != self.levels.len() {
            return Err(Error::Sequencing(format!(
                "batch for channel {channel} with {} levels does not fit the file",
                batch.levels.len()
            )));
        }
        if let Some(histograms) = &batch.histograms {
            if histograms.len() != self.levels.len() {
                return Err(Error::Sequencing(format!(
                    "{} histograms for {} levels",
                    histograms.len(),
                    self.levels.len()
                )));
            }
        }

        for (index, level) in self.levels.iter().enumerate() {
            let data = time_point.channels[index][channel].data;
            for (offset, pixels) in batch.level_slices(index) {
                // When reduction.z does not divide the batch size, the last
                // coarse slice of one batch and the first of the next map to
                // the same z. The later batch overwrites it.
                let z = (batch.start_slice + offset) / level.reduction.z;
                if z >= level.image.z {
                    continue;
                }
                self.backend
                    .write_hyperslab(data, z, level.image.y, level.image.x, pixels)?;
            }
        }

        if let Some(histograms) = &batch.histograms {
            for (index, histogram) in histograms.iter().enumerate() {
                let Some(handle) = time_point.channels[index][channel].histogram.take() else {
                    return Err(Error::Sequencing(format!(
                        "histogram for channel {channel} level {index} of frame {} written twice",
                        batch.frame
                    )));
                };
                self.backend.write_whole(handle, histogram)?;
                self.backend.close(handle)?;
            }
        }

        time_point.slices_written += batch.real_slices;
        let expected = self.config.planes_per_frame();
        if time_point.slices_written > expected {
            return Err(Error::Sequencing(format!(
                "frame {} received {} slices, expected {expected}",
                batch.frame, time_point.slices_written
            )));
        }
        if time_point.slices_written == expected {
            self.close_time_point()?;
        }
        Ok(())
    }

    /// Closes any open TimePoint, the level groups and the file.
    ///
    /// A file is still created if no batch was ever consumed.
    ///
    /// # Errors
    /// Returns an error if the backend fails to close a handle.
    pub fn close(&mut self) -> Result<()> {
        if self.handles.is_none() {
            log::warn!("closing {} before any plane was written", self.path.display());
            self.create_file(None)?;
        }
        if let Some(time_point) = self.time_point.take() {
            log::warn!(
                "frame {} closed after {} of {} slices",
                time_point.frame,
                time_point.slices_written,
                self.config.planes_per_frame()
            );
            self.release_time_point(time_point)?;
        }
        if let Some(handles) = self.handles.take() {
            for level in handles.levels {
                self.backend.close(level)?;
            }
            self.backend.close(handles.time_info)?;
            self.backend.close(handles.root)?;
            log::info!(
                "closed {} ({} of {} frames)",
                self.path.display(),
                self.frames_completed,
                self.config.frames
            );
        }
        Ok(())
    }

    fn create_file(&mut self, timestamp: Option<&str>) -> Result<()> {
        let root = self.backend.create_file(&self.path)?;
        log::info!(
            "creating {} with {} resolution levels",
            self.path.display(),
            self.levels.len()
        );
        for (name, value) in [
            ("DataSetDirectoryName", "DataSet"),
            ("DataSetInfoDirectoryName", "DataSetInfo"),
            ("ImarisDataSet", "ImarisDataSet"),
            ("ImarisVersion", IMARIS_FILE_VERSION),
        ] {
            self.backend.write_attribute(root, name, value)?;
        }
        self.backend.write_attribute_u32(root, "NumberOfDataSets", 1)?;

        let time_info = self.write_dataset_info(root, timestamp)?;

        let dataset = self.backend.create_group(root, "DataSet")?;
        let mut levels = Vec::with_capacity(self.levels.len());
        for level in self.levels.iter() {
            let group = self
                .backend
                .create_group(dataset, &format!("ResolutionLevel {}", level.index))?;
            levels.push(group);
        }
        self.backend.close(dataset)?;

        self.handles = Some(FileHandles {
            root,
            time_info,
            levels,
        });
        Ok(())
    }

    /// Writes `/DataSetInfo` and returns the still-open `TimeInfo` group.
    fn write_dataset_info(&mut self, root: Handle, timestamp: Option<&str>) -> Result<Handle> {
        let config = &self.config;
        let backend = &mut self.backend;
        let info = backend.create_group(root, "DataSetInfo")?;

        let max_value = config.max_sample_value();
        for channel in 0..config.channels {
            let group = backend.create_group(info, &format!("Channel {channel}"))?;
            let color = config.channel_color(channel).to_attribute();
            let color_range = format!("0 {max_value}");
            for (name, value) in [
                ("Color", color.as_str()),
                ("ColorMode", "BaseColor"),
                ("ColorOpacity", "1.000"),
                ("ColorRange", color_range.as_str()),
                ("Description", NOT_SPECIFIED_DESCRIPTION),
                ("GammaCorrection", "1.000"),
                ("Name", NOT_SPECIFIED_NAME),
            ] {
                backend.write_attribute(group, name, value)?;
            }
            backend.close(group)?;
        }

        #[allow(clippy::cast_precision_loss)]
        let ext_max = [
            config.width as f64 * config.pixel_size_xy,
            config.height as f64 * config.pixel_size_xy,
            config.slices as f64 * config.pixel_size_z,
        ];
        let image = backend.create_group(info, "Image")?;
        backend.write_attribute(image, "Description", NOT_SPECIFIED_DESCRIPTION)?;
        for (axis, extent) in ext_max.iter().enumerate() {
            backend.write_attribute(image, &format!("ExtMax{axis}"), &format_decimal(*extent))?;
        }
        for axis in 0..3 {
            backend.write_attribute(image, &format!("ExtMin{axis}"), "0")?;
        }
        backend.write_attribute(image, "Name", NOT_SPECIFIED_NAME)?;
        if let Some(date) = timestamp.filter(|date| !date.is_empty()) {
            backend.write_attribute(image, "RecordingDate", date)?;
        }
        backend.write_attribute(image, "Unit", "um")?;
        backend.write_attribute(image, "X", &config.width.to_string())?;
        backend.write_attribute(image, "Y", &config.height.to_string())?;
        backend.write_attribute(image, "Z", &config.slices.to_string())?;
        backend.close(image)?;

        let imaris = backend.create_group(info, "Imaris")?;
        backend.write_attribute(imaris, "Version", IMARIS_VERSION)?;
        backend.close(imaris)?;

        let dataset = backend.create_group(info, "ImarisDataSet")?;
        backend.write_attribute(dataset, "Creator", &config.creator)?;
        backend.write_attribute(dataset, "NumberOfImages", "1")?;
        backend.write_attribute(dataset, "Version", IMARIS_VERSION)?;
        backend.close(dataset)?;

        let log_group = backend.create_group(info, "Log")?;
        backend.write_attribute(log_group, "Entries", "0")?;
        backend.close(log_group)?;

        let time_info = backend.create_group(info, "TimeInfo")?;
        let frames = config.frames.to_string();
        backend.write_attribute(time_info, "DatasetTimePoints", &frames)?;
        backend.write_attribute(time_info, "FileTimePoints", &frames)?;

        backend.close(info)?;
        Ok(time_info)
    }

    fn open_time_point(&mut self, frame: usize, timestamp: Option<&str>) -> Result<()> {
        let Some(handles) = self.handles.as_ref() else {
            return Err(Error::Sequencing("file skeleton missing".to_string()));
        };
        if frame >= self.config.frames {
            return Err(Error::Sequencing(format!(
                "frame {frame} exceeds the configured {} frames",
                self.config.frames
            )));
        }
        log::debug!("opening TimePoint {frame}");
        if let Some(date) = timestamp.filter(|date| !date.is_empty()) {
            self.backend
                .write_attribute(handles.time_info, &format!("TimePoint{}", frame + 1), date)?;
        }

        let element = ElementType::from(self.levels[0].byte_depth);
        let histogram_max = format!("{}.000", self.config.max_sample_value());
        let mut channels = Vec::with_capacity(self.levels.len());
        for (level, &level_group) in self.levels.iter().zip(&handles.levels) {
            let group = self
                .backend
                .create_group(level_group, &format!("TimePoint {frame}"))?;
            let mut per_channel = Vec::with_capacity(self.config.channels);
            for channel in 0..self.config.channels {
                let channel_group = self
                    .backend
                    .create_group(group, &format!("Channel {channel}"))?;
                for (name, value) in [
                    ("HistogramMax", histogram_max.clone()),
                    ("HistogramMin", "0.000".to_string()),
                    ("ImageBlockSizeX", level.chunk.x.to_string()),
                    ("ImageBlockSizeY", level.chunk.y.to_string()),
                    ("ImageBlockSizeZ", level.chunk.z.to_string()),
                    ("ImageSizeX", level.image.x.to_string()),
                    ("ImageSizeY", level.image.y.to_string()),
                    ("ImageSizeZ", level.image.z.to_string()),
                ] {
                    self.backend.write_attribute(channel_group, name, &value)?;
                }

                let histogram = self.backend.create_dataset(
                    channel_group,
                    "Histogram",
                    &DatasetSpec::contiguous(vec![HISTOGRAM_BINS], ElementType::U64),
                )?;
                let data = self.backend.create_dataset(
                    channel_group,
                    "Data",
                    &DatasetSpec::chunked(
                        vec![level.container.z, level.container.y, level.container.x],
                        element,
                        vec![level.chunk.z, level.chunk.y, level.chunk.x],
                        self.config.compression,
                    ),
                )?;
                self.backend.close(channel_group)?;
                per_channel.push(ChannelDatasets {
                    data,
                    histogram: Some(histogram),
                });
            }
            self.backend.close(group)?;
            channels.push(per_channel);
        }

        self.time_point = Some(TimePoint {
            frame,
            channels,
            slices_written: 0,
        });
        Ok(())
    }

    fn close_time_point(&mut self) -> Result<()> {
        let Some(time_point) = self.time_point.take() else {
            return Ok(());
        };
        let missing = time_point.channels.iter().enumerate().find_map(|(level, channels)| {
            channels
                .iter()
                .position(|datasets| datasets.histogram.is_some())
                .map(|channel| (level, channel))
        });
        let frame = time_point.frame;
        self.release_time_point(time_point)?;
        if let Some((level, channel)) = missing {
            return Err(Error::Sequencing(format!(
                "frame {frame} completed without a histogram for channel {channel} level {level}"
            )));
        }
        self.frames_completed += 1;
        log::debug!("closed TimePoint {frame}");
        Ok(())
    }

    fn release_time_point(&mut self, time_point: TimePoint) -> Result<()> {
        for datasets in time_point.channels.into_iter().flatten() {
            if let Some(histogram) = datasets.histogram {
                self.backend.close(histogram)?;
            }
            self.backend.close(datasets.data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use imswrite_core::pixel::{Histogram, PixelBuffer};

    fn writer(config: &WriterConfig, backend: &MemoryBackend) -> PyramidFileWriter<MemoryBackend> {
        let levels: Arc<[ResolutionLevel]> = config.plan_levels().unwrap().into();
        PyramidFileWriter::new(backend.clone(), "test.ims", config.clone(), levels)
    }

    fn batch(slice: usize, frame: usize, values: Vec<u8>, histograms: bool) -> PixelBatch {
        let mut histogram: Histogram = [0; HISTOGRAM_BINS];
        histogram[3] = values.len() as u64;
        PixelBatch {
            channel: 0,
            start_slice: slice,
            frame,
            timestamp: Some("2024-01-02 03:04:05.678".to_string()),
            real_slices: 1,
            levels: vec![vec![Some(PixelBuffer::from(values))]],
            histograms: histograms.then(|| vec![histogram]),
        }
    }

    #[test]
    fn test_skeleton_attributes() {
        let config = WriterConfig::new(4, 3, 2)
            .with_channels(2)
            .with_pixel_size(0.5, 2.5)
            .with_creator("unit test");
        let backend = MemoryBackend::new();
        let mut writer = writer(&config, &backend);
        writer.close().unwrap();

        assert!(backend.is_closed());
        assert_eq!(backend.open_handles(), 0);
        assert_eq!(
            backend.attribute("/", "NumberOfDataSets"),
            Some(crate::memory::Attribute::U32(1))
        );
        assert_eq!(backend.text_attribute("/", "ImarisVersion").as_deref(), Some("5.5.0"));
        assert_eq!(
            backend.children("/DataSetInfo"),
            vec!["Channel 0", "Channel 1", "Image", "Imaris", "ImarisDataSet", "Log", "TimeInfo"]
        );
        let text = |path: &str, name: &str| backend.text_attribute(path, name).unwrap();
        assert_eq!(text("/DataSetInfo/Channel 0", "Color"), "0.294 0 0.51");
        assert_eq!(text("/DataSetInfo/Channel 1", "Color"), "0 0 1");
        assert_eq!(text("/DataSetInfo/Channel 1", "ColorRange"), "0 255");
        assert_eq!(text("/DataSetInfo/Image", "ExtMax0"), "2");
        assert_eq!(text("/DataSetInfo/Image", "ExtMax1"), "1.5");
        assert_eq!(text("/DataSetInfo/Image", "ExtMax2"), "5");
        assert_eq!(text("/DataSetInfo/Image", "X"), "4");
        assert_eq!(text("/DataSetInfo/ImarisDataSet", "Creator"), "unit test");
        assert_eq!(text("/DataSetInfo/TimeInfo", "FileTimePoints"), "1");
        assert!(backend.text_attribute("/DataSetInfo/Image", "RecordingDate").is_none());
        assert_eq!(backend.children("/DataSet"), vec!["ResolutionLevel 0"]);
    }

    #[test]
    fn test_complete_frame() {
        let config = WriterConfig::new(2, 2, 1);
        let backend = MemoryBackend::new();
        let mut writer = writer(&config, &backend);
        writer.consume(batch(0, 0, vec![1, 2, 3, 4], true)).unwrap();
        assert_eq!(writer.frames_completed(), 1);
        writer.close().unwrap();

        let channel = "/DataSet/ResolutionLevel 0/TimePoint 0/Channel 0";
        let data = backend.dataset(&format!("{channel}/Data")).unwrap();
        assert_eq!(data.spec.compression, Some(2));
        assert_eq!(data.plane(0, 2, 2), vec![1, 2, 3, 4]);
        let histogram = backend.dataset(&format!("{channel}/Histogram")).unwrap();
        assert_eq!(histogram.values[3], 4);
        assert_eq!(
            backend.text_attribute(channel, "HistogramMax").as_deref(),
            Some("255.000")
        );
        assert_eq!(
            backend
                .text_attribute("/DataSetInfo/TimeInfo", "TimePoint1")
                .as_deref(),
            Some("2024-01-02 03:04:05.678")
        );
        assert!(backend.text_attribute("/DataSetInfo/Image", "RecordingDate").is_some());
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_frame_without_histogram_is_an_error() {
        let config = WriterConfig::new(2, 2, 1);
        let backend = MemoryBackend::new();
        let mut writer = writer(&config, &backend);
        let err = writer.consume(batch(0, 0, vec![0; 4], false)).unwrap_err();
        assert!(matches!(err, Error::Sequencing(_)));
        writer.close().unwrap();
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn test_rejects_duplicate_histogram_and_foreign_frame() {
        let config = WriterConfig::new(2, 2, 3).with_frames(2);
        let backend = MemoryBackend::new();
        let mut writer = writer(&config, &backend);
        writer.consume(batch(0, 0, vec![0; 4], true)).unwrap();
        assert!(matches!(
            writer.consume(batch(1, 0, vec![0; 4], true)),
            Err(Error::Sequencing(_))
        ));
        assert!(matches!(
            writer.consume(batch(2, 1, vec![0; 4], false)),
            Err(Error::Sequencing(_))
        ));
        writer.close().unwrap();
        assert_eq!(writer.frames_completed(), 0);
        assert_eq!(backend.open_handles(), 0);
    }
}
