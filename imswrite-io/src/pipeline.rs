//! Producer-facing write pipeline.
//!
//! [`ImsWriter`] accepts whole planes on the caller's thread, groups them into
//! per-channel batches, downsamples each batch into every resolution level and
//! hands the result to a dedicated writer thread through a bounded channel.
//! A full channel blocks the caller, which keeps memory bounded when storage
//! is slower than acquisition.

use crate::backend::StorageBackend;
use crate::config::WriterConfig;
#[cfg(feature = "hdf5")]
use crate::hdf5::Hdf5Backend;
use crate::writer::PyramidFileWriter;
use crate::{Error, Result};
use imswrite_algorithms::{HistogramAccumulator, SliceDownsampler};
use imswrite_core::batch::{PixelBatch, SourceSlice};
use imswrite_core::geometry::ResolutionLevel;
use imswrite_core::pixel::PixelBuffer;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Order in which planes of a frame are submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrder {
    /// Not yet known; latched by the second plane of the first frame.
    Unknown,
    /// All slices of channel 0, then all slices of channel 1, ...
    SlicesFirst,
    /// All channels of slice 0, then all channels of slice 1, ...
    ChannelsFirst,
}

impl DeliveryOrder {
    /// Position `(slice, channel, frame)` of the `index`-th submitted plane.
    ///
    /// Returns `None` when the order is still unknown and the position
    /// depends on it, or when `slices` or `channels` is zero.
    #[must_use]
    pub fn position(
        self,
        index: usize,
        slices: usize,
        channels: usize,
    ) -> Option<(usize, usize, usize)> {
        if slices == 0 || channels == 0 {
            return None;
        }
        let per_frame = slices * channels;
        let (frame, rem) = (index / per_frame, index % per_frame);
        match self {
            Self::SlicesFirst => Some((rem % slices, rem / slices, frame)),
            Self::ChannelsFirst => Some((rem / channels, rem % channels, frame)),
            Self::Unknown if per_frame == 1 || index == 0 => Some((0, 0, frame)),
            Self::Unknown => None,
        }
    }
}

/// Streams planes into a multi-resolution `.ims` file.
///
/// ```no_run
/// use imswrite_io::{ImsWriter, MemoryBackend, WriterConfig};
/// use imswrite_core::PixelBuffer;
///
/// let config = WriterConfig::new(64, 64, 8);
/// let mut writer = ImsWriter::open("stack.ims", config, MemoryBackend::new())?;
/// for z in 0..8 {
///     writer.submit_plane(PixelBuffer::from(vec![0u8; 64 * 64]), z, 0, 0, None)?;
/// }
/// writer.close()?;
/// # Ok::<(), imswrite_io::Error>(())
/// ```
pub struct ImsWriter {
    config: WriterConfig,
    downsampler: SliceDownsampler,
    histograms: HistogramAccumulator,
    order: DeliveryOrder,
    staging: Vec<Vec<SourceSlice>>,
    submitted: usize,
    sender: Option<SyncSender<PixelBatch>>,
    worker: Option<JoinHandle<Result<()>>>,
    writer_failed: Arc<AtomicBool>,
    stopped: bool,
}

impl ImsWriter {
    /// Plans the pyramid and starts the writer thread.
    ///
    /// The file itself is created by the writer thread when the first batch
    /// arrives.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the thread cannot
    /// be spawned.
    pub fn open<B>(path: impl Into<PathBuf>, config: WriterConfig, backend: B) -> Result<Self>
    where
        B: StorageBackend + 'static,
    {
        config.validate()?;
        let levels: Arc<[ResolutionLevel]> = config.plan_levels()?.into();
        let downsampler = SliceDownsampler::new(Arc::clone(&levels), config.bit_depth)?;
        log::debug!(
            "{} resolution levels, {} slices per batch",
            levels.len(),
            downsampler.batch_size()
        );

        let (sender, receiver) = sync_channel::<PixelBatch>(config.queue_depth);
        let writer_failed = Arc::new(AtomicBool::new(false));
        let failed = Arc::clone(&writer_failed);
        let file_writer = PyramidFileWriter::new(backend, path, config.clone(), levels);
        let worker = thread::Builder::new()
            .name("imswrite-writer".to_string())
            .spawn(move || {
                let result = run_writer(file_writer, receiver);
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                result
            })?;

        Ok(Self {
            staging: vec![Vec::new(); config.channels],
            config,
            downsampler,
            histograms: HistogramAccumulator::new(),
            order: DeliveryOrder::Unknown,
            submitted: 0,
            sender: Some(sender),
            worker: Some(worker),
            writer_failed,
            stopped: false,
        })
    }

    /// Opens a writer backed by an HDF5 file.
    ///
    /// # Errors
    /// See [`Self::open`].
    #[cfg(feature = "hdf5")]
    pub fn create(path: impl Into<PathBuf>, config: WriterConfig) -> Result<Self> {
        Self::open(path, config, Hdf5Backend::new())
    }

    #[must_use]
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    #[must_use]
    pub fn levels(&self) -> &[ResolutionLevel] {
        self.downsampler.levels()
    }

    /// Number of slices grouped into one batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.downsampler.batch_size()
    }

    #[must_use]
    pub fn delivery_order(&self) -> DeliveryOrder {
        self.order
    }

    /// Number of planes accepted so far.
    #[must_use]
    pub fn planes_submitted(&self) -> usize {
        self.submitted
    }

    /// Submits one whole plane.
    ///
    /// Planes must arrive frame by frame, either channel-fastest or
    /// slice-fastest within a frame. `timestamp` ("YYYY-MM-DD HH:MM:SS.XXX")
    /// is recorded for the first plane of each frame.
    ///
    /// # Errors
    /// Returns an error if the plane has the wrong size or sample type, its
    /// indices are out of range or out of sequence, downsampling fails, or
    /// the writer thread has failed.
    pub fn submit_plane(
        &mut self,
        pixels: PixelBuffer,
        slice: usize,
        channel: usize,
        frame: usize,
        timestamp: Option<&str>,
    ) -> Result<()> {
        if self.stopped {
            return Err(Error::WriterStopped);
        }
        self.check_writer()?;
        self.check_plane(&pixels, slice, channel, frame)?;
        self.accept_position(slice, channel, frame)?;

        let timestamp = timestamp
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let result = self.stage(SourceSlice::new(pixels, slice, channel, frame, timestamp));
        if result.is_err() {
            self.stopped = true;
        }
        result
    }

    /// Signals end of input, waits for the writer thread to drain the queue
    /// and close the file, and returns its result.
    ///
    /// # Errors
    /// Returns the writer thread's error, if any.
    pub fn close(mut self) -> Result<()> {
        let staged: usize = self.staging.iter().map(Vec::len).sum();
        if staged > 0 {
            log::warn!("dropping {staged} staged planes that never completed a batch");
        }
        let expected = self.config.planes_per_frame() * self.config.frames;
        if self.submitted < expected {
            log::warn!("closing after {} of {expected} planes", self.submitted);
        }
        self.join_writer()
    }

    fn check_writer(&mut self) -> Result<()> {
        if !self.writer_failed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stopped = true;
        self.join_writer()?;
        Err(Error::WriterStopped)
    }

    fn check_plane(
        &self,
        pixels: &PixelBuffer,
        slice: usize,
        channel: usize,
        frame: usize,
    ) -> Result<()> {
        let config = &self.config;
        if slice >= config.slices || channel >= config.channels || frame >= config.frames {
            return Err(Error::InvalidInput(format!(
                "plane (z={slice}, c={channel}, t={frame}) outside {} slices, {} channels, {} frames",
                config.slices, config.channels, config.frames
            )));
        }
        let base = &self.downsampler.levels()[0];
        pixels
            .validate_plane(base.byte_depth, base.image.plane_len())
            .map_err(|err| Error::InvalidInput(err.to_string()))
    }

    fn accept_position(&mut self, slice: usize, channel: usize, frame: usize) -> Result<()> {
        let order = match self.order {
            DeliveryOrder::Unknown if slice == 1 && channel == 0 => DeliveryOrder::SlicesFirst,
            DeliveryOrder::Unknown if slice == 0 && channel == 1 => DeliveryOrder::ChannelsFirst,
            other => other,
        };
        let expected = order.position(self.submitted, self.config.slices, self.config.channels);
        if expected != Some((slice, channel, frame)) {
            let hint = expected.map_or_else(
                || "a channel-fastest or slice-fastest order".to_string(),
                |(z, c, t)| format!("(z={z}, c={c}, t={t})"),
            );
            return Err(Error::InvalidInput(format!(
                "plane (z={slice}, c={channel}, t={frame}) out of sequence, expected {hint}"
            )));
        }
        if order != self.order {
            log::debug!("delivery order latched as {order:?}");
            self.order = order;
        }
        self.submitted += 1;
        Ok(())
    }

    fn stage(&mut self, plane: SourceSlice) -> Result<()> {
        let (slice, channel, frame) = (plane.slice, plane.channel, plane.frame);
        self.staging[channel].push(plane);

        let batch_size = self.downsampler.batch_size();
        let channels = self.config.channels;
        if slice + 1 == self.config.slices && batch_size > 1 {
            match self.order {
                DeliveryOrder::ChannelsFirst => {
                    // channel batches are cut together, so pad them together
                    if channel + 1 == channels {
                        for c in 0..channels {
                            self.pad(c, frame);
                        }
                    }
                }
                DeliveryOrder::SlicesFirst | DeliveryOrder::Unknown => self.pad(channel, frame),
            }
        }

        match self.order {
            DeliveryOrder::SlicesFirst => {
                while self.staging[channel].len() >= batch_size {
                    self.dispatch(channel)?;
                }
            }
            DeliveryOrder::ChannelsFirst => {
                if self.staging.iter().all(|queue| queue.len() >= batch_size) {
                    for c in 0..channels {
                        self.dispatch(c)?;
                    }
                }
            }
            DeliveryOrder::Unknown => {
                if batch_size == 1 && channels == 1 {
                    self.dispatch(channel)?;
                }
            }
        }
        Ok(())
    }

    fn pad(&mut self, channel: usize, frame: usize) {
        let batch_size = self.downsampler.batch_size();
        let mut slice = self.config.slices;
        while slice % batch_size != 0 {
            self.staging[channel].push(SourceSlice::padding(slice, channel, frame));
            slice += 1;
        }
    }

    fn dispatch(&mut self, channel: usize) -> Result<()> {
        let batch_size = self.downsampler.batch_size();
        let slices: Vec<SourceSlice> = self.staging[channel].drain(..batch_size).collect();
        let batch = self.downsampler.process(&mut self.histograms, slices)?;
        log::debug!(
            "dispatching channel {} slices {}..{} of frame {}",
            batch.channel,
            batch.start_slice,
            batch.start_slice + batch.len(),
            batch.frame
        );
        let Some(sender) = self.sender.as_ref() else {
            return Err(Error::WriterStopped);
        };
        if sender.send(batch).is_err() {
            self.join_writer()?;
            return Err(Error::WriterStopped);
        }
        Ok(())
    }

    fn join_writer(&mut self) -> Result<()> {
        self.sender = None;
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| Error::WriterPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for ImsWriter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.join_writer() {
                log::warn!("writer thread failed during drop: {err}");
            }
        }
    }
}

fn run_writer<B: StorageBackend>(
    mut writer: PyramidFileWriter<B>,
    receiver: Receiver<PixelBatch>,
) -> Result<()> {
    for batch in &receiver {
        if let Err(err) = writer.consume(batch) {
            log::warn!("writer failed, closing file: {err}");
            if let Err(close_err) = writer.close() {
                log::warn!("best-effort close failed: {close_err}");
            }
            return Err(err);
        }
    }
    writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DatasetSpec, Handle};
    use crate::memory::MemoryBackend;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Condvar, Mutex};
    use std::time::{Duration, Instant};

    fn plane(value: u8, len: usize) -> PixelBuffer {
        PixelBuffer::from(vec![value; len])
    }

    #[test]
    fn test_position_orders() {
        assert_eq!(DeliveryOrder::ChannelsFirst.position(3, 3, 2), Some((1, 1, 0)));
        assert_eq!(DeliveryOrder::SlicesFirst.position(3, 3, 2), Some((0, 1, 0)));
        assert_eq!(DeliveryOrder::SlicesFirst.position(7, 3, 2), Some((1, 0, 1)));
        assert_eq!(DeliveryOrder::Unknown.position(0, 3, 2), Some((0, 0, 0)));
        assert_eq!(DeliveryOrder::Unknown.position(1, 3, 2), None);
        assert_eq!(DeliveryOrder::Unknown.position(2, 1, 1), Some((0, 0, 2)));
        assert_eq!(DeliveryOrder::SlicesFirst.position(0, 0, 2), None);
        assert_eq!(DeliveryOrder::ChannelsFirst.position(4, 3, 0), None);
    }

    #[test]
    fn test_detects_slices_first() {
        let config = WriterConfig::new(2, 2, 3).with_channels(2);
        let mut writer = ImsWriter::open("a.ims", config, MemoryBackend::new()).unwrap();
        writer.submit_plane(plane(1, 4), 0, 0, 0, None).unwrap();
        assert_eq!(writer.delivery_order(), DeliveryOrder::Unknown);
        writer.submit_plane(plane(1, 4), 1, 0, 0, None).unwrap();
        assert_eq!(writer.delivery_order(), DeliveryOrder::SlicesFirst);
        writer.close().unwrap();
    }

    #[test]
    fn test_detects_channels_first() {
        let config = WriterConfig::new(2, 2, 3).with_channels(2);
        let mut writer = ImsWriter::open("a.ims", config, MemoryBackend::new()).unwrap();
        writer.submit_plane(plane(1, 4), 0, 0, 0, None).unwrap();
        writer.submit_plane(plane(1, 4), 0, 1, 0, None).unwrap();
        assert_eq!(writer.delivery_order(), DeliveryOrder::ChannelsFirst);
        writer.close().unwrap();
    }

    #[test]
    fn test_single_plane_frames_stay_unknown() {
        let config = WriterConfig::new(2, 2, 1).with_frames(3);
        let backend = MemoryBackend::new();
        let mut writer = ImsWriter::open("a.ims", config, backend.clone()).unwrap();
        assert_eq!(writer.batch_size(), 1);
        for frame in 0..3 {
            writer.submit_plane(plane(9, 4), 0, 0, frame, None).unwrap();
        }
        assert_eq!(writer.delivery_order(), DeliveryOrder::Unknown);
        writer.close().unwrap();
        assert!(backend.contains("/DataSet/ResolutionLevel 0/TimePoint 2/Channel 0/Data"));
    }

    #[test]
    fn test_rejects_out_of_sequence_planes() {
        let config = WriterConfig::new(2, 2, 3).with_channels(2);
        let mut writer = ImsWriter::open("a.ims", config, MemoryBackend::new()).unwrap();
        writer.submit_plane(plane(1, 4), 0, 0, 0, None).unwrap();
        let err = writer.submit_plane(plane(1, 4), 2, 1, 0, None).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        // a rejected plane leaves the pipeline usable
        writer.submit_plane(plane(1, 4), 0, 1, 0, None).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_rejects_bad_planes() {
        let config = WriterConfig::new(2, 2, 2).with_bit_depth(12);
        let mut writer = ImsWriter::open("a.ims", config, MemoryBackend::new()).unwrap();
        assert!(matches!(
            writer.submit_plane(plane(1, 4), 0, 0, 0, None),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            writer.submit_plane(PixelBuffer::from(vec![0u16; 3]), 0, 0, 0, None),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            writer.submit_plane(PixelBuffer::from(vec![0u16; 4]), 0, 0, 1, None),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(writer.planes_submitted(), 0);
    }

    /// Delegates to a `MemoryBackend` but holds plane writes until opened.
    struct GatedBackend {
        inner: MemoryBackend,
        gate: Arc<(Mutex<bool>, Condvar)>,
    }

    impl StorageBackend for GatedBackend {
        fn create_file(&mut self, path: &Path) -> Result<Handle> {
            self.inner.create_file(path)
        }

        fn create_group(&mut self, parent: Handle, name: &str) -> Result<Handle> {
            self.inner.create_group(parent, name)
        }

        fn create_dataset(
            &mut self,
            parent: Handle,
            name: &str,
            spec: &DatasetSpec,
        ) -> Result<Handle> {
            self.inner.create_dataset(parent, name, spec)
        }

        fn write_attribute(&mut self, object: Handle, name: &str, value: &str) -> Result<()> {
            self.inner.write_attribute(object, name, value)
        }

        fn write_attribute_u32(&mut self, object: Handle, name: &str, value: u32) -> Result<()> {
            self.inner.write_attribute_u32(object, name, value)
        }

        fn write_hyperslab(
            &mut self,
            dataset: Handle,
            z: usize,
            height: usize,
            width: usize,
            pixels: &PixelBuffer,
        ) -> Result<()> {
            let (lock, opened) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = opened.wait(open).unwrap();
            }
            drop(open);
            self.inner.write_hyperslab(dataset, z, height, width, pixels)
        }

        fn write_whole(&mut self, dataset: Handle, values: &[u64]) -> Result<()> {
            self.inner.write_whole(dataset, values)
        }

        fn close(&mut self, handle: Handle) -> Result<()> {
            self.inner.close(handle)
        }
    }

    #[test]
    fn test_slow_writer_blocks_caller() {
        const FRAMES: usize = 20;
        // one plane per frame, so every plane is dispatched as its own batch
        let config = WriterConfig::new(2, 2, 1).with_frames(FRAMES);
        assert_eq!(config.queue_depth, 2);
        let memory = MemoryBackend::new();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let backend = GatedBackend {
            inner: memory.clone(),
            gate: Arc::clone(&gate),
        };
        let accepted = Arc::new(AtomicUsize::new(0));

        let producer = {
            let accepted = Arc::clone(&accepted);
            thread::spawn(move || -> Result<()> {
                let mut writer = ImsWriter::open("slow.ims", config, backend)?;
                for frame in 0..FRAMES {
                    writer.submit_plane(plane(7, 4), 0, 0, frame, None)?;
                    accepted.fetch_add(1, Ordering::SeqCst);
                }
                writer.close()
            })
        };

        // one batch held by the writer plus a full queue
        let deadline = Instant::now() + Duration::from_secs(10);
        while accepted.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert!(!producer.is_finished());

        {
            let (lock, opened) = &*gate;
            *lock.lock().unwrap() = true;
            opened.notify_all();
        }
        producer.join().unwrap().unwrap();

        assert_eq!(accepted.load(Ordering::SeqCst), FRAMES);
        assert!(memory.is_closed());
        assert_eq!(memory.open_handles(), 0);
        for frame in 0..FRAMES {
            let data = memory
                .dataset(&format!(
                    "/DataSet/ResolutionLevel 0/TimePoint {frame}/Channel 0/Data"
                ))
                .unwrap();
            assert_eq!(data.writes, 1);
            assert_eq!(data.get(0, 1, 1), Some(7));
        }
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let config = WriterConfig::new(2, 2, 2).with_bit_depth(24);
        assert!(ImsWriter::open("a.ims", config, MemoryBackend::new()).is_err());
    }
}
