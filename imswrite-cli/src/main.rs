//! imswrite CLI - Command-line interface for Imaris pyramid writing.
//!
//! Plans resolution pyramids and converts raw stacks into `.ims` files.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand, ValueEnum};
use imswrite_core::{plan_levels, ByteDepth, PixelBuffer};
use imswrite_io::{ImsWriter, WriterConfig};
use memmap2::Mmap;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("writer error: {0}")]
    ImswriteIo(#[from] imswrite_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] imswrite_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Plane order of a raw input stack, fastest-varying dimension first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlaneOrder {
    /// Channels vary fastest, then slices, then frames
    Czt,
    /// Slices vary fastest, then channels, then frames
    Zct,
}

impl PlaneOrder {
    /// `(slice, channel, frame)` of the plane at `index` in the file.
    fn position(self, index: usize, slices: usize, channels: usize) -> (usize, usize, usize) {
        let per_frame = slices * channels;
        let (frame, rem) = (index / per_frame, index % per_frame);
        match self {
            Self::Czt => (rem / channels, rem % channels, frame),
            Self::Zct => (rem % slices, rem / slices, frame),
        }
    }
}

/// Streaming multi-resolution Imaris writer.
#[derive(Parser)]
#[command(name = "imswrite")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolution pyramid planned for a volume
    Plan {
        /// Plane width in pixels
        #[arg(long)]
        width: usize,

        /// Plane height in pixels
        #[arg(long)]
        height: usize,

        /// Number of Z slices
        #[arg(long)]
        depth: usize,

        /// Number of time points
        #[arg(long, default_value = "1")]
        frames: usize,

        /// Significant bits per sample (1-16)
        #[arg(long, default_value = "16")]
        bit_depth: u8,

        /// Print the levels as JSON
        #[arg(long)]
        json: bool,
    },

    /// Convert a headerless little-endian raw stack into an .ims file
    Convert {
        /// Input raw file
        input: PathBuf,

        /// Output .ims path
        #[arg(short, long)]
        output: PathBuf,

        /// Plane width in pixels
        #[arg(long)]
        width: usize,

        /// Plane height in pixels
        #[arg(long)]
        height: usize,

        /// Z slices per channel and frame
        #[arg(long)]
        slices: usize,

        /// Number of channels
        #[arg(long, default_value = "1")]
        channels: usize,

        /// Number of time points
        #[arg(long, default_value = "1")]
        frames: usize,

        /// Significant bits per sample (1-16); above 8 samples are 2 bytes
        #[arg(long, default_value = "16")]
        bit_depth: u8,

        /// Plane order in the raw file
        #[arg(long, value_enum, default_value = "czt")]
        order: PlaneOrder,

        /// Pixel spacing in X and Y (micrometres)
        #[arg(long, default_value = "1.0")]
        pixel_size_xy: f64,

        /// Slice spacing (micrometres)
        #[arg(long, default_value = "1.0")]
        pixel_size_z: f64,

        /// Recording date, "YYYY-MM-DD HH:MM:SS.XXX"
        #[arg(long)]
        recording_date: Option<String>,

        /// Store pixel data without DEFLATE compression
        #[arg(long)]
        no_compression: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            width,
            height,
            depth,
            frames,
            bit_depth,
            json,
        } => {
            let byte_depth = ByteDepth::from_bit_depth(bit_depth)?;
            let levels = plan_levels(width, height, depth, frames, byte_depth)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&levels)?);
                return Ok(());
            }

            println!(
                "{:<6} | {:<18} | {:<12} | {:<16} | {:<18} | {:>12}",
                "Level", "Image (XxYxZ)", "Reduction", "Chunk (XxYxZxT)", "Container", "Bytes"
            );
            println!("{:-<96}", "");
            for level in &levels {
                println!(
                    "{:<6} | {:<18} | {:<12} | {:<16} | {:<18} | {:>12}",
                    level.index,
                    format!("{}x{}x{}", level.image.x, level.image.y, level.image.z),
                    format!(
                        "{}x{}x{}",
                        level.reduction.x, level.reduction.y, level.reduction.z
                    ),
                    format!(
                        "{}x{}x{}x{}",
                        level.chunk.x, level.chunk.y, level.chunk.z, level.chunk.t
                    ),
                    format!(
                        "{}x{}x{}",
                        level.container.x, level.container.y, level.container.z
                    ),
                    level.num_bytes()
                );
            }
            println!(
                "Slices per batch: {}",
                levels.last().map_or(1, |level| level.reduction.z)
            );
        }

        Commands::Convert {
            input,
            output,
            width,
            height,
            slices,
            channels,
            frames,
            bit_depth,
            order,
            pixel_size_xy,
            pixel_size_z,
            recording_date,
            no_compression,
            verbose,
        } => {
            let config = WriterConfig::new(width, height, slices)
                .with_channels(channels)
                .with_frames(frames)
                .with_pixel_size(pixel_size_xy, pixel_size_z)
                .with_compression(if no_compression { None } else { Some(2) })
                .with_creator(concat!("imswrite ", env!("CARGO_PKG_VERSION")))
                .try_with_bit_depth(bit_depth)?;
            config.validate()?;
            let byte_depth = config.byte_depth()?;

            let file = File::open(&input)?;
            // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&file)? };

            let plane_len = width * height;
            let plane_bytes = plane_len * byte_depth.bytes();
            let total_planes = config.planes_per_frame() * frames;
            if mmap.len() != plane_bytes * total_planes {
                return Err(CliError::InvalidInput(format!(
                    "{} is {} bytes, expected {} planes of {} bytes",
                    input.display(),
                    mmap.len(),
                    total_planes,
                    plane_bytes
                )));
            }

            if verbose {
                eprintln!("Input: {} ({} planes, {})", input.display(), total_planes, byte_depth);
                eprintln!("Output: {}", output.display());
                eprintln!("Order: {:?}", order);
            }

            let start = Instant::now();
            let mut writer = ImsWriter::create(output.clone(), config)?;
            if verbose {
                eprintln!(
                    "Pyramid: {} levels, {} slices per batch",
                    writer.levels().len(),
                    writer.batch_size()
                );
            }

            for (index, bytes) in mmap.chunks_exact(plane_bytes).enumerate() {
                let (slice, channel, frame) = order.position(index, slices, channels);
                let pixels = match byte_depth {
                    ByteDepth::U8 => PixelBuffer::from(bytes.to_vec()),
                    ByteDepth::U16 => PixelBuffer::from(
                        bytes
                            .chunks_exact(2)
                            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                            .collect::<Vec<_>>(),
                    ),
                };
                writer.submit_plane(pixels, slice, channel, frame, recording_date.as_deref())?;
                if verbose && (index + 1) % 100 == 0 {
                    eprintln!("  {} / {} planes", index + 1, total_planes);
                }
            }
            writer.close()?;

            let elapsed = start.elapsed();
            let megabytes = mmap.len() as f64 / 1_000_000.0;
            println!(
                "Wrote {} planes to {} in {:.2}s ({:.1} MB/s)",
                total_planes,
                output.display(),
                elapsed.as_secs_f64(),
                megabytes / elapsed.as_secs_f64().max(f64::EPSILON)
            );
        }
    }

    Ok(())
}
