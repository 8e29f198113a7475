//! Resolution pyramid planning and chunk layout optimisation.
//!
//! Each resolution level halves the axes that are not already small
//! relative to the other two, until a level fits in [`LEVEL_BYTE_LIMIT`].
//! Every level then gets a power-of-two chunk shape chosen by comparing the
//! cost of rendering three orthogonal slices, the block surface area and
//! the fraction of wasted (padded) storage.

use crate::pixel::ByteDepth;
use crate::{Error, Result};
use std::cmp::Ordering;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Levels are added while the current level exceeds this many bytes.
pub const LEVEL_BYTE_LIMIT: u64 = 4 * BYTES_PER_MIB;

/// Upper bound on the byte size of one chunk.
pub const CHUNK_BYTE_BUDGET: u64 = BYTES_PER_MIB;

/// Chunk layouts wasting more than this ratio of storage are avoided.
const MAX_MEMORY_COST: f64 = 2.0;

/// Spatial extents in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Extents {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Extents {
    #[must_use]
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// Number of voxels.
    #[must_use]
    pub fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Number of pixels in one XY plane.
    #[must_use]
    pub fn plane_len(&self) -> usize {
        self.x * self.y
    }
}

/// Chunk (block) extents, each a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkShape {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub t: usize,
}

impl ChunkShape {
    /// Number of voxels in one chunk across all four axes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64 * self.t as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chosen chunk shape plus the chunk-aligned container extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkLayout {
    pub chunk: ChunkShape,
    pub container: Extents,
}

/// One level of the resolution pyramid.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResolutionLevel {
    /// Level index; 0 is full resolution.
    pub index: usize,
    /// Logical image extents at this level.
    pub image: Extents,
    /// Number of time points (never reduced).
    pub time_points: usize,
    /// Reduction factor along each axis relative to level 0.
    pub reduction: Extents,
    /// Chunk shape used for storage.
    pub chunk: ChunkShape,
    /// Allocated, chunk-aligned dataset extents.
    pub container: Extents,
    /// Sample width.
    pub byte_depth: ByteDepth,
}

impl ResolutionLevel {
    fn new(
        index: usize,
        base: Extents,
        image: Extents,
        time_points: usize,
        byte_depth: ByteDepth,
    ) -> Self {
        let layout = plan_chunk_layout(image, time_points, byte_depth);
        Self {
            index,
            image,
            time_points,
            reduction: Extents::new(
                base.x.div_ceil(image.x),
                base.y.div_ceil(image.y),
                base.z.div_ceil(image.z),
            ),
            chunk: layout.chunk,
            container: layout.container,
            byte_depth,
        }
    }

    /// Byte footprint of one time point of this level.
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.byte_depth.bytes() as u64 * self.image.volume()
    }
}

/// Derives the resolution pyramid for an image, stopping at [`LEVEL_BYTE_LIMIT`].
///
/// # Errors
/// Returns an error if any extent or the time point count is zero.
pub fn plan_levels(
    width: usize,
    height: usize,
    depth: usize,
    time_points: usize,
    byte_depth: ByteDepth,
) -> Result<Vec<ResolutionLevel>> {
    plan_levels_with_limit(width, height, depth, time_points, byte_depth, LEVEL_BYTE_LIMIT)
}

/// Derives the resolution pyramid with an explicit per-level byte limit.
///
/// A new, coarser level is added while the previous one is larger than
/// `max_level_bytes`.
///
/// # Errors
/// Returns an error if any extent, the time point count or the limit is zero.
pub fn plan_levels_with_limit(
    width: usize,
    height: usize,
    depth: usize,
    time_points: usize,
    byte_depth: ByteDepth,
    max_level_bytes: u64,
) -> Result<Vec<ResolutionLevel>> {
    if width == 0 || height == 0 || depth == 0 || time_points == 0 {
        return Err(Error::InvalidDimensions(format!(
            "{width}x{height}x{depth} with {time_points} time points"
        )));
    }
    if max_level_bytes == 0 {
        return Err(Error::InvalidDimensions(
            "level byte limit must be positive".to_string(),
        ));
    }

    let base = Extents::new(width, height, depth);
    let mut levels = Vec::new();
    let mut current = base;
    loop {
        let level = ResolutionLevel::new(levels.len(), base, current, time_points, byte_depth);
        let footprint = level.num_bytes();
        log::debug!(
            "resolution level {}: {}x{}x{} reduction {}x{}x{} chunk {}x{}x{}x{}",
            level.index,
            level.image.x,
            level.image.y,
            level.image.z,
            level.reduction.x,
            level.reduction.y,
            level.reduction.z,
            level.chunk.x,
            level.chunk.y,
            level.chunk.z,
            level.chunk.t
        );
        levels.push(level);
        if footprint <= max_level_bytes {
            break;
        }
        let next = reduce(current);
        if next == current {
            break;
        }
        current = next;
    }
    Ok(levels)
}

/// Halves every axis that is not already small compared to the other two.
fn reduce(image: Extents) -> Extents {
    let (x, y, z) = (image.x as u64, image.y as u64, image.z as u64);
    let reduce_z = (10 * z) * (10 * z) > x * y;
    let reduce_y = (10 * y) * (10 * y) > x * z;
    let reduce_x = (10 * x) * (10 * x) > y * z;
    Extents::new(
        if reduce_x { image.x.div_ceil(2) } else { image.x },
        if reduce_y { image.y.div_ceil(2) } else { image.y },
        if reduce_z { image.z.div_ceil(2) } else { image.z },
    )
}

#[derive(Debug, Clone, Copy)]
struct LayoutCost {
    chunk: ChunkShape,
    slice: u64,
    geometry: u64,
    memory: f64,
}

impl LayoutCost {
    #[allow(clippy::cast_precision_loss)]
    fn new(chunk: ChunkShape, image: Extents, time_points: usize) -> Self {
        let nx = image.x.div_ceil(chunk.x) as u64;
        let ny = image.y.div_ceil(chunk.y) as u64;
        let nz = image.z.div_ceil(chunk.z) as u64;
        let nt = time_points.div_ceil(chunk.t) as u64;

        // blocks touched when rendering three orthogonal full-volume slices
        let slice = 1 + nx * ny + nx * nz + ny * nz - nx - ny - nz;
        // block surface area, minimal for cubes
        let geometry = nx * ny + nx * nz + ny * nz;
        let allocated = (nx * chunk.x as u64) as f64
            * (ny * chunk.y as u64) as f64
            * (nz * chunk.z as u64) as f64
            * (nt * chunk.t as u64) as f64;
        let memory = allocated / (image.volume() as f64 * time_points as f64);

        Self {
            chunk,
            slice,
            geometry,
            memory,
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.slice
            .cmp(&other.slice)
            .then(self.geometry.cmp(&other.geometry))
            .then(self.memory.total_cmp(&other.memory))
    }
}

/// Largest power of two that fits in the chunk byte budget.
fn chunk_voxel_budget(byte_depth: ByteDepth) -> u64 {
    let raw = CHUNK_BYTE_BUDGET / byte_depth.bytes() as u64;
    1 << (u64::BITS - 1 - raw.leading_zeros())
}

fn accepts(chunk: ChunkShape, image: Extents) -> bool {
    if image.z > 1 {
        // volumetric access: square XY blocks at least 4 deep
        chunk.x == chunk.y && chunk.z > 2
    } else {
        chunk.z == 1 && chunk.x <= 4 * chunk.y && chunk.y <= 4 * chunk.x
    }
}

/// Chooses the chunk shape and container extents for one level.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn plan_chunk_layout(image: Extents, time_points: usize, byte_depth: ByteDepth) -> ChunkLayout {
    let budget = chunk_voxel_budget(byte_depth);

    let mut costs = Vec::new();
    let mut cx = 1u64;
    while cx <= budget {
        let mut cy = 1u64;
        while cx * cy <= budget {
            let mut cz = 1u64;
            while cx * cy * cz <= budget {
                let chunk = ChunkShape {
                    x: cx as usize,
                    y: cy as usize,
                    z: cz as usize,
                    t: (budget / (cx * cy * cz)) as usize,
                };
                if accepts(chunk, image) {
                    costs.push(LayoutCost::new(chunk, image, time_points));
                }
                cz *= 2;
            }
            cy *= 2;
        }
        cx *= 2;
    }

    let chunk = if costs.is_empty() {
        fallback_chunk(budget)
    } else {
        costs.sort_by(LayoutCost::compare);
        let best = costs[0];
        if best.memory > MAX_MEMORY_COST {
            costs
                .iter()
                .find(|cost| cost.memory <= MAX_MEMORY_COST)
                .copied()
                .unwrap_or(best)
                .chunk
        } else {
            best.chunk
        }
    };

    ChunkLayout {
        chunk,
        container: Extents::new(
            image.x.next_multiple_of(chunk.x),
            image.y.next_multiple_of(chunk.y),
            image.z.next_multiple_of(chunk.z),
        ),
    }
}

/// Splits the budget exponent roughly 1 : 1.5 : 1.5 between Z, Y and X.
fn fallback_chunk(budget: u64) -> ChunkShape {
    let log2 = budget.trailing_zeros();
    let log2_z = log2 / 3;
    let log2_y = (log2 - log2_z) / 2;
    let log2_x = log2 - log2_z - log2_y;
    ChunkShape {
        x: 1 << log2_x,
        y: 1 << log2_y,
        z: 1 << log2_z,
        t: 1,
    }
}
