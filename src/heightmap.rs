//! Source heightmap: a single-channel 16-bit grid loaded once per build.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, TerrainError};
use crate::tiling::{self, TileCoord};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Immutable `width` x `height` grid of 16-bit height samples, row-major.
///
/// Both dimensions are non-zero multiples of [`tiling::TILE_SIZE`].
#[derive(Clone, Debug)]
pub struct Heightmap {
    pub width: u32,
    pub height: u32,
    samples: Vec<u16>,
    id: u64,
}

impl Heightmap {
    pub fn new(width: u32, height: u32, samples: Vec<u16>) -> Result<Self> {
        tiling::tile_grid_dimensions(width, height)?;
        let expected = width as usize * height as usize;
        if samples.len() != expected {
            return Err(TerrainError::SampleCountMismatch {
                expected,
                actual: samples.len(),
            });
        }
        Ok(Self {
            width,
            height,
            samples,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// A heightmap with every sample set to `value`.
    pub fn new_with(width: u32, height: u32, value: u16) -> Result<Self> {
        Self::new(width, height, vec![value; width as usize * height as usize])
    }

    /// Load a grayscale image, converting it to 16-bit luma.
    ///
    /// 8-bit sources are widened by the `image` crate, so their range still
    /// spans the full 0..=65535 scale.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let img = image::open(path).map_err(|source| TerrainError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        let luma = img.into_luma16();
        let (width, height) = luma.dimensions();
        Self::new(width, height, luma.into_raw())
    }

    /// Identifies this grid's contents. Clones share it; every other
    /// heightmap created in the process gets a different one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    pub fn get(&self, x: u32, y: u32) -> u16 {
        self.samples[y as usize * self.width as usize + x as usize]
    }

    /// `(tiles_x, tiles_y)` of this heightmap.
    pub fn tile_grid(&self) -> (u32, u32) {
        (self.width / tiling::TILE_SIZE, self.height / tiling::TILE_SIZE)
    }

    /// Every tile of this heightmap in row-major order.
    pub fn tiles(&self) -> impl Iterator<Item = TileCoord> {
        let (tiles_x, tiles_y) = self.tile_grid();
        tiling::tile_coords(tiles_x, tiles_y)
    }
}
