//! Tile addressing, LOD size chains and the on-disk tile layout.
//!
//! A heightmap is cut into fixed 256x256 tiles addressed by `(tx, ty)`.
//! Tiles are placed in world space with a stride of 255 samples so the last
//! row/column of one tile lands exactly on the first row/column of its
//! neighbour.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, TerrainError};

/// Edge length of a level-0 tile in samples.
pub const TILE_SIZE: u32 = 256;

/// World-space stride between adjacent tiles, in samples.
pub const TILE_WORLD_STRIDE: u32 = TILE_SIZE - 1;

/// Smallest edge length a LOD level may have.
pub const MIN_LOD_EDGE: u32 = 2;

const TILE_DIR_PREFIX: &str = "tile_";

/// Integer address of one tile in the tile grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub tx: u32,
    pub ty: u32,
}

impl TileCoord {
    pub fn new(tx: u32, ty: u32) -> Self {
        Self { tx, ty }
    }

    /// Top-left sample of this tile in the source heightmap.
    pub fn sample_origin(&self) -> (u32, u32) {
        (self.tx * TILE_SIZE, self.ty * TILE_SIZE)
    }

    /// Directory name used for this tile: `tile_<tx>_<ty>`.
    pub fn folder_name(&self) -> String {
        format!("{}{}_{}", TILE_DIR_PREFIX, self.tx, self.ty)
    }

    /// Parse a `tile_<tx>_<ty>` directory name.
    ///
    /// Returns `None` for anything else; discovery skips such entries.
    pub fn parse_folder_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(TILE_DIR_PREFIX)?;
        let (sx, sy) = rest.split_once('_')?;
        Some(Self::new(parse_index(sx)?, parse_index(sy)?))
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.tx, self.ty)
    }
}

/// Plain base-10 digits only; `u32::from_str` would also accept a sign.
fn parse_index(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Number of tiles along each axis for a `width` x `height` heightmap.
pub fn tile_grid_dimensions(width: u32, height: u32) -> Result<(u32, u32)> {
    if width == 0 || height == 0 || width % TILE_SIZE != 0 || height % TILE_SIZE != 0 {
        return Err(TerrainError::InvalidDimensions { width, height });
    }
    Ok((width / TILE_SIZE, height / TILE_SIZE))
}

/// All tiles of a grid in row-major order (`ty` outer, `tx` inner).
pub fn tile_coords(tiles_x: u32, tiles_y: u32) -> impl Iterator<Item = TileCoord> {
    (0..tiles_y).flat_map(move |ty| (0..tiles_x).map(move |tx| TileCoord::new(tx, ty)))
}

/// World position of sample `local` inside tile `tile` along one axis.
///
/// Computed from the integer global index so the shared border between
/// neighbouring tiles is bit-identical for every spacing.
pub fn world_coordinate(tile: u32, local: u32, spacing: f32) -> f32 {
    let global = tile as u64 * TILE_WORLD_STRIDE as u64 + local as u64;
    global as f32 * spacing
}

/// World-space `(base_x, base_z)` of a tile's first sample.
///
/// Equal to `t * (255 * spacing)` in exact arithmetic. In `f32` the result
/// can differ from that per-tile product in the last bit, since the integer
/// index `255 * t` is rounded once instead of twice.
pub fn tile_world_origin(tx: u32, ty: u32, spacing: f32) -> (f32, f32) {
    (
        world_coordinate(tx, 0, spacing),
        world_coordinate(ty, 0, spacing),
    )
}

/// Edge lengths of the LOD chain starting at `base_edge`.
///
/// Each level halves the previous one. The chain holds at most `count`
/// entries and ends early once the next edge would drop below 2.
pub fn lod_size_chain(base_edge: u32, count: u32) -> Vec<u32> {
    let mut chain = Vec::with_capacity(count as usize);
    let mut edge = base_edge;
    while chain.len() < count as usize && edge >= MIN_LOD_EDGE {
        chain.push(edge);
        edge /= 2;
    }
    chain
}

/// Edge length of LOD level `lod` for a full-size tile, if the level exists.
pub fn lod_edge(lod: u32) -> Option<u32> {
    TILE_SIZE
        .checked_shr(lod)
        .filter(|&edge| edge >= MIN_LOD_EDGE)
}

/// Paths of the persisted tile tree under a build output directory.
///
/// `{root}/tiles/tile_{tx}_{ty}/lod{k}.height.raw`
#[derive(Clone, Debug)]
pub struct TileLayout {
    root: PathBuf,
}

impl TileLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tiles_dir(&self) -> PathBuf {
        self.root.join("tiles")
    }

    pub fn tile_dir(&self, coord: TileCoord) -> PathBuf {
        self.tiles_dir().join(coord.folder_name())
    }

    pub fn height_path(&self, coord: TileCoord, lod: u32) -> PathBuf {
        self.tile_dir(coord).join(height_file_name(lod))
    }
}

/// File name of a persisted LOD level inside a tile directory.
pub fn height_file_name(lod: u32) -> String {
    format!("lod{}.height.raw", lod)
}

/// Output path of the mesh built from one tile folder and LOD level.
pub fn mesh_path(out_dir: &Path, tile_folder: &str, lod: u32) -> PathBuf {
    out_dir.join(format!("{}_lod{}.obj", tile_folder, lod))
}
