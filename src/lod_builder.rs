//! Tile/LOD decomposition of a heightmap.
//!
//! Tiles are processed one after another on the calling thread, which owns
//! the kernel. For each tile:
//!
//! 1. **Extract**: the kernel copies the 256x256 window at the tile's offset
//!    out of the heightmap; the result is persisted as `lod0.height.raw`.
//! 2. **Reduce**: the previous level is halved by the kernel and persisted,
//!    then becomes the input of the next reduction.
//! 3. **Done**: once the LOD size chain is exhausted.
//!
//! Any kernel or filesystem failure aborts the whole build.

use std::fs;

use log::{debug, info};

use crate::codec;
use crate::config::BuildConfig;
use crate::error::{Result, TerrainError};
use crate::heightmap::Heightmap;
use crate::kernel::{self, ComputeKernel};
use crate::manifest::BuildManifest;
use crate::tiling::{self, TileCoord, TileLayout, TILE_SIZE};

/// Summary of a finished build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildReport {
    pub tiles: usize,
    pub height_buffers: usize,
    pub lod_sizes: Vec<u32>,
}

/// Per-tile progress through the LOD chain.
enum TileStage {
    ExtractLod0,
    ReduceLevel { lod: usize, previous: Vec<u16> },
    Done,
}

/// Load the heightmap, pick a kernel, and build the tile tree.
pub fn run_build(config: &BuildConfig) -> Result<BuildReport> {
    if config.lod_count == 0 {
        return Err(TerrainError::InvalidLodCount(config.lod_count));
    }

    info!("Loading heightmap {}", config.heightmap_path.display());
    let heightmap = Heightmap::load(&config.heightmap_path)?;

    let mut kernel = kernel::create_kernel(config.kernel, config.filter, &heightmap)?;
    let layout = TileLayout::new(&config.out_dir);
    let report = build_tiles(&heightmap, kernel.as_mut(), &layout, config.lod_count)?;

    let (tiles_x, tiles_y) = heightmap.tile_grid();
    BuildManifest {
        source_width: heightmap.width,
        source_height: heightmap.height,
        tiles_x,
        tiles_y,
        tile_size: TILE_SIZE,
        lod_sizes: report.lod_sizes.clone(),
        filter: kernel.filter(),
        kernel: kernel.name(),
    }
    .save(layout.root())?;

    Ok(report)
}

/// Write every tile's LOD chain under `layout`.
pub fn build_tiles(
    heightmap: &Heightmap,
    kernel: &mut dyn ComputeKernel,
    layout: &TileLayout,
    lod_count: u32,
) -> Result<BuildReport> {
    if lod_count == 0 {
        return Err(TerrainError::InvalidLodCount(lod_count));
    }

    let chain = tiling::lod_size_chain(TILE_SIZE, lod_count);
    let (tiles_x, tiles_y) = heightmap.tile_grid();
    info!(
        "Building tiles: {} x {} | LODs={} | tileSize={} | kernel={}",
        tiles_x,
        tiles_y,
        chain.len(),
        TILE_SIZE,
        kernel.name()
    );

    let tiles_dir = layout.tiles_dir();
    fs::create_dir_all(&tiles_dir)
        .map_err(|e| TerrainError::io(format!("create {}", tiles_dir.display()), e))?;

    kernel.upload_source(heightmap)?;

    let mut report = BuildReport {
        tiles: 0,
        height_buffers: 0,
        lod_sizes: chain.clone(),
    };
    for coord in heightmap.tiles() {
        report.height_buffers += build_tile(heightmap, kernel, layout, coord, &chain)?;
        report.tiles += 1;
    }

    info!("Build done: {}", layout.root().display());
    Ok(report)
}

/// Run one tile through the LOD chain. Returns the number of levels written.
fn build_tile(
    heightmap: &Heightmap,
    kernel: &mut dyn ComputeKernel,
    layout: &TileLayout,
    coord: TileCoord,
    chain: &[u32],
) -> Result<usize> {
    let tile_dir = layout.tile_dir(coord);
    fs::create_dir_all(&tile_dir)
        .map_err(|e| TerrainError::io(format!("create {}", tile_dir.display()), e))?;

    let persist = |lod: usize, level: &[u16]| -> Result<()> {
        let edge = chain[lod] as usize;
        if level.len() != edge * edge {
            return Err(TerrainError::kernel(format!(
                "tile {} lod{} returned {} samples, expected {}",
                coord,
                lod,
                level.len(),
                edge * edge
            )));
        }
        codec::write_height_buffer(&layout.height_path(coord, lod as u32), level)
    };
    let advance = |lod: usize, level: Vec<u16>| {
        if lod < chain.len() {
            TileStage::ReduceLevel { lod, previous: level }
        } else {
            TileStage::Done
        }
    };

    let mut written = 0;
    let mut stage = TileStage::ExtractLod0;
    loop {
        stage = match stage {
            TileStage::ExtractLod0 => {
                let (origin_x, origin_y) = coord.sample_origin();
                let level = kernel.extract_window(heightmap, origin_x, origin_y, chain[0])?;
                persist(0, &level)?;
                written += 1;
                advance(1, level)
            }
            TileStage::ReduceLevel { lod, previous } => {
                let level = kernel.reduce(&previous, chain[lod - 1])?;
                persist(lod, &level)?;
                written += 1;
                advance(lod + 1, level)
            }
            TileStage::Done => break,
        };
    }

    debug!("Tile {} wrote {} LOD levels", coord, written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CpuKernel, ReduceFilter};
    use tempfile::tempdir;

    /// Counts calls and fails the n-th reduce.
    struct FlakyKernel {
        inner: CpuKernel,
        reduces: usize,
        fail_at: Option<usize>,
    }

    impl ComputeKernel for FlakyKernel {
        fn name(&self) -> String {
            "flaky".to_string()
        }

        fn filter(&self) -> ReduceFilter {
            self.inner.filter()
        }

        fn extract_window(
            &mut self,
            source: &Heightmap,
            x: u32,
            y: u32,
            edge: u32,
        ) -> Result<Vec<u16>> {
            self.inner.extract_window(source, x, y, edge)
        }

        fn reduce(&mut self, source: &[u16], edge: u32) -> Result<Vec<u16>> {
            self.reduces += 1;
            if Some(self.reduces) == self.fail_at {
                return Err(TerrainError::kernel("device lost"));
            }
            self.inner.reduce(source, edge)
        }
    }

    fn flaky(fail_at: Option<usize>) -> FlakyKernel {
        FlakyKernel {
            inner: CpuKernel::new(ReduceFilter::Average),
            reduces: 0,
            fail_at,
        }
    }

    #[test]
    fn test_build_writes_every_level() {
        let dir = tempdir().unwrap();
        let layout = TileLayout::new(dir.path());
        let samples = (0..512u32 * 256).map(|i| (i % 1000) as u16).collect();
        let hm = Heightmap::new(512, 256, samples).unwrap();
        let mut kernel = flaky(None);

        let report = build_tiles(&hm, &mut kernel, &layout, 3).unwrap();
        assert_eq!(report.tiles, 2);
        assert_eq!(report.height_buffers, 6);
        assert_eq!(report.lod_sizes, vec![256, 128, 64]);
        assert_eq!(kernel.reduces, 4);

        let right = TileCoord::new(1, 0);
        let lod0 = codec::read_height_buffer(&layout.height_path(right, 0), 256).unwrap();
        assert_eq!(lod0[0], hm.get(256, 0));
        assert_eq!(lod0[256 * 10 + 3], hm.get(259, 10));

        let lod2 = codec::read_height_buffer(&layout.height_path(right, 2), 64).unwrap();
        assert_eq!(lod2.len(), 64 * 64);
        assert!(!layout.height_path(right, 3).exists());
    }

    #[test]
    fn test_lod_chain_stops_at_two() {
        let dir = tempdir().unwrap();
        let layout = TileLayout::new(dir.path());
        let hm = Heightmap::new_with(256, 256, 9).unwrap();

        let report = build_tiles(&hm, &mut flaky(None), &layout, 12).unwrap();
        assert_eq!(report.lod_sizes, vec![256, 128, 64, 32, 16, 8, 4, 2]);
        assert_eq!(report.height_buffers, 8);
        let smallest_path = layout.height_path(TileCoord::new(0, 0), 7);
        let smallest = codec::read_height_buffer(&smallest_path, 2).unwrap();
        assert_eq!(smallest, vec![9; 4]);
    }

    #[test]
    fn test_kernel_failure_aborts_build() {
        let dir = tempdir().unwrap();
        let layout = TileLayout::new(dir.path());
        let hm = Heightmap::new_with(512, 512, 0).unwrap();
        let mut kernel = flaky(Some(2));

        let err = build_tiles(&hm, &mut kernel, &layout, 2).unwrap_err();
        assert!(matches!(err, TerrainError::Kernel(_)));
        // Tile (0,0) finished, tile (1,0) failed at lod1, nothing after it ran
        assert!(layout.height_path(TileCoord::new(0, 0), 1).exists());
        assert!(layout.height_path(TileCoord::new(1, 0), 0).exists());
        assert!(!layout.height_path(TileCoord::new(1, 0), 1).exists());
        assert!(!layout.tile_dir(TileCoord::new(0, 1)).exists());
        assert_eq!(kernel.reduces, 2);
    }

    #[test]
    fn test_zero_lods_rejected() {
        let dir = tempdir().unwrap();
        let hm = Heightmap::new_with(256, 256, 0).unwrap();
        let err = build_tiles(&hm, &mut flaky(None), &TileLayout::new(dir.path()), 0).unwrap_err();
        assert!(matches!(err, TerrainError::InvalidLodCount(0)));
    }

    #[test]
    fn test_run_build_from_png() {
        use image::{ImageBuffer, Luma};

        let dir = tempdir().unwrap();
        let png = dir.path().join("hm.png");
        let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_pixel(256, 512, Luma([1234]));
        img.save(&png).unwrap();

        let config = BuildConfig {
            heightmap_path: png,
            out_dir: dir.path().join("world"),
            lod_count: 2,
            kernel: kernel::KernelChoice::Cpu,
            filter: ReduceFilter::Nearest,
        };
        let report = run_build(&config).unwrap();
        assert_eq!(report.tiles, 2);

        let manifest = BuildManifest::load(&config.out_dir).unwrap().unwrap();
        assert_eq!((manifest.tiles_x, manifest.tiles_y), (1, 2));
        assert_eq!(manifest.lod_sizes, vec![256, 128]);
        assert_eq!(manifest.filter, ReduceFilter::Nearest);
        assert_eq!(manifest.kernel, "cpu");
    }

    #[test]
    fn test_run_build_default_kernel() {
        use image::{ImageBuffer, Luma};

        let dir = tempdir().unwrap();
        let png = dir.path().join("hm.png");
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(256, 256, |x, y| Luma([(x * 200 + y) as u16]));
        img.save(&png).unwrap();

        let config = BuildConfig {
            heightmap_path: png,
            out_dir: dir.path().join("world"),
            lod_count: 3,
            ..BuildConfig::default()
        };
        assert_eq!(config.kernel, kernel::KernelChoice::Auto);
        let report = run_build(&config).unwrap();
        assert_eq!(report.height_buffers, 3);

        let layout = TileLayout::new(&config.out_dir);
        let lod0_path = layout.height_path(TileCoord::new(0, 0), 0);
        let lod0 = codec::read_height_buffer(&lod0_path, 256).unwrap();
        assert_eq!(lod0[256 * 7 + 3], 3 * 200 + 7);
    }
}
