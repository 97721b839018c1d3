//! Run configuration for the `build` and `export_mesh` commands.

use std::path::PathBuf;

use crate::kernel::{KernelChoice, ReduceFilter};
use crate::mesh::MeshParams;

/// Default number of LOD levels (lod0 to lod4).
pub const DEFAULT_LOD_COUNT: u32 = 5;

/// Default capacity of each pipeline queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Settings for cutting a heightmap into persisted LOD tiles.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildConfig {
    /// 16-bit grayscale source image
    pub heightmap_path: PathBuf,
    /// Root of the tile tree (`{out_dir}/tiles/...`)
    pub out_dir: PathBuf,
    pub lod_count: u32,
    pub kernel: KernelChoice,
    pub filter: ReduceFilter,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            heightmap_path: PathBuf::from("assets/hm.png"),
            out_dir: PathBuf::from("out/world"),
            lod_count: DEFAULT_LOD_COUNT,
            kernel: KernelChoice::Auto,
            filter: ReduceFilter::Average,
        }
    }
}

/// Settings for turning persisted tiles into OBJ meshes.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportConfig {
    /// Build output directory; tiles are read from `{in_dir}/tiles`
    pub in_dir: PathBuf,
    /// Directory receiving the `.obj` files
    pub out_dir: PathBuf,
    pub lod_count: u32,
    pub mesh: MeshParams,
    /// Mesh-building worker threads
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            in_dir: PathBuf::from("out/world"),
            out_dir: PathBuf::from("out/meshes"),
            lod_count: DEFAULT_LOD_COUNT,
            mesh: MeshParams::default(),
            workers: default_worker_count(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// One worker per hardware thread, minus one left for the writer and the OS.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let build = BuildConfig::default();
        assert_eq!(build.lod_count, 5);
        assert_eq!(build.kernel, KernelChoice::Auto);

        let export = ExportConfig::default();
        assert_eq!(export.mesh.height_scale, 100.0);
        assert_eq!(export.mesh.spacing, 1.0);
        assert_eq!(export.queue_capacity, 64);
        assert!(export.workers >= 1);
    }
}
