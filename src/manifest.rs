//! `manifest.json`: a summary of one build, written next to the tile tree.
//!
//! Export never depends on it; tiles are discovered from the directory
//! tree. The manifest exists so a tile tree can be identified after the fact.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TerrainError};
use crate::kernel::ReduceFilter;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub source_width: u32,
    pub source_height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub tile_size: u32,
    /// Edge length of each persisted LOD level, level 0 first
    pub lod_sizes: Vec<u32>,
    pub filter: ReduceFilter,
    pub kernel: String,
}

impl BuildManifest {
    pub fn path(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILE)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = Self::path(root);
        let context = || format!("write manifest {}", path.display());
        let file = File::create(&path).map_err(|e| TerrainError::io(context(), e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush().map_err(|e| TerrainError::io(context(), e))
    }

    /// Load the manifest under `root`, or `None` if there is none.
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = Self::path(root);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path)
            .map_err(|e| TerrainError::io(format!("read manifest {}", path.display()), e))?;
        Ok(Some(serde_json::from_reader(BufReader::new(file))?))
    }
}
