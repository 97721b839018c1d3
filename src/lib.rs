//! Heightmap tiling and mesh export library
//!
//! Cuts a 16-bit heightmap into 256x256 tiles with a chain of LOD levels
//! (`build`), then turns the persisted tiles into OBJ meshes in parallel
//! (`export_mesh`). Re-exports modules for use by the CLI and tools.

pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod heightmap;
pub mod kernel;
pub mod lod_builder;
pub mod manifest;
pub mod mesh;
pub mod tiling;

pub use error::{Result, TerrainError};
