//! Error types shared by the build and export commands.
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are
//! `Send + 'static` so they can be captured on a pipeline thread and
//! re-raised on the caller.

use std::path::PathBuf;

/// Errors produced while tiling heightmaps or exporting meshes.
#[derive(thiserror::Error, Debug)]
pub enum TerrainError {
    #[error("heightmap dimensions {width}x{height} must be non-zero multiples of 256")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("expected {expected} height samples, got {actual}")]
    SampleCountMismatch { expected: usize, actual: usize },

    #[error("mesh builder expected {expected} height samples, got {actual}")]
    MeshSizeMismatch { expected: usize, actual: usize },

    #[error("LOD count must be at least 1 (got {0})")]
    InvalidLodCount(u32),

    #[error("{path}: {samples} samples is not a square height buffer")]
    NotSquare { path: PathBuf, samples: usize },

    #[error("{path}: height buffer holds {actual} samples, expected {expected}")]
    TruncatedHeightBuffer {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load heightmap {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("compute kernel failed: {0}")]
    Kernel(String),

    #[error("no GPU adapter available for the compute kernel")]
    GpuUnavailable,

    #[error("tiles folder not found: {0}")]
    TilesDirMissing(PathBuf),

    #[error("{0} thread panicked")]
    StagePanicked(&'static str),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

impl TerrainError {
    /// Wrap an I/O error with the operation and path that produced it.
    pub fn io<C: Into<String>>(context: C, source: std::io::Error) -> Self {
        TerrainError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kernel<T: ToString>(msg: T) -> Self {
        TerrainError::Kernel(msg.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TerrainError>;
