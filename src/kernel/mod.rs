//! Compute kernels used by the LOD builder.
//!
//! A kernel provides two synchronous operations:
//! - **extract window**: copy a square window out of the full heightmap
//! - **reduce**: halve the edge length of a square height buffer
//!
//! Two implementations exist: a wgpu compute-shader kernel and a rayon CPU
//! kernel. Both honour the same [`ReduceFilter`], so their output is
//! identical and the CPU kernel doubles as a fallback when no GPU adapter
//! is present.

pub mod cpu;
pub mod gpu;

pub use cpu::CpuKernel;
pub use gpu::GpuKernel;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TerrainError};
use crate::heightmap::Heightmap;

/// How a 2x2 block of samples is combined into one when halving a level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReduceFilter {
    /// Rounded mean of the block: `(a + b + c + d + 2) / 4`
    #[default]
    Average,
    /// Top-left sample of the block
    Nearest,
}

impl ReduceFilter {
    /// Value passed to the reduce shader's `mode` field.
    pub fn shader_code(&self) -> u32 {
        match self {
            Self::Average => 0,
            Self::Nearest => 1,
        }
    }

    /// Combine one 2x2 block (`a b / c d`).
    pub fn combine(&self, a: u16, b: u16, c: u16, d: u16) -> u16 {
        match self {
            Self::Average => ((a as u32 + b as u32 + c as u32 + d as u32 + 2) / 4) as u16,
            Self::Nearest => a,
        }
    }
}

impl std::fmt::Display for ReduceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Average => write!(f, "average"),
            Self::Nearest => write!(f, "nearest"),
        }
    }
}

/// Which kernel implementation to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum KernelChoice {
    /// GPU when an adapter is available, otherwise CPU
    #[default]
    Auto,
    Gpu,
    Cpu,
}

/// Extract/reduce operations dispatched one at a time by the LOD builder.
pub trait ComputeKernel {
    /// Human-readable kernel name for logs and the build manifest.
    fn name(&self) -> String;

    fn filter(&self) -> ReduceFilter;

    /// Make `source` resident before a run of [`extract_window`] calls.
    ///
    /// [`extract_window`]: ComputeKernel::extract_window
    fn upload_source(&mut self, _source: &Heightmap) -> Result<()> {
        Ok(())
    }

    /// Copy the `edge` x `edge` window at `(origin_x, origin_y)` out of `source`.
    fn extract_window(
        &mut self,
        source: &Heightmap,
        origin_x: u32,
        origin_y: u32,
        edge: u32,
    ) -> Result<Vec<u16>>;

    /// Halve an `edge` x `edge` buffer to `edge / 2` x `edge / 2`.
    fn reduce(&mut self, source: &[u16], edge: u32) -> Result<Vec<u16>>;
}

/// Create the requested kernel for tiling `source`.
///
/// `Auto` tries the GPU first and falls back to the CPU kernel when no
/// usable adapter exists or `source` exceeds the device's storage limit.
pub fn create_kernel(
    choice: KernelChoice,
    filter: ReduceFilter,
    source: &Heightmap,
) -> Result<Box<dyn ComputeKernel>> {
    match choice {
        KernelChoice::Cpu => Ok(Box::new(CpuKernel::new(filter))),
        KernelChoice::Gpu => Ok(Box::new(GpuKernel::new(filter)?)),
        KernelChoice::Auto => match GpuKernel::new(filter) {
            Ok(kernel) if kernel.can_hold(source.samples().len()) => {
                info!("Using GPU compute kernel");
                Ok(Box::new(kernel))
            }
            Ok(_) => {
                warn!(
                    "{}x{} heightmap exceeds the GPU storage limit, using CPU kernel",
                    source.width, source.height
                );
                Ok(Box::new(CpuKernel::new(filter)))
            }
            Err(e) => {
                warn!("GPU not available ({}), using CPU kernel", e);
                Ok(Box::new(CpuKernel::new(filter)))
            }
        },
    }
}

/// Reject windows that do not lie entirely inside `source`.
pub(crate) fn check_window(
    source: &Heightmap,
    origin_x: u32,
    origin_y: u32,
    edge: u32,
) -> Result<()> {
    let fits = |origin: u32, size: u32| origin.checked_add(edge).is_some_and(|end| end <= size);
    if edge == 0 || !fits(origin_x, source.width) || !fits(origin_y, source.height) {
        return Err(TerrainError::kernel(format!(
            "window {}x{} at ({}, {}) is outside the {}x{} heightmap",
            edge, edge, origin_x, origin_y, source.width, source.height
        )));
    }
    Ok(())
}

/// Validate a reduce input and return the output edge length.
pub(crate) fn check_reduce_input(len: usize, edge: u32) -> Result<u32> {
    if edge < 2 {
        return Err(TerrainError::kernel(format!("cannot reduce a {}x{} buffer", edge, edge)));
    }
    let expected = edge as usize * edge as usize;
    if len != expected {
        return Err(TerrainError::SampleCountMismatch { expected, actual: len });
    }
    Ok(edge / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_combine() {
        assert_eq!(ReduceFilter::Average.combine(0, 0, 0, 0), 0);
        assert_eq!(ReduceFilter::Average.combine(1, 2, 3, 4), 3);
        assert_eq!(ReduceFilter::Average.combine(65535, 65535, 65535, 65535), 65535);
        assert_eq!(ReduceFilter::Average.combine(65535, 0, 0, 0), 16384);
        assert_eq!(ReduceFilter::Nearest.combine(9, 1, 2, 3), 9);
    }

    #[test]
    fn test_check_window() {
        let hm = Heightmap::new_with(512, 256, 0).unwrap();
        assert!(check_window(&hm, 256, 0, 256).is_ok());
        assert!(check_window(&hm, 257, 0, 256).is_err());
        assert!(check_window(&hm, 0, 1, 256).is_err());
        assert!(check_window(&hm, u32::MAX, 0, 256).is_err());
        assert!(check_window(&hm, 0, 0, 0).is_err());
    }

    #[test]
    fn test_check_reduce_input() {
        assert_eq!(check_reduce_input(16, 4).unwrap(), 2);
        assert!(check_reduce_input(1, 1).is_err());
        assert!(matches!(
            check_reduce_input(15, 4),
            Err(TerrainError::SampleCountMismatch { expected: 16, actual: 15 })
        ));
    }

    #[test]
    fn test_create_cpu_kernel() {
        let hm = Heightmap::new_with(256, 256, 0).unwrap();
        let kernel = create_kernel(KernelChoice::Cpu, ReduceFilter::Nearest, &hm).unwrap();
        assert_eq!(kernel.name(), "cpu");
        assert_eq!(kernel.filter(), ReduceFilter::Nearest);
    }

    #[test]
    fn test_auto_kernel_always_available() {
        let samples = (0..512u32 * 256).map(|i| (i * 31 % 65536) as u16).collect();
        let hm = Heightmap::new(512, 256, samples).unwrap();

        let mut kernel = create_kernel(KernelChoice::Auto, ReduceFilter::Average, &hm).unwrap();
        assert_eq!(kernel.filter(), ReduceFilter::Average);

        kernel.upload_source(&hm).unwrap();
        let tile = kernel.extract_window(&hm, 256, 0, 256).unwrap();
        let expected = CpuKernel::new(ReduceFilter::Average)
            .extract_window(&hm, 256, 0, 256)
            .unwrap();
        assert_eq!(tile, expected);
        assert_eq!(kernel.reduce(&tile, 256).unwrap().len(), 128 * 128);
    }
}
