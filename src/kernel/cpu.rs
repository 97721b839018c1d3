//! CPU kernel: row-parallel extract and reduce using rayon.

use rayon::prelude::*;

use super::{check_reduce_input, check_window, ComputeKernel, ReduceFilter};
use crate::error::Result;
use crate::heightmap::Heightmap;

pub struct CpuKernel {
    filter: ReduceFilter,
}

impl CpuKernel {
    pub fn new(filter: ReduceFilter) -> Self {
        Self { filter }
    }
}

impl ComputeKernel for CpuKernel {
    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn filter(&self) -> ReduceFilter {
        self.filter
    }

    fn extract_window(
        &mut self,
        source: &Heightmap,
        origin_x: u32,
        origin_y: u32,
        edge: u32,
    ) -> Result<Vec<u16>> {
        check_window(source, origin_x, origin_y, edge)?;

        let edge = edge as usize;
        let width = source.width as usize;
        let src = source.samples();
        let mut out = vec![0u16; edge * edge];

        out.par_chunks_mut(edge).enumerate().for_each(|(row, dst)| {
            let start = (origin_y as usize + row) * width + origin_x as usize;
            dst.copy_from_slice(&src[start..start + edge]);
        });

        Ok(out)
    }

    fn reduce(&mut self, source: &[u16], edge: u32) -> Result<Vec<u16>> {
        let half = check_reduce_input(source.len(), edge)? as usize;
        let edge = edge as usize;
        let filter = self.filter;
        let mut out = vec![0u16; half * half];

        out.par_chunks_mut(half).enumerate().for_each(|(y, dst)| {
            let top = 2 * y * edge;
            let bottom = top + edge;
            for (x, value) in dst.iter_mut().enumerate() {
                let i = 2 * x;
                *value = filter.combine(
                    source[top + i],
                    source[top + i + 1],
                    source[bottom + i],
                    source[bottom + i + 1],
                );
            }
        });

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_heightmap() -> Heightmap {
        let (w, h) = (512u32, 256u32);
        let samples = (0..w * h).map(|i| (i % 65536) as u16).collect();
        Heightmap::new(w, h, samples).unwrap()
    }

    #[test]
    fn test_extract_window() {
        let hm = ramp_heightmap();
        let mut kernel = CpuKernel::new(ReduceFilter::Average);
        let tile = kernel.extract_window(&hm, 256, 0, 256).unwrap();
        assert_eq!(tile.len(), 256 * 256);
        for y in [0u32, 17, 255] {
            for x in [0u32, 100, 255] {
                assert_eq!(tile[(y * 256 + x) as usize], hm.get(256 + x, y));
            }
        }
    }

    #[test]
    fn test_extract_out_of_bounds() {
        let hm = ramp_heightmap();
        let mut kernel = CpuKernel::new(ReduceFilter::Average);
        assert!(kernel.extract_window(&hm, 300, 0, 256).is_err());
    }

    #[test]
    fn test_reduce_average() {
        let mut kernel = CpuKernel::new(ReduceFilter::Average);
        #[rustfmt::skip]
        let src = [
            0, 4,   10, 10,
            8, 12,  10, 11,
            1, 1,   100, 0,
            1, 2,   0,   0,
        ];
        assert_eq!(kernel.reduce(&src, 4).unwrap(), vec![6, 10, 1, 25]);
    }

    #[test]
    fn test_reduce_nearest() {
        let mut kernel = CpuKernel::new(ReduceFilter::Nearest);
        let src: Vec<u16> = (0..16).collect();
        assert_eq!(kernel.reduce(&src, 4).unwrap(), vec![0, 2, 8, 10]);
    }

    #[test]
    fn test_reduce_chain_to_two() {
        let mut kernel = CpuKernel::new(ReduceFilter::Average);
        let mut level = vec![4242u16; 256 * 256];
        let mut edge = 256;
        while edge > 2 {
            level = kernel.reduce(&level, edge).unwrap();
            edge /= 2;
            assert_eq!(level.len(), (edge * edge) as usize);
            assert!(level.iter().all(|&s| s == 4242));
        }
    }
}
