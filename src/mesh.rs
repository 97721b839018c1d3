//! Regular grid meshes built from square height buffers.

use crate::error::{Result, TerrainError};
use crate::tiling;

/// Triangle mesh over an `N x N` height grid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GridMesh {
    /// `N * N` positions, row-major (`z` outer, `x` inner).
    pub vertices: Vec<[f32; 3]>,
    /// `2 * (N - 1)^2` counter-clockwise triangles.
    pub indices: Vec<u32>,
}

impl GridMesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Parameters shared by every mesh of one export run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshParams {
    /// World distance between neighbouring samples.
    pub spacing: f32,
    /// World height of the maximum sample value.
    pub height_scale: f32,
}

impl Default for MeshParams {
    fn default() -> Self {
        Self {
            spacing: 1.0,
            height_scale: 100.0,
        }
    }
}

/// Build the grid mesh of one tile's height buffer.
///
/// Vertex `(z, x)` sits at `x * spacing + base_x`, `z * spacing + base_z`
/// with the tile origin from [`tiling::tile_world_origin`]. Height is the
/// sample normalized to `0..=1` and multiplied by `height_scale`.
///
/// Each quad `i0 i1 / i2 i3` becomes `(i0, i2, i1)` and `(i1, i2, i3)`.
pub fn build_grid_mesh(
    heights: &[u16],
    edge: u32,
    params: MeshParams,
    tile_x: u32,
    tile_y: u32,
) -> Result<GridMesh> {
    let n = edge as usize;
    if heights.len() != n * n {
        return Err(TerrainError::MeshSizeMismatch {
            expected: n * n,
            actual: heights.len(),
        });
    }

    let mut vertices = Vec::with_capacity(n * n);
    for z in 0..edge {
        let wz = tiling::world_coordinate(tile_y, z, params.spacing);
        for x in 0..edge {
            let wx = tiling::world_coordinate(tile_x, x, params.spacing);
            let sample = heights[z as usize * n + x as usize];
            let wy = sample as f32 / u16::MAX as f32 * params.height_scale;
            vertices.push([wx, wy, wz]);
        }
    }

    let quads = n.saturating_sub(1);
    let mut indices = Vec::with_capacity(quads * quads * 6);
    for z in 0..edge.saturating_sub(1) {
        for x in 0..edge - 1 {
            let i0 = z * edge + x;
            let i1 = i0 + 1;
            let i2 = i0 + edge;
            let i3 = i2 + 1;
            indices.extend_from_slice(&[i0, i2, i1, i1, i2, i3]);
        }
    }

    Ok(GridMesh { vertices, indices })
}
