//! GPU kernel using wgpu compute shaders.
//!
//! Samples travel to the GPU widened to `u32` (WGSL storage arrays have no
//! 16-bit type) and come back through a mapped staging buffer. Every
//! dispatch is submitted and waited on before returning, so at most one
//! kernel invocation is ever in flight. Buffers are scoped to the call that
//! creates them and released when it returns, on success and on error.

use std::borrow::Cow;

use bytemuck::{Pod, Zeroable};
use log::{debug, info};
use wgpu::util::DeviceExt;

use super::{check_reduce_input, check_window, ComputeKernel, ReduceFilter};
use crate::error::{Result, TerrainError};
use crate::heightmap::Heightmap;

const WORKGROUP_EDGE: u32 = 16;

/// Uniform parameters for the extract shader
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuExtractParams {
    source_width: u32,
    origin_x: u32,
    origin_y: u32,
    edge: u32,
}

/// Uniform parameters for the reduce shader
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuReduceParams {
    in_edge: u32,
    out_edge: u32,
    mode: u32,
    _pad: u32,
}

/// Heightmap resident on the device.
struct SourceUpload {
    source_id: u64,
    buffer: wgpu::Buffer,
}

/// Size of `samples` height samples once widened to `u32`.
fn widened_bytes(samples: usize) -> u64 {
    samples as u64 * std::mem::size_of::<u32>() as u64
}

fn fits_storage(samples: usize, limit_bytes: u64) -> bool {
    widened_bytes(samples) <= limit_bytes
}

/// GPU context for tile extraction and LOD reduction
pub struct GpuKernel {
    device: wgpu::Device,
    queue: wgpu::Queue,
    extract_pipeline: wgpu::ComputePipeline,
    reduce_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    adapter_name: String,
    filter: ReduceFilter,
    source: Option<SourceUpload>,
}

impl GpuKernel {
    /// Create a new GPU kernel.
    ///
    /// Fails with [`TerrainError::GpuUnavailable`] when no adapter exists and
    /// with [`TerrainError::Kernel`] when the device or shaders are rejected.
    pub fn new(filter: ReduceFilter) -> Result<Self> {
        pollster::block_on(Self::new_async(filter))
    }

    async fn new_async(filter: ReduceFilter) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(TerrainError::GpuUnavailable)?;

        let adapter_name = adapter.get_info().name;
        info!("GPU Adapter: {}", adapter_name);

        // Large heightmaps need the adapter's full storage binding size
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Terrain Tiler GPU"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| TerrainError::kernel(format!("request device: {}", e)))?;

        // Shader and pipeline errors are otherwise routed to the uncaptured
        // error handler, which panics
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Tile Bind Group Layout"),
            entries: &[
                // Input samples (read-only storage)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Output samples (read-write storage)
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Parameters uniform buffer
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Tile Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let extract_pipeline =
            Self::create_pipeline(&device, &pipeline_layout, "Extract Tile", EXTRACT_SHADER);
        let reduce_pipeline =
            Self::create_pipeline(&device, &pipeline_layout, "Reduce LOD", REDUCE_SHADER);

        if let Some(err) = device.pop_error_scope().await {
            return Err(TerrainError::kernel(format!("pipeline setup: {}", err)));
        }

        Ok(Self {
            device,
            queue,
            extract_pipeline,
            reduce_pipeline,
            bind_group_layout,
            adapter_name,
            filter,
            source: None,
        })
    }

    fn create_pipeline(
        device: &wgpu::Device,
        layout: &wgpu::PipelineLayout,
        label: &str,
        source: &'static str,
    ) -> wgpu::ComputePipeline {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
        });

        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        })
    }

    /// Whether `samples` height samples fit in one storage binding.
    pub fn can_hold(&self, samples: usize) -> bool {
        fits_storage(samples, self.storage_limit())
    }

    fn storage_limit(&self) -> u64 {
        self.device.limits().max_storage_buffer_binding_size as u64
    }

    /// Widen samples to u32 and upload them as a storage buffer.
    fn upload_samples(&self, label: &str, samples: &[u16]) -> Result<wgpu::Buffer> {
        let limit = self.storage_limit();
        if !fits_storage(samples.len(), limit) {
            return Err(TerrainError::kernel(format!(
                "{} needs {} bytes, device storage binding limit is {}",
                label,
                widened_bytes(samples.len()),
                limit
            )));
        }

        let widened: Vec<u32> = samples.iter().map(|&s| s as u32).collect();
        Ok(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(&widened),
            usage: wgpu::BufferUsages::STORAGE,
        }))
    }

    /// Run one compute pass writing an `out_edge` x `out_edge` buffer, wait
    /// for it, and read the result back.
    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        input: &wgpu::Buffer,
        params: &[u8],
        out_edge: u32,
    ) -> Result<Vec<u16>> {
        let out_bytes = out_edge as u64 * out_edge as u64 * std::mem::size_of::<u32>() as u64;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Output Buffer"),
            size: out_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let params_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Params Buffer"),
            contents: params,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Tile Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: input.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: out_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Tile Encoder"),
        });

        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Tile Pass"),
                timestamp_writes: None,
            });

            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);

            let groups = out_edge.div_ceil(WORKGROUP_EDGE);
            compute_pass.dispatch_workgroups(groups, groups, 1);
        }

        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, out_bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(TerrainError::kernel(err));
        }

        let widened = self.read_back(&staging_buffer)?;
        Ok(widened.into_iter().map(|s| s as u16).collect())
    }

    /// Map a staging buffer, wait for the GPU, and copy its contents out.
    fn read_back(&self, staging_buffer: &wgpu::Buffer) -> Result<Vec<u32>> {
        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(TerrainError::kernel)?
            .map_err(TerrainError::kernel)?;

        let data = buffer_slice.get_mapped_range();
        let result: Vec<u32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();

        Ok(result)
    }
}

impl ComputeKernel for GpuKernel {
    fn name(&self) -> String {
        format!("gpu ({})", self.adapter_name)
    }

    fn filter(&self) -> ReduceFilter {
        self.filter
    }

    fn upload_source(&mut self, source: &Heightmap) -> Result<()> {
        debug!("Uploading {}x{} heightmap to GPU", source.width, source.height);
        let buffer = self.upload_samples("Heightmap Buffer", source.samples())?;
        self.source = Some(SourceUpload {
            source_id: source.id(),
            buffer,
        });
        Ok(())
    }

    fn extract_window(
        &mut self,
        source: &Heightmap,
        origin_x: u32,
        origin_y: u32,
        edge: u32,
    ) -> Result<Vec<u16>> {
        check_window(source, origin_x, origin_y, edge)?;

        let resident = self
            .source
            .as_ref()
            .is_some_and(|s| s.source_id == source.id());
        if !resident {
            self.upload_source(source)?;
        }
        let upload = match self.source.as_ref() {
            Some(upload) => upload,
            None => return Err(TerrainError::kernel("heightmap was not uploaded")),
        };

        let params = GpuExtractParams {
            source_width: source.width,
            origin_x,
            origin_y,
            edge,
        };
        self.dispatch(
            &self.extract_pipeline,
            &upload.buffer,
            bytemuck::bytes_of(&params),
            edge,
        )
    }

    fn reduce(&mut self, source: &[u16], edge: u32) -> Result<Vec<u16>> {
        let out_edge = check_reduce_input(source.len(), edge)?;
        let input = self.upload_samples("LOD Input Buffer", source)?;

        let params = GpuReduceParams {
            in_edge: edge,
            out_edge,
            mode: self.filter.shader_code(),
            _pad: 0,
        };
        self.dispatch(&self.reduce_pipeline, &input, bytemuck::bytes_of(&params), out_edge)
    }
}

/// Copy one square window out of the full heightmap
const EXTRACT_SHADER: &str = r#"
struct Params {
    source_width: u32,
    origin_x: u32,
    origin_y: u32,
    edge: u32,
}

@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.edge || id.y >= params.edge) {
        return;
    }
    let sx = params.origin_x + id.x;
    let sy = params.origin_y + id.y;
    dst[id.y * params.edge + id.x] = src[sy * params.source_width + sx];
}
"#;

/// Halve a square buffer; mode 0 = rounded 2x2 mean, 1 = top-left sample
const REDUCE_SHADER: &str = r#"
struct Params {
    in_edge: u32,
    out_edge: u32,
    mode: u32,
    _pad: u32,
}

@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= params.out_edge || id.y >= params.out_edge) {
        return;
    }
    let i = (id.y * 2u) * params.in_edge + id.x * 2u;
    var value = src[i];
    if (params.mode == 0u) {
        let sum = src[i] + src[i + 1u] + src[i + params.in_edge] + src[i + params.in_edge + 1u];
        value = (sum + 2u) / 4u;
    }
    dst[id.y * params.out_edge + id.x] = value;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::CpuKernel;

    /// Kernel on the first adapter, or `None` on machines without one.
    fn gpu_kernel(filter: ReduceFilter) -> Option<GpuKernel> {
        match GpuKernel::new(filter) {
            Ok(kernel) => Some(kernel),
            Err(TerrainError::GpuUnavailable) => None,
            Err(e) => panic!("GPU kernel setup failed: {e}"),
        }
    }

    fn validate_wgsl(name: &str, source: &str) {
        let module = naga::front::wgsl::parse_str(source)
            .unwrap_or_else(|e| panic!("{name}: {}", e.emit_to_string(source)));
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::empty(),
        )
        .validate(&module)
        .unwrap_or_else(|e| panic!("{name}: {e:?}"));
    }

    #[test]
    fn test_shaders_validate() {
        validate_wgsl("extract", EXTRACT_SHADER);
        validate_wgsl("reduce", REDUCE_SHADER);
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<GpuExtractParams>(), 16);
        assert_eq!(std::mem::size_of::<GpuReduceParams>(), 16);
    }

    #[test]
    fn test_storage_limit() {
        assert!(fits_storage(256 * 256, 256 * 256 * 4));
        assert!(!fits_storage(256 * 256 + 1, 256 * 256 * 4));
        assert_eq!(widened_bytes(16384 * 16384), 1 << 30);
        assert!(!fits_storage(16384 * 16384, 128 << 20));
    }

    #[test]
    fn test_gpu_matches_cpu() {
        let Some(mut gpu) = gpu_kernel(ReduceFilter::Average) else {
            return;
        };
        let mut cpu = CpuKernel::new(ReduceFilter::Average);

        let samples = (0..512u32 * 256)
            .map(|i| (i.wrapping_mul(2654435761) >> 16) as u16)
            .collect();
        let hm = Heightmap::new(512, 256, samples).unwrap();

        let gpu_tile = gpu.extract_window(&hm, 256, 0, 256).unwrap();
        let cpu_tile = cpu.extract_window(&hm, 256, 0, 256).unwrap();
        assert_eq!(gpu_tile, cpu_tile);

        let gpu_lod1 = gpu.reduce(&gpu_tile, 256).unwrap();
        let cpu_lod1 = cpu.reduce(&cpu_tile, 256).unwrap();
        assert_eq!(gpu_lod1, cpu_lod1);
    }

    #[test]
    fn test_nearest_matches_cpu() {
        let Some(mut gpu) = gpu_kernel(ReduceFilter::Nearest) else {
            return;
        };
        let mut cpu = CpuKernel::new(ReduceFilter::Nearest);
        let level: Vec<u16> = (0..64u32 * 64).map(|i| (i * 7 % 65536) as u16).collect();
        assert_eq!(gpu.reduce(&level, 64).unwrap(), cpu.reduce(&level, 64).unwrap());
    }

    #[test]
    fn test_extract_reads_each_source() {
        let Some(mut gpu) = gpu_kernel(ReduceFilter::Average) else {
            return;
        };
        let a = Heightmap::new_with(256, 256, 1).unwrap();
        let b = Heightmap::new_with(256, 256, 9).unwrap();

        let tile_a = gpu.extract_window(&a, 0, 0, 256).unwrap();
        let tile_b = gpu.extract_window(&b, 0, 0, 256).unwrap();
        assert!(tile_a.iter().all(|&s| s == 1));
        assert!(tile_b.iter().all(|&s| s == 9));

        // Back to the first source after the second replaced it
        let again = gpu.extract_window(&a, 0, 0, 256).unwrap();
        assert_eq!(again, tile_a);
    }
}
