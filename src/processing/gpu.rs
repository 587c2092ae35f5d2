use std::sync::mpsc;

use image::RgbaImage;

use super::Compositor;
use crate::error::FilterError;
use crate::lut::{self, LUT_SIZE};

const WORKGROUP_SIZE: u32 = 16;

/// Compute-shader LUT pass on a dedicated wgpu device.
pub struct GpuCompositor {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    status: RuntimeStatus,
}

#[derive(Clone, Debug, Default)]
/// Adapter details for diagnostics.
pub struct RuntimeStatus {
    pub adapter_name: String,
    pub adapter_backend: String,
    pub adapter_driver: String,
}

impl RuntimeStatus {
    pub fn describe(&self) -> String {
        format!(
            "{} ({}, driver {})",
            self.adapter_name, self.adapter_backend, self.adapter_driver
        )
    }
}

impl GpuCompositor {
    pub fn new() -> Result<Self, FilterError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or(FilterError::GpuUnavailable)?;
        let info = adapter.get_info();
        let adapter_driver = if info.driver.trim().is_empty() {
            "unknown".to_string()
        } else {
            info.driver
        };
        let status = RuntimeStatus {
            adapter_name: info.name,
            adapter_backend: info.backend.to_string(),
            adapter_driver,
        };
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("lut_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|_| FilterError::GpuUnavailable)?;

        let (pipeline, bind_group_layout) = build_pipeline(&device)?;

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            status,
        })
    }

    pub fn status(&self) -> &RuntimeStatus {
        &self.status
    }

    fn dispatch(
        &self,
        src: &RgbaImage,
        lut: &RgbaImage,
        intensity: f32,
    ) -> Result<RgbaImage, FilterError> {
        let (width, height) = src.dimensions();
        let max_dim = self.device.limits().max_texture_dimension_2d;
        if width > max_dim || height > max_dim {
            return Err(FilterError::SurfaceAllocationFailure(format!(
                "{width}x{height} exceeds device limit {max_dim}"
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let surface = OffscreenSurface::allocate(&self.device, width, height);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(FilterError::SurfaceAllocationFailure(err.to_string()));
        }

        self.queue.write_texture(
            surface.src.as_image_copy(),
            src.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width.saturating_mul(4)),
                rows_per_image: Some(height),
            },
            surface.extent,
        );
        self.queue.write_texture(
            surface.lut.as_image_copy(),
            lut.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(LUT_SIZE * 4),
                rows_per_image: Some(LUT_SIZE),
            },
            lut_extent(),
        );

        let params: [f32; 4] = [width as f32, height as f32, intensity, 0.0];
        self.queue
            .write_buffer(&surface.params, 0, f32s_as_bytes(&params));

        let src_view = surface.src.create_view(&wgpu::TextureViewDescriptor::default());
        let lut_view = surface.lut.create_view(&wgpu::TextureViewDescriptor::default());
        let dst_view = surface.dst.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("lut_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&src_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&lut_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&dst_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: surface.params.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("lut_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("lut_compute"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                width.div_ceil(WORKGROUP_SIZE),
                height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        encoder.copy_texture_to_buffer(
            surface.dst.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &surface.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(surface.padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            surface.extent,
        );

        self.queue.submit([encoder.finish()]);
        let slice = surface.readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::wait());
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => {
                return Err(FilterError::SurfaceAllocationFailure(
                    "readback mapping failed".to_string(),
                ));
            }
        }

        let unpadded = (width as usize) * 4;
        let padded = surface.padded_bytes_per_row as usize;
        let mut out = vec![0_u8; unpadded * (height as usize)];
        {
            let mapped = slice.get_mapped_range();
            for row in 0..height as usize {
                let src_offset = row * padded;
                let dst_offset = row * unpadded;
                out[dst_offset..dst_offset + unpadded]
                    .copy_from_slice(&mapped[src_offset..src_offset + unpadded]);
            }
        }
        surface.readback.unmap();

        RgbaImage::from_raw(width, height, out).ok_or_else(|| {
            FilterError::SurfaceAllocationFailure("readback size mismatch".to_string())
        })
    }
}

impl Compositor for GpuCompositor {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn apply(
        &self,
        source: &RgbaImage,
        lut: &RgbaImage,
        intensity: f32,
    ) -> Result<RgbaImage, FilterError> {
        lut::validate_dimensions(lut)?;
        if source.width() == 0 || source.height() == 0 {
            return Ok(source.clone());
        }
        self.dispatch(source, lut, super::clamp_intensity(intensity))
    }
}

/// Every GPU object one dispatch needs. Dropping it destroys them, so early
/// returns release the surface too.
struct OffscreenSurface {
    src: wgpu::Texture,
    lut: wgpu::Texture,
    dst: wgpu::Texture,
    params: wgpu::Buffer,
    readback: wgpu::Buffer,
    extent: wgpu::Extent3d,
    padded_bytes_per_row: u32,
}

impl OffscreenSurface {
    fn allocate(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = |label, size, usage| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage,
                view_formats: &[],
            })
        };
        let sampled = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
        let src = texture("lut_pass_src", extent, sampled);
        let lut = texture("lut_pass_table", lut_extent(), sampled);
        let dst = texture(
            "lut_pass_dst",
            extent,
            wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::COPY_SRC,
        );

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lut_pass_params"),
            size: (std::mem::size_of::<f32>() * 4) as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let unpadded_bytes_per_row = width.saturating_mul(4);
        let padded_bytes_per_row = unpadded_bytes_per_row
            .div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("lut_pass_readback"),
            size: padded_bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        Self {
            src,
            lut,
            dst,
            params,
            readback,
            extent,
            padded_bytes_per_row,
        }
    }
}

impl Drop for OffscreenSurface {
    fn drop(&mut self) {
        self.src.destroy();
        self.lut.destroy();
        self.dst.destroy();
        self.params.destroy();
        self.readback.destroy();
    }
}

fn lut_extent() -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: LUT_SIZE,
        height: LUT_SIZE,
        depth_or_array_layers: 1,
    }
}

fn build_pipeline(
    device: &wgpu::Device,
) -> Result<(wgpu::ComputePipeline, wgpu::BindGroupLayout), FilterError> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let sampled_entry = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    };
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("lut_bgl"),
        entries: &[
            sampled_entry(0),
            sampled_entry(1),
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 3,
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

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("lut_shader"),
        source: wgpu::ShaderSource::Wgsl(SHADER_SRC.into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("lut_layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("lut_pipeline"),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some("main"),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    });

    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(FilterError::ShaderConstructionFailure(err.to_string()));
    }
    Ok((pipeline, bind_group_layout))
}

fn f32s_as_bytes(values: &[f32]) -> &[u8] {
    // f32 has no invalid bit patterns; reinterpreting as bytes is safe.
    unsafe {
        std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), std::mem::size_of_val(values))
    }
}

// Layout constants mirror lut::CUBE_LEVELS / TILES_PER_ROW / LUT_SIZE.
const SHADER_SRC: &str = r#"
struct Params {
    width: f32,
    height: f32,
    intensity: f32,
    _pad0: f32,
};

@group(0) @binding(0)
var src_tex: texture_2d<f32>;
@group(0) @binding(1)
var lut_tex: texture_2d<f32>;
@group(0) @binding(2)
var dst_tex: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(3)
var<uniform> params: Params;

const CUBE_LEVELS: u32 = 64u;
const TILES_PER_ROW: u32 = 8u;
const LUT_MAX: i32 = 511;

fn level(c: f32) -> u32 {
    return u32(round(clamp(c, 0.0, 1.0) * 255.0)) >> 2u;
}

@compute @workgroup_size(16, 16, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let width = u32(params.width + 0.5);
    let height = u32(params.height + 0.5);
    if (gid.x >= width || gid.y >= height) {
        return;
    }

    let coord = vec2<i32>(i32(gid.x), i32(gid.y));
    let px = textureLoad(src_tex, coord, 0);

    let blue = level(px.b);
    let lut_x = (blue % TILES_PER_ROW) * CUBE_LEVELS + level(px.r);
    let lut_y = (blue / TILES_PER_ROW) * CUBE_LEVELS + level(px.g);
    let lut_coord = clamp(
        vec2<i32>(i32(lut_x), i32(lut_y)),
        vec2<i32>(0, 0),
        vec2<i32>(LUT_MAX, LUT_MAX),
    );
    let mapped = textureLoad(lut_tex, lut_coord, 0);

    let t = clamp(params.intensity, 0.0, 1.0);
    let rgb = mix(px.rgb, mapped.rgb, vec3<f32>(t, t, t));
    textureStore(dst_tex, coord, vec4<f32>(rgb, px.a));
}
"#;

#[cfg(test)]
mod tests {
    use image::{ImageBuffer, Rgba, RgbaImage};

    use super::{GpuCompositor, SHADER_SRC};
    use crate::lut::{CUBE_LEVELS, LUT_SIZE, TILES_PER_ROW, packed_lut_from_fn};
    use crate::processing::{Compositor, CpuCompositor};

    fn gradient() -> RgbaImage {
        ImageBuffer::from_fn(40, 24, |x, y| {
            Rgba([
                ((x * 7 + y * 3) % 256) as u8,
                ((x * 11 + y * 5) % 256) as u8,
                ((x * 13 + y * 17) % 256) as u8,
                255,
            ])
        })
    }

    #[test]
    fn shader_constants_match_packed_layout() {
        assert!(SHADER_SRC.contains(&format!("CUBE_LEVELS: u32 = {}u", CUBE_LEVELS)));
        assert!(SHADER_SRC.contains(&format!("TILES_PER_ROW: u32 = {}u", TILES_PER_ROW)));
        assert!(SHADER_SRC.contains(&format!("LUT_MAX: i32 = {}", LUT_SIZE - 1)));
    }

    #[test]
    fn parity_matches_cpu_for_inverting_lut() {
        let Ok(gpu) = GpuCompositor::new() else {
            return;
        };
        let img = gradient();
        let lut = packed_lut_from_fn(|r, g, b| [255 - r, g / 2, 255 - b]);
        for intensity in [0.0, 0.35, 1.0] {
            let cpu = CpuCompositor.apply(&img, &lut, intensity).unwrap();
            let out = gpu
                .apply(&img, &lut, intensity)
                .expect("gpu apply should succeed");
            assert_rgba_close(&cpu, &out, 1);
        }
    }

    #[test]
    fn rejects_wrong_lut_size() {
        let Ok(gpu) = GpuCompositor::new() else {
            return;
        };
        let err = gpu
            .apply(&gradient(), &RgbaImage::new(512, 64), 1.0)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::FilterError::InvalidLutDimensions { .. }
        ));
    }

    fn assert_rgba_close(cpu: &RgbaImage, gpu: &RgbaImage, tolerance: u8) {
        assert_eq!(cpu.dimensions(), gpu.dimensions());
        for (c, g) in cpu.pixels().zip(gpu.pixels()) {
            for i in 0..4 {
                let d = c[i].abs_diff(g[i]);
                assert!(
                    d <= tolerance,
                    "channel {} differed by {} (cpu={}, gpu={}, tol={})",
                    i,
                    d,
                    c[i],
                    g[i],
                    tolerance
                );
            }
        }
    }
}
