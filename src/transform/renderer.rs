//! `wgpu` implementation of [`FrameRenderer`]
//!
//! Renders each frame as a textured quad into an offscreen RGBA target and
//! copies the result back into host memory.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use wgpu::util::DeviceExt;

use crate::{
    error::TransformError,
    model::frame::{frame_len, VideoFrame, BYTES_PER_PIXEL},
    transform::FrameRenderer,
};

const SURFACE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const QUAD_VERTEX_COUNT: u32 = 6;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 3],
    uv: [f32; 2],
}

// Two triangles covering clip space, uv origin at the top left.
const QUAD: [Vertex; 6] = [
    Vertex { position: [-1.0, -1.0, 0.0], uv: [0.0, 1.0] },
    Vertex { position: [1.0, -1.0, 0.0], uv: [1.0, 1.0] },
    Vertex { position: [1.0, 1.0, 0.0], uv: [1.0, 0.0] },
    Vertex { position: [-1.0, -1.0, 0.0], uv: [0.0, 1.0] },
    Vertex { position: [1.0, 1.0, 0.0], uv: [1.0, 0.0] },
    Vertex { position: [-1.0, 1.0, 0.0], uv: [0.0, 0.0] },
];

/// Per-size resources: input texture, render target and readback buffer.
struct RenderSurface {
    width: u32,
    height: u32,
    input: wgpu::Texture,
    input_view: wgpu::TextureView,
    output: wgpu::Texture,
    output_view: wgpu::TextureView,
    readback: wgpu::Buffer,
    padded_bytes_per_row: u32,
}

pub struct WgpuRenderer {
    /// Shared with the blocking task that polls for map completion.
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    vertex_buffer: Option<wgpu::Buffer>,
    surface: Option<RenderSurface>,
}

impl WgpuRenderer {
    /// Acquires an adapter and device and builds the fixed quad pipeline.
    pub async fn new() -> Result<Self, TransformError> {
        info!("[FrameTransformer] Initializing wgpu.");

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .ok_or_else(|| TransformError::GpuUnsupported("no suitable adapter".to_string()))?;

        let adapter_info = adapter.get_info();
        info!(
            "[FrameTransformer] Using adapter '{}' ({:?})",
            adapter_info.name, adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("frame-transform-device"),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(|e| TransformError::GpuUnsupported(e.to_string()))?;

        device.on_uncaptured_error(Box::new(|e| {
            error!("[FrameTransformer] Uncaptured wgpu error: {}", e);
        }));

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("quad-vertex-buffer"),
            contents: bytemuck::cast_slice(&QUAD),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("frame-sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        // sampler(0), frame texture(1)
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("frame-bind-group-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("swirl-shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("swirl.wgsl").into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("frame-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("frame-render-pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: std::mem::size_of::<Vertex>() as u64,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[
                        // position
                        wgpu::VertexAttribute {
                            offset: 0,
                            shader_location: 0,
                            format: wgpu::VertexFormat::Float32x3,
                        },
                        // uv
                        wgpu::VertexAttribute {
                            offset: 12,
                            shader_location: 1,
                            format: wgpu::VertexFormat::Float32x2,
                        },
                    ],
                }],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: SURFACE_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(Self {
            device: Arc::new(device),
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            vertex_buffer: Some(vertex_buffer),
            surface: None,
        })
    }

    fn create_surface(&self, width: u32, height: u32) -> RenderSurface {
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };

        let input = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame-input"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SURFACE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let output = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame-output"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: SURFACE_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        let padded_bytes_per_row = padded_bytes_per_row(width);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame-readback"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        RenderSurface {
            width,
            height,
            input_view: input.create_view(&wgpu::TextureViewDescriptor::default()),
            input,
            output_view: output.create_view(&wgpu::TextureViewDescriptor::default()),
            output,
            readback,
            padded_bytes_per_row,
        }
    }

    /// Maps the readback buffer without blocking the runtime: the device is
    /// polled on the blocking pool while this task awaits the map callback.
    async fn read_back(&self, surface: &RenderSurface) -> Result<Vec<u8>, TransformError> {
        let slice = surface.readback.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        let device = Arc::clone(&self.device);
        let poll = tokio::task::spawn_blocking(move || {
            let _ = device.poll(wgpu::Maintain::Wait);
        });

        let mapped = rx.await;
        poll.await
            .map_err(|e| TransformError::Readback(e.to_string()))?;
        mapped
            .map_err(|e| TransformError::Readback(e.to_string()))?
            .map_err(|e| TransformError::Readback(e.to_string()))?;

        let row_len = surface.width as usize * BYTES_PER_PIXEL;
        let mut pixels = Vec::with_capacity(frame_len(surface.width, surface.height));
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(surface.padded_bytes_per_row as usize) {
                pixels.extend_from_slice(&row[..row_len]);
            }
        }
        surface.readback.unmap();

        Ok(pixels)
    }
}

#[async_trait]
impl FrameRenderer for WgpuRenderer {
    fn configure(&mut self, width: u32, height: u32) -> Result<(), TransformError> {
        if let Some(old) = self.surface.take() {
            old.input.destroy();
            old.output.destroy();
            old.readback.destroy();
        }
        debug!("[FrameTransformer] Configuring surface {}x{}", width, height);
        self.surface = Some(self.create_surface(width, height));
        Ok(())
    }

    async fn draw(&mut self, frame: &VideoFrame) -> Result<Vec<u8>, TransformError> {
        let (Some(surface), Some(vertex_buffer)) = (&self.surface, &self.vertex_buffer) else {
            return Err(TransformError::Render("surface is not configured".to_string()));
        };
        if frame.dimensions() != (surface.width, surface.height) {
            return Err(TransformError::Render(format!(
                "frame is {}x{} but surface is {}x{}",
                frame.width(),
                frame.height(),
                surface.width,
                surface.height
            )));
        }

        let extent = wgpu::Extent3d {
            width: surface.width,
            height: surface.height,
            depth_or_array_layers: 1,
        };

        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &surface.input,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            frame.data(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(surface.width * BYTES_PER_PIXEL as u32),
                rows_per_image: Some(surface.height),
            },
            extent,
        );

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("frame-bind-group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&surface.input_view),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame-encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("frame-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &surface.output_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_viewport(0.0, 0.0, surface.width as f32, surface.height as f32, 0.0, 1.0);
            pass.set_pipeline(&self.pipeline);
            pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..QUAD_VERTEX_COUNT, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &surface.output,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &surface.readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(surface.padded_bytes_per_row),
                    rows_per_image: Some(surface.height),
                },
            },
            extent,
        );

        self.queue.submit(Some(encoder.finish()));

        self.read_back(surface).await
    }

    fn destroy(&mut self) {
        info!("[FrameTransformer] Freeing all wgpu resources.");
        if let Some(buffer) = self.vertex_buffer.take() {
            buffer.destroy();
        }
        if let Some(surface) = self.surface.take() {
            surface.input.destroy();
            surface.output.destroy();
            surface.readback.destroy();
        }
    }
}

/// Rows copied out of a texture must be aligned to
/// `COPY_BYTES_PER_ROW_ALIGNMENT`.
fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_PIXEL as u32;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(640), 2560);
    }

    #[tokio::test]
    #[ignore = "requires a GPU adapter"]
    async fn renders_a_frame_on_real_hardware() {
        let mut renderer = WgpuRenderer::new().await.unwrap();
        renderer.configure(8, 4).unwrap();

        let frame = VideoFrame::new(10, 8, 4, vec![200; frame_len(8, 4)]).unwrap();
        let pixels = renderer.draw(&frame).await.unwrap();

        assert_eq!(pixels.len(), frame_len(8, 4));
        renderer.destroy();
    }
}
