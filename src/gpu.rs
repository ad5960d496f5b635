//! Integrated GPU context: diffusion compute plus windowed presentation.
//!
//! [`GpuFieldRenderer`] owns the device, queue, the shared
//! [`DiffusionPipeline`] and the presentation pipeline. The driving event
//! loop calls `step()` then `draw()` once per frame; both run on one logical
//! thread and never overlap, so draw always observes a committed field.

use std::sync::Arc;

use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, Buffer, BufferUsages, CommandEncoderDescriptor, Device, FragmentState,
    Instance, LoadOp, MultisampleState, Operations, PipelineLayoutDescriptor, PrimitiveState,
    Queue, RenderPassColorAttachment, RenderPassDescriptor, RenderPipeline,
    RenderPipelineDescriptor, ShaderStages, StoreOp, Surface, SurfaceConfiguration, TextureUsages,
    TextureViewDescriptor, VertexState,
    util::{BufferInitDescriptor, DeviceExt},
};
use winit::window::Window;

use crate::error::SimError;
use crate::sim::{DiffusionParams, Field, gpucompute::DiffusionPipeline};

pub struct GpuFieldRenderer {
    #[allow(dead_code)]
    instance: Instance, // Keep instance alive for the lifetime of the renderer
    device: Device,
    queue: Queue,
    compute: DiffusionPipeline,
    render: PresentContext,
    window: Arc<Window>,
}

/// Presentation half of the integrated context: surface plus the fullscreen
/// pass that maps field scalars to colors.
struct PresentContext {
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    render_pipeline: RenderPipeline,
    field_bind_group_a: BindGroup,
    field_bind_group_b: BindGroup,
    size_bind_group: BindGroup,
}

impl GpuFieldRenderer {
    pub async fn new(
        window: Arc<Window>,
        start: Field,
        params: DiffusionParams,
    ) -> Result<Self, SimError> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());

        // Create surface first to find a compatible adapter
        let surface = instance.create_surface(window.clone())?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: Some(&surface),
            })
            .await?;

        log::info!("Using adapter: {:?}", adapter.get_info());

        let downlevel_caps = adapter.get_downlevel_capabilities();
        if !downlevel_caps
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(SimError::NoComputeSupport);
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("heatgrid device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);

        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let compute = DiffusionPipeline::new(&device, &start, params).await?;
        let render =
            Self::create_present_context(&device, surface, surface_config, surface_format, &compute)
                .await?;

        log::info!(
            "simulation ready: {}x{} grid, rate {}",
            start.width(),
            start.height(),
            params.rate
        );

        Ok(Self {
            instance,
            device,
            queue,
            compute,
            render,
            window,
        })
    }

    async fn create_present_context(
        device: &Device,
        surface: Surface<'static>,
        surface_config: SurfaceConfiguration,
        surface_format: wgpu::TextureFormat,
        compute: &DiffusionPipeline,
    ) -> Result<PresentContext, SimError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::include_wgsl!("./rendering/present.wgsl"));
        if let Some(e) = device.pop_error_scope().await {
            return Err(SimError::ShaderCompile {
                diagnostics: e.to_string(),
            });
        }

        // Presentation only ever reads field storage
        let field_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("present field bind group layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let (field_a, field_b) = compute.buffers();
        let field_bind_group_a = Self::field_bind_group(
            device,
            &field_bg_layout,
            field_a,
            "present field bind group (a)",
        );
        let field_bind_group_b = Self::field_bind_group(
            device,
            &field_bg_layout,
            field_b,
            "present field bind group (b)",
        );

        let size_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("present size bind group layout"),
            entries: &[BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let (grid_width, grid_height) = compute.dimensions();
        let size_buffer = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("present size buffer"),
            contents: bytemuck::cast_slice(&[grid_width, grid_height]),
            usage: BufferUsages::UNIFORM,
        });
        let size_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("present size bind group"),
            layout: &size_bg_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: size_buffer.as_entire_binding(),
            }],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("present pipeline layout"),
            bind_group_layouts: &[&field_bg_layout, &size_bg_layout],
            push_constant_ranges: &[],
        });

        let render_pipeline = device.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("present pipeline"),
            layout: Some(&pipeline_layout),
            vertex: VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: None,
            multisample: MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });
        if let Some(e) = device.pop_error_scope().await {
            return Err(SimError::PipelineLink {
                diagnostics: e.to_string(),
            });
        }

        Ok(PresentContext {
            surface,
            surface_config,
            render_pipeline,
            field_bind_group_a,
            field_bind_group_b,
            size_bind_group,
        })
    }

    fn field_bind_group(
        device: &Device,
        layout: &wgpu::BindGroupLayout,
        buffer: &Buffer,
        label: &str,
    ) -> BindGroup {
        device.create_bind_group(&BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        })
    }

    /// Advance the field by one discrete tick. Reads current, writes next,
    /// commits.
    pub fn step(&mut self) {
        self.compute.encode_step(&self.device, &self.queue);
    }

    /// Rasterize the committed field to the window surface. Never touches
    /// simulation state.
    pub fn draw(&self) -> Result<(), SimError> {
        let output = self.render.surface.get_current_texture()?;
        let view = output.texture.create_view(&TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("present encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("present pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(wgpu::Color::BLACK),
                        store: StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            render_pass.set_pipeline(&self.render.render_pipeline);

            // The flip flag names the committed buffer; next is never read
            // by presentation.
            let field_bind_group = if self.compute.flipped() {
                &self.render.field_bind_group_b
            } else {
                &self.render.field_bind_group_a
            };
            render_pass.set_bind_group(0, field_bind_group, &[]);
            render_pass.set_bind_group(1, &self.render.size_bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        Ok(())
    }

    /// Reconfigure the surface after a window resize or a lost context.
    /// The grid itself is fixed for the simulation's lifetime.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.render.surface_config.width = width;
            self.render.surface_config.height = height;
            self.render
                .surface
                .configure(&self.device, &self.render.surface_config);
            log::debug!("surface reconfigured to {width}x{height}");
        }
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    pub fn surface_size(&self) -> (u32, u32) {
        (
            self.render.surface_config.width,
            self.render.surface_config.height,
        )
    }

    pub fn steps(&self) -> u32 {
        self.compute.steps()
    }
}
