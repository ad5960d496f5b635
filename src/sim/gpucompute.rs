//! GPU diffusion pipeline and a headless compute context.
//!
//! [`DiffusionPipeline`] owns the double-buffered field storage and the
//! compute pass that advances it; it is shared by the windowed renderer in
//! [`crate::gpu`] and by [`ComputeContext`], which runs the same pipeline
//! without a surface and can copy the field back for inspection.

use std::sync::mpsc::channel;

use wgpu::{
    BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor,
    BindGroupLayoutEntry, Buffer, BufferDescriptor, BufferUsages, CommandEncoderDescriptor,
    ComputePassDescriptor, ComputePipeline, ComputePipelineDescriptor, Device, Instance,
    PipelineCompilationOptions, Queue, ShaderStages,
    util::{BufferInitDescriptor, DeviceExt},
};

use crate::error::SimError;
use crate::sim::{DiffusionParams, Field};

/// Double-buffered field storage plus the compute pass that advances it.
///
/// Exactly one buffer is "current" at any point outside a step; `flipped`
/// names which one. A step dispatches the kernel reading current and
/// writing next, then commits by flipping the flag after submission.
pub struct DiffusionPipeline {
    field_a: Buffer,
    field_b: Buffer,
    fields_bg: BindGroup,
    fields_bg_rev: BindGroup,
    params_bind_group: BindGroup,
    size_bind_group: BindGroup,
    flipped: bool,
    pipeline: ComputePipeline,
    width: u32,
    height: u32,
    steps: u32,
}

impl DiffusionPipeline {
    pub async fn new(
        device: &Device,
        start: &Field,
        params: DiffusionParams,
    ) -> Result<Self, SimError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::include_wgsl!("./diffuse.wgsl"));
        if let Some(e) = device.pop_error_scope().await {
            return Err(SimError::ShaderCompile {
                diagnostics: e.to_string(),
            });
        }

        // The current field is seeded with the initial values; the next
        // field only ever holds kernel output and is never read before the
        // first step writes it.
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let field_a = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("field buffer a"),
            contents: bytemuck::cast_slice(start.values()),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        });
        let field_b = device.create_buffer(&BufferDescriptor {
            label: Some("field buffer b"),
            size: field_a.size(),
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(e) = device.pop_error_scope().await {
            return Err(SimError::Allocation {
                detail: e.to_string(),
            });
        }

        let params_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("diffusion params buffer"),
            contents: bytemuck::bytes_of(&params),
            usage: BufferUsages::UNIFORM,
        });

        // The size uniform is written exactly once, from the same field the
        // buffers were sized from; nothing can desynchronize the kernel's
        // boundary test from the actual grid.
        let size_buf = device.create_buffer_init(&BufferInitDescriptor {
            label: Some("grid size buffer"),
            contents: bytemuck::cast_slice(&[start.width(), start.height()]),
            usage: BufferUsages::UNIFORM,
        });

        let fields_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("field buffers bind group layout"),
            entries: &[
                storage_entry(0, ShaderStages::COMPUTE),
                storage_entry(1, ShaderStages::COMPUTE),
            ],
        });
        let fields_bg = device.create_bind_group(&BindGroupDescriptor {
            label: Some("field bind group (a -> b)"),
            layout: &fields_bg_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: field_a.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: field_b.as_entire_binding(),
                },
            ],
        });
        let fields_bg_rev = device.create_bind_group(&BindGroupDescriptor {
            label: Some("field bind group (b -> a)"),
            layout: &fields_bg_layout,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: field_b.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: field_a.as_entire_binding(),
                },
            ],
        });

        let params_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("diffusion params bind group layout"),
            entries: &[uniform_entry(0, ShaderStages::COMPUTE)],
        });
        let params_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("diffusion params bind group"),
            layout: &params_bg_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: params_buf.as_entire_binding(),
            }],
        });

        let size_bg_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("grid size bind group layout"),
            entries: &[uniform_entry(0, ShaderStages::COMPUTE)],
        });
        let size_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("grid size bind group"),
            layout: &size_bg_layout,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: size_buf.as_entire_binding(),
            }],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("diffusion pipeline layout"),
            bind_group_layouts: &[&fields_bg_layout, &params_bg_layout, &size_bg_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("diffusion compute pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: None,
            compilation_options: PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(e) = device.pop_error_scope().await {
            return Err(SimError::PipelineLink {
                diagnostics: e.to_string(),
            });
        }

        Ok(Self {
            field_a,
            field_b,
            fields_bg,
            fields_bg_rev,
            params_bind_group,
            size_bind_group,
            flipped: false,
            pipeline,
            width: start.width(),
            height: start.height(),
            steps: 0,
        })
    }

    /// Run one diffusion step and commit it. All writes land in the next
    /// buffer; the flip after submission is the commit, so no observer ever
    /// sees a half-written field.
    pub fn encode_step(&mut self, device: &Device, queue: &Queue) {
        let num_dispatches = (self.width * self.height).div_ceil(64);

        let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("diffusion step encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("diffusion step compute pass"),
                ..Default::default()
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(
                0,
                if self.flipped {
                    &self.fields_bg_rev
                } else {
                    &self.fields_bg
                },
                &[],
            );
            pass.set_bind_group(1, &self.params_bind_group, &[]);
            pass.set_bind_group(2, &self.size_bind_group, &[]);
            pass.dispatch_workgroups(num_dispatches, 1, 1);
        }
        queue.submit(std::iter::once(encoder.finish()));

        self.flipped = !self.flipped;
        self.steps += 1;
    }

    /// The committed, authoritative field buffer. Presentation reads this
    /// and nothing else.
    pub fn front_buffer(&self) -> &Buffer {
        if self.flipped {
            &self.field_b
        } else {
            &self.field_a
        }
    }

    pub fn buffers(&self) -> (&Buffer, &Buffer) {
        (&self.field_a, &self.field_b)
    }

    pub fn flipped(&self) -> bool {
        self.flipped
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }
}

fn storage_entry(binding: u32, visibility: ShaderStages) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32, visibility: ShaderStages) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Headless diffusion context: same pipeline, no surface. Used where the
/// field needs to be advanced and read back without a window.
pub struct ComputeContext {
    device: Device,
    queue: Queue,
    pipeline: DiffusionPipeline,
}

impl ComputeContext {
    pub async fn create(start: &Field, params: DiffusionParams) -> Result<Self, SimError> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await?;

        let downlevel_caps = adapter.get_downlevel_capabilities();
        if !downlevel_caps
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(SimError::NoComputeSupport);
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("heatgrid headless device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await?;

        let pipeline = DiffusionPipeline::new(&device, start, params).await?;

        Ok(Self {
            device,
            queue,
            pipeline,
        })
    }

    pub fn step(&mut self) {
        self.pipeline.encode_step(&self.device, &self.queue);
    }

    pub fn steps(&self) -> u32 {
        self.pipeline.steps()
    }

    /// Copy the committed field back to the CPU.
    pub fn read_back(&self) -> Result<Field, SimError> {
        let src = self.pipeline.front_buffer();
        let staging = self.device.create_buffer(&BufferDescriptor {
            label: Some("field readback buffer"),
            size: src.size(),
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some("field readback encoder"),
            });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, None);
        self.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = channel();
        staging.map_async(wgpu::MapMode::Read, .., move |v| {
            let _ = tx.send(v);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| SimError::Readback {
                detail: e.to_string(),
            })?;
        rx.recv()
            .map_err(|e| SimError::Readback {
                detail: e.to_string(),
            })?
            .map_err(|e| SimError::Readback {
                detail: e.to_string(),
            })?;

        let values = {
            let view = staging.get_mapped_range(..);
            bytemuck::cast_slice::<u8, f32>(view.as_ref()).to_vec()
        };
        let (width, height) = self.pipeline.dimensions();
        Ok(Field::from_values(width, height, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The kernel and the CPU reference stepper must agree. Skips when the
    // host has no usable adapter so the numeric suite still runs everywhere.
    #[test]
    fn gpu_kernel_matches_cpu_reference() {
        let mut start = Field::new(16, 16);
        start.seed_disk(8.0, 8.0, 3.0, 1.0);
        let params = DiffusionParams::new(0.25);

        let mut ctx = match pollster::block_on(ComputeContext::create(&start, params)) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("skipping GPU parity test: {e}");
                return;
            }
        };

        let mut expected = start;
        for _ in 0..5 {
            ctx.step();
            expected = expected.stepped(params.rate);
        }
        let actual = ctx.read_back().expect("readback failed");

        assert_eq!(ctx.steps(), 5);
        for (i, (a, e)) in actual
            .values()
            .iter()
            .zip(expected.values().iter())
            .enumerate()
        {
            assert!(
                (a - e).abs() < 1e-5,
                "cell {i} diverged: gpu {a} vs cpu {e}"
            );
        }
    }
}
