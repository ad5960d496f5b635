//! GPU-resident heat diffusion on a fixed 2D grid.
//!
//! The event loop drives a two-phase cycle per frame: `step()` advances the
//! field one tick through the compute pass and commits the result, then
//! `draw()` rasterizes the committed field to the window. Construction is
//! async (adapter and device acquisition), so the renderer is built on
//! `resumed` and handed back through a user event.

pub mod error;
pub mod gpu;
pub mod sim;

use std::sync::Arc;

use winit::{
    event::WindowEvent,
    event_loop::{EventLoop, EventLoopProxy},
    window::WindowAttributes,
};

use crate::{
    error::SimError,
    gpu::GpuFieldRenderer,
    sim::{DiffusionParams, Field},
};

/// Fixed per-run configuration. The embedding application supplies
/// dimensions and the initial condition; nothing is read from files or
/// flags.
#[derive(Clone, Copy, Debug)]
pub struct SimConfig {
    pub grid_width: u32,
    pub grid_height: u32,
    pub diffusion_rate: f32,
    /// Radius of the hot disk seeded at the grid center, in cells.
    pub seed_radius: f32,
}

impl SimConfig {
    /// The initial condition: a disk of value 1.0 centered on the grid,
    /// zero elsewhere.
    pub fn initial_field(&self) -> Field {
        let mut field = Field::new(self.grid_width, self.grid_height);
        field.seed_disk(
            self.grid_width as f32 / 2.0,
            self.grid_height as f32 / 2.0,
            self.seed_radius,
            1.0,
        );
        field
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            grid_width: 512,
            grid_height: 512,
            diffusion_rate: DiffusionParams::STABLE_RATE,
            seed_radius: 48.0,
        }
    }
}

/// Renderer construction result, delivered through the event loop.
pub enum GpuMessage {
    Initialized(GpuFieldRenderer),
    Error(SimError),
}

struct Application {
    proxy: Option<EventLoopProxy<GpuMessage>>,
    renderer: Option<GpuFieldRenderer>,
    config: SimConfig,
}

impl Application {
    fn new(event_loop: &EventLoop<GpuMessage>, config: SimConfig) -> Self {
        Self {
            proxy: Some(event_loop.create_proxy()),
            renderer: None,
            config,
        }
    }
}

impl winit::application::ApplicationHandler<GpuMessage> for Application {
    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }

        // Match the surface to the grid so one cell maps to one pixel
        // until the user resizes.
        let attrs = WindowAttributes::default()
            .with_title("heatgrid")
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.grid_width,
                self.config.grid_height,
            ));
        match event_loop.create_window(attrs) {
            Ok(window) => {
                if let Some(proxy) = self.proxy.take() {
                    let window = Arc::new(window);
                    let field = self.config.initial_field();
                    let params = DiffusionParams::new(self.config.diffusion_rate);

                    let result =
                        pollster::block_on(GpuFieldRenderer::new(window, field, params));
                    match result {
                        Ok(renderer) => {
                            let _ = proxy.send_event(GpuMessage::Initialized(renderer));
                        }
                        Err(e) => {
                            log::error!("failed to create GPU renderer: {e}");
                            let _ = proxy.send_event(GpuMessage::Error(e));
                        }
                    }
                }
            }
            Err(e) => log::error!("failed to create window: {e}"),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                self.renderer = None;
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Some(ref mut renderer) = self.renderer {
                    renderer.step();

                    if renderer.steps() % 600 == 0 {
                        log::debug!("{} steps completed", renderer.steps());
                    }

                    match renderer.draw() {
                        Ok(()) => renderer.request_redraw(),
                        Err(SimError::ContextLost(
                            wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated,
                        )) => {
                            // Surface needs reconfiguring; retry is owned
                            // here, not inside the core.
                            let (w, h) = renderer.surface_size();
                            renderer.resize(w, h);
                            renderer.request_redraw();
                        }
                        Err(SimError::ContextLost(wgpu::SurfaceError::OutOfMemory)) => {
                            log::error!("surface out of memory");
                            event_loop.exit();
                        }
                        Err(e) => {
                            // Halt rather than keep presenting stale state.
                            log::error!("draw failed: {e}");
                            event_loop.exit();
                        }
                    }
                }
            }
            _ => (),
        }
    }

    fn user_event(&mut self, event_loop: &winit::event_loop::ActiveEventLoop, event: GpuMessage) {
        match event {
            GpuMessage::Initialized(renderer) => {
                log::info!("GPU renderer initialized");
                renderer.request_redraw();
                self.renderer = Some(renderer);
            }
            GpuMessage::Error(e) => {
                log::error!("GPU initialization failed, exiting: {e}");
                event_loop.exit();
            }
        }
    }
}

/// Run the simulation until the window closes.
pub fn run(config: SimConfig) -> anyhow::Result<()> {
    let event_loop = EventLoop::<GpuMessage>::with_user_event().build()?;
    let mut app = Application::new(&event_loop, config);
    event_loop.run_app(&mut app)?;
    Ok(())
}
