//! Error taxonomy for the simulation core.
//!
//! Everything here is surfaced synchronously to the immediate caller and
//! never retried internally. Recovery policy belongs to the driving loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// GPU storage for a field could not be allocated.
    #[error("failed to allocate field storage: {detail}")]
    Allocation { detail: String },

    /// A shader module failed validation.
    #[error("shader compilation failed: {diagnostics}")]
    ShaderCompile { diagnostics: String },

    /// A pipeline could not be created from validated shader modules.
    #[error("pipeline creation failed: {diagnostics}")]
    PipelineLink { diagnostics: String },

    #[error("no compatible graphics adapter found: {0}")]
    NoAdapter(#[from] wgpu::RequestAdapterError),

    #[error("adapter does not support compute shaders")]
    NoComputeSupport,

    #[error("failed to acquire graphics device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error("failed to create render surface: {0}")]
    CreateSurface(#[from] wgpu::CreateSurfaceError),

    /// The surface or device became invalid mid-run. Not recoverable from
    /// inside the core; the event loop decides whether to reconfigure.
    #[error("graphics context lost: {0}")]
    ContextLost(#[from] wgpu::SurfaceError),

    /// Copying a field back off the GPU failed.
    #[error("field readback failed: {detail}")]
    Readback { detail: String },
}
