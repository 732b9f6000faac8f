//! GPU backend abstraction layer.
//!
//! This module provides a trait-based abstraction over the GPU device,
//! allowing the engine to work with different graphics APIs.
//!
//! # Available Backends
//!
//! - `dummy` (default): no-op backend that records its command stream, used
//!   for testing and development without GPU hardware
//! - `wgpu-backend`: cross-platform, headless backend using wgpu
//!
//! The rest of the engine only depends on [`GraphicsBackend`]; backends are
//! constructed by the caller and passed in by reference.

pub mod traits;
pub mod types;

#[cfg(feature = "dummy")]
pub mod dummy;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use traits::{
    BackendError, BackendResult, BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry,
    BindGroupLayoutHandle, BindingType, BufferHandle, ColorAttachment, ComputePipelineDescriptor,
    ComputePipelineHandle, DepthStencilAttachment, GraphicsBackend, RenderPassDescriptor,
    RenderPipelineDescriptor, RenderPipelineHandle, ShaderStageFlags, TextureHandle,
    TextureViewHandle,
};
pub use types::*;

#[cfg(feature = "dummy")]
pub use dummy::{DummyBackend, RecordedCommand};

#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::WgpuBackend;
