//! Core backend abstraction traits
//!
//! [`GraphicsBackend`] defines the opaque device capability the engine is
//! built on: resource creation, state transitions, command recording on three
//! logical queues, and fence-style synchronization. The render graph and the
//! pipeline passes only ever talk to `&mut dyn GraphicsBackend`.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    #[error("Internal backend error: {0}")]
    Internal(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPipelineHandle(pub(crate) u64);

/// Handle to a compute pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineHandle(pub(crate) u64);

/// Handle to a bind group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupHandle(pub(crate) u64);

/// Handle to a bind group layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutHandle(pub(crate) u64);

/// Bind group entry for creating bind groups
#[derive(Debug, Clone)]
pub enum BindGroupEntry {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Texture(TextureViewHandle),
}

/// Bind group layout entry
#[derive(Debug, Clone)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStageFlags,
    pub ty: BindingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStageFlags(u32);

impl ShaderStageFlags {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const COMPUTE: Self = Self(1 << 2);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ShaderStageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Binding type
#[derive(Debug, Clone)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    Texture,
    DepthTexture,
}

/// Render pipeline descriptor
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    /// WGSL module containing both vertex and fragment entry points.
    pub shader: String,
    pub vs_entry: String,
    /// `None` for depth-only pipelines (shadow passes).
    pub fs_entry: Option<String>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_targets: Vec<ColorTargetState>,
}

/// Compute pipeline descriptor
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    /// WGSL module source.
    pub shader: String,
    pub entry_point: String,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    /// Bytes of root constants pushed per dispatch (0 if unused).
    pub push_constant_size: u32,
}

/// Color attachment for a render pass
#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub view: TextureViewHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// Depth attachment for a render pass
#[derive(Debug, Clone)]
pub struct DepthStencilAttachment {
    pub view: TextureViewHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub read_only: bool,
}

/// Render pass descriptor
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
}

/// Main graphics backend trait.
///
/// Object-safe: backends are constructed through inherent methods and used
/// through `&mut dyn GraphicsBackend`.
///
/// # Recording model
///
/// Commands are recorded between [`begin_commands`] and [`submit_commands`]
/// on a logical queue. Within a single queue, commands execute in submission
/// order; across queues, ordering is guaranteed only where
/// [`wait_sync_handle`] is explicitly inserted.
///
/// [`begin_commands`]: Self::begin_commands
/// [`submit_commands`]: Self::submit_commands
/// [`wait_sync_handle`]: Self::wait_sync_handle
pub trait GraphicsBackend {
    /// Get the backend name for debugging.
    fn name(&self) -> &'static str;

    // Resource creation

    /// Create a buffer.
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Write data to a buffer. The write is ordered before the next
    /// submission on the copy queue.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    /// Create a texture.
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a view of the whole texture.
    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle>;

    /// Obtain a shader-visible index for a texture view, for use inside
    /// GPU-side material records.
    fn texture_view_index(&mut self, view: TextureViewHandle) -> u32;

    /// Destroy a buffer.
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Destroy a texture.
    fn destroy_texture(&mut self, texture: TextureHandle);

    // Pipeline creation

    /// Create a bind group layout.
    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle>;

    /// Create a bind group.
    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle>;

    /// Create a render pipeline.
    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    /// Create a compute pipeline.
    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle>;

    // Submission and synchronization

    /// Open a command batch on the given queue.
    fn begin_commands(&mut self, queue: QueueKind);

    /// Close and submit the current batch on the given queue.
    ///
    /// The returned handle is signaled when the batch retires and can be
    /// waited on from another queue.
    fn submit_commands(&mut self, queue: QueueKind) -> SyncHandle;

    /// Make subsequent work on `queue` wait (GPU-side) until `handle` has
    /// been signaled by the queue that produced it.
    fn wait_sync_handle(&mut self, queue: QueueKind, handle: SyncHandle);

    /// Block the host until all submitted work has retired.
    fn wait_idle(&mut self);

    // Transitions and copies

    /// Transition a buffer between resource states.
    fn transition_buffer(&mut self, buffer: BufferHandle, from: ResourceState, to: ResourceState);

    /// Transition a texture between resource states.
    fn transition_texture(
        &mut self,
        texture: TextureHandle,
        from: ResourceState,
        to: ResourceState,
    );

    /// Record a buffer-to-buffer copy.
    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    );

    /// Record a fill of a buffer region with a repeated 32-bit word.
    fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32);

    // Compute recording

    /// Begin a compute pass.
    fn begin_compute_pass(&mut self, label: Option<&str>);

    /// End the current compute pass.
    fn end_compute_pass(&mut self);

    /// Set the compute pipeline.
    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle);

    /// Set a bind group.
    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle);

    /// Push root constants for the next dispatch.
    fn set_push_constants(&mut self, data: &[u8]);

    /// Dispatch compute work.
    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32);

    /// Dispatch compute work with workgroup counts read from a buffer.
    fn dispatch_compute_indirect(&mut self, args: BufferHandle, offset: u64);

    // Graphics recording

    /// Begin a render pass.
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor);

    /// End the current render pass.
    fn end_render_pass(&mut self);

    /// Set the render pipeline.
    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    /// Set the viewport.
    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32);

    /// Set a vertex buffer.
    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64);

    /// Set the index buffer.
    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);

    /// Issue up to `max_count` indexed draws with arguments read from `args`
    /// and the actual draw count read by the GPU from `count` at execution
    /// time. The host never reads the count.
    fn multi_draw_indexed_indirect_count(
        &mut self,
        args: BufferHandle,
        args_offset: u64,
        count: BufferHandle,
        count_offset: u64,
        max_count: u32,
    );
}
