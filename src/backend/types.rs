//! Common types shared between backends.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
    R32Float,
    R32Uint,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Depth32Float
            | TextureFormat::R32Float
            | TextureFormat::R32Uint => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be used as a vertex buffer.
        const VERTEX = 1 << 0;
        /// Buffer can be used as an index buffer.
        const INDEX = 1 << 1;
        /// Buffer can be used as a uniform buffer.
        const UNIFORM = 1 << 2;
        /// Buffer can be used as a storage buffer.
        const STORAGE = 1 << 3;
        /// Buffer can be used as an indirect argument buffer.
        const INDIRECT = 1 << 4;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 5;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 6;
        /// Buffer is mappable for CPU reads.
        const MAP_READ = 1 << 7;
        /// Buffer is mappable for CPU writes.
        const MAP_WRITE = 1 << 8;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Usage flags for textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const TEXTURE_BINDING = 1 << 2;
        const STORAGE_BINDING = 1 << 3;
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Descriptor for creating a texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    /// Create a descriptor for a 2D texture.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            format,
            usage,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// The state a resource must be in for a given access.
///
/// Backends that track states explicitly (Vulkan layouts, D3D-style states)
/// translate these into API barriers; backends with automatic tracking may
/// treat transitions as hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Initial state of a freshly created resource.
    Undefined,
    /// Source of a copy operation.
    TransferSrc,
    /// Destination of a copy or fill operation.
    TransferDst,
    /// Read-only access from a shader (sampled texture or storage read).
    ShaderResource,
    /// Read/write storage access with GPU atomics allowed.
    UnorderedAccess,
    /// Read as indirect draw/dispatch arguments.
    IndirectArgument,
    /// Read as vertex attribute data.
    VertexBuffer,
    /// Read as index data.
    IndexBuffer,
    /// Written as a color attachment.
    ColorAttachment,
    /// Written as a depth attachment.
    DepthAttachment,
    /// Depth read-only (sampling + depth test).
    DepthReadOnly,
}

impl ResourceState {
    /// Check if this state allows GPU writes.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::TransferDst
                | Self::UnorderedAccess
                | Self::ColorAttachment
                | Self::DepthAttachment
        )
    }

    /// Check if this state allows GPU reads.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::TransferSrc
                | Self::ShaderResource
                | Self::UnorderedAccess
                | Self::IndirectArgument
                | Self::VertexBuffer
                | Self::IndexBuffer
                | Self::DepthReadOnly
        )
    }
}

/// The logical queue a command batch is submitted on.
///
/// Backends with a single hardware queue map all three onto it; submission
/// order then subsumes the explicit cross-queue waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Uploads of per-frame structured data.
    Copy,
    /// Asynchronous compute (cull, sort, args emission).
    Compute,
    /// Rasterization.
    Graphics,
}

/// An opaque point in a queue's timeline, signaled at submission.
///
/// Obtained from [`submit_commands`](super::GraphicsBackend::submit_commands)
/// and consumed by
/// [`wait_sync_handle`](super::GraphicsBackend::wait_sync_handle) to order
/// work across queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncHandle(pub(crate) u64);

impl SyncHandle {
    /// Raw timeline value, mostly useful for logging.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

// ============================================================================
// Indirect Argument Structs
// ============================================================================

/// Arguments for an indexed indirect draw call.
///
/// Matches the GPU layout consumed by indirect multi-draw. The buffer
/// containing these must have [`BufferUsage::INDIRECT`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct DrawIndexedIndirectArgs {
    /// Number of indices to draw.
    pub index_count: u32,
    /// Number of instances to draw.
    pub instance_count: u32,
    /// Index of the first index to draw.
    pub first_index: u32,
    /// Value added to each index before reading from the vertex buffer.
    pub base_vertex: i32,
    /// Instance ID of the first instance to draw.
    pub first_instance: u32,
}

impl DrawIndexedIndirectArgs {
    /// Size of the struct in bytes.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Convert to bytes for uploading to a buffer.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

const_assert_eq!(std::mem::size_of::<DrawIndexedIndirectArgs>(), 20);

/// Arguments for an indirect compute dispatch.
///
/// Written on the GPU by the sort's args kernel so workgroup counts derive
/// from the live survivor counter without host read-back.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct DispatchIndirectArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchIndirectArgs {
    /// Size of the struct in bytes.
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Convert to bytes for uploading to a buffer.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

const_assert_eq!(std::mem::size_of::<DispatchIndirectArgs>(), 12);

// ============================================================================
// Pipeline State Types
// ============================================================================

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    TriangleList,
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontFace {
    Ccw,
    Cw,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Compare function for depth testing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Always,
}

/// Depth state for render pipelines
#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

/// Blend state for a color target. `None` on the target means opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendState {
    /// Standard src-alpha / one-minus-src-alpha blending.
    AlphaBlending,
    /// Additive blending.
    Additive,
}

#[derive(Debug, Clone)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Vertex buffer layout
#[derive(Debug, Clone)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Load operation for render pass attachments
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Clear([f32; 4]),
    ClearDepth(f32),
    Load,
}

/// Store operation for render pass attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_state_is_write() {
        assert!(ResourceState::TransferDst.is_write());
        assert!(ResourceState::UnorderedAccess.is_write());
        assert!(ResourceState::ColorAttachment.is_write());
        assert!(ResourceState::DepthAttachment.is_write());

        assert!(!ResourceState::ShaderResource.is_write());
        assert!(!ResourceState::IndirectArgument.is_write());
        assert!(!ResourceState::TransferSrc.is_write());
    }

    #[test]
    fn test_resource_state_is_read() {
        assert!(ResourceState::ShaderResource.is_read());
        assert!(ResourceState::IndirectArgument.is_read());
        assert!(ResourceState::UnorderedAccess.is_read());
        assert!(ResourceState::DepthReadOnly.is_read());

        assert!(!ResourceState::Undefined.is_read());
        assert!(!ResourceState::ColorAttachment.is_read());
    }

    #[test]
    fn test_buffer_descriptor_builder() {
        let desc = BufferDescriptor::new(256, BufferUsage::STORAGE | BufferUsage::COPY_DST)
            .with_label("survivors");
        assert_eq!(desc.size, 256);
        assert!(desc.usage.contains(BufferUsage::STORAGE));
        assert_eq!(desc.label.as_deref(), Some("survivors"));
    }

    #[test]
    fn test_indirect_args_bytes() {
        let args = DrawIndexedIndirectArgs {
            index_count: 36,
            instance_count: 1,
            first_index: 0,
            base_vertex: 0,
            first_instance: 7,
        };
        let bytes = args.as_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..4], &36u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &7u32.to_le_bytes());
    }
}
