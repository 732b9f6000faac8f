//! Resource registry: virtual resources for one frame of graph execution.
//!
//! The registry owns every transient GPU resource used by a frame in a
//! contiguous table indexed by handle. Externally-owned resources are
//! imported as non-owning references and are never destroyed by the graph.
//!
//! Handles are `{id, kind, version}`; the version is the frame index, so a
//! handle kept across frames fails fast instead of silently aliasing a
//! recycled slot. Requesting a handle that was never created or imported for
//! the current frame is a programming error and panics.

use crate::backend::{
    BackendResult, BufferDescriptor, BufferHandle, GraphicsBackend, ResourceState,
    TextureDescriptor, TextureHandle,
};

/// What a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
}

/// Identifier for a virtual resource inside one graph execution.
///
/// `ResourceHandle` is `Copy` and cheap to pass around. It is only valid for
/// the frame it was created in; resolving it afterwards panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub(crate) id: u32,
    pub(crate) version: u32,
    pub(crate) kind: ResourceKind,
}

impl ResourceHandle {
    /// The slot index within the registry table.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Buffer or texture.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }
}

/// Physical backing of a registry entry.
///
/// Transient resources stay in the `Pending*` variants until their first use
/// during execution; creation is deferred so a pass list that never runs
/// allocates nothing.
enum Physical {
    PendingBuffer(BufferDescriptor),
    Buffer(BufferHandle),
    PendingTexture(TextureDescriptor),
    Texture(TextureHandle),
}

struct RegistryEntry {
    name: String,
    physical: Physical,
    state: ResourceState,
    imported: bool,
}

/// Per-frame table of virtual resources.
///
/// The registry lives for the renderer's lifetime; entries live for one
/// frame. [`begin_frame`](Self::begin_frame) bumps the handle version and
/// [`end_frame`](Self::end_frame) destroys all transient physical resources.
pub struct ResourceRegistry {
    entries: Vec<RegistryEntry>,
    frame_version: u32,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            frame_version: 0,
        }
    }

    /// Current frame version (diagnostics).
    pub fn frame_version(&self) -> u32 {
        self.frame_version
    }

    /// Number of entries registered this frame.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Start a new frame: all previously issued handles become stale.
    pub fn begin_frame(&mut self) {
        debug_assert!(
            self.entries.is_empty(),
            "begin_frame called without end_frame; transient resources would leak"
        );
        self.frame_version = self.frame_version.wrapping_add(1);
    }

    /// Destroy transient physical resources and drop all entries.
    ///
    /// Imported resources are left untouched; their lifetime is owned by the
    /// caller that imported them.
    pub fn end_frame(&mut self, backend: &mut dyn GraphicsBackend) {
        for entry in self.entries.drain(..) {
            if entry.imported {
                continue;
            }
            match entry.physical {
                Physical::Buffer(handle) => {
                    log::trace!("registry: destroying transient buffer '{}'", entry.name);
                    backend.destroy_buffer(handle);
                }
                Physical::Texture(handle) => {
                    log::trace!("registry: destroying transient texture '{}'", entry.name);
                    backend.destroy_texture(handle);
                }
                // Never realized: nothing to destroy.
                Physical::PendingBuffer(_) | Physical::PendingTexture(_) => {}
            }
        }
    }

    fn push_entry(&mut self, entry: RegistryEntry, kind: ResourceKind) -> ResourceHandle {
        let id = self.entries.len() as u32;
        self.entries.push(entry);
        ResourceHandle {
            id,
            version: self.frame_version,
            kind,
        }
    }

    /// Register a transient buffer. The physical buffer is created at first
    /// use during execution and destroyed at end of frame.
    pub fn create_buffer(&mut self, name: &str, desc: BufferDescriptor) -> ResourceHandle {
        self.push_entry(
            RegistryEntry {
                name: name.to_string(),
                physical: Physical::PendingBuffer(desc),
                state: ResourceState::Undefined,
                imported: false,
            },
            ResourceKind::Buffer,
        )
    }

    /// Register a transient texture.
    pub fn create_texture(&mut self, name: &str, desc: TextureDescriptor) -> ResourceHandle {
        self.push_entry(
            RegistryEntry {
                name: name.to_string(),
                physical: Physical::PendingTexture(desc),
                state: ResourceState::Undefined,
                imported: false,
            },
            ResourceKind::Texture,
        )
    }

    /// Import an externally-owned buffer in a known state.
    pub fn import_buffer(
        &mut self,
        name: &str,
        buffer: BufferHandle,
        state: ResourceState,
    ) -> ResourceHandle {
        self.push_entry(
            RegistryEntry {
                name: name.to_string(),
                physical: Physical::Buffer(buffer),
                state,
                imported: true,
            },
            ResourceKind::Buffer,
        )
    }

    /// Import an externally-owned texture in a known state.
    pub fn import_texture(
        &mut self,
        name: &str,
        texture: TextureHandle,
        state: ResourceState,
    ) -> ResourceHandle {
        self.push_entry(
            RegistryEntry {
                name: name.to_string(),
                physical: Physical::Texture(texture),
                state,
                imported: true,
            },
            ResourceKind::Texture,
        )
    }

    fn entry(&self, handle: ResourceHandle) -> &RegistryEntry {
        assert_eq!(
            handle.version, self.frame_version,
            "resource handle {} is stale: created in frame version {}, current is {}",
            handle.id, handle.version, self.frame_version
        );
        self.entries
            .get(handle.id as usize)
            .unwrap_or_else(|| panic!("resource handle {} was never registered", handle.id))
    }

    fn entry_mut(&mut self, handle: ResourceHandle) -> &mut RegistryEntry {
        assert_eq!(
            handle.version, self.frame_version,
            "resource handle {} is stale: created in frame version {}, current is {}",
            handle.id, handle.version, self.frame_version
        );
        self.entries
            .get_mut(handle.id as usize)
            .unwrap_or_else(|| panic!("resource handle {} was never registered", handle.id))
    }

    /// Name of the resource (diagnostics).
    pub fn name(&self, handle: ResourceHandle) -> &str {
        &self.entry(handle).name
    }

    /// Currently tracked state of the resource.
    pub fn state(&self, handle: ResourceHandle) -> ResourceState {
        self.entry(handle).state
    }

    pub(crate) fn set_state(&mut self, handle: ResourceHandle, state: ResourceState) {
        self.entry_mut(handle).state = state;
    }

    /// Create the physical resource if this is its first use.
    pub(crate) fn realize(
        &mut self,
        handle: ResourceHandle,
        backend: &mut dyn GraphicsBackend,
    ) -> BackendResult<()> {
        let entry = self.entry_mut(handle);
        match &entry.physical {
            Physical::PendingBuffer(desc) => {
                log::trace!("registry: realizing transient buffer '{}'", entry.name);
                let physical = backend.create_buffer(desc)?;
                entry.physical = Physical::Buffer(physical);
            }
            Physical::PendingTexture(desc) => {
                log::trace!("registry: realizing transient texture '{}'", entry.name);
                let physical = backend.create_texture(desc)?;
                entry.physical = Physical::Texture(physical);
            }
            Physical::Buffer(_) | Physical::Texture(_) => {}
        }
        Ok(())
    }

    /// Resolve a handle to its physical buffer.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale, refers to a texture, or has not been
    /// realized yet (i.e. the pass did not declare access to it).
    pub fn buffer(&self, handle: ResourceHandle) -> BufferHandle {
        let entry = self.entry(handle);
        match entry.physical {
            Physical::Buffer(h) => h,
            Physical::PendingBuffer(_) => panic!(
                "buffer '{}' accessed before first declared use realized it",
                entry.name
            ),
            _ => panic!("resource '{}' is not a buffer", entry.name),
        }
    }

    /// Resolve a handle to its physical texture.
    ///
    /// # Panics
    ///
    /// Same conditions as [`buffer`](Self::buffer).
    pub fn texture(&self, handle: ResourceHandle) -> TextureHandle {
        let entry = self.entry(handle);
        match entry.physical {
            Physical::Texture(h) => h,
            Physical::PendingTexture(_) => panic!(
                "texture '{}' accessed before first declared use realized it",
                entry.name
            ),
            _ => panic!("resource '{}' is not a texture", entry.name),
        }
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferUsage, DummyBackend};

    fn storage_desc(size: u64) -> BufferDescriptor {
        BufferDescriptor::new(size, BufferUsage::STORAGE)
    }

    #[test]
    fn test_create_and_resolve_buffer() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();

        registry.begin_frame();
        let handle = registry.create_buffer("survivors", storage_desc(64));
        assert_eq!(handle.kind(), ResourceKind::Buffer);
        assert_eq!(registry.state(handle), ResourceState::Undefined);

        registry.realize(handle, &mut backend).unwrap();
        let physical = registry.buffer(handle);
        assert!(backend.buffer_alive(physical));

        registry.end_frame(&mut backend);
        assert!(!backend.buffer_alive(physical));
    }

    #[test]
    fn test_import_is_not_destroyed() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();
        let external = backend.create_buffer(&storage_desc(16)).unwrap();

        registry.begin_frame();
        let handle = registry.import_buffer("instances", external, ResourceState::ShaderResource);
        assert_eq!(registry.state(handle), ResourceState::ShaderResource);
        assert_eq!(registry.buffer(handle), external);
        registry.end_frame(&mut backend);

        assert!(backend.buffer_alive(external));
    }

    #[test]
    fn test_deferred_creation_skips_unused() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();

        registry.begin_frame();
        let _unused = registry.create_buffer("never_used", storage_desc(1024));
        registry.end_frame(&mut backend);

        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn test_stale_handle_panics() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();

        registry.begin_frame();
        let handle = registry.create_buffer("old", storage_desc(16));
        registry.end_frame(&mut backend);

        registry.begin_frame();
        let _ = registry.state(handle);
    }

    #[test]
    #[should_panic(expected = "never registered")]
    fn test_unknown_handle_panics() {
        let mut registry = ResourceRegistry::new();
        registry.begin_frame();
        let bogus = ResourceHandle {
            id: 42,
            version: registry.frame_version(),
            kind: ResourceKind::Buffer,
        };
        let _ = registry.state(bogus);
    }

    #[test]
    #[should_panic(expected = "not a buffer")]
    fn test_kind_mismatch_panics() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();
        registry.begin_frame();
        let handle = registry.create_texture(
            "depth",
            TextureDescriptor::new_2d(
                4,
                4,
                crate::backend::TextureFormat::Depth32Float,
                crate::backend::TextureUsage::RENDER_ATTACHMENT,
            ),
        );
        registry.realize(handle, &mut backend).unwrap();
        let _ = registry.buffer(handle);
    }
}
