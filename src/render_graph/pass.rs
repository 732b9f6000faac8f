//! Pass declarations for the render graph.
//!
//! A pass is plain data: a name, a queue, an ordered list of resource
//! accesses with their required states, and an execute callback. Passes are
//! built through [`PassBuilder`], are immutable once built, and are consumed
//! exactly once by the scheduler.

use crate::backend::{BackendResult, BufferHandle, GraphicsBackend, QueueKind, ResourceState, TextureHandle};
use crate::render_graph::graph::RenderGraph;
use crate::render_graph::registry::{ResourceHandle, ResourceRegistry};

/// Unique identifier for a pass within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(pub(crate) u32);

/// A declared access to a virtual resource.
#[derive(Debug, Clone)]
pub struct ResourceAccess {
    /// The resource being accessed.
    pub handle: ResourceHandle,
    /// The state the resource must be in when the pass executes.
    pub state: ResourceState,
    /// Optional state to transition the resource to after the pass.
    pub final_state: Option<ResourceState>,
    /// Whether the pass writes through this access.
    pub write: bool,
}

/// Context handed to a pass callback during execution.
///
/// Resource handles declared on the pass resolve to physical handles here;
/// the backend is available for command recording.
pub struct PassContext<'a> {
    /// The backend commands are recorded on.
    pub backend: &'a mut dyn GraphicsBackend,
    pub(crate) registry: &'a ResourceRegistry,
}

impl<'a> PassContext<'a> {
    /// Resolve a declared buffer handle to its physical buffer.
    pub fn buffer(&self, handle: ResourceHandle) -> BufferHandle {
        self.registry.buffer(handle)
    }

    /// Resolve a declared texture handle to its physical texture.
    pub fn texture(&self, handle: ResourceHandle) -> TextureHandle {
        self.registry.texture(handle)
    }
}

pub(crate) type PassCallback = Box<dyn FnOnce(&mut PassContext) -> BackendResult<()>>;

/// A pass in the render graph.
pub(crate) struct Pass {
    pub(crate) name: String,
    pub(crate) queue: QueueKind,
    pub(crate) accesses: Vec<ResourceAccess>,
    pub(crate) waits: Vec<QueueKind>,
    pub(crate) callback: Option<PassCallback>,
}

/// Builder returned by [`RenderGraph::add_render_pass`].
///
/// Declare accesses and attach the execute callback; the pass is added to the
/// graph when [`execute`](Self::execute) is called.
///
/// # Example
///
/// ```ignore
/// graph
///     .add_render_pass("cull_main")
///     .queue(QueueKind::Compute)
///     .read(instances, ResourceState::ShaderResource)
///     .write(survivors, ResourceState::UnorderedAccess)
///     .execute(move |ctx| {
///         // record dispatches
///         Ok(())
///     });
/// ```
pub struct PassBuilder<'g> {
    pub(crate) graph: &'g mut RenderGraph,
    pub(crate) name: String,
    pub(crate) queue: QueueKind,
    pub(crate) accesses: Vec<ResourceAccess>,
    pub(crate) waits: Vec<QueueKind>,
}

impl<'g> PassBuilder<'g> {
    /// Set the logical queue the pass is submitted on (default: graphics).
    pub fn queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    fn push_access(&mut self, access: ResourceAccess) {
        #[cfg(debug_assertions)]
        for existing in &self.accesses {
            debug_assert!(
                existing.handle != access.handle || existing.state == access.state,
                "pass '{}' declares resource {} with conflicting states {:?} and {:?}",
                self.name,
                access.handle.id(),
                existing.state,
                access.state
            );
        }
        self.accesses.push(access);
    }

    /// Declare a read of `handle`, requiring it in `state`.
    pub fn read(mut self, handle: ResourceHandle, state: ResourceState) -> Self {
        debug_assert!(
            state.is_read(),
            "read access declared with non-readable state {state:?}"
        );
        self.push_access(ResourceAccess {
            handle,
            state,
            final_state: None,
            write: false,
        });
        self
    }

    /// Declare a read of `handle` and a state to leave it in afterwards.
    pub fn read_with_final(
        mut self,
        handle: ResourceHandle,
        state: ResourceState,
        final_state: ResourceState,
    ) -> Self {
        debug_assert!(state.is_read());
        self.push_access(ResourceAccess {
            handle,
            state,
            final_state: Some(final_state),
            write: false,
        });
        self
    }

    /// Declare a write of `handle`, requiring it in `state`.
    pub fn write(mut self, handle: ResourceHandle, state: ResourceState) -> Self {
        debug_assert!(
            state.is_write(),
            "write access declared with non-writable state {state:?}"
        );
        self.push_access(ResourceAccess {
            handle,
            state,
            final_state: None,
            write: true,
        });
        self
    }

    /// Make this pass's queue wait for the most recent submission on
    /// `queue` before executing.
    ///
    /// Cross-queue ordering is never inferred; this is the only mechanism.
    pub fn wait_for_queue(mut self, queue: QueueKind) -> Self {
        debug_assert!(
            queue != self.queue,
            "pass '{}' cannot wait on its own queue",
            self.name
        );
        self.waits.push(queue);
        self
    }

    /// Attach the execute callback and add the pass to the graph.
    pub fn execute<F>(self, callback: F) -> PassId
    where
        F: FnOnce(&mut PassContext) -> BackendResult<()> + 'static,
    {
        let pass = Pass {
            name: self.name,
            queue: self.queue,
            accesses: self.accesses,
            waits: self.waits,
            callback: Some(Box::new(callback)),
        };
        self.graph.push_pass(pass)
    }

    /// Add the pass with no recorded work.
    ///
    /// Useful for passes that exist only to transition resources.
    pub fn execute_empty(self) -> PassId {
        self.execute(|_| Ok(()))
    }
}
