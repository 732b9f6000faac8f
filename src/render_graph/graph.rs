//! Render graph scheduling and execution.
//!
//! The graph walks its passes **in declaration order**: there is no
//! topological reordering, so callers must add passes already in dependency
//! order. A pass reading data another pass produced later in the list is not
//! detected; ordering correctness is entirely the caller's responsibility.
//!
//! Per resource, a state-transition barrier is inserted only when the
//! currently tracked state differs from what the next access requires.
//! Consecutive passes on the same logical queue share one submission;
//! cross-queue ordering happens only through explicitly declared waits.

use std::collections::HashMap;

use crate::backend::{BackendResult, GraphicsBackend, QueueKind, SyncHandle};
use crate::render_graph::pass::{Pass, PassBuilder, PassContext, PassId};
use crate::render_graph::registry::{ResourceKind, ResourceRegistry};

/// Counters from one graph execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    /// Number of passes executed.
    pub passes_executed: usize,
    /// Number of state-transition barriers inserted.
    pub barriers_inserted: usize,
    /// Number of command batches submitted.
    pub submissions: usize,
}

/// A frame's pass list.
///
/// Built fresh each frame, executed once, then discarded.
pub struct RenderGraph {
    passes: Vec<Pass>,
    executed: bool,
}

impl RenderGraph {
    /// Create a new empty render graph.
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            executed: false,
        }
    }

    /// Start declaring a pass. The pass joins the graph when the builder's
    /// `execute` is called; passes run in the order they were added.
    pub fn add_render_pass(&mut self, name: &str) -> PassBuilder<'_> {
        debug_assert!(
            !self.executed,
            "cannot add passes to an already executed graph"
        );
        PassBuilder {
            graph: self,
            name: name.to_string(),
            queue: QueueKind::Graphics,
            accesses: Vec::new(),
            waits: Vec::new(),
        }
    }

    pub(crate) fn push_pass(&mut self, pass: Pass) -> PassId {
        let id = PassId(self.passes.len() as u32);
        self.passes.push(pass);
        id
    }

    /// Number of declared passes.
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Names of declared passes in execution order.
    pub fn pass_names(&self) -> impl Iterator<Item = &str> {
        self.passes.iter().map(|p| p.name.as_str())
    }

    /// Execute all passes in declaration order.
    ///
    /// Physical creation of transient resources happens at their first
    /// declared use; transients are destroyed after the last pass.
    ///
    /// # Panics
    ///
    /// Panics if the graph was already executed; each graph (and each pass)
    /// is consumed exactly once.
    pub fn execute(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        registry: &mut ResourceRegistry,
    ) -> BackendResult<GraphStats> {
        assert!(!self.executed, "render graph executed twice");
        self.executed = true;

        let mut stats = GraphStats::default();
        let mut last_sync: HashMap<QueueKind, SyncHandle> = HashMap::new();
        let mut open_queue: Option<QueueKind> = None;

        for pass in &mut self.passes {
            log::trace!("graph: pass '{}' on {:?}", pass.name, pass.queue);

            // Batch consecutive same-queue passes into one submission.
            if open_queue != Some(pass.queue) {
                if let Some(queue) = open_queue {
                    last_sync.insert(queue, backend.submit_commands(queue));
                    stats.submissions += 1;
                }
                backend.begin_commands(pass.queue);
                open_queue = Some(pass.queue);
            }

            // Explicitly declared cross-queue waits.
            for waited in &pass.waits {
                match last_sync.get(waited) {
                    Some(&handle) => backend.wait_sync_handle(pass.queue, handle),
                    // Nothing submitted on that queue yet; there is nothing
                    // to order against.
                    None => log::trace!(
                        "graph: pass '{}' waits on {:?} with no prior submission",
                        pass.name,
                        waited
                    ),
                }
            }

            // Realize resources on first use and insert barriers only where
            // the tracked state differs from the required state.
            for access in &pass.accesses {
                registry.realize(access.handle, backend)?;
                let current = registry.state(access.handle);
                if current != access.state {
                    match access.handle.kind() {
                        ResourceKind::Buffer => backend.transition_buffer(
                            registry.buffer(access.handle),
                            current,
                            access.state,
                        ),
                        ResourceKind::Texture => backend.transition_texture(
                            registry.texture(access.handle),
                            current,
                            access.state,
                        ),
                    }
                    registry.set_state(access.handle, access.state);
                    stats.barriers_inserted += 1;
                }
            }

            let callback = pass
                .callback
                .take()
                .expect("pass callback consumed more than once");
            {
                let mut ctx = PassContext {
                    backend: &mut *backend,
                    registry,
                };
                callback(&mut ctx)?;
            }

            // Apply declared final states.
            for access in &pass.accesses {
                if let Some(final_state) = access.final_state {
                    let current = registry.state(access.handle);
                    if current != final_state {
                        match access.handle.kind() {
                            ResourceKind::Buffer => backend.transition_buffer(
                                registry.buffer(access.handle),
                                current,
                                final_state,
                            ),
                            ResourceKind::Texture => backend.transition_texture(
                                registry.texture(access.handle),
                                current,
                                final_state,
                            ),
                        }
                        registry.set_state(access.handle, final_state);
                        stats.barriers_inserted += 1;
                    }
                }
            }

            stats.passes_executed += 1;
        }

        if let Some(queue) = open_queue {
            backend.submit_commands(queue);
            stats.submissions += 1;
        }

        registry.end_frame(backend);

        log::debug!(
            "graph: executed {} passes, {} barriers, {} submissions",
            stats.passes_executed,
            stats.barriers_inserted,
            stats.submissions
        );
        Ok(stats)
    }
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BufferDescriptor, BufferUsage, DummyBackend, RecordedCommand, ResourceState,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    fn storage_desc(size: u64) -> BufferDescriptor {
        BufferDescriptor::new(size, BufferUsage::STORAGE | BufferUsage::COPY_DST)
    }

    #[test]
    fn test_passes_run_in_declaration_order() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();
        registry.begin_frame();

        let order = Rc::new(RefCell::new(Vec::new()));
        let mut graph = RenderGraph::new();
        for name in ["first", "second", "third"] {
            let order = Rc::clone(&order);
            graph.add_render_pass(name).execute(move |_| {
                order.borrow_mut().push(name);
                Ok(())
            });
        }

        let stats = graph.execute(&mut backend, &mut registry).unwrap();
        assert_eq!(stats.passes_executed, 3);
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_barrier_only_on_state_change() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();
        registry.begin_frame();

        let external = backend.create_buffer(&storage_desc(64)).unwrap();
        let handle = registry.import_buffer("buf", external, ResourceState::ShaderResource);

        let mut graph = RenderGraph::new();
        // Same required state as import: no barrier.
        graph
            .add_render_pass("read_a")
            .read(handle, ResourceState::ShaderResource)
            .execute_empty();
        // Different state: one barrier.
        graph
            .add_render_pass("write_b")
            .write(handle, ResourceState::UnorderedAccess)
            .execute_empty();
        // Same state again: no barrier.
        graph
            .add_render_pass("write_c")
            .write(handle, ResourceState::UnorderedAccess)
            .execute_empty();

        let stats = graph.execute(&mut backend, &mut registry).unwrap();
        assert_eq!(stats.barriers_inserted, 1);

        let transitions: Vec<_> = backend
            .all_commands()
            .filter(|c| matches!(c, RecordedCommand::TransitionBuffer { .. }))
            .collect();
        assert_eq!(transitions.len(), 1);
        assert_eq!(
            transitions[0],
            &RecordedCommand::TransitionBuffer {
                buffer: external,
                from: ResourceState::ShaderResource,
                to: ResourceState::UnorderedAccess,
            }
        );
    }

    #[test]
    fn test_final_state_transition() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();
        registry.begin_frame();

        let external = backend.create_buffer(&storage_desc(64)).unwrap();
        let handle = registry.import_buffer("buf", external, ResourceState::UnorderedAccess);

        let mut graph = RenderGraph::new();
        graph
            .add_render_pass("sort")
            .read_with_final(
                handle,
                ResourceState::UnorderedAccess,
                ResourceState::IndirectArgument,
            )
            .execute_empty();

        let stats = graph.execute(&mut backend, &mut registry).unwrap();
        // No barrier on entry (state matches), one to the declared final state.
        assert_eq!(stats.barriers_inserted, 1);
    }

    #[test]
    fn test_transient_created_on_first_use_destroyed_after() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();
        registry.begin_frame();

        let handle = registry.create_buffer("scratch", storage_desc(128));
        let mut graph = RenderGraph::new();
        graph
            .add_render_pass("fill")
            .write(handle, ResourceState::TransferDst)
            .execute(move |ctx| {
                let physical = ctx.buffer(handle);
                ctx.backend.fill_buffer(physical, 0, 128, 0);
                Ok(())
            });

        assert_eq!(backend.live_buffer_count(), 0);
        graph.execute(&mut backend, &mut registry).unwrap();
        // Transient destroyed at end of frame.
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn test_queue_batching_and_waits() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();
        registry.begin_frame();

        let mut graph = RenderGraph::new();
        graph
            .add_render_pass("upload")
            .queue(QueueKind::Copy)
            .execute_empty();
        graph
            .add_render_pass("cull")
            .queue(QueueKind::Compute)
            .wait_for_queue(QueueKind::Copy)
            .execute_empty();
        graph
            .add_render_pass("sort")
            .queue(QueueKind::Compute)
            .execute_empty();
        graph
            .add_render_pass("draw")
            .queue(QueueKind::Graphics)
            .wait_for_queue(QueueKind::Compute)
            .execute_empty();

        let stats = graph.execute(&mut backend, &mut registry).unwrap();
        // cull+sort batch together: copy, compute, graphics.
        assert_eq!(stats.submissions, 3);

        let submissions = backend.submissions();
        assert_eq!(submissions[0].queue, QueueKind::Copy);
        assert_eq!(submissions[1].queue, QueueKind::Compute);
        assert_eq!(submissions[2].queue, QueueKind::Graphics);

        // The compute batch waits on the copy submission's sync handle.
        assert_eq!(
            submissions[1].commands[0],
            RecordedCommand::WaitSyncHandle {
                handle: submissions[0].sync
            }
        );
        // The graphics batch waits on the compute submission.
        assert_eq!(
            submissions[2].commands[0],
            RecordedCommand::WaitSyncHandle {
                handle: submissions[1].sync
            }
        );
    }

    #[test]
    #[should_panic(expected = "executed twice")]
    fn test_graph_consumed_once() {
        let mut backend = DummyBackend::new();
        let mut registry = ResourceRegistry::new();
        registry.begin_frame();

        let mut graph = RenderGraph::new();
        graph.add_render_pass("noop").execute_empty();
        graph.execute(&mut backend, &mut registry).unwrap();

        registry.begin_frame();
        let _ = graph.execute(&mut backend, &mut registry);
    }
}
