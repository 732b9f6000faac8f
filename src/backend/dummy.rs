//! Dummy GPU backend for testing and development.
//!
//! This backend performs no GPU work but keeps enough CPU-side state for the
//! rest of the engine to be exercised without hardware:
//!
//! - Buffer contents are real: `write_buffer`, `fill_buffer`, and
//!   `copy_buffer_to_buffer` operate on host memory, so uploads and counter
//!   resets can be inspected with [`DummyBackend::read_buffer`].
//! - Every recorded command is kept in a per-submission command stream,
//!   available through [`DummyBackend::submissions`], so tests can assert on
//!   barrier placement, dispatch parameters, and draw consumption.

use std::collections::HashMap;

use crate::backend::traits::*;
use crate::backend::types::*;

/// A command recorded by the dummy backend.
///
/// Variants mirror the recording methods of
/// [`GraphicsBackend`](crate::backend::GraphicsBackend); data-movement
/// commands are additionally applied to host-side buffer storage.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    WaitSyncHandle {
        handle: SyncHandle,
    },
    TransitionBuffer {
        buffer: BufferHandle,
        from: ResourceState,
        to: ResourceState,
    },
    TransitionTexture {
        texture: TextureHandle,
        from: ResourceState,
        to: ResourceState,
    },
    CopyBufferToBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    FillBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    },
    BeginComputePass {
        label: Option<String>,
    },
    EndComputePass,
    SetComputePipeline(ComputePipelineHandle),
    SetBindGroup {
        index: u32,
        bind_group: BindGroupHandle,
    },
    SetPushConstants(Vec<u8>),
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        args: BufferHandle,
        offset: u64,
    },
    BeginRenderPass {
        label: Option<String>,
    },
    EndRenderPass,
    SetRenderPipeline(RenderPipelineHandle),
    SetViewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    MultiDrawIndexedIndirectCount {
        args: BufferHandle,
        args_offset: u64,
        count: BufferHandle,
        count_offset: u64,
        max_count: u32,
    },
}

/// A submitted command batch.
#[derive(Debug, Clone)]
pub struct Submission {
    pub queue: QueueKind,
    pub sync: SyncHandle,
    pub commands: Vec<RecordedCommand>,
}

struct DummyBuffer {
    desc: BufferDescriptor,
    data: Vec<u8>,
}

/// Dummy GPU backend.
pub struct DummyBackend {
    next_handle: u64,
    next_sync: u64,
    buffers: HashMap<u64, DummyBuffer>,
    textures: HashMap<u64, TextureDescriptor>,
    view_indices: HashMap<u64, u32>,
    next_view_index: u32,
    open_batches: HashMap<QueueKind, Vec<RecordedCommand>>,
    submissions: Vec<Submission>,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            next_sync: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            view_indices: HashMap::new(),
            next_view_index: 0,
            open_batches: HashMap::new(),
            submissions: Vec::new(),
        }
    }

    fn alloc_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn record(&mut self, queue: QueueKind, command: RecordedCommand) {
        self.open_batches.entry(queue).or_default().push(command);
    }

    /// Record into whichever batch is currently open.
    ///
    /// The recording methods of the trait carry no queue parameter; like a
    /// hardware command list, they apply to the batch most recently begun.
    fn record_current(&mut self, command: RecordedCommand) {
        debug_assert_eq!(
            self.open_batches.len(),
            1,
            "dummy backend expects exactly one open command batch while recording"
        );
        if let Some(batch) = self.open_batches.values_mut().next() {
            batch.push(command);
        }
    }

    /// Read data back from a buffer (test/inspection helper).
    pub fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> Vec<u8> {
        let buf = self
            .buffers
            .get(&buffer.0)
            .expect("read_buffer: unknown buffer handle");
        let start = offset as usize;
        let end = (offset + size) as usize;
        buf.data[start..end].to_vec()
    }

    /// All submitted batches so far, in submission order.
    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    /// Flattened view of every submitted command, in submission order.
    pub fn all_commands(&self) -> impl Iterator<Item = &RecordedCommand> {
        self.submissions.iter().flat_map(|s| s.commands.iter())
    }

    /// Check whether a buffer handle is still alive.
    pub fn buffer_alive(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains_key(&buffer.0)
    }

    /// Number of live buffers (for leak checks in tests).
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Forget all recorded submissions (between test frames).
    pub fn clear_submissions(&mut self) {
        self.submissions.clear();
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let handle = self.alloc_handle();
        self.buffers.insert(
            handle,
            DummyBuffer {
                desc: desc.clone(),
                data: vec![0u8; desc.size as usize],
            },
        );
        Ok(BufferHandle(handle))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let buf = self
            .buffers
            .get_mut(&buffer.0)
            .expect("write_buffer: unknown buffer handle");
        let start = offset as usize;
        let end = start + data.len();
        assert!(
            end as u64 <= buf.desc.size,
            "write_buffer: range {}..{} exceeds buffer size {}",
            start,
            end,
            buf.desc.size
        );
        buf.data[start..end].copy_from_slice(data);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        let handle = self.alloc_handle();
        self.textures.insert(handle, desc.clone());
        Ok(TextureHandle(handle))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::TextureCreationFailed(
                "view of unknown texture".into(),
            ));
        }
        let handle = self.alloc_handle();
        Ok(TextureViewHandle(handle))
    }

    fn texture_view_index(&mut self, view: TextureViewHandle) -> u32 {
        *self.view_indices.entry(view.0).or_insert_with(|| {
            let idx = self.next_view_index;
            self.next_view_index += 1;
            idx
        })
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        log::trace!("DummyBackend: destroying buffer {:?}", buffer);
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        log::trace!("DummyBackend: destroying texture {:?}", texture);
        self.textures.remove(&texture.0);
    }

    fn create_bind_group_layout(
        &mut self,
        _entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        Ok(BindGroupLayoutHandle(self.alloc_handle()))
    }

    fn create_bind_group(
        &mut self,
        _layout: BindGroupLayoutHandle,
        _entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        Ok(BindGroupHandle(self.alloc_handle()))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        log::trace!("DummyBackend: creating render pipeline {:?}", desc.label);
        Ok(RenderPipelineHandle(self.alloc_handle()))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        log::trace!("DummyBackend: creating compute pipeline {:?}", desc.label);
        Ok(ComputePipelineHandle(self.alloc_handle()))
    }

    fn begin_commands(&mut self, queue: QueueKind) {
        debug_assert!(
            !self.open_batches.contains_key(&queue),
            "begin_commands called twice on {queue:?} without submit"
        );
        self.open_batches.insert(queue, Vec::new());
    }

    fn submit_commands(&mut self, queue: QueueKind) -> SyncHandle {
        let commands = self
            .open_batches
            .remove(&queue)
            .expect("submit_commands without begin_commands");
        let sync = SyncHandle(self.next_sync);
        self.next_sync += 1;
        log::trace!(
            "DummyBackend: submitting {} commands on {:?} (sync {})",
            commands.len(),
            queue,
            sync.value()
        );
        self.submissions.push(Submission {
            queue,
            sync,
            commands,
        });
        sync
    }

    fn wait_sync_handle(&mut self, queue: QueueKind, handle: SyncHandle) {
        self.record(queue, RecordedCommand::WaitSyncHandle { handle });
    }

    fn wait_idle(&mut self) {
        // Nothing outstanding in dummy mode.
    }

    fn transition_buffer(&mut self, buffer: BufferHandle, from: ResourceState, to: ResourceState) {
        self.record_current(RecordedCommand::TransitionBuffer { buffer, from, to });
    }

    fn transition_texture(
        &mut self,
        texture: TextureHandle,
        from: ResourceState,
        to: ResourceState,
    ) {
        self.record_current(RecordedCommand::TransitionTexture { texture, from, to });
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        let data = self.read_buffer(src, src_offset, size);
        let dst_buf = self
            .buffers
            .get_mut(&dst.0)
            .expect("copy_buffer_to_buffer: unknown destination");
        let start = dst_offset as usize;
        dst_buf.data[start..start + size as usize].copy_from_slice(&data);
        self.record_current(RecordedCommand::CopyBufferToBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32) {
        {
            let buf = self
                .buffers
                .get_mut(&buffer.0)
                .expect("fill_buffer: unknown buffer handle");
            let start = offset as usize;
            let end = start + size as usize;
            for chunk in buf.data[start..end].chunks_exact_mut(4) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
        }
        self.record_current(RecordedCommand::FillBuffer {
            buffer,
            offset,
            size,
            value,
        });
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.record_current(RecordedCommand::BeginComputePass {
            label: label.map(str::to_owned),
        });
    }

    fn end_compute_pass(&mut self) {
        self.record_current(RecordedCommand::EndComputePass);
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.record_current(RecordedCommand::SetComputePipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        self.record_current(RecordedCommand::SetBindGroup { index, bind_group });
    }

    fn set_push_constants(&mut self, data: &[u8]) {
        self.record_current(RecordedCommand::SetPushConstants(data.to_vec()));
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.record_current(RecordedCommand::Dispatch { x, y, z });
    }

    fn dispatch_compute_indirect(&mut self, args: BufferHandle, offset: u64) {
        self.record_current(RecordedCommand::DispatchIndirect { args, offset });
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.record_current(RecordedCommand::BeginRenderPass {
            label: desc.label.clone(),
        });
    }

    fn end_render_pass(&mut self) {
        self.record_current(RecordedCommand::EndRenderPass);
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record_current(RecordedCommand::SetRenderPipeline(pipeline));
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.record_current(RecordedCommand::SetViewport {
            x,
            y,
            width,
            height,
        });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record_current(RecordedCommand::SetVertexBuffer {
            slot,
            buffer,
            offset,
        });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, _format: IndexFormat) {
        self.record_current(RecordedCommand::SetIndexBuffer { buffer, offset });
    }

    fn multi_draw_indexed_indirect_count(
        &mut self,
        args: BufferHandle,
        args_offset: u64,
        count: BufferHandle,
        count_offset: u64,
        max_count: u32,
    ) {
        self.record_current(RecordedCommand::MultiDrawIndexedIndirectCount {
            args,
            args_offset,
            count,
            count_offset,
            max_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_desc(size: u64) -> BufferDescriptor {
        BufferDescriptor::new(size, BufferUsage::STORAGE | BufferUsage::COPY_DST)
    }

    #[test]
    fn test_buffer_write_read_roundtrip() {
        let mut backend = DummyBackend::new();
        let buffer = backend.create_buffer(&storage_desc(16)).unwrap();

        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]);
        assert_eq!(backend.read_buffer(buffer, 4, 4), vec![1, 2, 3, 4]);
        assert_eq!(backend.read_buffer(buffer, 0, 4), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_fill_buffer_value() {
        let mut backend = DummyBackend::new();
        let buffer = backend.create_buffer(&storage_desc(16)).unwrap();

        backend.begin_commands(QueueKind::Compute);
        backend.fill_buffer(buffer, 0, 16, 0xFFFF_FFFF);
        backend.submit_commands(QueueKind::Compute);

        assert_eq!(backend.read_buffer(buffer, 0, 16), vec![0xFF; 16]);
    }

    #[test]
    fn test_copy_buffer_to_buffer() {
        let mut backend = DummyBackend::new();
        let src = backend.create_buffer(&storage_desc(8)).unwrap();
        let dst = backend.create_buffer(&storage_desc(8)).unwrap();

        backend.write_buffer(src, 0, &[9, 8, 7, 6]);
        backend.begin_commands(QueueKind::Copy);
        backend.copy_buffer_to_buffer(src, 0, dst, 4, 4);
        backend.submit_commands(QueueKind::Copy);

        assert_eq!(backend.read_buffer(dst, 4, 4), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_submission_records_commands() {
        let mut backend = DummyBackend::new();
        backend.begin_commands(QueueKind::Compute);
        backend.begin_compute_pass(Some("test"));
        backend.dispatch_compute(4, 1, 1);
        backend.end_compute_pass();
        let sync = backend.submit_commands(QueueKind::Compute);

        assert_eq!(backend.submissions().len(), 1);
        let submission = &backend.submissions()[0];
        assert_eq!(submission.queue, QueueKind::Compute);
        assert_eq!(submission.sync, sync);
        assert!(submission
            .commands
            .contains(&RecordedCommand::Dispatch { x: 4, y: 1, z: 1 }));
    }

    #[test]
    fn test_sync_handles_are_monotonic() {
        let mut backend = DummyBackend::new();
        backend.begin_commands(QueueKind::Copy);
        let a = backend.submit_commands(QueueKind::Copy);
        backend.begin_commands(QueueKind::Graphics);
        let b = backend.submit_commands(QueueKind::Graphics);
        assert!(b.value() > a.value());
    }

    #[test]
    fn test_destroy_buffer_releases() {
        let mut backend = DummyBackend::new();
        let buffer = backend.create_buffer(&storage_desc(4)).unwrap();
        assert!(backend.buffer_alive(buffer));
        backend.destroy_buffer(buffer);
        assert!(!backend.buffer_alive(buffer));
    }
}
