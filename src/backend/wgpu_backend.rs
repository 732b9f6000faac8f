//! Headless wgpu backend.
//!
//! Implements [`GraphicsBackend`] on top of wgpu. The engine never touches a
//! window, so the backend is created without a surface and renders into
//! textures only.
//!
//! wgpu exposes a single hardware queue and tracks resource states
//! internally, so the three logical queues all map onto it,
//! `wait_sync_handle` is satisfied by submission order, and the explicit
//! state transitions become no-ops.
//!
//! Pass-scoped commands cannot be recorded directly because wgpu pass objects
//! borrow the command encoder; commands are buffered in a pending pass and
//! replayed when the pass ends.

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::backend::traits::*;
use crate::backend::types::*;

enum ComputeCommand {
    SetPipeline(u64),
    SetBindGroup { index: u32, bind_group: u64 },
    SetPushConstants(Vec<u8>),
    Dispatch { x: u32, y: u32, z: u32 },
    DispatchIndirect { args: u64, offset: u64 },
}

enum RenderCommand {
    SetPipeline(u64),
    SetBindGroup {
        index: u32,
        bind_group: u64,
    },
    SetViewport {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: u64,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: u64,
        offset: u64,
        format: wgpu::IndexFormat,
    },
    MultiDrawIndexedIndirectCount {
        args: u64,
        args_offset: u64,
        count: u64,
        count_offset: u64,
        max_count: u32,
    },
}

/// Pending compute pass with buffered commands
struct PendingComputePass {
    label: Option<String>,
    commands: Vec<ComputeCommand>,
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    desc: RenderPassDescriptor,
    commands: Vec<RenderCommand>,
}

/// wgpu implementation of [`GraphicsBackend`].
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,

    next_handle: u64,
    next_sync: u64,

    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, wgpu::Texture>,
    views: HashMap<u64, wgpu::TextureView>,
    view_indices: HashMap<u64, u32>,
    next_view_index: u32,
    bind_group_layouts: HashMap<u64, wgpu::BindGroupLayout>,
    bind_groups: HashMap<u64, wgpu::BindGroup>,
    render_pipelines: HashMap<u64, wgpu::RenderPipeline>,
    compute_pipelines: HashMap<u64, wgpu::ComputePipeline>,

    /// Reusable fill sources keyed by (word value, byte size).
    fill_sources: HashMap<(u32, u64), wgpu::Buffer>,

    encoder: Option<wgpu::CommandEncoder>,
    pending_compute: Option<PendingComputePass>,
    pending_render: Option<PendingRenderPass>,
}

impl WgpuBackend {
    /// Create a headless wgpu backend on the best available adapter.
    pub fn new() -> BackendResult<Self> {
        let instance = wgpu::Instance::default();

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| {
            BackendError::InitializationFailed("no suitable GPU adapter found".into())
        })?;

        log::info!("WgpuBackend: using adapter {:?}", adapter.get_info().name);

        let required_features = wgpu::Features::INDIRECT_FIRST_INSTANCE
            | wgpu::Features::MULTI_DRAW_INDIRECT
            | wgpu::Features::MULTI_DRAW_INDIRECT_COUNT
            | wgpu::Features::PUSH_CONSTANTS;

        let required_limits = wgpu::Limits {
            max_push_constant_size: 16,
            ..wgpu::Limits::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gpu-driven-engine"),
                required_features,
                required_limits,
            },
            None,
        ))
        .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        Ok(Self {
            device,
            queue,
            next_handle: 1,
            next_sync: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            view_indices: HashMap::new(),
            next_view_index: 0,
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            fill_sources: HashMap::new(),
            encoder: None,
            pending_compute: None,
            pending_render: None,
        })
    }

    fn alloc_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn buffer(&self, handle: u64) -> &wgpu::Buffer {
        self.buffers.get(&handle).expect("unknown buffer handle")
    }

    fn encoder_mut(&mut self) -> &mut wgpu::CommandEncoder {
        self.encoder
            .as_mut()
            .expect("recording outside begin_commands/submit_commands")
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut out = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::VERTEX) {
            out |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::INDEX) {
            out |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            out |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) {
            out |= wgpu::BufferUsages::STORAGE;
        }
        if usage.contains(BufferUsage::INDIRECT) {
            out |= wgpu::BufferUsages::INDIRECT;
        }
        if usage.contains(BufferUsage::COPY_SRC) {
            out |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            out |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::MAP_READ) {
            out |= wgpu::BufferUsages::MAP_READ;
        }
        if usage.contains(BufferUsage::MAP_WRITE) {
            out |= wgpu::BufferUsages::MAP_WRITE;
        }
        out
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut out = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            out |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            out |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            out |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::STORAGE_BINDING) {
            out |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        out
    }

    fn convert_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
            TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
            TextureFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        }
    }

    fn convert_compare(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
            VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        }
    }

    fn convert_blend(blend: BlendState) -> wgpu::BlendState {
        match blend {
            BlendState::AlphaBlending => wgpu::BlendState::ALPHA_BLENDING,
            BlendState::Additive => wgpu::BlendState {
                color: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
                alpha: wgpu::BlendComponent::REPLACE,
            },
        }
    }

    fn flush_pending_compute(&mut self) {
        let Some(pending) = self.pending_compute.take() else {
            return;
        };
        let mut encoder = self.encoder.take().expect("compute pass outside commands");
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: pending.label.as_deref(),
                timestamp_writes: None,
            });
            for cmd in &pending.commands {
                match cmd {
                    ComputeCommand::SetPipeline(handle) => {
                        cpass.set_pipeline(&self.compute_pipelines[handle]);
                    }
                    ComputeCommand::SetBindGroup { index, bind_group } => {
                        cpass.set_bind_group(*index, &self.bind_groups[bind_group], &[]);
                    }
                    ComputeCommand::SetPushConstants(data) => {
                        cpass.set_push_constants(0, data);
                    }
                    ComputeCommand::Dispatch { x, y, z } => {
                        cpass.dispatch_workgroups(*x, *y, *z);
                    }
                    ComputeCommand::DispatchIndirect { args, offset } => {
                        cpass.dispatch_workgroups_indirect(&self.buffers[args], *offset);
                    }
                }
            }
        }
        self.encoder = Some(encoder);
    }

    fn flush_pending_render(&mut self) {
        let Some(pending) = self.pending_render.take() else {
            return;
        };
        let mut encoder = self.encoder.take().expect("render pass outside commands");
        {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pending
                .desc
                .color_attachments
                .iter()
                .map(|att| {
                    Some(wgpu::RenderPassColorAttachment {
                        view: &self.views[&att.view.0],
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: match att.load_op {
                                LoadOp::Clear(c) => wgpu::LoadOp::Clear(wgpu::Color {
                                    r: c[0] as f64,
                                    g: c[1] as f64,
                                    b: c[2] as f64,
                                    a: c[3] as f64,
                                }),
                                LoadOp::ClearDepth(_) | LoadOp::Load => wgpu::LoadOp::Load,
                            },
                            store: match att.store_op {
                                StoreOp::Store => wgpu::StoreOp::Store,
                                StoreOp::Discard => wgpu::StoreOp::Discard,
                            },
                        },
                    })
                })
                .collect();

            let depth_stencil_attachment =
                pending
                    .desc
                    .depth_stencil_attachment
                    .as_ref()
                    .map(|att| wgpu::RenderPassDepthStencilAttachment {
                        view: &self.views[&att.view.0],
                        depth_ops: Some(wgpu::Operations {
                            load: match att.load_op {
                                LoadOp::ClearDepth(d) => wgpu::LoadOp::Clear(d),
                                LoadOp::Clear(_) => wgpu::LoadOp::Clear(1.0),
                                LoadOp::Load => wgpu::LoadOp::Load,
                            },
                            store: match att.store_op {
                                StoreOp::Store => wgpu::StoreOp::Store,
                                StoreOp::Discard => wgpu::StoreOp::Discard,
                            },
                        }),
                        stencil_ops: None,
                    });

            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: pending.desc.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for cmd in &pending.commands {
                match cmd {
                    RenderCommand::SetPipeline(handle) => {
                        rpass.set_pipeline(&self.render_pipelines[handle]);
                    }
                    RenderCommand::SetBindGroup { index, bind_group } => {
                        rpass.set_bind_group(*index, &self.bind_groups[bind_group], &[]);
                    }
                    RenderCommand::SetViewport {
                        x,
                        y,
                        width,
                        height,
                    } => {
                        rpass.set_viewport(*x, *y, *width, *height, 0.0, 1.0);
                    }
                    RenderCommand::SetVertexBuffer { slot, buffer, offset } => {
                        rpass.set_vertex_buffer(*slot, self.buffers[buffer].slice(*offset..));
                    }
                    RenderCommand::SetIndexBuffer {
                        buffer,
                        offset,
                        format,
                    } => {
                        rpass.set_index_buffer(self.buffers[buffer].slice(*offset..), *format);
                    }
                    RenderCommand::MultiDrawIndexedIndirectCount {
                        args,
                        args_offset,
                        count,
                        count_offset,
                        max_count,
                    } => {
                        rpass.multi_draw_indexed_indirect_count(
                            &self.buffers[args],
                            *args_offset,
                            &self.buffers[count],
                            *count_offset,
                            *max_count,
                        );
                    }
                }
            }
        }
        self.encoder = Some(encoder);
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: desc.size,
            usage: Self::convert_buffer_usage(desc.usage),
            mapped_at_creation: false,
        });
        let handle = self.alloc_handle();
        self.buffers.insert(handle, buffer);
        Ok(BufferHandle(handle))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.queue.write_buffer(self.buffer(buffer.0), offset, data);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.depth,
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        let handle = self.alloc_handle();
        self.textures.insert(handle, texture);
        Ok(TextureHandle(handle))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::TextureCreationFailed("view of unknown texture".into()))?;
        let view = tex.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = self.alloc_handle();
        self.views.insert(handle, view);
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
        if let Some(buf) = self.buffers.remove(&buffer.0) {
            buf.destroy();
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture.0) {
            tex.destroy();
        }
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let wgpu_entries: Vec<wgpu::BindGroupLayoutEntry> = entries
            .iter()
            .map(|entry| {
                let mut visibility = wgpu::ShaderStages::empty();
                if entry.visibility.contains(ShaderStageFlags::VERTEX) {
                    visibility |= wgpu::ShaderStages::VERTEX;
                }
                if entry.visibility.contains(ShaderStageFlags::FRAGMENT) {
                    visibility |= wgpu::ShaderStages::FRAGMENT;
                }
                if entry.visibility.contains(ShaderStageFlags::COMPUTE) {
                    visibility |= wgpu::ShaderStages::COMPUTE;
                }
                let ty = match &entry.ty {
                    BindingType::UniformBuffer => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    BindingType::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage {
                            read_only: *read_only,
                        },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    BindingType::Texture => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    BindingType::DepthTexture => wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                };
                wgpu::BindGroupLayoutEntry {
                    binding: entry.binding,
                    visibility,
                    ty,
                    count: None,
                }
            })
            .collect();

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &wgpu_entries,
            });
        let handle = self.alloc_handle();
        self.bind_group_layouts.insert(handle, layout);
        Ok(BindGroupLayoutHandle(handle))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let wgpu_entries: Vec<wgpu::BindGroupEntry> = entries
            .iter()
            .map(|(binding, entry)| {
                let resource = match entry {
                    BindGroupEntry::Buffer {
                        buffer,
                        offset,
                        size,
                    } => wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.buffers[&buffer.0],
                        offset: *offset,
                        size: size.and_then(wgpu::BufferSize::new),
                    }),
                    BindGroupEntry::Texture(view) => {
                        wgpu::BindingResource::TextureView(&self.views[&view.0])
                    }
                };
                wgpu::BindGroupEntry {
                    binding: *binding,
                    resource,
                }
            })
            .collect();

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.bind_group_layouts[&layout.0],
            entries: &wgpu_entries,
        });
        let handle = self.alloc_handle();
        self.bind_groups.insert(handle, bind_group);
        Ok(BindGroupHandle(handle))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: desc.label.as_deref(),
                source: wgpu::ShaderSource::Wgsl(desc.shader.as_str().into()),
            });

        let layouts: Vec<&wgpu::BindGroupLayout> = desc
            .bind_group_layouts
            .iter()
            .map(|h| &self.bind_group_layouts[&h.0])
            .collect();
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: desc.label.as_deref(),
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            });

        let attribute_sets: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|attr| wgpu::VertexAttribute {
                        format: Self::convert_vertex_format(attr.format),
                        offset: attr.offset,
                        shader_location: attr.location,
                    })
                    .collect()
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(&attribute_sets)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes,
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|target| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_format(target.format),
                    blend: target.blend.map(Self::convert_blend),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let fragment = desc.fs_entry.as_ref().map(|entry| wgpu::FragmentState {
            module: &module,
            entry_point: entry,
            compilation_options: Default::default(),
            targets: &color_targets,
        });

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: desc.label.as_deref(),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: &desc.vs_entry,
                    compilation_options: Default::default(),
                    buffers: &vertex_buffers,
                },
                fragment,
                primitive: wgpu::PrimitiveState {
                    topology: match desc.topology {
                        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
                        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
                        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
                    },
                    strip_index_format: None,
                    front_face: match desc.front_face {
                        FrontFace::Ccw => wgpu::FrontFace::Ccw,
                        FrontFace::Cw => wgpu::FrontFace::Cw,
                    },
                    cull_mode: match desc.cull_mode {
                        CullMode::None => None,
                        CullMode::Front => Some(wgpu::Face::Front),
                        CullMode::Back => Some(wgpu::Face::Back),
                    },
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: desc.depth_stencil.as_ref().map(|ds| wgpu::DepthStencilState {
                    format: Self::convert_format(ds.format),
                    depth_write_enabled: ds.depth_write_enabled,
                    depth_compare: Self::convert_compare(ds.depth_compare),
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

        let handle = self.alloc_handle();
        self.render_pipelines.insert(handle, pipeline);
        Ok(RenderPipelineHandle(handle))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: desc.label.as_deref(),
                source: wgpu::ShaderSource::Wgsl(desc.shader.as_str().into()),
            });

        let layouts: Vec<&wgpu::BindGroupLayout> = desc
            .bind_group_layouts
            .iter()
            .map(|h| &self.bind_group_layouts[&h.0])
            .collect();
        let push_constant_ranges = if desc.push_constant_size > 0 {
            vec![wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::COMPUTE,
                range: 0..desc.push_constant_size,
            }]
        } else {
            Vec::new()
        };
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: desc.label.as_deref(),
                bind_group_layouts: &layouts,
                push_constant_ranges: &push_constant_ranges,
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: desc.label.as_deref(),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: &desc.entry_point,
                compilation_options: Default::default(),
            });

        let handle = self.alloc_handle();
        self.compute_pipelines.insert(handle, pipeline);
        Ok(ComputePipelineHandle(handle))
    }

    fn begin_commands(&mut self, _queue: QueueKind) {
        debug_assert!(
            self.encoder.is_none(),
            "begin_commands called with a batch already open"
        );
        self.encoder = Some(
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None }),
        );
    }

    fn submit_commands(&mut self, queue: QueueKind) -> SyncHandle {
        debug_assert!(self.pending_compute.is_none() && self.pending_render.is_none());
        let encoder = self
            .encoder
            .take()
            .expect("submit_commands without begin_commands");
        self.queue.submit(std::iter::once(encoder.finish()));
        let sync = SyncHandle(self.next_sync);
        self.next_sync += 1;
        log::trace!(
            "WgpuBackend: submitted batch for {:?} (sync {})",
            queue,
            sync.value()
        );
        sync
    }

    fn wait_sync_handle(&mut self, _queue: QueueKind, _handle: SyncHandle) {
        // Single hardware queue: submission order already provides the
        // requested ordering.
    }

    fn wait_idle(&mut self) {
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }

    fn transition_buffer(&mut self, _buffer: BufferHandle, _from: ResourceState, _to: ResourceState) {
        // wgpu tracks buffer states internally.
    }

    fn transition_texture(
        &mut self,
        _texture: TextureHandle,
        _from: ResourceState,
        _to: ResourceState,
    ) {
        // wgpu tracks texture states internally.
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        let encoder = self
            .encoder
            .as_mut()
            .expect("copy_buffer_to_buffer outside commands");
        encoder.copy_buffer_to_buffer(
            &self.buffers[&src.0],
            src_offset,
            &self.buffers[&dst.0],
            dst_offset,
            size,
        );
    }

    fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32) {
        if value == 0 {
            let encoder = self.encoder.as_mut().expect("fill_buffer outside commands");
            encoder.clear_buffer(&self.buffers[&buffer.0], offset, Some(size));
            return;
        }
        // Non-zero fills copy from a cached constant buffer.
        if !self.fill_sources.contains_key(&(value, size)) {
            let words = vec![value; (size / 4) as usize];
            let source = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("fill_source"),
                    contents: bytemuck::cast_slice(&words),
                    usage: wgpu::BufferUsages::COPY_SRC,
                });
            self.fill_sources.insert((value, size), source);
        }
        let encoder = self.encoder.as_mut().expect("fill_buffer outside commands");
        encoder.copy_buffer_to_buffer(
            &self.fill_sources[&(value, size)],
            0,
            &self.buffers[&buffer.0],
            offset,
            size,
        );
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        debug_assert!(self.pending_compute.is_none(), "nested compute pass");
        self.pending_compute = Some(PendingComputePass {
            label: label.map(str::to_owned),
            commands: Vec::new(),
        });
    }

    fn end_compute_pass(&mut self) {
        self.flush_pending_compute();
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        if let Some(pending) = &mut self.pending_compute {
            pending.commands.push(ComputeCommand::SetPipeline(pipeline.0));
        }
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        if let Some(pending) = &mut self.pending_compute {
            pending.commands.push(ComputeCommand::SetBindGroup {
                index,
                bind_group: bind_group.0,
            });
        } else if let Some(pending) = &mut self.pending_render {
            pending.commands.push(RenderCommand::SetBindGroup {
                index,
                bind_group: bind_group.0,
            });
        }
    }

    fn set_push_constants(&mut self, data: &[u8]) {
        if let Some(pending) = &mut self.pending_compute {
            pending
                .commands
                .push(ComputeCommand::SetPushConstants(data.to_vec()));
        }
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        if let Some(pending) = &mut self.pending_compute {
            pending.commands.push(ComputeCommand::Dispatch { x, y, z });
        }
    }

    fn dispatch_compute_indirect(&mut self, args: BufferHandle, offset: u64) {
        if let Some(pending) = &mut self.pending_compute {
            pending.commands.push(ComputeCommand::DispatchIndirect {
                args: args.0,
                offset,
            });
        }
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        debug_assert!(self.pending_render.is_none(), "nested render pass");
        self.pending_render = Some(PendingRenderPass {
            desc: desc.clone(),
            commands: Vec::new(),
        });
    }

    fn end_render_pass(&mut self) {
        self.flush_pending_render();
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(pending) = &mut self.pending_render {
            pending.commands.push(RenderCommand::SetPipeline(pipeline.0));
        }
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        if let Some(pending) = &mut self.pending_render {
            pending.commands.push(RenderCommand::SetViewport {
                x,
                y,
                width,
                height,
            });
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        if let Some(pending) = &mut self.pending_render {
            pending.commands.push(RenderCommand::SetVertexBuffer {
                slot,
                buffer: buffer.0,
                offset,
            });
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        if let Some(pending) = &mut self.pending_render {
            pending.commands.push(RenderCommand::SetIndexBuffer {
                buffer: buffer.0,
                offset,
                format: match format {
                    IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
                    IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
                },
            });
        }
    }

    fn multi_draw_indexed_indirect_count(
        &mut self,
        args: BufferHandle,
        args_offset: u64,
        count: BufferHandle,
        count_offset: u64,
        max_count: u32,
    ) {
        if let Some(pending) = &mut self.pending_render {
            pending
                .commands
                .push(RenderCommand::MultiDrawIndexedIndirectCount {
                    args: args.0,
                    args_offset,
                    count: count.0,
                    count_offset,
                    max_count,
                });
        }
    }
}
