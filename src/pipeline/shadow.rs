//! Shadow map passes.
//!
//! Every shadow-casting light runs the same cull → sort → emit chain as the
//! camera, once per sub-view: a directional light's four cascades render
//! into quadrant viewports of one shadow atlas, each spot light gets a
//! dedicated depth texture. The association between a light's stable
//! identity and its buffer set is checked every frame; when the identity
//! disappears or changes, the whole set is torn down and recreated, never
//! silently reused for a different light.

use std::collections::HashMap;

use bytemuck::{bytes_of, Pod, Zeroable};
use glam::Mat4;
use static_assertions::const_assert_eq;

use crate::backend::{
    BackendResult, BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle,
    BindingType, BufferHandle, BufferDescriptor, BufferUsage, CompareFunction, CullMode,
    DepthStencilAttachment, DepthStencilState, FrontFace, GraphicsBackend, LoadOp,
    PrimitiveTopology, QueueKind, RenderPassDescriptor, RenderPipelineDescriptor,
    RenderPipelineHandle, ResourceState, ShaderStageFlags, StoreOp, TextureDescriptor,
    TextureFormat, TextureHandle, TextureUsage, VertexAttribute, VertexBufferLayout, VertexFormat,
};
use crate::pipeline::cull::CullUniforms;
use crate::pipeline::frame::{
    FrameBuffers, FrameHandles, ViewBuffers, ViewLayouts, INSTANCE_FLAG_TRANSPARENT,
};
use crate::pipeline::sort::SortDirection;
use crate::pipeline::{CASCADE_COUNT, MAX_INSTANCES, MAX_SPOT_LIGHTS};
use crate::render_graph::{RenderGraph, ResourceHandle, ResourceRegistry};
use crate::scene::{Frustum, MeshBuffers, ShadowCastingLight, ShadowLightId, ShadowProjection};

/// Edge length of the directional cascade atlas.
pub const SHADOW_ATLAS_SIZE: u32 = 4096;

/// Edge length of one cascade quadrant within the atlas.
pub const SHADOW_CASCADE_SIZE: u32 = SHADOW_ATLAS_SIZE / 2;

/// Edge length of a spot light's dedicated shadow map.
pub const SPOT_SHADOW_SIZE: u32 = 1024;

/// Per-sub-view uniforms of the depth-only raster pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShadowViewUniforms {
    pub view_proj: [[f32; 4]; 4],
}

const_assert_eq!(std::mem::size_of::<ShadowViewUniforms>(), 64);

/// The depth-only render pipeline shared by all shadow views.
pub struct ShadowPipelines {
    depth_only: RenderPipelineHandle,
    pub view_layout: BindGroupLayoutHandle,
}

impl ShadowPipelines {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        depth_format: TextureFormat,
    ) -> BackendResult<Self> {
        let view_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::StorageBuffer { read_only: true },
            },
        ])?;
        let depth_only = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("shadow_depth_only".into()),
            shader: SHADOW_SHADER.to_string(),
            vs_entry: "vs_shadow".into(),
            fs_entry: None,
            vertex_layouts: vec![VertexBufferLayout {
                array_stride: 32,
                attributes: vec![VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                }],
            }],
            bind_group_layouts: vec![view_layout],
            topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState {
                format: depth_format,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
            }),
            color_targets: Vec::new(),
        })?;
        Ok(Self {
            depth_only,
            view_layout,
        })
    }

    /// Add the atlas render pass drawing all four cascades of a directional
    /// light through quadrant viewports.
    pub fn add_atlas_pass(
        &self,
        graph: &mut RenderGraph,
        label: &str,
        atlas: ResourceHandle,
        cascades: [ShadowDrawInputs; CASCADE_COUNT],
        frame: FrameHandles,
        mesh: MeshBuffers,
    ) {
        let pipeline = self.depth_only;
        let name = format!("shadow_atlas:{label}");
        let mut builder = graph
            .add_render_pass(&name)
            .queue(QueueKind::Graphics)
            .read(frame.instances, ResourceState::ShaderResource)
            .write(atlas, ResourceState::DepthAttachment);
        for cascade in &cascades {
            builder = builder
                .read(cascade.draw_args, ResourceState::IndirectArgument)
                .read(cascade.counter, ResourceState::IndirectArgument);
        }
        builder.execute(move |ctx| {
            let atlas_texture = ctx.texture(atlas);
            let view = ctx.backend.create_texture_view(atlas_texture)?;
            ctx.backend.begin_render_pass(&RenderPassDescriptor {
                label: Some(name.clone()),
                color_attachments: Vec::new(),
                depth_stencil_attachment: Some(DepthStencilAttachment {
                    view,
                    load_op: LoadOp::ClearDepth(1.0),
                    store_op: StoreOp::Store,
                    read_only: false,
                }),
            });
            ctx.backend.set_render_pipeline(pipeline);
            ctx.backend.set_vertex_buffer(0, mesh.vertex, 0);
            ctx.backend.set_index_buffer(mesh.index, 0, mesh.index_format);
            for (i, cascade) in cascades.iter().enumerate() {
                let draw_args = ctx.buffer(cascade.draw_args);
                let counter = ctx.buffer(cascade.counter);
                let x = (i as u32 % 2) * SHADOW_CASCADE_SIZE;
                let y = (i as u32 / 2) * SHADOW_CASCADE_SIZE;
                ctx.backend.set_viewport(
                    x as f32,
                    y as f32,
                    SHADOW_CASCADE_SIZE as f32,
                    SHADOW_CASCADE_SIZE as f32,
                );
                ctx.backend.set_bind_group(0, cascade.bind_group);
                ctx.backend
                    .multi_draw_indexed_indirect_count(draw_args, 0, counter, 0, MAX_INSTANCES);
            }
            ctx.backend.end_render_pass();
            Ok(())
        });
    }

    /// Add the render pass for one spot light's dedicated shadow map.
    pub fn add_spot_pass(
        &self,
        graph: &mut RenderGraph,
        label: &str,
        depth: ResourceHandle,
        inputs: ShadowDrawInputs,
        frame: FrameHandles,
        mesh: MeshBuffers,
    ) {
        let pipeline = self.depth_only;
        let name = format!("shadow_spot:{label}");
        graph
            .add_render_pass(&name)
            .queue(QueueKind::Graphics)
            .read(frame.instances, ResourceState::ShaderResource)
            .read(inputs.draw_args, ResourceState::IndirectArgument)
            .read(inputs.counter, ResourceState::IndirectArgument)
            .write(depth, ResourceState::DepthAttachment)
            .execute(move |ctx| {
                let depth_texture = ctx.texture(depth);
                let draw_args = ctx.buffer(inputs.draw_args);
                let counter = ctx.buffer(inputs.counter);
                let view = ctx.backend.create_texture_view(depth_texture)?;
                ctx.backend.begin_render_pass(&RenderPassDescriptor {
                    label: Some(name.clone()),
                    color_attachments: Vec::new(),
                    depth_stencil_attachment: Some(DepthStencilAttachment {
                        view,
                        load_op: LoadOp::ClearDepth(1.0),
                        store_op: StoreOp::Store,
                        read_only: false,
                    }),
                });
                ctx.backend.set_render_pipeline(pipeline);
                ctx.backend.set_bind_group(0, inputs.bind_group);
                ctx.backend.set_vertex_buffer(0, mesh.vertex, 0);
                ctx.backend.set_index_buffer(mesh.index, 0, mesh.index_format);
                ctx.backend
                    .multi_draw_indexed_indirect_count(draw_args, 0, counter, 0, MAX_INSTANCES);
                ctx.backend.end_render_pass();
                Ok(())
            });
    }
}

/// Registry handles plus the bind group a shadow draw consumes.
#[derive(Debug, Clone, Copy)]
pub struct ShadowDrawInputs {
    pub draw_args: ResourceHandle,
    pub counter: ResourceHandle,
    pub bind_group: BindGroupHandle,
}

/// One shadow sub-view: the survivor buffer set plus the raster-side
/// uniforms and bind group.
pub struct ShadowView {
    pub buffers: ViewBuffers,
    pub view_uniforms: BufferHandle,
    pub draw_bind_group: BindGroupHandle,
}

impl ShadowView {
    fn new(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        layouts: ViewLayouts,
        view_layout: BindGroupLayoutHandle,
        frame: &FrameBuffers,
    ) -> BackendResult<Self> {
        // Shadows sort front to back along the light, like a depth prepass.
        let buffers = ViewBuffers::new(backend, label, SortDirection::Ascending, layouts, frame)?;
        let view_uniforms = backend.create_buffer(
            &BufferDescriptor::new(
                std::mem::size_of::<ShadowViewUniforms>() as u64,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            )
            .with_label(format!("{label}_view_uniforms")),
        )?;
        let draw_bind_group = backend.create_bind_group(
            view_layout,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: view_uniforms,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    1,
                    BindGroupEntry::Buffer {
                        buffer: frame.instances,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?;
        Ok(Self {
            buffers,
            view_uniforms,
            draw_bind_group,
        })
    }

    /// Write this sub-view's cull and raster uniforms for the frame.
    ///
    /// Shadow views cull opaque instances only; transparent geometry does
    /// not cast shadows here.
    pub fn write_uniforms(
        &self,
        backend: &mut dyn GraphicsBackend,
        view_proj: Mat4,
        instance_count: u32,
    ) {
        let frustum = Frustum::from_view_proj(view_proj);
        let cull = CullUniforms::new(&frustum, instance_count, INSTANCE_FLAG_TRANSPARENT, 0);
        backend.write_buffer(self.buffers.uniforms, 0, bytes_of(&cull));
        let view = ShadowViewUniforms {
            view_proj: view_proj.to_cols_array_2d(),
        };
        backend.write_buffer(self.view_uniforms, 0, bytes_of(&view));
    }

    fn destroy(self, backend: &mut dyn GraphicsBackend) {
        self.buffers.destroy(backend);
        backend.destroy_buffer(self.view_uniforms);
    }
}

/// A light's shadow resources, bound to its stable identity.
pub enum ShadowTarget {
    Directional {
        views: [ShadowView; CASCADE_COUNT],
        atlas: TextureHandle,
    },
    Spot {
        view: ShadowView,
        depth: TextureHandle,
    },
}

pub struct ShadowEntry {
    pub id: ShadowLightId,
    pub target: ShadowTarget,
}

impl ShadowEntry {
    fn destroy(self, backend: &mut dyn GraphicsBackend) {
        match self.target {
            ShadowTarget::Directional { views, atlas } => {
                for view in views {
                    view.destroy(backend);
                }
                backend.destroy_texture(atlas);
            }
            ShadowTarget::Spot { view, depth } => {
                view.destroy(backend);
                backend.destroy_texture(depth);
            }
        }
    }

    fn matches(&self, projection: &ShadowProjection) -> bool {
        matches!(
            (&self.target, projection),
            (
                ShadowTarget::Directional { .. },
                ShadowProjection::Directional { .. }
            ) | (ShadowTarget::Spot { .. }, ShadowProjection::Spot { .. })
        )
    }
}

/// The shadow association table, keyed by light identity.
pub struct ShadowMaps {
    entries: HashMap<ShadowLightId, ShadowEntry>,
    depth_format: TextureFormat,
}

impl ShadowMaps {
    pub fn new(depth_format: TextureFormat) -> Self {
        Self {
            entries: HashMap::new(),
            depth_format,
        }
    }

    pub fn entry(&self, id: ShadowLightId) -> Option<&ShadowEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reconcile the table with this frame's active lights.
    ///
    /// Entries whose identity is gone (or whose light changed kind under the
    /// same identity) are destroyed; missing entries are created. Buffer
    /// sets therefore never carry over from one light to a different one.
    ///
    /// # Panics
    ///
    /// Panics when the number of active spot lights exceeds
    /// `MAX_SPOT_LIGHTS`.
    pub fn sync(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        lights: &[ShadowCastingLight],
        layouts: ViewLayouts,
        view_layout: BindGroupLayoutHandle,
        frame: &FrameBuffers,
    ) -> BackendResult<()> {
        let spot_count = lights
            .iter()
            .filter(|l| matches!(l.projection, ShadowProjection::Spot { .. }))
            .count();
        assert!(
            spot_count <= MAX_SPOT_LIGHTS as usize,
            "active spot light count {} exceeds the fixed capacity {}",
            spot_count,
            MAX_SPOT_LIGHTS
        );

        let stale: Vec<ShadowLightId> = self
            .entries
            .iter()
            .filter(|(id, entry)| {
                !lights
                    .iter()
                    .any(|l| l.id == **id && entry.matches(&l.projection))
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            log::debug!("shadow: tearing down association for light {id:?}");
            let entry = self.entries.remove(&id).expect("stale id collected above");
            entry.destroy(backend);
        }

        for light in lights {
            if self.entries.contains_key(&light.id) {
                continue;
            }
            log::debug!("shadow: creating association for light {:?}", light.id);
            let target = match light.projection {
                ShadowProjection::Directional { .. } => {
                    let label = |i: usize| {
                        format!(
                            "shadow_dir_{}_{}_c{}",
                            light.id.object_id, light.id.component_id, i
                        )
                    };
                    let views = [
                        ShadowView::new(backend, &label(0), layouts, view_layout, frame)?,
                        ShadowView::new(backend, &label(1), layouts, view_layout, frame)?,
                        ShadowView::new(backend, &label(2), layouts, view_layout, frame)?,
                        ShadowView::new(backend, &label(3), layouts, view_layout, frame)?,
                    ];
                    let atlas = backend.create_texture(
                        &TextureDescriptor::new_2d(
                            SHADOW_ATLAS_SIZE,
                            SHADOW_ATLAS_SIZE,
                            self.depth_format,
                            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                        )
                        .with_label(format!(
                            "shadow_atlas_{}_{}",
                            light.id.object_id, light.id.component_id
                        )),
                    )?;
                    ShadowTarget::Directional { views, atlas }
                }
                ShadowProjection::Spot { .. } => {
                    let label = format!(
                        "shadow_spot_{}_{}",
                        light.id.object_id, light.id.component_id
                    );
                    let view = ShadowView::new(backend, &label, layouts, view_layout, frame)?;
                    let depth = backend.create_texture(
                        &TextureDescriptor::new_2d(
                            SPOT_SHADOW_SIZE,
                            SPOT_SHADOW_SIZE,
                            self.depth_format,
                            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                        )
                        .with_label(format!("{label}_depth")),
                    )?;
                    ShadowTarget::Spot { view, depth }
                }
            };
            self.entries.insert(
                light.id,
                ShadowEntry {
                    id: light.id,
                    target,
                },
            );
        }
        Ok(())
    }

    /// Destroy every association (renderer shutdown).
    pub fn clear(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, entry) in self.entries.drain() {
            entry.destroy(backend);
        }
    }

    /// Import a shadow texture for this frame's graph.
    pub fn import_texture(
        registry: &mut ResourceRegistry,
        name: &str,
        texture: TextureHandle,
    ) -> ResourceHandle {
        registry.import_texture(name, texture, ResourceState::Undefined)
    }
}

/// Depth-only vertex shader for shadow rendering.
pub const SHADOW_SHADER: &str = r#"
struct ShadowViewUniforms {
    view_proj: mat4x4<f32>,
}

struct Instance {
    model: mat4x4<f32>,
    inv_model: mat4x4<f32>,
    prev_model: mat4x4<f32>,
    aabb_min: vec4<f32>,
    aabb_max: vec4<f32>,
    index_count: u32,
    first_index: u32,
    base_vertex: i32,
    vertex_buffer_view: u32,
    index_buffer_view: u32,
    material_index: u32,
    flags: u32,
    pad: u32,
}

@group(0) @binding(0) var<uniform> shadow_view: ShadowViewUniforms;
@group(0) @binding(1) var<storage, read> instances: array<Instance>;

@vertex
fn vs_shadow(
    @location(0) position: vec3<f32>,
    @builtin(instance_index) instance_index: u32,
) -> @builtin(position) vec4<f32> {
    let inst = instances[instance_index];
    return shadow_view.view_proj * (inst.model * vec4<f32>(position, 1.0));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use glam::Mat4;

    fn test_layouts(backend: &mut DummyBackend) -> (ViewLayouts, BindGroupLayoutHandle) {
        let layouts = ViewLayouts {
            cull: backend.create_bind_group_layout(&[]).unwrap(),
            sort_args: backend.create_bind_group_layout(&[]).unwrap(),
            sort_data: backend.create_bind_group_layout(&[]).unwrap(),
            emit: backend.create_bind_group_layout(&[]).unwrap(),
        };
        let view_layout = backend.create_bind_group_layout(&[]).unwrap();
        (layouts, view_layout)
    }

    fn spot(object_id: u64, component_id: u64) -> ShadowCastingLight {
        ShadowCastingLight {
            id: ShadowLightId::new(object_id, component_id),
            projection: ShadowProjection::Spot {
                view_proj: Mat4::IDENTITY,
            },
        }
    }

    #[test]
    fn test_sync_creates_and_removes_associations() {
        let mut backend = DummyBackend::new();
        let (layouts, view_layout) = test_layouts(&mut backend);
        let frame = FrameBuffers::new(&mut backend).unwrap();
        let baseline = backend.live_buffer_count();

        let mut maps = ShadowMaps::new(TextureFormat::Depth32Float);
        maps.sync(&mut backend, &[spot(1, 1)], layouts, view_layout, &frame)
            .unwrap();
        assert_eq!(maps.len(), 1);
        assert!(maps.entry(ShadowLightId::new(1, 1)).is_some());
        assert!(backend.live_buffer_count() > baseline);

        // Light removed: association torn down, buffers freed.
        maps.sync(&mut backend, &[], layouts, view_layout, &frame)
            .unwrap();
        assert!(maps.is_empty());
        assert_eq!(backend.live_buffer_count(), baseline);
    }

    #[test]
    fn test_sync_recreates_on_identity_change() {
        let mut backend = DummyBackend::new();
        let (layouts, view_layout) = test_layouts(&mut backend);
        let frame = FrameBuffers::new(&mut backend).unwrap();

        let mut maps = ShadowMaps::new(TextureFormat::Depth32Float);
        maps.sync(&mut backend, &[spot(1, 1)], layouts, view_layout, &frame)
            .unwrap();
        let old = match &maps.entry(ShadowLightId::new(1, 1)).unwrap().target {
            ShadowTarget::Spot { view, .. } => view.buffers.counter,
            _ => unreachable!(),
        };

        // Same object, different component: a different light identity.
        maps.sync(&mut backend, &[spot(1, 2)], layouts, view_layout, &frame)
            .unwrap();
        assert_eq!(maps.len(), 1);
        assert!(maps.entry(ShadowLightId::new(1, 1)).is_none());
        assert!(!backend.buffer_alive(old));
    }

    #[test]
    fn test_sync_keeps_unchanged_association() {
        let mut backend = DummyBackend::new();
        let (layouts, view_layout) = test_layouts(&mut backend);
        let frame = FrameBuffers::new(&mut backend).unwrap();

        let mut maps = ShadowMaps::new(TextureFormat::Depth32Float);
        maps.sync(&mut backend, &[spot(4, 2)], layouts, view_layout, &frame)
            .unwrap();
        let before = match &maps.entry(ShadowLightId::new(4, 2)).unwrap().target {
            ShadowTarget::Spot { view, .. } => view.buffers.counter,
            _ => unreachable!(),
        };
        maps.sync(&mut backend, &[spot(4, 2)], layouts, view_layout, &frame)
            .unwrap();
        let after = match &maps.entry(ShadowLightId::new(4, 2)).unwrap().target {
            ShadowTarget::Spot { view, .. } => view.buffers.counter,
            _ => unreachable!(),
        };
        assert_eq!(before, after, "stable identity must keep its buffers");
    }

    #[test]
    #[should_panic(expected = "exceeds the fixed capacity")]
    fn test_sync_spot_overflow_panics() {
        let mut backend = DummyBackend::new();
        let (layouts, view_layout) = test_layouts(&mut backend);
        let frame = FrameBuffers::new(&mut backend).unwrap();

        let lights: Vec<ShadowCastingLight> = (0..MAX_SPOT_LIGHTS as u64 + 1)
            .map(|i| spot(i, 0))
            .collect();
        let mut maps = ShadowMaps::new(TextureFormat::Depth32Float);
        let _ = maps.sync(&mut backend, &lights, layouts, view_layout, &frame);
    }
}
