//! Indirect draw consumption.
//!
//! After the sort, a small emit kernel expands each `(key, index)` pair into
//! a packed indirect draw argument record, in sorted order, with the
//! instance index riding in `first_instance`. Each view is then rendered by
//! a single `multi_draw_indexed_indirect_count` call whose maximum count is
//! the fixed capacity and whose actual count the GPU reads from the live
//! counter at execution time. The host never learns how many draws were
//! issued.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::backend::{
    BackendResult, BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle,
    BindingType, BlendState, BufferHandle, ColorAttachment, ColorTargetState,
    ComputePipelineDescriptor, ComputePipelineHandle, CompareFunction, CullMode,
    DepthStencilAttachment, DepthStencilState, DispatchIndirectArgs, FrontFace, GraphicsBackend,
    LoadOp, PrimitiveTopology, QueueKind, RenderPassDescriptor, RenderPipelineDescriptor,
    RenderPipelineHandle, ResourceState, ShaderStageFlags, StoreOp, TextureFormat, VertexAttribute,
    VertexBufferLayout, VertexFormat,
};
use crate::pipeline::frame::{FrameBuffers, FrameHandles, ViewBuffers, ViewHandles};
use crate::pipeline::sort::emit_args_slot;
use crate::pipeline::MAX_INSTANCES;
use crate::render_graph::{RenderGraph, ResourceHandle};
use crate::scene::{CameraView, MeshBuffers};

/// Threads per emit workgroup; must match the args kernel's `EMIT_WORKGROUP`.
pub const EMIT_WORKGROUP_SIZE: u32 = 64;

/// Camera uniforms bound by the forward pipelines.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniforms {
    pub view_proj: [[f32; 4]; 4],
    /// World-space camera position; w unused.
    pub position: [f32; 4],
}

const_assert_eq!(std::mem::size_of::<CameraUniforms>(), 80);

impl CameraUniforms {
    pub fn from_view(camera: &CameraView) -> Self {
        Self {
            view_proj: camera.view_proj().to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
        }
    }
}

/// Which half of the camera split a forward pass renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPassKind {
    /// Clears the targets, depth writes on.
    Opaque,
    /// Loads the opaque result, depth read-only, alpha blending.
    Transparent,
}

/// Color and depth targets of the forward passes (frame transients).
#[derive(Debug, Clone, Copy)]
pub struct DrawTargets {
    pub color: ResourceHandle,
    pub depth: ResourceHandle,
}

/// The emit compute pipeline and the forward render pipelines.
pub struct DrawPipelines {
    emit: ComputePipelineHandle,
    opaque: RenderPipelineHandle,
    transparent: RenderPipelineHandle,
    pub emit_layout: BindGroupLayoutHandle,
    pub scene_layout: BindGroupLayoutHandle,
}

impl DrawPipelines {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        color_format: TextureFormat,
        depth_format: TextureFormat,
    ) -> BackendResult<Self> {
        let emit_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: false },
            },
        ])?;
        let emit = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("emit_draw_args".into()),
            shader: EMIT_SHADER.to_string(),
            entry_point: "emit_draw_args".into(),
            bind_group_layouts: vec![emit_layout],
            push_constant_size: 0,
        })?;

        let scene_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::VERTEX,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::StorageBuffer { read_only: true },
            },
        ])?;

        let vertex_layout = VertexBufferLayout {
            array_stride: 32,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Float32x2,
                    offset: 24,
                },
            ],
        };

        let opaque = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("forward_opaque".into()),
            shader: FORWARD_SHADER.to_string(),
            vs_entry: "vs_main".into(),
            fs_entry: Some("fs_main".into()),
            vertex_layouts: vec![vertex_layout.clone()],
            bind_group_layouts: vec![scene_layout],
            topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState {
                format: depth_format,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
            }),
            color_targets: vec![ColorTargetState {
                format: color_format,
                blend: None,
            }],
        })?;
        let transparent = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("forward_transparent".into()),
            shader: FORWARD_SHADER.to_string(),
            vs_entry: "vs_main".into(),
            fs_entry: Some("fs_main".into()),
            vertex_layouts: vec![vertex_layout],
            bind_group_layouts: vec![scene_layout],
            topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState {
                format: depth_format,
                depth_write_enabled: false,
                depth_compare: CompareFunction::Less,
            }),
            color_targets: vec![ColorTargetState {
                format: color_format,
                blend: Some(BlendState::AlphaBlending),
            }],
        })?;

        Ok(Self {
            emit,
            opaque,
            transparent,
            emit_layout,
            scene_layout,
        })
    }

    /// Bind group over the camera uniforms and the frame's structured buffers.
    pub fn create_scene_bind_group(
        &self,
        backend: &mut dyn GraphicsBackend,
        camera_uniforms: BufferHandle,
        frame: &FrameBuffers,
    ) -> BackendResult<BindGroupHandle> {
        backend.create_bind_group(
            self.scene_layout,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: camera_uniforms,
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
                (
                    2,
                    BindGroupEntry::Buffer {
                        buffer: frame.materials,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )
    }

    /// Add the emit dispatch turning one view's sorted pairs into packed
    /// draw arguments.
    pub fn add_emit_pass(
        &self,
        graph: &mut RenderGraph,
        view: &ViewBuffers,
        handles: ViewHandles,
        frame: FrameHandles,
    ) {
        let pipeline = self.emit;
        let bind_group = view.emit_bind_group;
        let label = format!("emit_args:{}", view.label);
        graph
            .add_render_pass(&label)
            .queue(QueueKind::Compute)
            .read(handles.sort_dispatch, ResourceState::IndirectArgument)
            .read(handles.survivors, ResourceState::ShaderResource)
            .read(handles.counter, ResourceState::ShaderResource)
            .read(frame.instances, ResourceState::ShaderResource)
            .write(handles.draw_args, ResourceState::UnorderedAccess)
            .execute(move |ctx| {
                let dispatch = ctx.buffer(handles.sort_dispatch);
                let offset = emit_args_slot() as u64 * DispatchIndirectArgs::SIZE;
                ctx.backend.begin_compute_pass(Some(&label));
                ctx.backend.set_compute_pipeline(pipeline);
                ctx.backend.set_bind_group(0, bind_group);
                ctx.backend.dispatch_compute_indirect(dispatch, offset);
                ctx.backend.end_compute_pass();
                Ok(())
            });
    }

    /// Add one forward pass consuming a view's sorted draw arguments.
    ///
    /// `wait_for_compute` must be set on the frame's first graphics pass; the
    /// graph never infers the cross-queue dependency on the cull/sort chain.
    #[allow(clippy::too_many_arguments)]
    pub fn add_forward_pass(
        &self,
        graph: &mut RenderGraph,
        kind: ForwardPassKind,
        view: &ViewBuffers,
        handles: ViewHandles,
        frame: FrameHandles,
        scene_bind_group: BindGroupHandle,
        mesh: MeshBuffers,
        targets: DrawTargets,
        wait_for_compute: bool,
    ) {
        let (pipeline, name) = match kind {
            ForwardPassKind::Opaque => (self.opaque, format!("draw_opaque:{}", view.label)),
            ForwardPassKind::Transparent => {
                (self.transparent, format!("draw_transparent:{}", view.label))
            }
        };

        let mut builder = graph
            .add_render_pass(&name)
            .queue(QueueKind::Graphics)
            .read(handles.draw_args, ResourceState::IndirectArgument)
            .read(handles.counter, ResourceState::IndirectArgument)
            .read(frame.instances, ResourceState::ShaderResource)
            .read(frame.materials, ResourceState::ShaderResource)
            .write(targets.color, ResourceState::ColorAttachment);
        builder = match kind {
            ForwardPassKind::Opaque => builder.write(targets.depth, ResourceState::DepthAttachment),
            ForwardPassKind::Transparent => {
                builder.read(targets.depth, ResourceState::DepthReadOnly)
            }
        };
        if wait_for_compute {
            builder = builder.wait_for_queue(QueueKind::Compute);
        }

        builder.execute(move |ctx| {
            let color_texture = ctx.texture(targets.color);
            let depth_texture = ctx.texture(targets.depth);
            let draw_args = ctx.buffer(handles.draw_args);
            let counter = ctx.buffer(handles.counter);
            let color = ctx.backend.create_texture_view(color_texture)?;
            let depth = ctx.backend.create_texture_view(depth_texture)?;
            let (color_load, depth_load, depth_read_only) = match kind {
                ForwardPassKind::Opaque => {
                    (LoadOp::Clear([0.0, 0.0, 0.0, 1.0]), LoadOp::ClearDepth(1.0), false)
                }
                ForwardPassKind::Transparent => (LoadOp::Load, LoadOp::Load, true),
            };
            ctx.backend.begin_render_pass(&RenderPassDescriptor {
                label: Some(name.clone()),
                color_attachments: vec![ColorAttachment {
                    view: color,
                    load_op: color_load,
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: Some(DepthStencilAttachment {
                    view: depth,
                    load_op: depth_load,
                    store_op: StoreOp::Store,
                    read_only: depth_read_only,
                }),
            });
            ctx.backend.set_render_pipeline(pipeline);
            ctx.backend.set_bind_group(0, scene_bind_group);
            ctx.backend.set_vertex_buffer(0, mesh.vertex, 0);
            ctx.backend.set_index_buffer(mesh.index, 0, mesh.index_format);
            ctx.backend
                .multi_draw_indexed_indirect_count(draw_args, 0, counter, 0, MAX_INSTANCES);
            ctx.backend.end_render_pass();
            Ok(())
        });
    }
}

/// Kernel expanding sorted survivor pairs into packed draw arguments.
///
/// Dispatched indirectly from the slot the sort's args kernel reserves, so
/// a zero count dispatches zero groups.
pub const EMIT_SHADER: &str = r#"
struct Survivor {
    key: u32,
    index: u32,
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

struct DrawArgs {
    index_count: u32,
    instance_count: u32,
    first_index: u32,
    base_vertex: i32,
    first_instance: u32,
}

@group(0) @binding(0) var<storage, read> survivors: array<Survivor>;
@group(0) @binding(1) var<storage, read> counter: u32;
@group(0) @binding(2) var<storage, read> instances: array<Instance>;
@group(0) @binding(3) var<storage, read_write> draw_args: array<DrawArgs>;

@compute @workgroup_size(64)
fn emit_draw_args(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if i >= counter {
        return;
    }
    let survivor = survivors[i];
    let inst = instances[survivor.index];
    draw_args[i] = DrawArgs(
        inst.index_count,
        1u,
        inst.first_index,
        inst.base_vertex,
        survivor.index,
    );
}
"#;

/// Forward shading module shared by the opaque and transparent pipelines.
///
/// Instances are fetched through `instance_index`, which the emit kernel
/// placed in each draw's `first_instance`. Shading is intentionally minimal;
/// lighting correctness lives in a downstream pass.
pub const FORWARD_SHADER: &str = r#"
struct CameraUniforms {
    view_proj: mat4x4<f32>,
    position: vec4<f32>,
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

struct Material {
    uniform_view: u32,
    base_color_view: u32,
    metallic_roughness_view: u32,
    normal_view: u32,
    emissive_view: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
}

@group(0) @binding(0) var<uniform> camera: CameraUniforms;
@group(0) @binding(1) var<storage, read> instances: array<Instance>;
@group(0) @binding(2) var<storage, read> materials: array<Material>;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) world_normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
    @location(2) @interpolate(flat) material_index: u32,
}

@vertex
fn vs_main(input: VertexInput, @builtin(instance_index) instance_index: u32) -> VertexOutput {
    let inst = instances[instance_index];
    let world = inst.model * vec4<f32>(input.position, 1.0);

    var out: VertexOutput;
    out.clip = camera.view_proj * world;
    // Normal matrix is the transposed inverse model matrix.
    out.world_normal = normalize((vec4<f32>(input.normal, 0.0) * inst.inv_model).xyz);
    out.uv = input.uv;
    out.material_index = inst.material_index;
    return out;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let material = materials[input.material_index];
    let light_dir = normalize(vec3<f32>(0.4, 0.8, 0.2));
    let ndl = max(dot(normalize(input.world_normal), light_dir), 0.0);
    let shade = 0.2 + 0.8 * ndl;
    return vec4<f32>(vec3<f32>(shade), 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_camera_uniforms_layout() {
        let camera = CameraView::perspective(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, 1.0);
        let uniforms = CameraUniforms::from_view(&camera);
        assert_eq!(uniforms.position, [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(
            uniforms.view_proj,
            camera.view_proj().to_cols_array_2d()
        );
    }
}
