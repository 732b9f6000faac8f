//! Indirect cull pass.
//!
//! One compute dispatch per view, one thread per instance. Each thread
//! transforms the instance's local bounds to a world-space AABB, tests it
//! against the view's six frustum planes, and on pass atomically appends a
//! `(key, instance index)` pair to the view's survivor buffer. The key is
//! the signed distance of the AABB center to the near plane, encoded so
//! unsigned comparison preserves float order.
//!
//! The counter is reset by an explicit fill (with its own transition) before
//! the cull dispatch; no host read-back occurs anywhere in the chain.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::backend::{
    BackendResult, BindGroupLayoutEntry, BindingType, ComputePipelineDescriptor,
    ComputePipelineHandle, GraphicsBackend, QueueKind, ResourceState, ShaderStageFlags,
};
use crate::pipeline::frame::{FrameHandles, InstanceData, SurvivorRecord, ViewBuffers, ViewHandles};
use crate::pipeline::sort::encode_depth_key;
use crate::render_graph::RenderGraph;
use crate::scene::{Aabb, Frustum};

/// Threads per cull workgroup; the dispatch covers one thread per instance.
pub const CULL_WORKGROUP_SIZE: u32 = 64;

/// Uniforms of one cull dispatch, mirrored by the WGSL `CullUniforms`.
///
/// `flags_mask`/`flags_value` select which instances belong to the view:
/// opaque views match a clear transparent bit, the transparent view matches
/// it set, shadow views match opaque only.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CullUniforms {
    pub planes: [[f32; 4]; 6],
    pub instance_count: u32,
    pub flags_mask: u32,
    pub flags_value: u32,
    pub _pad: u32,
}

const_assert_eq!(std::mem::size_of::<CullUniforms>(), 112);

impl CullUniforms {
    pub fn new(frustum: &Frustum, instance_count: u32, flags_mask: u32, flags_value: u32) -> Self {
        Self {
            planes: frustum.planes.map(|p| p.to_array()),
            instance_count,
            flags_mask,
            flags_value,
            _pad: 0,
        }
    }
}

/// The cull compute pipeline and its bind group layout.
pub struct CullPipeline {
    pipeline: ComputePipelineHandle,
    pub layout: crate::backend::BindGroupLayoutHandle,
}

impl CullPipeline {
    pub fn new(backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::UniformBuffer,
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: false },
            },
            BindGroupLayoutEntry {
                binding: 3,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: false },
            },
        ])?;
        let pipeline = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("cull_instances".into()),
            shader: CULL_SHADER.to_string(),
            entry_point: "cull_instances".into(),
            bind_group_layouts: vec![layout],
            push_constant_size: 0,
        })?;
        Ok(Self { pipeline, layout })
    }

    /// Add the counter reset and cull dispatch for one view.
    ///
    /// `wait_for_upload` orders the first compute pass of the frame after the
    /// copy queue's upload submission; the graph never infers this.
    pub fn add_passes(
        &self,
        graph: &mut RenderGraph,
        frame: FrameHandles,
        view: &ViewBuffers,
        handles: ViewHandles,
        instance_count: u32,
        wait_for_upload: bool,
    ) {
        let mut reset = graph
            .add_render_pass(&format!("reset_counter:{}", view.label))
            .queue(QueueKind::Compute)
            .write(handles.counter, ResourceState::TransferDst);
        if wait_for_upload {
            reset = reset.wait_for_queue(QueueKind::Copy);
        }
        reset.execute(move |ctx| {
            let counter = ctx.buffer(handles.counter);
            ctx.backend.fill_buffer(counter, 0, 4, 0);
            Ok(())
        });

        let pipeline = self.pipeline;
        let bind_group = view.cull_bind_group;
        let label = view.label.clone();
        graph
            .add_render_pass(&format!("cull:{}", view.label))
            .queue(QueueKind::Compute)
            .read(handles.uniforms, ResourceState::ShaderResource)
            .read(frame.instances, ResourceState::ShaderResource)
            .write(handles.survivors, ResourceState::UnorderedAccess)
            .write(handles.counter, ResourceState::UnorderedAccess)
            .execute(move |ctx| {
                let groups = instance_count.div_ceil(CULL_WORKGROUP_SIZE);
                ctx.backend.begin_compute_pass(Some(&label));
                ctx.backend.set_compute_pipeline(pipeline);
                ctx.backend.set_bind_group(0, bind_group);
                ctx.backend.dispatch_compute(groups, 1, 1);
                ctx.backend.end_compute_pass();
                Ok(())
            });
    }
}

/// CPU mirror of the cull kernel, used by tests to validate survivor sets.
///
/// Appends sequentially, so its output order matches a serial execution of
/// the kernel; after sorting, GPU and CPU agree for distinct keys.
pub fn cull_cpu(
    instances: &[InstanceData],
    frustum: &Frustum,
    flags_mask: u32,
    flags_value: u32,
) -> Vec<SurvivorRecord> {
    let mut survivors = Vec::new();
    for (i, inst) in instances.iter().enumerate() {
        if inst.flags & flags_mask != flags_value {
            continue;
        }
        let model = glam::Mat4::from_cols_array_2d(&inst.model);
        let local = Aabb::new(
            glam::Vec4::from_array(inst.aabb_min).truncate(),
            glam::Vec4::from_array(inst.aabb_max).truncate(),
        );
        let world = local.transformed(model);
        if !frustum.intersects_aabb(&world) {
            continue;
        }
        let depth = frustum.near_distance(world.center());
        survivors.push(SurvivorRecord {
            key: encode_depth_key(depth),
            index: i as u32,
        });
    }
    survivors
}

/// WGSL cull kernel. Struct layouts mirror [`InstanceData`], [`CullUniforms`],
/// and [`SurvivorRecord`]; the frustum test mirrors
/// [`Frustum::intersects_aabb`](crate::scene::Frustum::intersects_aabb).
pub const CULL_SHADER: &str = r#"
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

struct CullUniforms {
    planes: array<vec4<f32>, 6>,
    instance_count: u32,
    flags_mask: u32,
    flags_value: u32,
    pad: u32,
}

struct Survivor {
    key: u32,
    index: u32,
}

@group(0) @binding(0) var<uniform> cull: CullUniforms;
@group(0) @binding(1) var<storage, read> instances: array<Instance>;
@group(0) @binding(2) var<storage, read_write> survivors: array<Survivor>;
@group(0) @binding(3) var<storage, read_write> counter: atomic<u32>;

// Flip float bits so unsigned comparison orders signed depths correctly.
fn encode_depth(depth: f32) -> u32 {
    let bits = bitcast<u32>(depth);
    if (bits & 0x80000000u) != 0u {
        return ~bits;
    }
    return bits | 0x80000000u;
}

@compute @workgroup_size(64)
fn cull_instances(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if i >= cull.instance_count {
        return;
    }
    let inst = instances[i];
    if (inst.flags & cull.flags_mask) != cull.flags_value {
        return;
    }

    // World-space AABB of the eight transformed local corners.
    var world_min = vec3<f32>(3.402823e38);
    var world_max = vec3<f32>(-3.402823e38);
    for (var c = 0u; c < 8u; c = c + 1u) {
        let corner = vec3<f32>(
            select(inst.aabb_min.x, inst.aabb_max.x, (c & 1u) != 0u),
            select(inst.aabb_min.y, inst.aabb_max.y, (c & 2u) != 0u),
            select(inst.aabb_min.z, inst.aabb_max.z, (c & 4u) != 0u),
        );
        let world = (inst.model * vec4<f32>(corner, 1.0)).xyz;
        world_min = min(world_min, world);
        world_max = max(world_max, world);
    }

    // Positive-vertex test against each plane.
    for (var p = 0u; p < 6u; p = p + 1u) {
        let plane = cull.planes[p];
        let positive = vec3<f32>(
            select(world_min.x, world_max.x, plane.x >= 0.0),
            select(world_min.y, world_max.y, plane.y >= 0.0),
            select(world_min.z, world_max.z, plane.z >= 0.0),
        );
        if dot(plane.xyz, positive) + plane.w < 0.0 {
            return;
        }
    }

    let center = 0.5 * (world_min + world_max);
    let depth = dot(cull.planes[4].xyz, center) + cull.planes[4].w;
    let slot = atomicAdd(&counter, 1u);
    survivors[slot].key = encode_depth(depth);
    survivors[slot].index = i;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame::INSTANCE_FLAG_TRANSPARENT;
    use crate::scene::{CameraView, MeshRef, VisibleInstance};
    use glam::{Mat4, Vec3};

    fn mesh() -> MeshRef {
        MeshRef {
            vertex_buffer_view: 0,
            index_buffer_view: 0,
            index_count: 36,
            first_index: 0,
            base_vertex: 0,
        }
    }

    fn instance_at(position: Vec3) -> InstanceData {
        InstanceData::from_visible(&VisibleInstance::new(
            Mat4::from_translation(position),
            Aabb::unit(),
            mesh(),
            0,
        ))
    }

    fn camera_frustum() -> Frustum {
        let camera = CameraView::perspective(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 1.0);
        Frustum::from_view_proj(camera.view_proj())
    }

    #[test]
    fn test_cull_rejects_instance_outside_frustum() {
        let frustum = camera_frustum();
        // A and C in front of the camera, B far behind it.
        let instances = [
            instance_at(Vec3::new(0.0, 0.0, -5.0)),
            instance_at(Vec3::new(0.0, 0.0, 50.0)),
            instance_at(Vec3::new(1.0, 0.0, -10.0)),
        ];
        let survivors = cull_cpu(&instances, &frustum, 0, 0);
        let indices: Vec<u32> = survivors.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_cull_keys_grow_with_depth() {
        let frustum = camera_frustum();
        let instances = [
            instance_at(Vec3::new(0.0, 0.0, -20.0)),
            instance_at(Vec3::new(0.0, 0.0, -2.0)),
        ];
        let survivors = cull_cpu(&instances, &frustum, 0, 0);
        assert_eq!(survivors.len(), 2);
        // The nearer instance has the smaller encoded key.
        assert!(survivors[1].key < survivors[0].key);
    }

    #[test]
    fn test_cull_flag_filter_splits_views() {
        let frustum = camera_frustum();
        let mut transparent = instance_at(Vec3::new(0.0, 0.0, -5.0));
        transparent.flags = INSTANCE_FLAG_TRANSPARENT;
        let instances = [instance_at(Vec3::new(0.0, 0.0, -3.0)), transparent];

        let opaque = cull_cpu(&instances, &frustum, INSTANCE_FLAG_TRANSPARENT, 0);
        assert_eq!(opaque.len(), 1);
        assert_eq!(opaque[0].index, 0);

        let blended = cull_cpu(
            &instances,
            &frustum,
            INSTANCE_FLAG_TRANSPARENT,
            INSTANCE_FLAG_TRANSPARENT,
        );
        assert_eq!(blended.len(), 1);
        assert_eq!(blended[0].index, 1);
    }

    #[test]
    fn test_cull_each_index_appears_once() {
        let frustum = camera_frustum();
        let instances: Vec<InstanceData> = (0..64)
            .map(|i| instance_at(Vec3::new((i % 8) as f32 - 4.0, 0.0, -(i as f32) - 1.0)))
            .collect();
        let survivors = cull_cpu(&instances, &frustum, 0, 0);
        let mut seen = std::collections::HashSet::new();
        for s in &survivors {
            assert!(seen.insert(s.index), "index {} appended twice", s.index);
        }
        assert!(survivors.len() as u32 <= instances.len() as u32);
    }

    #[test]
    fn test_cull_scaled_instance_world_bounds() {
        let frustum = camera_frustum();
        // Unit box scaled x100 at the frustum's left edge: world bounds keep it visible.
        let big = InstanceData::from_visible(&VisibleInstance::new(
            Mat4::from_scale_rotation_translation(
                Vec3::splat(100.0),
                glam::Quat::IDENTITY,
                Vec3::new(-80.0, 0.0, -20.0),
            ),
            Aabb::unit(),
            mesh(),
            0,
        ));
        let survivors = cull_cpu(&[big], &frustum, 0, 0);
        assert_eq!(survivors.len(), 1);
    }
}
