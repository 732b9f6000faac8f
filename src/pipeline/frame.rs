//! Per-frame GPU data: instance/material records, upload staging, and the
//! per-view survivor buffer sets.
//!
//! Every struct that crosses to the GPU is `#[repr(C)]` with a size assert
//! against the WGSL layout it mirrors. The instance array is rebuilt from the
//! scene's visible list every frame, staged through a ring buffer, and copied
//! to a device-local buffer on the copy queue; the array index is the
//! instance identity used by cull, sort, and draw.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::backend::{
    BackendResult, BindGroupEntry, BindGroupHandle, BindGroupLayoutHandle, BufferDescriptor,
    BufferHandle, BufferUsage, DispatchIndirectArgs, DrawIndexedIndirectArgs, GraphicsBackend,
    QueueKind, ResourceState,
};
use crate::pipeline::cull::CullUniforms;
use crate::pipeline::sort::{self, SortDirection};
use crate::pipeline::{MAX_INSTANCES, MAX_MATERIALS};
use crate::render_graph::{RenderGraph, ResourceHandle, ResourceRegistry};
use crate::scene::{MaterialDesc, VisibleInstance};

/// Instance flag: sorted back to front and drawn with blending.
pub const INSTANCE_FLAG_TRANSPARENT: u32 = 1 << 0;

/// GPU-side mesh instance record.
///
/// Mirrors the WGSL `Instance` struct bound by the cull, emit, and forward
/// kernels. AABB extents are local space; the cull kernel transforms the
/// eight corners by `model` per view.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceData {
    pub model: [[f32; 4]; 4],
    pub inv_model: [[f32; 4]; 4],
    pub prev_model: [[f32; 4]; 4],
    /// Local AABB minimum; w unused.
    pub aabb_min: [f32; 4],
    /// Local AABB maximum; w unused.
    pub aabb_max: [f32; 4],
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub vertex_buffer_view: u32,
    pub index_buffer_view: u32,
    pub material_index: u32,
    pub flags: u32,
    pub _pad: u32,
}

const_assert_eq!(std::mem::size_of::<InstanceData>(), 256);

impl InstanceData {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn from_visible(instance: &VisibleInstance) -> Self {
        let mut flags = 0;
        if instance.transparent {
            flags |= INSTANCE_FLAG_TRANSPARENT;
        }
        Self {
            model: instance.transform.to_cols_array_2d(),
            inv_model: instance.transform.inverse().to_cols_array_2d(),
            prev_model: instance.prev_transform.to_cols_array_2d(),
            aabb_min: instance.aabb.min.extend(0.0).to_array(),
            aabb_max: instance.aabb.max.extend(0.0).to_array(),
            index_count: instance.mesh.index_count,
            first_index: instance.mesh.first_index,
            base_vertex: instance.mesh.base_vertex,
            vertex_buffer_view: instance.mesh.vertex_buffer_view,
            index_buffer_view: instance.mesh.index_buffer_view,
            material_index: instance.material_index,
            flags,
            _pad: 0,
        }
    }
}

/// GPU-side material record.
///
/// View indices are shader-visible descriptor indices; absent textures are
/// replaced with the default white/black views at record-build time, so the
/// shader never branches on absence.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct MaterialData {
    pub uniform_view: u32,
    pub base_color_view: u32,
    pub metallic_roughness_view: u32,
    pub normal_view: u32,
    pub emissive_view: u32,
    pub _pad: [u32; 3],
}

const_assert_eq!(std::mem::size_of::<MaterialData>(), 32);

impl MaterialData {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Shader-visible indices of the 1x1 fallback texture views.
///
/// Created once at renderer startup. White substitutes absent color-like
/// textures, black substitutes absent normal/emissive maps.
#[derive(Debug, Clone, Copy)]
pub struct DefaultViews {
    pub white: u32,
    pub black: u32,
}

impl MaterialData {
    pub fn from_desc(desc: &MaterialDesc, defaults: DefaultViews) -> Self {
        Self {
            uniform_view: desc.uniform_view,
            base_color_view: desc.base_color_view.unwrap_or(defaults.white),
            metallic_roughness_view: desc.metallic_roughness_view.unwrap_or(defaults.white),
            normal_view: desc.normal_view.unwrap_or(defaults.black),
            emissive_view: desc.emissive_view.unwrap_or(defaults.black),
            _pad: [0; 3],
        }
    }
}

/// One `(sort key, instance index)` pair appended by the cull kernel.
///
/// The bitonic sort orders these by key; the emit kernel then expands them
/// into packed indirect draw arguments in sorted order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct SurvivorRecord {
    pub key: u32,
    pub index: u32,
}

const_assert_eq!(std::mem::size_of::<SurvivorRecord>(), 8);

impl SurvivorRecord {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// CPU-side arrays built from the scene's visible list each frame.
#[derive(Debug, Default)]
pub struct FrameArrays {
    pub instances: Vec<InstanceData>,
    pub materials: Vec<MaterialData>,
}

impl FrameArrays {
    /// Rebuild the arrays from this frame's scene input.
    ///
    /// # Panics
    ///
    /// Panics when the visible list exceeds `MAX_INSTANCES` or the material
    /// table exceeds `MAX_MATERIALS`; there is no truncation path.
    pub fn rebuild(
        &mut self,
        instances: &[VisibleInstance],
        materials: &[MaterialDesc],
        defaults: DefaultViews,
    ) {
        assert!(
            instances.len() <= MAX_INSTANCES as usize,
            "visible instance count {} exceeds the fixed capacity {}",
            instances.len(),
            MAX_INSTANCES
        );
        assert!(
            materials.len() <= MAX_MATERIALS as usize,
            "material count {} exceeds the fixed capacity {}",
            materials.len(),
            MAX_MATERIALS
        );

        self.instances.clear();
        self.instances
            .extend(instances.iter().map(InstanceData::from_visible));
        self.materials.clear();
        self.materials
            .extend(materials.iter().map(|m| MaterialData::from_desc(m, defaults)));
    }

    pub fn instance_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.instances)
    }

    pub fn material_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.materials)
    }
}

/// A sub-allocation from the staging ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAllocation {
    pub offset: u64,
    pub size: u64,
}

/// Persistently allocated upload staging buffer.
///
/// Per-frame data is written into consecutive 256-byte-aligned regions and
/// copied to device-local buffers on the copy queue; the write cursor resets
/// when the frame begins.
pub struct StagingRing {
    buffer: BufferHandle,
    capacity: u64,
    write_offset: u64,
}

impl StagingRing {
    /// Alignment of every allocation, matching uniform-offset requirements.
    pub const ALIGNMENT: u64 = 256;

    pub fn new(backend: &mut dyn GraphicsBackend, capacity: u64) -> BackendResult<Self> {
        let buffer = backend.create_buffer(
            &BufferDescriptor::new(capacity, BufferUsage::COPY_SRC | BufferUsage::MAP_WRITE)
                .with_label("upload_staging_ring"),
        )?;
        Ok(Self {
            buffer,
            capacity,
            write_offset: 0,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Reset the write cursor at the start of a frame.
    pub fn reset(&mut self) {
        self.write_offset = 0;
    }

    /// Reserve an aligned region, or `None` when the ring is exhausted.
    pub fn allocate(&mut self, size: u64) -> Option<RingAllocation> {
        let offset = self.write_offset.next_multiple_of(Self::ALIGNMENT);
        if offset + size > self.capacity {
            return None;
        }
        self.write_offset = offset + size;
        Some(RingAllocation { offset, size })
    }

    /// Write `data` into a fresh allocation and return it.
    ///
    /// # Panics
    ///
    /// Panics when the ring is exhausted; ring capacity is provisioned for
    /// the fixed instance/material limits, so exhaustion is a sizing bug.
    pub fn stage(&mut self, backend: &mut dyn GraphicsBackend, data: &[u8]) -> RingAllocation {
        let alloc = self
            .allocate(data.len() as u64)
            .expect("staging ring exhausted");
        backend.write_buffer(self.buffer, alloc.offset, data);
        alloc
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

/// Device-local per-frame structured buffers, created once at startup.
pub struct FrameBuffers {
    pub instances: BufferHandle,
    pub materials: BufferHandle,
}

impl FrameBuffers {
    pub fn new(backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let instances = backend.create_buffer(
            &BufferDescriptor::new(
                MAX_INSTANCES as u64 * InstanceData::SIZE,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            )
            .with_label("frame_instances"),
        )?;
        let materials = backend.create_buffer(
            &BufferDescriptor::new(
                MAX_MATERIALS as u64 * MaterialData::SIZE,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            )
            .with_label("frame_materials"),
        )?;
        Ok(Self {
            instances,
            materials,
        })
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.instances);
        backend.destroy_buffer(self.materials);
    }
}

/// Registry handles for the frame buffers, imported once per frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameHandles {
    pub instances: ResourceHandle,
    pub materials: ResourceHandle,
}

/// Stage the frame arrays and add the copy-queue upload pass.
///
/// The staging writes happen host-side immediately; the pass records the
/// staging-to-device copies, leaving both destination buffers in
/// shader-resource state for the compute passes that follow.
pub fn add_upload_pass(
    graph: &mut RenderGraph,
    registry: &mut ResourceRegistry,
    backend: &mut dyn GraphicsBackend,
    staging: &mut StagingRing,
    arrays: &FrameArrays,
    frame: &FrameBuffers,
) -> FrameHandles {
    let instance_alloc = staging.stage(backend, arrays.instance_bytes());
    let material_alloc = staging.stage(backend, arrays.material_bytes());

    let staging_handle =
        registry.import_buffer("staging_ring", staging.buffer(), ResourceState::TransferSrc);
    let handles = FrameHandles {
        instances: registry.import_buffer(
            "frame_instances",
            frame.instances,
            ResourceState::Undefined,
        ),
        materials: registry.import_buffer(
            "frame_materials",
            frame.materials,
            ResourceState::Undefined,
        ),
    };

    graph
        .add_render_pass("upload_frame_data")
        .queue(QueueKind::Copy)
        .read(staging_handle, ResourceState::TransferSrc)
        .write(handles.instances, ResourceState::TransferDst)
        .write(handles.materials, ResourceState::TransferDst)
        .execute(move |ctx| {
            let staging = ctx.buffer(staging_handle);
            let instances = ctx.buffer(handles.instances);
            let materials = ctx.buffer(handles.materials);
            if instance_alloc.size > 0 {
                ctx.backend.copy_buffer_to_buffer(
                    staging,
                    instance_alloc.offset,
                    instances,
                    0,
                    instance_alloc.size,
                );
            }
            if material_alloc.size > 0 {
                ctx.backend.copy_buffer_to_buffer(
                    staging,
                    material_alloc.offset,
                    materials,
                    0,
                    material_alloc.size,
                );
            }
            Ok(())
        });

    handles
}

/// Bind group layouts shared by every view's buffer set.
///
/// Created once with the compute pipelines and borrowed whenever a view set
/// is built (camera views at startup, shadow views on association).
#[derive(Debug, Clone, Copy)]
pub struct ViewLayouts {
    pub cull: BindGroupLayoutHandle,
    pub sort_args: BindGroupLayoutHandle,
    pub sort_data: BindGroupLayoutHandle,
    pub emit: BindGroupLayoutHandle,
}

/// One view's survivor buffer set.
///
/// `survivors` holds `(key, index)` pairs appended by the cull kernel and
/// sorted in place; `draw_args` receives the packed indirect arguments in
/// sorted order; `counter` is the atomic append counter doubling as the
/// indirect draw count source. All buffers persist across frames; only the
/// counter is reset each frame.
pub struct ViewBuffers {
    pub label: String,
    pub direction: SortDirection,
    pub survivors: BufferHandle,
    pub counter: BufferHandle,
    pub draw_args: BufferHandle,
    pub sort_dispatch: BufferHandle,
    pub uniforms: BufferHandle,
    pub cull_bind_group: BindGroupHandle,
    pub sort_args_bind_group: BindGroupHandle,
    pub sort_data_bind_group: BindGroupHandle,
    pub emit_bind_group: BindGroupHandle,
}

impl ViewBuffers {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        direction: SortDirection,
        layouts: ViewLayouts,
        frame: &FrameBuffers,
    ) -> BackendResult<Self> {
        let capacity = MAX_INSTANCES as u64;
        let survivors = backend.create_buffer(
            &BufferDescriptor::new(capacity * SurvivorRecord::SIZE, BufferUsage::STORAGE)
                .with_label(format!("{label}_survivors")),
        )?;
        let counter = backend.create_buffer(
            &BufferDescriptor::new(
                4,
                BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::INDIRECT,
            )
            .with_label(format!("{label}_counter")),
        )?;
        let draw_args = backend.create_buffer(
            &BufferDescriptor::new(
                capacity * DrawIndexedIndirectArgs::SIZE,
                BufferUsage::STORAGE | BufferUsage::INDIRECT,
            )
            .with_label(format!("{label}_draw_args")),
        )?;
        let sort_dispatch = backend.create_buffer(
            &BufferDescriptor::new(
                sort::dispatch_slot_count() as u64 * DispatchIndirectArgs::SIZE,
                BufferUsage::STORAGE | BufferUsage::INDIRECT,
            )
            .with_label(format!("{label}_sort_dispatch")),
        )?;
        let uniforms = backend.create_buffer(
            &BufferDescriptor::new(
                std::mem::size_of::<CullUniforms>() as u64,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            )
            .with_label(format!("{label}_cull_uniforms")),
        )?;

        let cull_bind_group = backend.create_bind_group(
            layouts.cull,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: uniforms,
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
                        buffer: survivors,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    3,
                    BindGroupEntry::Buffer {
                        buffer: counter,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?;
        let sort_args_bind_group = backend.create_bind_group(
            layouts.sort_args,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: counter,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    1,
                    BindGroupEntry::Buffer {
                        buffer: sort_dispatch,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?;
        let sort_data_bind_group = backend.create_bind_group(
            layouts.sort_data,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: survivors,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    1,
                    BindGroupEntry::Buffer {
                        buffer: counter,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?;
        let emit_bind_group = backend.create_bind_group(
            layouts.emit,
            &[
                (
                    0,
                    BindGroupEntry::Buffer {
                        buffer: survivors,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    1,
                    BindGroupEntry::Buffer {
                        buffer: counter,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    2,
                    BindGroupEntry::Buffer {
                        buffer: frame.instances,
                        offset: 0,
                        size: None,
                    },
                ),
                (
                    3,
                    BindGroupEntry::Buffer {
                        buffer: draw_args,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?;

        Ok(Self {
            label: label.to_string(),
            direction,
            survivors,
            counter,
            draw_args,
            sort_dispatch,
            uniforms,
            cull_bind_group,
            sort_args_bind_group,
            sort_data_bind_group,
            emit_bind_group,
        })
    }

    /// Import this view's buffers into the frame's registry.
    pub fn import(&self, registry: &mut ResourceRegistry) -> ViewHandles {
        ViewHandles {
            survivors: registry.import_buffer(
                &format!("{}_survivors", self.label),
                self.survivors,
                ResourceState::Undefined,
            ),
            counter: registry.import_buffer(
                &format!("{}_counter", self.label),
                self.counter,
                ResourceState::Undefined,
            ),
            draw_args: registry.import_buffer(
                &format!("{}_draw_args", self.label),
                self.draw_args,
                ResourceState::Undefined,
            ),
            sort_dispatch: registry.import_buffer(
                &format!("{}_sort_dispatch", self.label),
                self.sort_dispatch,
                ResourceState::Undefined,
            ),
            uniforms: registry.import_buffer(
                &format!("{}_cull_uniforms", self.label),
                self.uniforms,
                ResourceState::ShaderResource,
            ),
        }
    }

    /// Destroy the set's buffers (shadow association teardown).
    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.survivors);
        backend.destroy_buffer(self.counter);
        backend.destroy_buffer(self.draw_args);
        backend.destroy_buffer(self.sort_dispatch);
        backend.destroy_buffer(self.uniforms);
    }
}

/// Registry handles for one view's buffer set, valid for one frame.
#[derive(Debug, Clone, Copy)]
pub struct ViewHandles {
    pub survivors: ResourceHandle,
    pub counter: ResourceHandle,
    pub draw_args: ResourceHandle,
    pub sort_dispatch: ResourceHandle,
    pub uniforms: ResourceHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::scene::{Aabb, MeshRef};
    use glam::{Mat4, Vec3};

    fn test_mesh() -> MeshRef {
        MeshRef {
            vertex_buffer_view: 0,
            index_buffer_view: 1,
            index_count: 36,
            first_index: 0,
            base_vertex: 0,
        }
    }

    fn test_instance(x: f32) -> VisibleInstance {
        VisibleInstance::new(
            Mat4::from_translation(Vec3::new(x, 0.0, 0.0)),
            Aabb::unit(),
            test_mesh(),
            0,
        )
    }

    const DEFAULTS: DefaultViews = DefaultViews { white: 7, black: 8 };

    #[test]
    fn test_instance_data_layout() {
        let data = InstanceData::from_visible(&test_instance(3.0).with_transparency(true));
        assert_eq!(data.flags, INSTANCE_FLAG_TRANSPARENT);
        assert_eq!(data.index_count, 36);
        // Translation lands in the fourth column.
        assert_eq!(data.model[3][0], 3.0);
        // Inverse undoes the translation.
        assert_eq!(data.inv_model[3][0], -3.0);
    }

    #[test]
    fn test_material_fallback_views() {
        let desc = MaterialDesc {
            uniform_view: 42,
            base_color_view: Some(5),
            ..Default::default()
        };
        let data = MaterialData::from_desc(&desc, DEFAULTS);
        assert_eq!(data.base_color_view, 5);
        assert_eq!(data.metallic_roughness_view, DEFAULTS.white);
        assert_eq!(data.normal_view, DEFAULTS.black);
        assert_eq!(data.emissive_view, DEFAULTS.black);
    }

    #[test]
    fn test_frame_arrays_rebuild_clears_previous() {
        let mut arrays = FrameArrays::default();
        arrays.rebuild(&[test_instance(1.0), test_instance(2.0)], &[], DEFAULTS);
        assert_eq!(arrays.instances.len(), 2);
        arrays.rebuild(&[test_instance(3.0)], &[MaterialDesc::default()], DEFAULTS);
        assert_eq!(arrays.instances.len(), 1);
        assert_eq!(arrays.materials.len(), 1);
        assert_eq!(arrays.instances[0].model[3][0], 3.0);
    }

    #[test]
    #[should_panic(expected = "exceeds the fixed capacity")]
    fn test_frame_arrays_overflow_panics() {
        let mut arrays = FrameArrays::default();
        let too_many = vec![test_instance(0.0); MAX_INSTANCES as usize + 1];
        arrays.rebuild(&too_many, &[], DEFAULTS);
    }

    #[test]
    fn test_staging_ring_alignment_and_exhaustion() {
        let mut backend = DummyBackend::new();
        let mut ring = StagingRing::new(&mut backend, 1024).unwrap();

        let a = ring.allocate(100).unwrap();
        assert_eq!(a.offset, 0);
        let b = ring.allocate(100).unwrap();
        assert_eq!(b.offset, 256);
        assert!(ring.allocate(1024).is_none());

        ring.reset();
        let c = ring.allocate(100).unwrap();
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn test_staging_ring_stage_writes_data() {
        let mut backend = DummyBackend::new();
        let mut ring = StagingRing::new(&mut backend, 1024).unwrap();

        let payload = [1u8, 2, 3, 4];
        ring.stage(&mut backend, &[0xAA; 16]);
        let alloc = ring.stage(&mut backend, &payload);
        assert_eq!(alloc.offset, 256);
        assert_eq!(
            backend.read_buffer(ring.buffer(), alloc.offset, 4),
            payload.to_vec()
        );
    }
}
