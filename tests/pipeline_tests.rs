//! Integration tests for the GPU-driven pipeline.
//!
//! The dummy backend records every submitted command and applies host-side
//! data movement (writes, fills, copies), so these tests verify two things:
//! the command stream the renderer produces (queue batching, explicit
//! cross-queue waits, counter resets, indirect dispatch and draw consumption)
//! and, through the CPU mirrors of the cull and sort kernels, the semantics
//! of the survivor sets themselves.

use rstest::rstest;

use glam::{Mat4, Vec3};
use gpu_driven_engine::backend::{
    BufferDescriptor, BufferUsage, DummyBackend, GraphicsBackend, IndexFormat, QueueKind,
    RecordedCommand,
};
use gpu_driven_engine::pipeline::cull::cull_cpu;
use gpu_driven_engine::pipeline::frame::InstanceData;
use gpu_driven_engine::pipeline::sort::{
    dispatch_slot_count, sort_survivors_cpu, SortDirection,
};
use gpu_driven_engine::scene::{
    Aabb, CameraView, Frustum, MaterialDesc, MeshBuffers, MeshRef, SceneInput, ShadowCastingLight,
    ShadowLightId, ShadowProjection, VisibleInstance,
};
use gpu_driven_engine::{Renderer, TargetSize, MAX_INSTANCES};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_mesh() -> MeshRef {
    MeshRef {
        vertex_buffer_view: 0,
        index_buffer_view: 1,
        index_count: 36,
        first_index: 0,
        base_vertex: 0,
    }
}

fn instance_at(position: Vec3) -> VisibleInstance {
    VisibleInstance::new(
        Mat4::from_translation(position),
        Aabb::unit(),
        test_mesh(),
        0,
    )
}

fn camera() -> CameraView {
    CameraView::perspective(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 1.0)
}

fn mesh_buffers(backend: &mut DummyBackend) -> MeshBuffers {
    let vertex = backend
        .create_buffer(
            &BufferDescriptor::new(1 << 20, BufferUsage::VERTEX).with_label("mesh_vertices"),
        )
        .unwrap();
    let index = backend
        .create_buffer(&BufferDescriptor::new(1 << 18, BufferUsage::INDEX).with_label("mesh_indices"))
        .unwrap();
    MeshBuffers {
        vertex,
        index,
        index_format: IndexFormat::Uint32,
    }
}

fn spot_light(object_id: u64, component_id: u64) -> ShadowCastingLight {
    ShadowCastingLight {
        id: ShadowLightId::new(object_id, component_id),
        projection: ShadowProjection::Spot {
            view_proj: Mat4::perspective_rh(1.0, 1.0, 0.1, 50.0)
                * Mat4::look_at_rh(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::Z),
        },
    }
}

struct TestScene {
    backend: DummyBackend,
    renderer: Renderer,
    mesh: MeshBuffers,
}

impl TestScene {
    fn new() -> Self {
        init_logging();
        let mut backend = DummyBackend::new();
        let mesh = mesh_buffers(&mut backend);
        let renderer = Renderer::new(
            &mut backend,
            TargetSize {
                width: 640,
                height: 360,
            },
        )
        .unwrap();
        Self {
            backend,
            renderer,
            mesh,
        }
    }

    fn render(
        &mut self,
        instances: &[VisibleInstance],
        lights: &[ShadowCastingLight],
    ) -> gpu_driven_engine::FrameStats {
        let scene = SceneInput {
            camera: camera(),
            instances,
            materials: &[MaterialDesc::default()],
            shadow_lights: lights,
            mesh_buffers: self.mesh,
        };
        self.renderer.render_frame(&mut self.backend, &scene).unwrap()
    }
}

// ============================================================================
// Command stream structure
// ============================================================================

#[test]
fn test_frame_batches_queues_with_explicit_waits() {
    let mut scene = TestScene::new();
    scene.render(&[instance_at(Vec3::new(0.0, 0.0, -5.0))], &[]);

    let submissions = scene.backend.submissions();
    assert_eq!(submissions.len(), 3, "copy, compute, graphics");
    assert_eq!(submissions[0].queue, QueueKind::Copy);
    assert_eq!(submissions[1].queue, QueueKind::Compute);
    assert_eq!(submissions[2].queue, QueueKind::Graphics);

    // Cross-queue ordering is declared, never inferred: the compute batch
    // waits on the upload, the graphics batch waits on the compute chain.
    assert_eq!(
        submissions[1].commands[0],
        RecordedCommand::WaitSyncHandle {
            handle: submissions[0].sync
        }
    );
    assert_eq!(
        submissions[2].commands[0],
        RecordedCommand::WaitSyncHandle {
            handle: submissions[1].sync
        }
    );
}

#[test]
fn test_counter_reset_precedes_cull_dispatch() {
    let mut scene = TestScene::new();
    scene.render(&[instance_at(Vec3::new(0.0, 0.0, -5.0))], &[]);

    let opaque_counter = scene.renderer.opaque_view().counter;
    let compute = &scene.backend.submissions()[1];
    let reset_pos = compute
        .commands
        .iter()
        .position(|c| {
            matches!(c, RecordedCommand::FillBuffer { buffer, value: 0, .. } if *buffer == opaque_counter)
        })
        .expect("opaque counter reset recorded");
    let first_dispatch = compute
        .commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::Dispatch { .. }))
        .expect("cull dispatch recorded");
    assert!(reset_pos < first_dispatch, "reset must precede the append");

    // The counter holds zero after the frame: the dummy applies fills but
    // executes no kernels, so any other value would mean a host-side write.
    assert_eq!(scene.backend.read_buffer(opaque_counter, 0, 4), vec![0; 4]);
}

#[test]
fn test_sort_and_emit_dispatch_indirectly_per_view() {
    let mut scene = TestScene::new();
    scene.render(&[instance_at(Vec3::new(0.0, 0.0, -5.0))], &[]);

    let indirect_dispatches = scene
        .backend
        .all_commands()
        .filter(|c| matches!(c, RecordedCommand::DispatchIndirect { .. }))
        .count();
    // Two camera views, each dispatching every slot of the sort network
    // (presort, outer/inner stages, emit) through the GPU-written args.
    assert_eq!(indirect_dispatches, 2 * dispatch_slot_count() as usize);
}

#[test]
fn test_draw_consumes_counter_as_count_source() {
    let mut scene = TestScene::new();
    scene.render(&[instance_at(Vec3::new(0.0, 0.0, -5.0))], &[]);

    let view = scene.renderer.opaque_view();
    let (args, counter) = (view.draw_args, view.counter);
    let draw = scene
        .backend
        .all_commands()
        .find_map(|c| match c {
            RecordedCommand::MultiDrawIndexedIndirectCount {
                args: a,
                count: n,
                max_count,
                ..
            } if *a == args => Some((*n, *max_count)),
            _ => None,
        })
        .expect("opaque indirect draw recorded");
    assert_eq!(draw.0, counter, "count must come from the live counter");
    assert_eq!(draw.1, MAX_INSTANCES, "max count is the fixed capacity");
}

#[test]
fn test_zero_instance_frame_executes_cleanly() {
    let mut scene = TestScene::new();
    let stats = scene.render(&[], &[]);

    assert_eq!(stats.instances_submitted, 0);
    // Counters read zero, and the indirect draws are still recorded; with a
    // zero count source they issue no draws on the device.
    assert_eq!(
        scene
            .backend
            .read_buffer(scene.renderer.opaque_view().counter, 0, 4),
        vec![0; 4]
    );
    assert!(scene
        .backend
        .all_commands()
        .any(|c| matches!(c, RecordedCommand::MultiDrawIndexedIndirectCount { .. })));
}

#[test]
fn test_instance_upload_reaches_device_buffer() {
    let mut scene = TestScene::new();
    scene.render(&[instance_at(Vec3::new(4.0, 0.0, -5.0))], &[]);

    // The dummy applies the staging copy, so the device-local instance
    // buffer holds the record; the translation sits in the fourth column.
    let bytes = scene.backend.read_buffer(
        scene.renderer.frame_buffers().instances,
        0,
        InstanceData::SIZE,
    );
    let record: InstanceData = bytemuck::pod_read_unaligned(&bytes);
    assert_eq!(record.model[3][0], 4.0);
    assert_eq!(record.index_count, 36);
}

// ============================================================================
// Survivor-set semantics (CPU mirrors)
// ============================================================================

#[test]
fn test_frustum_scenario_drops_only_outside_instance() {
    // A and C inside the frustum, B entirely outside.
    let visible = [
        instance_at(Vec3::new(0.0, 0.0, -5.0)),
        instance_at(Vec3::new(0.0, 0.0, 50.0)),
        instance_at(Vec3::new(1.0, 0.0, -10.0)),
    ];
    let instances: Vec<InstanceData> = visible.iter().map(InstanceData::from_visible).collect();
    let frustum = Frustum::from_view_proj(camera().view_proj());

    let mut survivors = cull_cpu(&instances, &frustum, 0, 0);
    assert_eq!(survivors.len(), 2, "opaque counter must be 2");

    sort_survivors_cpu(&mut survivors, SortDirection::Ascending);
    let indices: Vec<u32> = survivors.iter().map(|s| s.index).collect();
    // Front to back: A (depth 5) before C (depth 10); B is gone.
    assert_eq!(indices, vec![0, 2]);
}

#[rstest]
#[case::opaque_front_to_back(SortDirection::Ascending)]
#[case::transparent_back_to_front(SortDirection::Descending)]
fn test_sorted_keys_are_monotonic(#[case] direction: SortDirection) {
    let visible: Vec<VisibleInstance> = (0..300)
        .map(|i| {
            instance_at(Vec3::new(
                ((i * 7) % 13) as f32 - 6.0,
                ((i * 3) % 5) as f32 - 2.0,
                -2.0 - ((i * 11) % 97) as f32,
            ))
        })
        .collect();
    let instances: Vec<InstanceData> = visible.iter().map(InstanceData::from_visible).collect();
    let frustum = Frustum::from_view_proj(camera().view_proj());

    let mut survivors = cull_cpu(&instances, &frustum, 0, 0);
    assert!(survivors.len() as u32 <= instances.len() as u32);
    sort_survivors_cpu(&mut survivors, direction);

    for pair in survivors.windows(2) {
        match direction {
            SortDirection::Ascending => assert!(pair[0].key <= pair[1].key),
            SortDirection::Descending => assert!(pair[0].key >= pair[1].key),
        }
    }
}

#[test]
fn test_cull_and_sort_are_deterministic() {
    let visible: Vec<VisibleInstance> = (0..200)
        .map(|i| instance_at(Vec3::new((i % 17) as f32 - 8.0, 0.0, -1.0 - (i % 31) as f32)))
        .collect();
    let instances: Vec<InstanceData> = visible.iter().map(InstanceData::from_visible).collect();
    let frustum = Frustum::from_view_proj(camera().view_proj());

    let run = || {
        let mut survivors = cull_cpu(&instances, &frustum, 0, 0);
        sort_survivors_cpu(&mut survivors, SortDirection::Ascending);
        survivors
    };
    assert_eq!(run(), run());
}

// ============================================================================
// Capacity boundaries
// ============================================================================

#[test]
fn test_instance_count_at_capacity_completes() {
    let mut scene = TestScene::new();
    let visible: Vec<VisibleInstance> = (0..MAX_INSTANCES)
        .map(|i| instance_at(Vec3::new(0.0, 0.0, -1.0 - (i % 100) as f32)))
        .collect();
    let stats = scene.render(&visible, &[]);
    assert_eq!(stats.instances_submitted, MAX_INSTANCES);
}

#[test]
#[should_panic(expected = "exceeds the fixed capacity")]
fn test_instance_count_above_capacity_is_fatal() {
    let mut scene = TestScene::new();
    let visible: Vec<VisibleInstance> =
        (0..MAX_INSTANCES + 1).map(|_| instance_at(Vec3::ZERO)).collect();
    scene.render(&visible, &[]);
}

// ============================================================================
// Shadow associations
// ============================================================================

#[test]
fn test_shadow_views_run_the_full_chain() {
    let mut scene = TestScene::new();
    let stats = scene.render(&[instance_at(Vec3::new(0.0, 0.0, -5.0))], &[spot_light(1, 1)]);

    assert_eq!(stats.shadow_views, 1);
    assert_eq!(stats.views_culled, 3);

    // The spot view dispatches its own sort network and depth-only pass.
    let indirect_dispatches = scene
        .backend
        .all_commands()
        .filter(|c| matches!(c, RecordedCommand::DispatchIndirect { .. }))
        .count();
    assert_eq!(indirect_dispatches, 3 * dispatch_slot_count() as usize);
    assert!(scene.backend.all_commands().any(|c| matches!(
        c,
        RecordedCommand::BeginRenderPass { label: Some(l) } if l.starts_with("shadow_spot")
    )));
}

#[test]
fn test_directional_light_renders_four_cascade_viewports() {
    let mut scene = TestScene::new();
    let light = ShadowCastingLight {
        id: ShadowLightId::new(9, 1),
        projection: ShadowProjection::Directional {
            cascades: [Mat4::IDENTITY; 4],
        },
    };
    let stats = scene.render(&[instance_at(Vec3::new(0.0, 0.0, -5.0))], &[light]);

    assert_eq!(stats.shadow_views, 4);
    let viewports = scene
        .backend
        .all_commands()
        .filter(|c| matches!(c, RecordedCommand::SetViewport { .. }))
        .count();
    assert_eq!(viewports, 4, "one atlas quadrant per cascade");
}

#[test]
fn test_removed_spot_light_tears_down_and_draws_nothing() {
    let mut scene = TestScene::new();
    let instances = [instance_at(Vec3::new(0.0, 0.0, -5.0))];

    scene.render(&instances, &[spot_light(1, 1)]);
    let spot_counter = {
        let entry = scene
            .renderer
            .shadow_maps()
            .entry(ShadowLightId::new(1, 1))
            .unwrap();
        match &entry.target {
            gpu_driven_engine::pipeline::shadow::ShadowTarget::Spot { view, .. } => {
                view.buffers.counter
            }
            _ => unreachable!(),
        }
    };
    assert!(scene.backend.buffer_alive(spot_counter));

    // The light disappears before the next frame.
    scene.backend.clear_submissions();
    let stats = scene.render(&instances, &[]);

    assert_eq!(stats.shadow_views, 0);
    assert!(scene.renderer.shadow_maps().is_empty());
    assert!(
        !scene.backend.buffer_alive(spot_counter),
        "stale association buffers must be freed"
    );
    assert!(
        !scene.backend.all_commands().any(|c| matches!(
            c,
            RecordedCommand::BeginRenderPass { label: Some(l) } if l.starts_with("shadow")
        )),
        "no shadow pass may reference the removed light"
    );
}

#[rstest]
#[case::one_frame(1)]
#[case::three_frames(3)]
fn test_consecutive_frames_reuse_persistent_buffers(#[case] frames: u32) {
    let mut scene = TestScene::new();
    let instances = [instance_at(Vec3::new(0.0, 0.0, -5.0))];

    let mut last = 0;
    for _ in 0..frames {
        let stats = scene.render(&instances, &[]);
        last = stats.frame;
    }
    assert_eq!(last, frames as u64);

    // Survivor sets persist across frames; only transients are recycled.
    assert!(scene
        .backend
        .buffer_alive(scene.renderer.opaque_view().survivors));
    assert!(scene
        .backend
        .buffer_alive(scene.renderer.transparent_view().survivors));
}
