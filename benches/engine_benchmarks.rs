use criterion::{black_box, criterion_group, criterion_main, Criterion};

use glam::{Mat4, Vec3};
use gpu_driven_engine::pipeline::cull::cull_cpu;
use gpu_driven_engine::pipeline::frame::{DefaultViews, FrameArrays, InstanceData, SurvivorRecord};
use gpu_driven_engine::pipeline::sort::{sort_survivors_cpu, SortDirection};
use gpu_driven_engine::scene::{Aabb, CameraView, Frustum, MeshRef, VisibleInstance};
use gpu_driven_engine::RenderGraph;

// ---------------------------------------------------------------------------
// Render graph construction
// ---------------------------------------------------------------------------

fn bench_graph_build_chain(c: &mut Criterion) {
    c.bench_function("render_graph_build_32_passes", |b| {
        b.iter(|| {
            let mut graph = RenderGraph::new();
            for i in 0..32 {
                graph
                    .add_render_pass(&format!("pass_{i}"))
                    .execute_empty();
            }
            black_box(graph.pass_count());
        });
    });
}

// ---------------------------------------------------------------------------
// CPU mirrors of the compute kernels
// ---------------------------------------------------------------------------

fn scattered_instances(count: usize) -> Vec<VisibleInstance> {
    let mesh = MeshRef {
        vertex_buffer_view: 0,
        index_buffer_view: 1,
        index_count: 36,
        first_index: 0,
        base_vertex: 0,
    };
    (0..count)
        .map(|i| {
            VisibleInstance::new(
                Mat4::from_translation(Vec3::new(
                    ((i * 7) % 41) as f32 - 20.0,
                    ((i * 3) % 11) as f32 - 5.0,
                    -1.0 - ((i * 13) % 199) as f32,
                )),
                Aabb::unit(),
                mesh,
                0,
            )
        })
        .collect()
}

fn bench_frame_array_rebuild(c: &mut Criterion) {
    let visible = scattered_instances(8192);
    let defaults = DefaultViews { white: 0, black: 1 };
    c.bench_function("frame_arrays_rebuild_8k", |b| {
        let mut arrays = FrameArrays::default();
        b.iter(|| {
            arrays.rebuild(black_box(&visible), &[], defaults);
            black_box(arrays.instances.len());
        });
    });
}

fn bench_cull_mirror(c: &mut Criterion) {
    let visible = scattered_instances(8192);
    let instances: Vec<InstanceData> = visible.iter().map(InstanceData::from_visible).collect();
    let camera = CameraView::perspective(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 16.0 / 9.0);
    let frustum = Frustum::from_view_proj(camera.view_proj());
    c.bench_function("cull_mirror_8k", |b| {
        b.iter(|| black_box(cull_cpu(black_box(&instances), &frustum, 0, 0)));
    });
}

fn bench_sort_mirror(c: &mut Criterion) {
    let mut state = 1u32;
    let records: Vec<SurvivorRecord> = (0..16384u32)
        .map(|i| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            SurvivorRecord {
                key: state,
                index: i,
            }
        })
        .collect();
    c.bench_function("bitonic_mirror_16k", |b| {
        b.iter(|| {
            let mut data = records.clone();
            sort_survivors_cpu(&mut data, SortDirection::Ascending);
            black_box(data.len());
        });
    });
}

criterion_group!(
    benches,
    bench_graph_build_chain,
    bench_frame_array_rebuild,
    bench_cull_mirror,
    bench_sort_mirror
);
criterion_main!(benches);
