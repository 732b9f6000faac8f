//! GPU bitonic sort over a view's survivor buffer.
//!
//! The sort is a classic bitonic network split into three kernel families so
//! no single kernel exceeds on-chip memory limits:
//!
//! 1. `write_sort_args` converts the live survivor counter into workgroup
//!    counts for every subsequent dispatch, entirely on the GPU, so the host
//!    never reads the count back. Stages the live count does not need get
//!    zero workgroups.
//! 2. `presort` runs every compare-exchange stage for spans up to
//!    [`PRESORT_SPAN`] inside workgroup shared memory, padding lanes beyond
//!    the live count with a direction-appropriate sentinel.
//! 3. `outer_sort` / `inner_sort` handle stages for spans above the
//!    threshold: outer does one global compare-exchange per thread with
//!    span/stride pushed as root constants, inner finishes the sub-span
//!    strides of each merge stage back in shared memory.
//!
//! The host records the dispatch sequence for the worst case (full capacity)
//! once per sort; every dispatch is indirect, so a small live count
//! degenerates to near-zero thread groups without any host decision.

use bytemuck::bytes_of;

use crate::backend::{
    BackendResult, BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType,
    ComputePipelineDescriptor, ComputePipelineHandle, DispatchIndirectArgs, GraphicsBackend,
    QueueKind, ResourceState, ShaderStageFlags,
};
use crate::pipeline::draw::EMIT_WORKGROUP_SIZE;
use crate::pipeline::frame::{SurvivorRecord, ViewBuffers, ViewHandles};
use crate::pipeline::MAX_INSTANCES;
use crate::render_graph::RenderGraph;

/// Largest span sorted entirely in workgroup shared memory.
pub const PRESORT_SPAN: u32 = 2048;

/// Threads per sort workgroup.
pub const SORT_WORKGROUP_SIZE: u32 = 256;

/// Sort order of one invocation.
///
/// Ascending keys put near instances first (opaque, early depth rejection);
/// descending puts far instances first (transparent, correct blending).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// The key value that sorts after every real key in this direction.
    pub fn sentinel_key(self) -> u32 {
        match self {
            SortDirection::Ascending => u32::MAX,
            SortDirection::Descending => 0,
        }
    }

    fn push_flag(self) -> u32 {
        match self {
            SortDirection::Ascending => 0,
            SortDirection::Descending => 1,
        }
    }
}

/// Encode a signed depth so unsigned integer comparison preserves float
/// order. Mirrors the WGSL `encode_depth` in the cull kernel.
pub fn encode_depth_key(depth: f32) -> u32 {
    let bits = depth.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

/// One slot in the indirect dispatch sequence.
///
/// The host enumerates the same sequence the `write_sort_args` kernel fills,
/// in the same order; slot index times [`DispatchIndirectArgs::SIZE`] is the
/// offset of each indirect dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStep {
    /// Shared-memory sort of every [`PRESORT_SPAN`] tile.
    Presort,
    /// Global compare-exchange for one `(span, stride)` stage.
    Outer { span: u32, stride: u32 },
    /// Shared-memory finish of strides below [`PRESORT_SPAN`] for one span.
    Inner { span: u32 },
    /// Expansion of sorted survivors into packed draw arguments.
    EmitArgs,
}

/// The full dispatch sequence for a capacity-sized network.
pub fn dispatch_steps() -> Vec<SortStep> {
    let mut steps = vec![SortStep::Presort];
    let mut span = PRESORT_SPAN * 2;
    while span <= MAX_INSTANCES {
        let mut stride = span / 2;
        while stride >= PRESORT_SPAN {
            steps.push(SortStep::Outer { span, stride });
            stride /= 2;
        }
        steps.push(SortStep::Inner { span });
        span *= 2;
    }
    steps.push(SortStep::EmitArgs);
    steps
}

/// Number of indirect dispatch slots the args kernel writes.
pub fn dispatch_slot_count() -> u32 {
    dispatch_steps().len() as u32
}

/// Slot index of the emit-args dispatch (always the last slot).
pub fn emit_args_slot() -> u32 {
    dispatch_slot_count() - 1
}

/// Root constants shared by the presort, outer, and inner kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SortConstants {
    span: u32,
    stride: u32,
    descending: u32,
}

/// The four sort-related compute pipelines and their layouts.
pub struct SortPipelines {
    args: ComputePipelineHandle,
    presort: ComputePipelineHandle,
    outer: ComputePipelineHandle,
    inner: ComputePipelineHandle,
    pub args_layout: BindGroupLayoutHandle,
    pub data_layout: BindGroupLayoutHandle,
}

impl SortPipelines {
    pub fn new(backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let args_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: true },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: false },
            },
        ])?;
        let data_layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: false },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::COMPUTE,
                ty: BindingType::StorageBuffer { read_only: true },
            },
        ])?;

        let args_source = args_shader_source();
        let sort_source = sort_shader_source();

        let args = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("bitonic_write_args".into()),
            shader: args_source,
            entry_point: "write_sort_args".into(),
            bind_group_layouts: vec![args_layout],
            push_constant_size: 0,
        })?;
        let push_size = std::mem::size_of::<SortConstants>() as u32;
        let presort = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("bitonic_presort".into()),
            shader: sort_source.clone(),
            entry_point: "presort".into(),
            bind_group_layouts: vec![data_layout],
            push_constant_size: push_size,
        })?;
        let outer = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("bitonic_outer".into()),
            shader: sort_source.clone(),
            entry_point: "outer_sort".into(),
            bind_group_layouts: vec![data_layout],
            push_constant_size: push_size,
        })?;
        let inner = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("bitonic_inner".into()),
            shader: sort_source,
            entry_point: "inner_sort".into(),
            bind_group_layouts: vec![data_layout],
            push_constant_size: push_size,
        })?;

        Ok(Self {
            args,
            presort,
            outer,
            inner,
            args_layout,
            data_layout,
        })
    }

    /// Add the args-generation and network passes for one view.
    pub fn add_passes(&self, graph: &mut RenderGraph, view: &ViewBuffers, handles: ViewHandles) {
        let args_pipeline = self.args;
        let args_bind_group = view.sort_args_bind_group;
        let args_label = format!("sort_args:{}", view.label);
        graph
            .add_render_pass(&args_label)
            .queue(QueueKind::Compute)
            .read(handles.counter, ResourceState::ShaderResource)
            .write(handles.sort_dispatch, ResourceState::UnorderedAccess)
            .execute(move |ctx| {
                ctx.backend.begin_compute_pass(Some(&args_label));
                ctx.backend.set_compute_pipeline(args_pipeline);
                ctx.backend.set_bind_group(0, args_bind_group);
                ctx.backend.dispatch_compute(1, 1, 1);
                ctx.backend.end_compute_pass();
                Ok(())
            });

        let presort = self.presort;
        let outer = self.outer;
        let inner = self.inner;
        let bind_group = view.sort_data_bind_group;
        let descending = view.direction.push_flag();
        let sort_label = format!("sort:{}", view.label);
        graph
            .add_render_pass(&sort_label)
            .queue(QueueKind::Compute)
            .read(handles.sort_dispatch, ResourceState::IndirectArgument)
            .read(handles.counter, ResourceState::ShaderResource)
            .write(handles.survivors, ResourceState::UnorderedAccess)
            .execute(move |ctx| {
                let dispatch = ctx.buffer(handles.sort_dispatch);
                ctx.backend.begin_compute_pass(Some(&sort_label));
                ctx.backend.set_bind_group(0, bind_group);
                for (slot, step) in dispatch_steps().into_iter().enumerate() {
                    let offset = slot as u64 * DispatchIndirectArgs::SIZE;
                    let constants = match step {
                        SortStep::Presort => {
                            ctx.backend.set_compute_pipeline(presort);
                            SortConstants {
                                span: PRESORT_SPAN,
                                stride: 0,
                                descending,
                            }
                        }
                        SortStep::Outer { span, stride } => {
                            ctx.backend.set_compute_pipeline(outer);
                            SortConstants {
                                span,
                                stride,
                                descending,
                            }
                        }
                        SortStep::Inner { span } => {
                            ctx.backend.set_compute_pipeline(inner);
                            SortConstants {
                                span,
                                stride: 0,
                                descending,
                            }
                        }
                        // Consumed by the draw module's emit pass.
                        SortStep::EmitArgs => continue,
                    };
                    ctx.backend.set_push_constants(bytes_of(&constants));
                    ctx.backend.dispatch_compute_indirect(dispatch, offset);
                }
                ctx.backend.end_compute_pass();
                Ok(())
            });
    }
}

/// CPU mirror of the bitonic network, used by tests and benches.
///
/// Runs the same compare-exchange schedule the kernels execute (padding to a
/// power of two with the direction's sentinel, then every `(span, stride)`
/// stage), so a disagreement with a library sort indicates a network bug
/// that would equally affect the GPU path.
pub fn sort_survivors_cpu(records: &mut Vec<SurvivorRecord>, direction: SortDirection) {
    let count = records.len();
    if count <= 1 {
        return;
    }
    let padded = count.next_power_of_two();
    let sentinel = SurvivorRecord {
        key: direction.sentinel_key(),
        index: u32::MAX,
    };
    records.resize(padded, sentinel);

    let ascending_overall = direction == SortDirection::Ascending;
    let mut span = 2;
    while span <= padded {
        let mut stride = span / 2;
        while stride >= 1 {
            for t in 0..padded / 2 {
                let i = (t / stride) * (stride * 2) + (t % stride);
                let partner = i + stride;
                let ascending = ((i & span) == 0) == ascending_overall;
                let (a, b) = (records[i].key, records[partner].key);
                let swap = if ascending { a > b } else { a < b };
                if swap {
                    records.swap(i, partner);
                }
            }
            stride /= 2;
        }
        span *= 2;
    }
    records.truncate(count);
}

fn shader_constants() -> String {
    format!(
        "const SORT_CAPACITY: u32 = {MAX_INSTANCES}u;\n\
         const PRESORT_SPAN: u32 = {PRESORT_SPAN}u;\n\
         const SORT_WORKGROUP: u32 = {SORT_WORKGROUP_SIZE}u;\n\
         const EMIT_WORKGROUP: u32 = {EMIT_WORKGROUP_SIZE}u;\n"
    )
}

fn args_shader_source() -> String {
    format!("{}{}", shader_constants(), ARGS_SHADER_BODY)
}

fn sort_shader_source() -> String {
    format!("{}{}", shader_constants(), SORT_SHADER_BODY)
}

/// Kernel converting the live counter into per-slot workgroup counts.
///
/// The slot order must match [`dispatch_steps`] exactly.
const ARGS_SHADER_BODY: &str = r#"
struct DispatchArgs {
    x: u32,
    y: u32,
    z: u32,
}

@group(0) @binding(0) var<storage, read> counter: u32;
@group(0) @binding(1) var<storage, read_write> dispatch_args: array<DispatchArgs>;

fn next_pow2(value: u32) -> u32 {
    var v = value - 1u;
    v = v | (v >> 1u);
    v = v | (v >> 2u);
    v = v | (v >> 4u);
    v = v | (v >> 8u);
    v = v | (v >> 16u);
    return v + 1u;
}

@compute @workgroup_size(1)
fn write_sort_args() {
    let count = min(counter, SORT_CAPACITY);
    var padded = 0u;
    if count > 0u {
        padded = max(next_pow2(count), PRESORT_SPAN);
    }

    var slot = 0u;
    dispatch_args[slot] = DispatchArgs(padded / PRESORT_SPAN, 1u, 1u);
    slot = slot + 1u;

    var span = PRESORT_SPAN * 2u;
    while span <= SORT_CAPACITY {
        var stride = span / 2u;
        while stride >= PRESORT_SPAN {
            var groups = 0u;
            if span <= padded {
                groups = padded / (2u * SORT_WORKGROUP);
            }
            dispatch_args[slot] = DispatchArgs(groups, 1u, 1u);
            slot = slot + 1u;
            stride = stride / 2u;
        }
        var inner_groups = 0u;
        if span <= padded {
            inner_groups = padded / PRESORT_SPAN;
        }
        dispatch_args[slot] = DispatchArgs(inner_groups, 1u, 1u);
        slot = slot + 1u;
        span = span * 2u;
    }

    dispatch_args[slot] = DispatchArgs((count + EMIT_WORKGROUP - 1u) / EMIT_WORKGROUP, 1u, 1u);
}
"#;

/// The presort / outer / inner compare-exchange kernels.
///
/// Compare direction at stage `span` is taken from the element's global
/// index (`(i & span) == 0`), so shared-memory tiles slot into the larger
/// network without per-tile bookkeeping.
const SORT_SHADER_BODY: &str = r#"
struct Survivor {
    key: u32,
    index: u32,
}

struct SortConstants {
    span: u32,
    stride: u32,
    descending: u32,
}

var<push_constant> pc: SortConstants;

@group(0) @binding(0) var<storage, read_write> survivors: array<Survivor>;
@group(0) @binding(1) var<storage, read> counter: u32;

var<workgroup> tile: array<Survivor, PRESORT_SPAN>;

fn sentinel_key() -> u32 {
    if pc.descending != 0u {
        return 0u;
    }
    return 0xffffffffu;
}

fn live_count() -> u32 {
    return min(counter, SORT_CAPACITY);
}

fn next_pow2(value: u32) -> u32 {
    var v = value - 1u;
    v = v | (v >> 1u);
    v = v | (v >> 2u);
    v = v | (v >> 4u);
    v = v | (v >> 8u);
    v = v | (v >> 16u);
    return v + 1u;
}

fn padded_count() -> u32 {
    let count = live_count();
    if count == 0u {
        return 0u;
    }
    return max(next_pow2(count), PRESORT_SPAN);
}

fn out_of_order(a: u32, b: u32, ascending: bool) -> bool {
    if ascending {
        return a > b;
    }
    return a < b;
}

fn block_ascending(global_index: u32, span: u32) -> bool {
    return ((global_index & span) == 0u) == (pc.descending == 0u);
}

// All stages with span <= PRESORT_SPAN, one tile per workgroup in shared
// memory. Lanes beyond the live count load sentinels, which also pads the
// buffer up to the power-of-two length the later stages rely on.
@compute @workgroup_size(256)
fn presort(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let base = wg.x * PRESORT_SPAN;
    let count = live_count();

    for (var e = lid.x; e < PRESORT_SPAN; e = e + SORT_WORKGROUP) {
        var record = Survivor(sentinel_key(), 0xffffffffu);
        if base + e < count {
            record = survivors[base + e];
        }
        tile[e] = record;
    }
    workgroupBarrier();

    var span = 2u;
    while span <= PRESORT_SPAN {
        var stride = span / 2u;
        while stride >= 1u {
            for (var t = lid.x; t < PRESORT_SPAN / 2u; t = t + SORT_WORKGROUP) {
                let e = (t / stride) * (stride * 2u) + (t % stride);
                let partner = e + stride;
                let ascending = block_ascending(base + e, span);
                let a = tile[e];
                let b = tile[partner];
                if out_of_order(a.key, b.key, ascending) {
                    tile[e] = b;
                    tile[partner] = a;
                }
            }
            workgroupBarrier();
            stride = stride / 2u;
        }
        span = span * 2u;
    }

    for (var e = lid.x; e < PRESORT_SPAN; e = e + SORT_WORKGROUP) {
        survivors[base + e] = tile[e];
    }
}

// One global compare-exchange per thread for stages with
// stride >= PRESORT_SPAN. Span and stride arrive as root constants.
@compute @workgroup_size(256)
fn outer_sort(@builtin(global_invocation_id) gid: vec3<u32>) {
    let t = gid.x;
    let stride = pc.stride;
    let i = (t / stride) * (stride * 2u) + (t % stride);
    let partner = i + stride;
    if partner >= padded_count() {
        return;
    }
    let ascending = block_ascending(i, pc.span);
    let a = survivors[i];
    let b = survivors[partner];
    if out_of_order(a.key, b.key, ascending) {
        survivors[i] = b;
        survivors[partner] = a;
    }
}

// Finishes one merge stage: all strides below PRESORT_SPAN, back in shared
// memory. The presort already sentinel-padded the region, so no count guard
// is needed on load.
@compute @workgroup_size(256)
fn inner_sort(
    @builtin(workgroup_id) wg: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let base = wg.x * PRESORT_SPAN;

    for (var e = lid.x; e < PRESORT_SPAN; e = e + SORT_WORKGROUP) {
        tile[e] = survivors[base + e];
    }
    workgroupBarrier();

    var stride = PRESORT_SPAN / 2u;
    while stride >= 1u {
        for (var t = lid.x; t < PRESORT_SPAN / 2u; t = t + SORT_WORKGROUP) {
            let e = (t / stride) * (stride * 2u) + (t % stride);
            let partner = e + stride;
            let ascending = block_ascending(base + e, pc.span);
            let a = tile[e];
            let b = tile[partner];
            if out_of_order(a.key, b.key, ascending) {
                tile[e] = b;
                tile[partner] = a;
            }
        }
        workgroupBarrier();
        stride = stride / 2u;
    }

    for (var e = lid.x; e < PRESORT_SPAN; e = e + SORT_WORKGROUP) {
        survivors[base + e] = tile[e];
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: u32, index: u32) -> SurvivorRecord {
        SurvivorRecord { key, index }
    }

    /// Deterministic pseudo-random keys.
    fn lcg_keys(count: usize, mut state: u32) -> Vec<SurvivorRecord> {
        (0..count)
            .map(|i| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                record(state, i as u32)
            })
            .collect()
    }

    #[test]
    fn test_encode_depth_key_preserves_order() {
        let depths = [-100.0f32, -1.5, -0.0, 0.0, 0.25, 1.0, 42.0, 1e30];
        let keys: Vec<u32> = depths.iter().map(|&d| encode_depth_key(d)).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] <= pair[1], "encoded keys must be monotonic");
        }
        assert!(encode_depth_key(-1.0) < encode_depth_key(1.0));
    }

    #[test]
    fn test_cpu_network_matches_library_sort_ascending() {
        let mut records = lcg_keys(1000, 7);
        let mut expected: Vec<u32> = records.iter().map(|r| r.key).collect();
        expected.sort_unstable();

        sort_survivors_cpu(&mut records, SortDirection::Ascending);
        let keys: Vec<u32> = records.iter().map(|r| r.key).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_cpu_network_matches_library_sort_descending() {
        let mut records = lcg_keys(777, 99);
        let mut expected: Vec<u32> = records.iter().map(|r| r.key).collect();
        expected.sort_unstable_by(|a, b| b.cmp(a));

        sort_survivors_cpu(&mut records, SortDirection::Descending);
        let keys: Vec<u32> = records.iter().map(|r| r.key).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_cpu_network_truncates_sentinel_padding() {
        // 100 is far from a power of two; sentinels must not leak back in.
        let mut records = lcg_keys(100, 3);
        sort_survivors_cpu(&mut records, SortDirection::Ascending);
        assert_eq!(records.len(), 100);
        assert!(records.iter().all(|r| r.index != u32::MAX));
    }

    #[test]
    fn test_cpu_network_is_deterministic() {
        let mut a = lcg_keys(512, 11);
        let mut b = a.clone();
        sort_survivors_cpu(&mut a, SortDirection::Ascending);
        sort_survivors_cpu(&mut b, SortDirection::Ascending);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cpu_network_handles_degenerate_counts() {
        let mut empty: Vec<SurvivorRecord> = Vec::new();
        sort_survivors_cpu(&mut empty, SortDirection::Ascending);
        assert!(empty.is_empty());

        let mut single = vec![record(9, 0)];
        sort_survivors_cpu(&mut single, SortDirection::Descending);
        assert_eq!(single, vec![record(9, 0)]);
    }

    #[test]
    fn test_dispatch_steps_shape() {
        let steps = dispatch_steps();
        assert_eq!(steps[0], SortStep::Presort);
        assert_eq!(*steps.last().unwrap(), SortStep::EmitArgs);

        // Every span doubles from 2*PRESORT_SPAN to capacity, strides halve
        // down to the presort threshold, and each span ends with an inner.
        let mut expected = vec![SortStep::Presort];
        let mut span = PRESORT_SPAN * 2;
        while span <= MAX_INSTANCES {
            let mut stride = span / 2;
            while stride >= PRESORT_SPAN {
                expected.push(SortStep::Outer { span, stride });
                stride /= 2;
            }
            expected.push(SortStep::Inner { span });
            span *= 2;
        }
        expected.push(SortStep::EmitArgs);
        assert_eq!(steps, expected);
        assert_eq!(dispatch_slot_count() as usize, steps.len());
        assert_eq!(emit_args_slot() as usize, steps.len() - 1);
    }

    #[test]
    fn test_sentinel_keys_sort_last() {
        assert_eq!(SortDirection::Ascending.sentinel_key(), u32::MAX);
        assert_eq!(SortDirection::Descending.sentinel_key(), 0);
    }
}
