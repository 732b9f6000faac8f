//! The renderer context.
//!
//! Owns every long-lived pipeline object and buffer set, constructed once at
//! startup and passed by reference into the per-frame pass recording; nothing
//! here lives in process-wide statics. Each frame builds a fresh render
//! graph in dependency order (upload, then the per-view compute chains,
//! then the raster passes) and executes it once.

use bytemuck::bytes_of;

use crate::backend::{
    BackendResult, BindGroupHandle, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend,
    TextureDescriptor, TextureFormat, TextureHandle, TextureUsage,
};
use crate::pipeline::cull::{CullPipeline, CullUniforms};
use crate::pipeline::draw::{
    CameraUniforms, DrawPipelines, DrawTargets, ForwardPassKind,
};
use crate::pipeline::frame::{
    self, DefaultViews, FrameArrays, FrameBuffers, StagingRing, ViewBuffers, ViewLayouts,
    INSTANCE_FLAG_TRANSPARENT,
};
use crate::pipeline::shadow::{
    ShadowDrawInputs, ShadowMaps, ShadowPipelines, ShadowTarget,
};
use crate::pipeline::sort::{SortDirection, SortPipelines};
use crate::pipeline::{CASCADE_COUNT, MAX_INSTANCES, MAX_MATERIALS};
use crate::render_graph::{GraphStats, RenderGraph, ResourceHandle, ResourceRegistry};
use crate::scene::{Frustum, SceneInput, ShadowProjection};

/// Counters for one rendered frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frame number, starting at 1.
    pub frame: u64,
    /// Instances submitted to the cull kernels.
    pub instances_submitted: u32,
    /// Views that ran the cull/sort/emit chain this frame.
    pub views_culled: u32,
    /// Active shadow sub-views among them.
    pub shadow_views: u32,
    /// Graph execution counters.
    pub graph: GraphStats,
}

/// Size of the forward render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

struct DefaultTextures {
    white: TextureHandle,
    black: TextureHandle,
    views: DefaultViews,
}

enum ShadowPlan {
    Directional {
        label: String,
        atlas: ResourceHandle,
        inputs: [ShadowDrawInputs; CASCADE_COUNT],
    },
    Spot {
        label: String,
        depth: ResourceHandle,
        inputs: ShadowDrawInputs,
    },
}

/// The engine's top-level object.
///
/// # Lifecycle
///
/// ```ignore
/// let mut renderer = Renderer::new(&mut backend, TargetSize { width, height })?;
/// loop {
///     let stats = renderer.render_frame(&mut backend, &scene_input)?;
/// }
/// renderer.destroy(&mut backend);
/// ```
pub struct Renderer {
    registry: ResourceRegistry,
    cull: CullPipeline,
    sort: SortPipelines,
    draw: DrawPipelines,
    shadow: ShadowPipelines,
    view_layouts: ViewLayouts,
    staging: StagingRing,
    arrays: FrameArrays,
    frame_buffers: FrameBuffers,
    camera_uniforms: BufferHandle,
    scene_bind_group: BindGroupHandle,
    opaque_view: ViewBuffers,
    transparent_view: ViewBuffers,
    shadows: ShadowMaps,
    defaults: DefaultTextures,
    target_size: TargetSize,
    frame_count: u64,
}

impl Renderer {
    /// Color format of the forward target.
    pub const COLOR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
    /// Depth format shared by the forward and shadow passes.
    pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

    /// Staging capacity: one frame's instance and material arrays plus
    /// alignment slack.
    const STAGING_CAPACITY: u64 = MAX_INSTANCES as u64 * frame::InstanceData::SIZE
        + MAX_MATERIALS as u64 * frame::MaterialData::SIZE
        + 4096;

    pub fn new(backend: &mut dyn GraphicsBackend, target_size: TargetSize) -> BackendResult<Self> {
        log::info!(
            "renderer: initializing on backend '{}' ({}x{})",
            backend.name(),
            target_size.width,
            target_size.height
        );

        let cull = CullPipeline::new(backend)?;
        let sort = SortPipelines::new(backend)?;
        let draw = DrawPipelines::new(backend, Self::COLOR_FORMAT, Self::DEPTH_FORMAT)?;
        let shadow = ShadowPipelines::new(backend, Self::DEPTH_FORMAT)?;
        let view_layouts = ViewLayouts {
            cull: cull.layout,
            sort_args: sort.args_layout,
            sort_data: sort.data_layout,
            emit: draw.emit_layout,
        };

        let staging = StagingRing::new(backend, Self::STAGING_CAPACITY)?;
        let frame_buffers = FrameBuffers::new(backend)?;
        let defaults = Self::create_default_textures(backend)?;

        let camera_uniforms = backend.create_buffer(
            &BufferDescriptor::new(
                std::mem::size_of::<CameraUniforms>() as u64,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            )
            .with_label("camera_uniforms"),
        )?;
        let scene_bind_group = draw.create_scene_bind_group(backend, camera_uniforms, &frame_buffers)?;

        let opaque_view = ViewBuffers::new(
            backend,
            "camera_opaque",
            SortDirection::Ascending,
            view_layouts,
            &frame_buffers,
        )?;
        let transparent_view = ViewBuffers::new(
            backend,
            "camera_transparent",
            SortDirection::Descending,
            view_layouts,
            &frame_buffers,
        )?;

        Ok(Self {
            registry: ResourceRegistry::new(),
            cull,
            sort,
            draw,
            shadow,
            view_layouts,
            staging,
            arrays: FrameArrays::default(),
            frame_buffers,
            camera_uniforms,
            scene_bind_group,
            opaque_view,
            transparent_view,
            shadows: ShadowMaps::new(Self::DEPTH_FORMAT),
            defaults,
            target_size,
            frame_count: 0,
        })
    }

    fn create_default_textures(
        backend: &mut dyn GraphicsBackend,
    ) -> BackendResult<DefaultTextures> {
        let desc = |label: &str| {
            TextureDescriptor::new_2d(
                1,
                1,
                TextureFormat::Rgba8Unorm,
                TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            )
            .with_label(label)
        };
        let white = backend.create_texture(&desc("default_white"))?;
        let black = backend.create_texture(&desc("default_black"))?;
        let white_view = backend.create_texture_view(white)?;
        let black_view = backend.create_texture_view(black)?;
        let views = DefaultViews {
            white: backend.texture_view_index(white_view),
            black: backend.texture_view_index(black_view),
        };
        Ok(DefaultTextures {
            white,
            black,
            views,
        })
    }

    /// Frames rendered so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The per-frame structured buffers, for downstream passes.
    pub fn frame_buffers(&self) -> &FrameBuffers {
        &self.frame_buffers
    }

    /// The camera's front-to-back view set.
    pub fn opaque_view(&self) -> &ViewBuffers {
        &self.opaque_view
    }

    /// The camera's back-to-front view set.
    pub fn transparent_view(&self) -> &ViewBuffers {
        &self.transparent_view
    }

    /// Current shadow associations.
    pub fn shadow_maps(&self) -> &ShadowMaps {
        &self.shadows
    }

    /// Build and execute one frame's render graph.
    ///
    /// # Panics
    ///
    /// Panics when the scene exceeds a fixed capacity (instances, materials,
    /// spot lights); see the pipeline module constants.
    pub fn render_frame(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        scene: &SceneInput<'_>,
    ) -> BackendResult<FrameStats> {
        self.frame_count += 1;
        log::trace!(
            "renderer: frame {} with {} instances, {} lights",
            self.frame_count,
            scene.instances.len(),
            scene.shadow_lights.len()
        );

        self.arrays
            .rebuild(scene.instances, scene.materials, self.defaults.views);
        let instance_count = self.arrays.instances.len() as u32;

        self.shadows.sync(
            backend,
            scene.shadow_lights,
            self.view_layouts,
            self.shadow.view_layout,
            &self.frame_buffers,
        )?;

        self.write_camera_uniforms(backend, scene, instance_count);

        self.registry.begin_frame();
        self.staging.reset();
        let mut graph = RenderGraph::new();

        let frame_handles = frame::add_upload_pass(
            &mut graph,
            &mut self.registry,
            backend,
            &mut self.staging,
            &self.arrays,
            &self.frame_buffers,
        );

        // Per-view compute chains. The first chain's counter reset carries
        // the explicit wait on the copy queue's upload.
        let opaque_handles = self.opaque_view.import(&mut self.registry);
        self.cull.add_passes(
            &mut graph,
            frame_handles,
            &self.opaque_view,
            opaque_handles,
            instance_count,
            true,
        );
        self.sort
            .add_passes(&mut graph, &self.opaque_view, opaque_handles);
        self.draw
            .add_emit_pass(&mut graph, &self.opaque_view, opaque_handles, frame_handles);

        let transparent_handles = self.transparent_view.import(&mut self.registry);
        self.cull.add_passes(
            &mut graph,
            frame_handles,
            &self.transparent_view,
            transparent_handles,
            instance_count,
            false,
        );
        self.sort
            .add_passes(&mut graph, &self.transparent_view, transparent_handles);
        self.draw.add_emit_pass(
            &mut graph,
            &self.transparent_view,
            transparent_handles,
            frame_handles,
        );

        let mut shadow_views = 0u32;
        let mut shadow_plans = Vec::new();
        for light in scene.shadow_lights {
            let entry = self
                .shadows
                .entry(light.id)
                .expect("shadow association synced above");
            match (&entry.target, light.projection) {
                (
                    ShadowTarget::Directional { views, atlas },
                    ShadowProjection::Directional { cascades },
                ) => {
                    let mut inputs = Vec::with_capacity(CASCADE_COUNT);
                    for (view, view_proj) in views.iter().zip(cascades) {
                        view.write_uniforms(backend, view_proj, instance_count);
                        let handles = view.buffers.import(&mut self.registry);
                        self.cull.add_passes(
                            &mut graph,
                            frame_handles,
                            &view.buffers,
                            handles,
                            instance_count,
                            false,
                        );
                        self.sort.add_passes(&mut graph, &view.buffers, handles);
                        self.draw
                            .add_emit_pass(&mut graph, &view.buffers, handles, frame_handles);
                        inputs.push(ShadowDrawInputs {
                            draw_args: handles.draw_args,
                            counter: handles.counter,
                            bind_group: view.draw_bind_group,
                        });
                        shadow_views += 1;
                    }
                    let label = format!("dir_{}_{}", light.id.object_id, light.id.component_id);
                    let atlas_handle = ShadowMaps::import_texture(
                        &mut self.registry,
                        &format!("shadow_atlas_{label}"),
                        *atlas,
                    );
                    let inputs: [ShadowDrawInputs; CASCADE_COUNT] =
                        inputs.try_into().expect("exactly four cascades");
                    shadow_plans.push(ShadowPlan::Directional {
                        label,
                        atlas: atlas_handle,
                        inputs,
                    });
                }
                (ShadowTarget::Spot { view, depth }, ShadowProjection::Spot { view_proj }) => {
                    view.write_uniforms(backend, view_proj, instance_count);
                    let handles = view.buffers.import(&mut self.registry);
                    self.cull.add_passes(
                        &mut graph,
                        frame_handles,
                        &view.buffers,
                        handles,
                        instance_count,
                        false,
                    );
                    self.sort.add_passes(&mut graph, &view.buffers, handles);
                    self.draw
                        .add_emit_pass(&mut graph, &view.buffers, handles, frame_handles);
                    shadow_views += 1;
                    let label = format!("spot_{}_{}", light.id.object_id, light.id.component_id);
                    let depth_handle = ShadowMaps::import_texture(
                        &mut self.registry,
                        &format!("shadow_depth_{label}"),
                        *depth,
                    );
                    shadow_plans.push(ShadowPlan::Spot {
                        label,
                        depth: depth_handle,
                        inputs: ShadowDrawInputs {
                            draw_args: handles.draw_args,
                            counter: handles.counter,
                            bind_group: view.draw_bind_group,
                        },
                    });
                }
                // sync() recreates an entry whose kind changed, so the only
                // way here is a bug in the association table.
                _ => unreachable!("shadow association kind mismatch"),
            }
        }

        // Raster passes: camera forward split, then the shadow casters.
        let targets = DrawTargets {
            color: self.registry.create_texture(
                "forward_color",
                TextureDescriptor::new_2d(
                    self.target_size.width,
                    self.target_size.height,
                    Self::COLOR_FORMAT,
                    TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                )
                .with_label("forward_color"),
            ),
            depth: self.registry.create_texture(
                "forward_depth",
                TextureDescriptor::new_2d(
                    self.target_size.width,
                    self.target_size.height,
                    Self::DEPTH_FORMAT,
                    TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                )
                .with_label("forward_depth"),
            ),
        };

        self.draw.add_forward_pass(
            &mut graph,
            ForwardPassKind::Opaque,
            &self.opaque_view,
            opaque_handles,
            frame_handles,
            self.scene_bind_group,
            scene.mesh_buffers,
            targets,
            true,
        );
        self.draw.add_forward_pass(
            &mut graph,
            ForwardPassKind::Transparent,
            &self.transparent_view,
            transparent_handles,
            frame_handles,
            self.scene_bind_group,
            scene.mesh_buffers,
            targets,
            false,
        );

        for plan in shadow_plans {
            match plan {
                ShadowPlan::Directional {
                    label,
                    atlas,
                    inputs,
                } => self.shadow.add_atlas_pass(
                    &mut graph,
                    &label,
                    atlas,
                    inputs,
                    frame_handles,
                    scene.mesh_buffers,
                ),
                ShadowPlan::Spot {
                    label,
                    depth,
                    inputs,
                } => self.shadow.add_spot_pass(
                    &mut graph,
                    &label,
                    depth,
                    inputs,
                    frame_handles,
                    scene.mesh_buffers,
                ),
            }
        }

        let graph_stats = graph.execute(backend, &mut self.registry)?;

        let stats = FrameStats {
            frame: self.frame_count,
            instances_submitted: instance_count,
            views_culled: 2 + shadow_views,
            shadow_views,
            graph: graph_stats,
        };
        log::trace!(
            "renderer: frame {} done ({} views, {} passes, {} barriers)",
            stats.frame,
            stats.views_culled,
            stats.graph.passes_executed,
            stats.graph.barriers_inserted
        );
        Ok(stats)
    }

    fn write_camera_uniforms(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        scene: &SceneInput<'_>,
        instance_count: u32,
    ) {
        backend.write_buffer(
            self.camera_uniforms,
            0,
            bytes_of(&CameraUniforms::from_view(&scene.camera)),
        );

        let frustum = Frustum::from_view_proj(scene.camera.view_proj());
        let opaque = CullUniforms::new(&frustum, instance_count, INSTANCE_FLAG_TRANSPARENT, 0);
        backend.write_buffer(self.opaque_view.uniforms, 0, bytes_of(&opaque));
        let transparent = CullUniforms::new(
            &frustum,
            instance_count,
            INSTANCE_FLAG_TRANSPARENT,
            INSTANCE_FLAG_TRANSPARENT,
        );
        backend.write_buffer(self.transparent_view.uniforms, 0, bytes_of(&transparent));
    }

    /// Release every GPU resource the renderer owns.
    pub fn destroy(mut self, backend: &mut dyn GraphicsBackend) {
        backend.wait_idle();
        self.shadows.clear(backend);
        self.opaque_view.destroy(backend);
        self.transparent_view.destroy(backend);
        self.staging.destroy(backend);
        self.frame_buffers.destroy(backend);
        backend.destroy_buffer(self.camera_uniforms);
        backend.destroy_texture(self.defaults.white);
        backend.destroy_texture(self.defaults.black);
    }
}
