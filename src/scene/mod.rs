//! Scene-facing input types.
//!
//! The scene graph that produces visibility is an external collaborator; the
//! engine consumes its output once per frame as a [`SceneInput`]: an ordered
//! list of visible mesh instances, the material table they index, and the
//! currently active shadow-casting lights with stable identity.

pub mod frustum;

pub use frustum::Frustum;

use glam::{Mat4, Vec3};

use crate::backend::{BufferHandle, IndexFormat};

/// Axis-aligned bounding box in the instance's local space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        debug_assert!(min.cmple(max).all(), "AABB min must not exceed max");
        Self { min, max }
    }

    /// Unit cube centered at the origin.
    pub fn unit() -> Self {
        Self::new(Vec3::splat(-0.5), Vec3::splat(0.5))
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// The eight corner points.
    pub fn corners(&self) -> [Vec3; 8] {
        let (mn, mx) = (self.min, self.max);
        [
            Vec3::new(mn.x, mn.y, mn.z),
            Vec3::new(mx.x, mn.y, mn.z),
            Vec3::new(mn.x, mx.y, mn.z),
            Vec3::new(mx.x, mx.y, mn.z),
            Vec3::new(mn.x, mn.y, mx.z),
            Vec3::new(mx.x, mn.y, mx.z),
            Vec3::new(mn.x, mx.y, mx.z),
            Vec3::new(mx.x, mx.y, mx.z),
        ]
    }

    /// Bounding box of this box transformed by `matrix`.
    ///
    /// Transforms all eight corners and re-wraps them; this is what the cull
    /// kernel does per instance, so the two must stay in sync.
    pub fn transformed(&self, matrix: Mat4) -> Aabb {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for corner in self.corners() {
            let p = matrix.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        Aabb { min, max }
    }
}

/// Where an instance's geometry lives inside the shared mesh arena.
///
/// Indirect multi-draw requires every mesh to come from one bound
/// vertex/index buffer pair; `first_index`/`base_vertex` select the mesh
/// within it. The view indices are shader-visible descriptor indices supplied
/// by the asset collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRef {
    pub vertex_buffer_view: u32,
    pub index_buffer_view: u32,
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
}

/// Material description consumed from the asset collaborator.
///
/// Absent texture views fall back to the renderer's default white view
/// (base color, metallic-roughness) or black view (normal, emissive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaterialDesc {
    /// Shader-visible index of the material's uniform-buffer view.
    pub uniform_view: u32,
    pub base_color_view: Option<u32>,
    pub metallic_roughness_view: Option<u32>,
    pub normal_view: Option<u32>,
    pub emissive_view: Option<u32>,
}

/// One visible mesh instance, rebuilt every frame by the scene collaborator.
#[derive(Debug, Clone, Copy)]
pub struct VisibleInstance {
    /// Model matrix for the current frame.
    pub transform: Mat4,
    /// Model matrix of the previous frame, for motion vectors.
    pub prev_transform: Mat4,
    /// Local-space bounds; the cull kernel transforms these to world space.
    pub aabb: Aabb,
    pub mesh: MeshRef,
    /// Index into the frame's material table.
    pub material_index: u32,
    /// Transparent instances go to the back-to-front view.
    pub transparent: bool,
}

impl VisibleInstance {
    pub fn new(transform: Mat4, aabb: Aabb, mesh: MeshRef, material_index: u32) -> Self {
        Self {
            transform,
            prev_transform: transform,
            aabb,
            mesh,
            material_index,
            transparent: false,
        }
    }

    pub fn with_transparency(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }
}

/// The shared vertex/index buffers all drawable meshes live in.
///
/// Owned by the asset collaborator; the engine binds them for the indirect
/// draw and never destroys them.
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    pub vertex: BufferHandle,
    pub index: BufferHandle,
    pub index_format: IndexFormat,
}

/// Stable identity of a shadow-casting light across frames.
///
/// Compared frame to frame to detect add/remove; when the identity bound to
/// a shadow buffer set changes, the set is torn down and recreated rather
/// than reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowLightId {
    pub object_id: u64,
    pub component_id: u64,
}

impl ShadowLightId {
    pub fn new(object_id: u64, component_id: u64) -> Self {
        Self {
            object_id,
            component_id,
        }
    }
}

/// Per-light shadow projection data.
#[derive(Debug, Clone, Copy)]
pub enum ShadowProjection {
    /// Four cascade view-projections, near to far, rendered into one atlas.
    Directional { cascades: [Mat4; 4] },
    /// Single view-projection into a dedicated depth texture.
    Spot { view_proj: Mat4 },
}

/// A currently active shadow-casting light.
#[derive(Debug, Clone, Copy)]
pub struct ShadowCastingLight {
    pub id: ShadowLightId,
    pub projection: ShadowProjection,
}

/// The main camera for one frame.
#[derive(Debug, Clone, Copy)]
pub struct CameraView {
    pub view: Mat4,
    pub proj: Mat4,
    pub position: Vec3,
}

impl CameraView {
    pub fn view_proj(&self) -> Mat4 {
        self.proj * self.view
    }

    /// A camera looking at `target` with a standard perspective projection.
    pub fn perspective(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(position, target, Vec3::Y),
            proj: Mat4::perspective_rh(std::f32::consts::FRAC_PI_3, aspect, 0.1, 1000.0),
            position,
        }
    }
}

/// Everything the engine consumes for one frame.
#[derive(Debug, Clone, Copy)]
pub struct SceneInput<'a> {
    pub camera: CameraView,
    pub instances: &'a [VisibleInstance],
    pub materials: &'a [MaterialDesc],
    pub shadow_lights: &'a [ShadowCastingLight],
    pub mesh_buffers: MeshBuffers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_transformed_translation() {
        let aabb = Aabb::unit();
        let moved = aabb.transformed(Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        assert_eq!(moved.center(), Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(moved.min, Vec3::new(9.5, -0.5, -0.5));
    }

    #[test]
    fn test_aabb_transformed_rotation_grows_bounds() {
        let aabb = Aabb::unit();
        let rotated = aabb.transformed(Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4));
        // A rotated unit cube's AABB expands to sqrt(2) along x and z.
        let expected = std::f32::consts::SQRT_2 * 0.5;
        assert!((rotated.max.x - expected).abs() < 1e-5);
        assert!((rotated.max.z - expected).abs() < 1e-5);
        assert!((rotated.max.y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_shadow_light_id_equality() {
        let a = ShadowLightId::new(3, 7);
        let b = ShadowLightId::new(3, 7);
        let c = ShadowLightId::new(3, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
