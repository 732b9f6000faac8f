//! View frustum extraction and intersection tests.
//!
//! These functions are the CPU mirror of the frustum test inside the cull
//! kernel; both operate on the same plane order and the same positive-vertex
//! test, so changing one requires changing the other.

use glam::{Mat4, Vec3, Vec4};

use crate::scene::Aabb;

/// Plane index of the near plane within [`Frustum::planes`].
///
/// The cull kernel uses the signed distance to this plane as the sort key.
pub const NEAR_PLANE: usize = 4;

/// Six half-spaces of a view-projection, normals pointing inward.
///
/// Plane layout is `(normal, d)` packed in a `Vec4`; a point `p` is inside
/// when `dot(normal, p) + d >= 0` for all six planes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    /// Planes in the order left, right, bottom, top, near, far.
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extract the six planes from a view-projection matrix.
    ///
    /// Assumes a 0..1 depth range (the convention of `Mat4::perspective_rh`
    /// and every backend here). Planes are normalized so their `w` is a real
    /// distance, which the sort key depends on.
    pub fn from_view_proj(view_proj: Mat4) -> Self {
        let row0 = view_proj.row(0);
        let row1 = view_proj.row(1);
        let row2 = view_proj.row(2);
        let row3 = view_proj.row(3);

        let planes = [
            row3 + row0, // left
            row3 - row0, // right
            row3 + row1, // bottom
            row3 - row1, // top
            row2,        // near (0..1 depth)
            row3 - row2, // far
        ];

        Self {
            planes: planes.map(normalize_plane),
        }
    }

    /// Signed distance from `point` to the near plane.
    ///
    /// Positive in front of the camera, growing with depth.
    pub fn near_distance(&self, point: Vec3) -> f32 {
        let plane = self.planes[NEAR_PLANE];
        plane.truncate().dot(point) + plane.w
    }

    /// Test a world-space box against all six planes.
    ///
    /// Positive-vertex test: for each plane, the corner farthest along the
    /// plane normal is checked; if even that corner is behind the plane, the
    /// whole box is outside. Conservative: boxes near edges may pass without
    /// being visible, which only costs a draw, never drops one.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        for plane in &self.planes {
            let normal = plane.truncate();
            let positive = Vec3::new(
                if normal.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if normal.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if normal.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );
            if normal.dot(positive) + plane.w < 0.0 {
                return false;
            }
        }
        true
    }

    /// Test a single point against all six planes.
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(point) + plane.w >= 0.0)
    }
}

fn normalize_plane(plane: Vec4) -> Vec4 {
    let length = plane.truncate().length();
    if length > 0.0 {
        plane / length
    } else {
        plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::CameraView;

    fn camera_at_origin() -> Frustum {
        let camera = CameraView::perspective(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 1.0);
        Frustum::from_view_proj(camera.view_proj())
    }

    #[test]
    fn test_point_in_front_is_inside() {
        let frustum = camera_at_origin();
        assert!(frustum.contains_point(Vec3::new(0.0, 0.0, -5.0)));
    }

    #[test]
    fn test_point_behind_is_outside() {
        let frustum = camera_at_origin();
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 5.0)));
    }

    #[test]
    fn test_point_outside_side_plane() {
        let frustum = camera_at_origin();
        // Far to the left at shallow depth: outside the left plane.
        assert!(!frustum.contains_point(Vec3::new(-100.0, 0.0, -1.0)));
    }

    #[test]
    fn test_aabb_straddling_plane_is_inside() {
        let frustum = camera_at_origin();
        // Box straddles the near plane; the positive-vertex test keeps it.
        let aabb = Aabb::new(Vec3::new(-0.5, -0.5, -0.5), Vec3::new(0.5, 0.5, 0.5));
        assert!(frustum.intersects_aabb(&aabb));
    }

    #[test]
    fn test_aabb_fully_behind_is_outside() {
        let frustum = camera_at_origin();
        let aabb = Aabb::new(Vec3::new(-1.0, -1.0, 2.0), Vec3::new(1.0, 1.0, 4.0));
        assert!(!frustum.intersects_aabb(&aabb));
    }

    #[test]
    fn test_near_distance_grows_with_depth() {
        let frustum = camera_at_origin();
        let near = frustum.near_distance(Vec3::new(0.0, 0.0, -1.0));
        let far = frustum.near_distance(Vec3::new(0.0, 0.0, -10.0));
        assert!(near > 0.0);
        assert!(far > near);
    }

    #[test]
    fn test_near_distance_negative_behind_camera() {
        let frustum = camera_at_origin();
        assert!(frustum.near_distance(Vec3::new(0.0, 0.0, 2.0)) < 0.0);
    }
}
