//! CPU frustum culling for the baseline path
//!
//! Only used when occlusion culling is off, to give the direct-draw path the
//! same frustum rejection a typical renderer would do.

use glam::{Mat4, Vec3, Vec4};
use rayon::prelude::*;

use crate::scene::{Aabb, ObjectRecord};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    /// Plane equations (normal.xyz, d), normals pointing inward
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Planes of a [0, 1] depth-range view-projection
    pub fn from_view_projection(m: &Mat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|p| {
            let length = p.truncate().length();
            if length > 0.0 {
                p / length
            } else {
                p
            }
        });
        Self { planes }
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();
            // Corner furthest along the plane normal
            let positive = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            normal.dot(positive) + plane.w >= 0.0
        })
    }
}

/// Indices of objects whose world bounds intersect the frustum
pub fn cull_objects(frustum: &Frustum, objects: &[ObjectRecord]) -> Vec<u32> {
    objects
        .par_iter()
        .enumerate()
        .filter(|(_, object)| frustum.intersects_aabb(&object.world_bounds))
        .map(|(i, _)| i as u32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::scene::MeshRange;

    fn record(center: Vec3) -> ObjectRecord {
        ObjectRecord {
            world_bounds: Aabb::new(center - Vec3::splat(0.5), center + Vec3::splat(0.5)),
            model: Mat4::from_translation(center),
            material_index: 0,
            mesh: MeshRange {
                first_index: 0,
                index_count: 36,
                base_vertex: 0,
            },
        }
    }

    #[test]
    fn test_objects_in_front_survive() {
        let camera = Camera::looking_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 16, 9);
        let frustum = Frustum::from_view_projection(&camera.view_projection());
        let objects = vec![
            record(Vec3::ZERO),
            record(Vec3::new(0.0, 0.0, 20.0)),
            record(Vec3::new(500.0, 0.0, 0.0)),
            record(Vec3::new(0.0, 0.0, -5000.0)),
        ];
        assert_eq!(cull_objects(&frustum, &objects), vec![0]);
    }

    #[test]
    fn test_straddling_box_is_kept() {
        let camera = Camera::looking_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 1, 1);
        let frustum = Frustum::from_view_projection(&camera.view_projection());
        let edge = camera.z_near + 5.0;
        // Centered on the left plane
        let x = edge * (camera.fov_y / 2.0).tan();
        assert!(frustum.intersects_aabb(&record(Vec3::new(-x, 0.0, -edge)).world_bounds));
    }
}
