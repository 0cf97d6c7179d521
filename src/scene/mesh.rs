use glam::Vec3;

use super::Aabb;
use crate::gpu::layout::MeshVertex;

/// Indexed triangle mesh in model space
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from_array(v.position)))
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn push_quad(&mut self, corners: [Vec3; 4], normal: Vec3) {
        let base = self.vertices.len() as u32;
        for corner in corners {
            self.vertices.push(MeshVertex {
                position: corner.to_array(),
                normal: normal.to_array(),
            });
        }
        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    fn push_triangle(&mut self, corners: [Vec3; 3]) {
        let normal = (corners[1] - corners[0])
            .cross(corners[2] - corners[0])
            .normalize_or_zero();
        let base = self.vertices.len() as u32;
        for corner in corners {
            self.vertices.push(MeshVertex {
                position: corner.to_array(),
                normal: normal.to_array(),
            });
        }
        self.indices.extend_from_slice(&[base, base + 1, base + 2]);
    }

    /// Unit cube centered on the origin, 24 vertices with face normals
    pub fn cube() -> Self {
        let mut mesh = Self::default();
        let h = 0.5;
        let faces = [
            (Vec3::X, Vec3::Y, Vec3::Z),
            (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
            (Vec3::Y, Vec3::Z, Vec3::X),
            (Vec3::NEG_Y, Vec3::NEG_Z, Vec3::X),
            (Vec3::Z, Vec3::Y, Vec3::NEG_X),
            (Vec3::NEG_Z, Vec3::Y, Vec3::X),
        ];
        for (normal, up, side) in faces {
            let c = normal * h;
            let (u, s) = (up * h, side * h);
            mesh.push_quad([c - s - u, c + s - u, c + s + u, c - s + u], normal);
        }
        mesh
    }

    /// Square pyramid with its base centered on the origin plane y = -0.5
    pub fn pyramid() -> Self {
        let mut mesh = Self::default();
        let apex = Vec3::new(0.0, 0.5, 0.0);
        let base = [
            Vec3::new(-0.5, -0.5, -0.5),
            Vec3::new(0.5, -0.5, -0.5),
            Vec3::new(0.5, -0.5, 0.5),
            Vec3::new(-0.5, -0.5, 0.5),
        ];
        for i in 0..4 {
            mesh.push_triangle([base[(i + 1) % 4], base[i], apex]);
        }
        mesh.push_quad([base[0], base[1], base[2], base[3]], Vec3::NEG_Y);
        mesh
    }
}
