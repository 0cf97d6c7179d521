//! AABB proxy mesh and per-object draw records
//!
//! One unit cube centered on the origin is instanced over every object; each
//! instance's transform is the object's [`AabbTransform`]. Draw templates are
//! built once per scene and never change afterwards.

use crate::error::PipelineResult;
use crate::gpu::layout::{DrawTemplate, ProxyVertex};
use crate::gpu::{BufferDesc, BufferHandle, BufferUsage, GpuBackend, ResourceState};
use crate::scene::{AabbTransform, ObjectRecord};

pub const PROXY_VERTICES: [ProxyVertex; 8] = [
    ProxyVertex { position: [-0.5, -0.5, -0.5] },
    ProxyVertex { position: [0.5, -0.5, -0.5] },
    ProxyVertex { position: [0.5, 0.5, -0.5] },
    ProxyVertex { position: [-0.5, 0.5, -0.5] },
    ProxyVertex { position: [-0.5, -0.5, 0.5] },
    ProxyVertex { position: [0.5, -0.5, 0.5] },
    ProxyVertex { position: [0.5, 0.5, 0.5] },
    ProxyVertex { position: [-0.5, 0.5, 0.5] },
];

#[rustfmt::skip]
pub const PROXY_INDICES: [u32; 36] = [
    0, 2, 1, 0, 3, 2, // -z
    4, 5, 6, 4, 6, 7, // +z
    0, 1, 5, 0, 5, 4, // -y
    3, 7, 6, 3, 6, 2, // +y
    0, 4, 7, 0, 7, 3, // -x
    1, 2, 6, 1, 6, 5, // +x
];

#[rustfmt::skip]
pub const PROXY_LINE_INDICES: [u32; 24] = [
    0, 1, 1, 2, 2, 3, 3, 0,
    4, 5, 5, 6, 6, 7, 7, 4,
    0, 4, 1, 5, 2, 6, 3, 7,
];

/// One indexed draw per object; the object index rides in `first_instance`
pub fn build_draw_templates(objects: &[ObjectRecord]) -> Vec<DrawTemplate> {
    objects
        .iter()
        .enumerate()
        .map(|(i, object)| DrawTemplate {
            index_count: object.mesh.index_count,
            instance_count: 1,
            first_index: object.mesh.first_index,
            base_vertex: object.mesh.base_vertex,
            first_instance: i as u32,
            material_index: object.material_index,
            _padding: [0; 2],
        })
        .collect()
}

pub fn build_aabb_transforms(objects: &[ObjectRecord]) -> Vec<[[f32; 4]; 4]> {
    objects
        .iter()
        .map(|object| {
            AabbTransform::from_aabb(&object.world_bounds)
                .matrix()
                .to_cols_array_2d()
        })
        .collect()
}

/// Proxy cube uploaded to the device
#[derive(Debug, Clone, Copy)]
pub struct ProxyGeometry {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub line_index_buffer: BufferHandle,
}

impl ProxyGeometry {
    pub const INDEX_COUNT: u32 = PROXY_INDICES.len() as u32;
    pub const LINE_INDEX_COUNT: u32 = PROXY_LINE_INDICES.len() as u32;

    pub fn create<B: GpuBackend + ?Sized>(backend: &mut B) -> PipelineResult<Self> {
        let vertex_buffer = backend.create_buffer_init(
            &BufferDesc::new(
                "Proxy Vertices",
                std::mem::size_of_val(&PROXY_VERTICES) as u64,
                BufferUsage::VERTEX | BufferUsage::COPY_DST,
            )
            .state(ResourceState::VertexOrConstant),
            bytemuck::cast_slice(&PROXY_VERTICES),
        )?;
        let index_buffer = backend.create_buffer_init(
            &BufferDesc::new(
                "Proxy Indices",
                std::mem::size_of_val(&PROXY_INDICES) as u64,
                BufferUsage::INDEX | BufferUsage::COPY_DST,
            )
            .state(ResourceState::IndexBuffer),
            bytemuck::cast_slice(&PROXY_INDICES),
        )?;
        let line_index_buffer = backend.create_buffer_init(
            &BufferDesc::new(
                "Proxy Line Indices",
                std::mem::size_of_val(&PROXY_LINE_INDICES) as u64,
                BufferUsage::INDEX | BufferUsage::COPY_DST,
            )
            .state(ResourceState::IndexBuffer),
            bytemuck::cast_slice(&PROXY_LINE_INDICES),
        )?;
        Ok(Self {
            vertex_buffer,
            index_buffer,
            line_index_buffer,
        })
    }

    pub fn destroy<B: GpuBackend + ?Sized>(&self, backend: &mut B) {
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
        backend.destroy_buffer(self.line_index_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Aabb, MeshRange};
    use glam::{Mat4, Vec3};

    fn object(min: Vec3, max: Vec3, range: MeshRange) -> ObjectRecord {
        ObjectRecord {
            world_bounds: Aabb::new(min, max),
            model: Mat4::IDENTITY,
            material_index: 3,
            mesh: range,
        }
    }

    #[test]
    fn test_proxy_covers_unit_cube() {
        assert!(PROXY_INDICES.iter().all(|&i| (i as usize) < PROXY_VERTICES.len()));
        assert!(PROXY_LINE_INDICES.iter().all(|&i| (i as usize) < PROXY_VERTICES.len()));
        for v in PROXY_VERTICES {
            assert!(v.position.iter().all(|c| c.abs() == 0.5));
        }
    }

    #[test]
    fn test_templates_are_self_describing() {
        let range = MeshRange {
            first_index: 36,
            index_count: 18,
            base_vertex: 24,
        };
        let objects = vec![
            object(Vec3::ZERO, Vec3::ONE, range),
            object(Vec3::ZERO, Vec3::ONE, range),
        ];
        let templates = build_draw_templates(&objects);
        assert_eq!(templates[1].first_instance, 1);
        assert_eq!(templates[1].first_index, 36);
        assert_eq!(templates[1].base_vertex, 24);
        assert_eq!(templates[0].instance_count, 1);
        assert_eq!(templates[0].material_index, 3);
    }

    #[test]
    fn test_aabb_transform_instances_proxy_onto_bounds() {
        let range = MeshRange {
            first_index: 0,
            index_count: 36,
            base_vertex: 0,
        };
        let objects = vec![object(Vec3::new(2.0, 0.0, -1.0), Vec3::new(4.0, 6.0, 1.0), range)];
        let m = Mat4::from_cols_array_2d(&build_aabb_transforms(&objects)[0]);
        let corners: Vec<Vec3> = PROXY_VERTICES
            .iter()
            .map(|v| m.transform_point3(Vec3::from_array(v.position)))
            .collect();
        let bounds = Aabb::from_points(corners).unwrap();
        assert!(bounds.min.abs_diff_eq(objects[0].world_bounds.min, 1e-5));
        assert!(bounds.max.abs_diff_eq(objects[0].world_bounds.max, 1e-5));
    }
}
