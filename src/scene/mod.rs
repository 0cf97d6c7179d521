//! Static scene data
//!
//! A [`SceneDescription`] is what a [`SceneSource`] produces: meshes, object
//! placements and materials. [`Scene::assemble`] merges every mesh into one
//! shared vertex/index buffer and computes each object's world bounds once.

pub mod aabb;
pub mod loader;
pub mod mesh;
pub mod synthetic;

pub use aabb::{Aabb, AabbTransform};
pub use loader::{LoadProgress, LoadStatus, SceneLoadTask, SceneSource};
pub use mesh::MeshData;
pub use synthetic::SyntheticScene;

use glam::Mat4;

use crate::error::{PipelineError, PipelineResult};
use crate::gpu::layout::{MaterialGpuData, MeshVertex, ObjectGpuData};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub base_color: [f32; 4],
}

/// One placed instance of a mesh
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDesc {
    pub mesh: usize,
    pub transform: Mat4,
    pub material: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneDescription {
    pub meshes: Vec<MeshData>,
    pub objects: Vec<ObjectDesc>,
    pub materials: Vec<Material>,
}

/// Location of a mesh inside the shared vertex/index buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRange {
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub world_bounds: Aabb,
    pub model: Mat4,
    pub material_index: u32,
    pub mesh: MeshRange,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
    pub objects: Vec<ObjectRecord>,
    pub materials: Vec<Material>,
}

impl Scene {
    pub fn assemble(description: SceneDescription) -> PipelineResult<Self> {
        let SceneDescription {
            meshes,
            objects,
            mut materials,
        } = description;

        if materials.is_empty() {
            materials.push(Material {
                base_color: [0.8, 0.8, 0.8, 1.0],
            });
        }

        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut ranges = Vec::with_capacity(meshes.len());
        let mut local_bounds = Vec::with_capacity(meshes.len());
        for (i, mesh) in meshes.iter().enumerate() {
            let bounds = mesh.bounds().ok_or_else(|| PipelineError::SceneLoad {
                message: format!("mesh {} has no vertices", i),
            })?;
            if let Some(&bad) = mesh.indices.iter().find(|&&idx| idx as usize >= mesh.vertices.len()) {
                return Err(PipelineError::SceneLoad {
                    message: format!("mesh {} index {} out of range", i, bad),
                });
            }
            ranges.push(MeshRange {
                first_index: indices.len() as u32,
                index_count: mesh.indices.len() as u32,
                base_vertex: vertices.len() as i32,
            });
            local_bounds.push(bounds);
            vertices.extend_from_slice(&mesh.vertices);
            indices.extend_from_slice(&mesh.indices);
        }

        let objects = objects
            .into_iter()
            .enumerate()
            .map(|(i, object)| {
                let (Some(range), Some(bounds)) = (ranges.get(object.mesh), local_bounds.get(object.mesh)) else {
                    return Err(PipelineError::SceneLoad {
                        message: format!("object {} references missing mesh {}", i, object.mesh),
                    });
                };
                if object.material as usize >= materials.len() {
                    return Err(PipelineError::SceneLoad {
                        message: format!("object {} references missing material {}", i, object.material),
                    });
                }
                Ok(ObjectRecord {
                    world_bounds: bounds.transformed(&object.transform),
                    model: object.transform,
                    material_index: object.material,
                    mesh: *range,
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        Ok(Self {
            vertices,
            indices,
            objects,
            materials,
        })
    }

    pub fn object_count(&self) -> u32 {
        self.objects.len() as u32
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.objects
            .iter()
            .map(|o| o.world_bounds)
            .reduce(|a, b| a.union(&b))
    }

    pub fn object_gpu_data(&self) -> Vec<ObjectGpuData> {
        self.objects
            .iter()
            .map(|o| ObjectGpuData {
                model: o.model.to_cols_array_2d(),
                material_index: o.material_index,
                _padding: [0; 3],
            })
            .collect()
    }

    pub fn material_gpu_data(&self) -> Vec<MaterialGpuData> {
        self.materials
            .iter()
            .map(|m| MaterialGpuData {
                base_color: m.base_color,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn two_mesh_description() -> SceneDescription {
        SceneDescription {
            meshes: vec![MeshData::cube(), MeshData::pyramid()],
            objects: vec![
                ObjectDesc {
                    mesh: 1,
                    transform: Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)),
                    material: 0,
                },
                ObjectDesc {
                    mesh: 0,
                    transform: Mat4::from_scale(Vec3::splat(2.0)),
                    material: 0,
                },
            ],
            materials: vec![],
        }
    }

    #[test]
    fn test_assemble_merges_meshes() {
        let scene = Scene::assemble(two_mesh_description()).unwrap();
        assert_eq!(scene.vertices.len(), 24 + MeshData::pyramid().vertices.len());
        assert_eq!(scene.objects[1].mesh.first_index, 0);
        assert_eq!(scene.objects[0].mesh.first_index, 36);
        assert_eq!(scene.objects[0].mesh.base_vertex, 24);
        assert_eq!(scene.materials.len(), 1);
    }

    #[test]
    fn test_world_bounds_follow_model_matrix() {
        let scene = Scene::assemble(two_mesh_description()).unwrap();
        assert_eq!(scene.objects[1].world_bounds.min, Vec3::splat(-1.0));
        assert_eq!(scene.objects[0].world_bounds.center(), Vec3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn test_missing_mesh_is_rejected() {
        let mut description = two_mesh_description();
        description.objects[0].mesh = 7;
        assert!(matches!(
            Scene::assemble(description),
            Err(PipelineError::SceneLoad { .. })
        ));
    }
}
