use glam::{Mat4, Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{LoadProgress, Material, MeshData, ObjectDesc, SceneDescription, SceneSource};
use crate::config::SceneConfig;
use crate::error::PipelineResult;

const CUBE: usize = 0;
const PYRAMID: usize = 1;

const PALETTE: [[f32; 4]; 6] = [
    [0.85, 0.33, 0.31, 1.0],
    [0.36, 0.72, 0.36, 1.0],
    [0.26, 0.55, 0.79, 1.0],
    [0.94, 0.77, 0.28, 1.0],
    [0.58, 0.40, 0.74, 1.0],
    [0.90, 0.55, 0.24, 1.0],
];
const WALL_MATERIAL: u32 = PALETTE.len() as u32;
const GROUND_MATERIAL: u32 = WALL_MATERIAL + 1;

/// Deterministic city-block scene: a grid of boxes and pyramids cut by tall walls
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticScene {
    pub config: SceneConfig,
}

impl SyntheticScene {
    pub fn new(config: SceneConfig) -> Self {
        Self { config }
    }

    /// Grid extent along x and z
    pub fn extent(&self) -> (f32, f32) {
        (
            self.config.grid_x as f32 * self.config.spacing,
            self.config.grid_z as f32 * self.config.spacing,
        )
    }

    fn grid_position(&self, x: u32, z: u32) -> Vec3 {
        let (width, depth) = self.extent();
        Vec3::new(
            (x as f32 + 0.5) * self.config.spacing - width / 2.0,
            0.0,
            (z as f32 + 0.5) * self.config.spacing - depth / 2.0,
        )
    }

    pub fn generate(&self, progress: Option<&LoadProgress>) -> SceneDescription {
        let cfg = &self.config;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let (width, depth) = self.extent();

        let mut materials: Vec<Material> = PALETTE.iter().map(|&c| Material { base_color: c }).collect();
        materials.push(Material { base_color: [0.55, 0.55, 0.58, 1.0] });
        materials.push(Material { base_color: [0.25, 0.27, 0.25, 1.0] });

        let mut objects = vec![ObjectDesc {
            mesh: CUBE,
            transform: Mat4::from_scale_rotation_translation(
                Vec3::new(width + cfg.spacing, 0.2, depth + cfg.spacing),
                Quat::IDENTITY,
                Vec3::new(0.0, -0.1, 0.0),
            ),
            material: GROUND_MATERIAL,
        }];

        let footprint = cfg.spacing * 0.6;
        for z in 0..cfg.grid_z {
            for x in 0..cfg.grid_x {
                let height = rng.gen_range(0.5..3.0) * footprint;
                let size = Vec3::new(
                    rng.gen_range(0.4..1.0) * footprint,
                    height,
                    rng.gen_range(0.4..1.0) * footprint,
                );
                let mesh = if rng.gen_bool(0.2) { PYRAMID } else { CUBE };
                let position = self.grid_position(x, z) + Vec3::Y * (height / 2.0);
                objects.push(ObjectDesc {
                    mesh,
                    transform: Mat4::from_scale_rotation_translation(
                        size,
                        Quat::from_rotation_y(rng.gen_range(0.0..std::f32::consts::TAU)),
                        position,
                    ),
                    material: rng.gen_range(0..PALETTE.len() as u32),
                });
            }
            if let Some(progress) = progress {
                progress.report("placing objects", (z + 1) as usize, cfg.grid_z as usize);
            }
        }

        // Walls span the whole grid width, evenly spaced along z
        for i in 0..cfg.occluder_walls {
            let z = depth * ((i + 1) as f32 / (cfg.occluder_walls + 1) as f32) - depth / 2.0;
            let wall_height = cfg.spacing * 4.0;
            objects.push(ObjectDesc {
                mesh: CUBE,
                transform: Mat4::from_scale_rotation_translation(
                    Vec3::new(width, wall_height, cfg.spacing * 0.25),
                    Quat::IDENTITY,
                    Vec3::new(0.0, wall_height / 2.0, z),
                ),
                material: WALL_MATERIAL,
            });
        }

        SceneDescription {
            meshes: vec![MeshData::cube(), MeshData::pyramid()],
            objects,
            materials,
        }
    }
}

impl SceneSource for SyntheticScene {
    fn name(&self) -> String {
        format!("synthetic {}x{}", self.config.grid_x, self.config.grid_z)
    }

    fn load(&self, progress: &LoadProgress) -> PipelineResult<SceneDescription> {
        Ok(self.generate(Some(progress)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SceneConfig {
        SceneConfig {
            grid_x: 4,
            grid_z: 3,
            spacing: 2.0,
            occluder_walls: 2,
            seed: 7,
        }
    }

    #[test]
    fn test_object_count() {
        let description = SyntheticScene::new(small()).generate(None);
        assert_eq!(description.objects.len(), 1 + 4 * 3 + 2);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = SyntheticScene::new(small()).generate(None);
        let b = SyntheticScene::new(small()).generate(None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_materials_resolve() {
        let description = SyntheticScene::new(small()).generate(None);
        assert!(description
            .objects
            .iter()
            .all(|o| (o.material as usize) < description.materials.len()));
    }
}
