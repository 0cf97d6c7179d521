//! Device resources of the culling pipeline
//!
//! - [`SceneBuffers`]: static per-scene data, shared read-only by all frame slots
//! - [`FrameSlot`]: per in-flight frame visibility, compacted draws and constants
//! - [`DepthTargets`]: resolution dependent, rebuilt on resize

use crate::error::PipelineResult;
use crate::gpu::layout::{
    CompactionUniforms, DrawTemplate, FrameUniforms, GridUniforms, ReprojectUniforms,
    DRAW_ARGS_STRIDE,
};
use crate::gpu::{
    align_up, BufferDesc, BufferHandle, BufferUsage, GpuBackend, MemoryKind, ResourceState,
    TextureDesc, TextureFormat, TextureHandle, TextureUsage, STORAGE_OFFSET_ALIGNMENT,
};
use crate::scene::Scene;

use super::proxy::{build_aabb_transforms, build_draw_templates};

pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Layout of the compacted draw buffer
///
/// `capacity` packed 20-byte draw argument records, then a `u32` counter at
/// the next storage-aligned offset. Capacity equals the object count, so the
/// counter can never exceed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendBufferLayout {
    pub capacity: u32,
    pub entries_size: u64,
    pub counter_offset: u64,
    pub size: u64,
}

impl AppendBufferLayout {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        let entries_size = capacity as u64 * DRAW_ARGS_STRIDE;
        let counter_offset = align_up(entries_size, STORAGE_OFFSET_ALIGNMENT);
        Self {
            capacity,
            entries_size,
            counter_offset,
            size: counter_offset + 16,
        }
    }
}

fn storage_size(count: usize, stride: usize) -> u64 {
    (count.max(1) * stride) as u64
}

/// Static scene data on the device
#[derive(Debug, Clone)]
pub struct SceneBuffers {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub objects: BufferHandle,
    pub materials: BufferHandle,
    pub templates: BufferHandle,
    pub aabb_transforms: BufferHandle,
    pub compaction_uniforms: BufferHandle,
    /// Four zero words, source of the per-frame counter reset
    pub zero: BufferHandle,
    /// All-ones flags bound by overlays when no visibility was computed
    pub all_visible: BufferHandle,
    pub object_count: u32,
    pub append_layout: AppendBufferLayout,
    /// CPU copy used by the direct-draw baseline
    pub draw_templates: Vec<DrawTemplate>,
}

impl SceneBuffers {
    pub fn upload<B: GpuBackend + ?Sized>(backend: &mut B, scene: &Scene) -> PipelineResult<Self> {
        let object_count = scene.object_count();
        let draw_templates = build_draw_templates(&scene.objects);
        let transforms = build_aabb_transforms(&scene.objects);
        let objects = scene.object_gpu_data();
        let materials = scene.material_gpu_data();

        let static_storage = |label: &str, size: u64| {
            BufferDesc::new(label, size, BufferUsage::STORAGE | BufferUsage::COPY_DST)
                .state(ResourceState::ShaderResource)
        };

        let vertex_buffer = backend.create_buffer_init(
            &BufferDesc::new(
                "Scene Vertices",
                storage_size(scene.vertices.len(), std::mem::size_of::<crate::gpu::layout::MeshVertex>()),
                BufferUsage::VERTEX | BufferUsage::COPY_DST,
            )
            .state(ResourceState::VertexOrConstant),
            bytemuck::cast_slice(&scene.vertices),
        )?;
        let index_buffer = backend.create_buffer_init(
            &BufferDesc::new(
                "Scene Indices",
                storage_size(scene.indices.len(), 4),
                BufferUsage::INDEX | BufferUsage::COPY_DST,
            )
            .state(ResourceState::IndexBuffer),
            bytemuck::cast_slice(&scene.indices),
        )?;
        let objects_buffer = backend.create_buffer_init(
            &static_storage("Object Data", storage_size(objects.len(), std::mem::size_of::<crate::gpu::layout::ObjectGpuData>())),
            bytemuck::cast_slice(&objects),
        )?;
        let materials_buffer = backend.create_buffer_init(
            &static_storage("Materials", storage_size(materials.len(), std::mem::size_of::<crate::gpu::layout::MaterialGpuData>())),
            bytemuck::cast_slice(&materials),
        )?;
        let templates = backend.create_buffer_init(
            &static_storage("Draw Templates", storage_size(draw_templates.len(), std::mem::size_of::<DrawTemplate>())),
            bytemuck::cast_slice(&draw_templates),
        )?;
        let aabb_transforms = backend.create_buffer_init(
            &static_storage("AABB Transforms", storage_size(transforms.len(), 64)),
            bytemuck::cast_slice(&transforms),
        )?;

        let append_layout = AppendBufferLayout::new(object_count);
        let compaction_uniforms = backend.create_buffer_init(
            &BufferDesc::new(
                "Compaction Uniforms",
                std::mem::size_of::<CompactionUniforms>() as u64,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            )
            .state(ResourceState::VertexOrConstant),
            bytemuck::bytes_of(&CompactionUniforms {
                object_count,
                capacity: append_layout.capacity,
                _padding: [0; 2],
            }),
        )?;
        let zero = backend.create_buffer_init(
            &BufferDesc::new("Counter Reset", 16, BufferUsage::COPY_SRC | BufferUsage::COPY_DST)
                .state(ResourceState::CopySource),
            &[0u8; 16],
        )?;
        let ones = vec![1u32; object_count.max(1) as usize];
        let all_visible = backend.create_buffer_init(
            &static_storage("All Visible", storage_size(ones.len(), 4)),
            bytemuck::cast_slice(&ones),
        )?;

        log::info!(
            "[SceneBuffers::upload] {} objects, {} vertices, {} indices, {} materials",
            object_count,
            scene.vertices.len(),
            scene.indices.len(),
            scene.materials.len()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            objects: objects_buffer,
            materials: materials_buffer,
            templates,
            aabb_transforms,
            compaction_uniforms,
            zero,
            all_visible,
            object_count,
            append_layout,
            draw_templates,
        })
    }

    pub fn destroy<B: GpuBackend + ?Sized>(&self, backend: &mut B) {
        for buffer in [
            self.vertex_buffer,
            self.index_buffer,
            self.objects,
            self.materials,
            self.templates,
            self.aabb_transforms,
            self.compaction_uniforms,
            self.zero,
            self.all_visible,
        ] {
            backend.destroy_buffer(buffer);
        }
    }
}

/// Resources owned by one in-flight frame
#[derive(Debug, Clone)]
pub struct FrameSlot {
    pub index: usize,
    pub visibility: BufferHandle,
    pub compacted: BufferHandle,
    pub frame_uniforms: BufferHandle,
    pub reproject_uniforms: BufferHandle,
    pub downsample_uniforms: BufferHandle,
    pub copy_uniforms: BufferHandle,
    pub debug_uniforms: BufferHandle,
}

impl FrameSlot {
    pub fn create<B: GpuBackend + ?Sized>(
        backend: &mut B,
        index: usize,
        object_count: u32,
        layout: &AppendBufferLayout,
    ) -> PipelineResult<Self> {
        let visibility = backend.create_buffer(
            &BufferDesc::new(
                format!("Visibility [{}]", index),
                storage_size(object_count as usize, 4),
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            )
            .state(ResourceState::ShaderResource),
        )?;
        let compacted = backend.create_buffer(
            &BufferDesc::new(
                format!("Compacted Draws [{}]", index),
                layout.size,
                BufferUsage::STORAGE | BufferUsage::INDIRECT | BufferUsage::COPY_DST,
            )
            .state(ResourceState::IndirectArgument),
        )?;

        let mut uniform = |name: &str, size: usize| {
            backend.create_buffer(
                &BufferDesc::new(
                    format!("{} [{}]", name, index),
                    size as u64,
                    BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                )
                .memory(MemoryKind::Dynamic)
                .state(ResourceState::VertexOrConstant),
            )
        };
        let frame_uniforms = uniform("Frame Uniforms", std::mem::size_of::<FrameUniforms>())?;
        let reproject_uniforms = uniform("Reproject Uniforms", std::mem::size_of::<ReprojectUniforms>())?;
        let downsample_uniforms = uniform("Downsample Uniforms", std::mem::size_of::<GridUniforms>())?;
        let copy_uniforms = uniform("Depth Copy Uniforms", std::mem::size_of::<GridUniforms>())?;
        let debug_uniforms = uniform("Debug Depth Uniforms", std::mem::size_of::<GridUniforms>())?;

        Ok(Self {
            index,
            visibility,
            compacted,
            frame_uniforms,
            reproject_uniforms,
            downsample_uniforms,
            copy_uniforms,
            debug_uniforms,
        })
    }

    pub fn destroy<B: GpuBackend + ?Sized>(&self, backend: &mut B) {
        for buffer in [
            self.visibility,
            self.compacted,
            self.frame_uniforms,
            self.reproject_uniforms,
            self.downsample_uniforms,
            self.copy_uniforms,
            self.debug_uniforms,
        ] {
            backend.destroy_buffer(buffer);
        }
    }
}

/// Reprojected depth stored as one `u32` per texel (depth bits, 0 = unwritten)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthGrid {
    pub buffer: BufferHandle,
    pub width: u32,
    pub height: u32,
}

impl DepthGrid {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn uniforms_to(&self, dst: (u32, u32)) -> GridUniforms {
        GridUniforms {
            src_size: [self.width, self.height],
            dst_size: [dst.0, dst.1],
        }
    }

    fn create<B: GpuBackend + ?Sized>(backend: &mut B, label: &str, width: u32, height: u32) -> PipelineResult<Self> {
        let buffer = backend.create_buffer(
            &BufferDesc::new(
                label,
                storage_size((width * height) as usize, 4),
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            )
            .state(ResourceState::ShaderResource),
        )?;
        Ok(Self { buffer, width, height })
    }
}

/// Grid size for a resolution divisor, never below one texel
pub fn grid_size(width: u32, height: u32, divisor: u32) -> (u32, u32) {
    ((width / divisor).max(1), (height / divisor).max(1))
}

/// Scene depth plus its half and quarter resolution estimates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthTargets {
    pub width: u32,
    pub height: u32,
    pub depth: TextureHandle,
    pub half: DepthGrid,
    pub quarter: DepthGrid,
}

impl DepthTargets {
    pub fn create<B: GpuBackend + ?Sized>(backend: &mut B, width: u32, height: u32) -> PipelineResult<Self> {
        let depth = backend.create_texture(&TextureDesc {
            label: "Scene Depth".to_string(),
            width,
            height,
            format: DEPTH_FORMAT,
            usage: TextureUsage::DEPTH_TARGET | TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            initial_state: ResourceState::DepthWrite,
        })?;
        let (hw, hh) = grid_size(width, height, 2);
        let (qw, qh) = grid_size(width, height, 4);
        let half = DepthGrid::create(backend, "Reprojected Depth (half)", hw, hh)?;
        let quarter = DepthGrid::create(backend, "Reprojected Depth (quarter)", qw, qh)?;
        log::debug!(
            "[DepthTargets::create] depth {}x{}, half {}x{}, quarter {}x{}",
            width, height, hw, hh, qw, qh
        );
        Ok(Self {
            width,
            height,
            depth,
            half,
            quarter,
        })
    }

    pub fn destroy<B: GpuBackend + ?Sized>(&self, backend: &mut B) {
        backend.destroy_texture(self.depth);
        backend.destroy_buffer(self.half.buffer);
        backend.destroy_buffer(self.quarter.buffer);
    }

    /// Grid the copy and visibility stages read this frame
    pub fn cull_grid(&self, downsample: bool) -> &DepthGrid {
        if downsample {
            &self.quarter
        } else {
            &self.half
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_layout_counter_is_aligned() {
        let layout = AppendBufferLayout::new(100);
        assert_eq!(layout.entries_size, 2000);
        assert_eq!(layout.counter_offset, 2048);
        assert_eq!(layout.counter_offset % STORAGE_OFFSET_ALIGNMENT, 0);
        assert!(layout.size >= layout.counter_offset + 4);
    }

    #[test]
    fn test_append_layout_empty_scene() {
        let layout = AppendBufferLayout::new(0);
        assert_eq!(layout.capacity, 1);
        assert_eq!(layout.counter_offset, 256);
    }

    #[test]
    fn test_grid_sizes() {
        assert_eq!(grid_size(1280, 720, 2), (640, 360));
        assert_eq!(grid_size(1280, 720, 4), (320, 180));
        assert_eq!(grid_size(3, 1, 4), (1, 1));
    }
}
