//! GPU-visible record layouts
//!
//! These mirror the structs declared in `shaders/common.wgsl` and are read by
//! the software device kernels. Sizes are pinned by the tests below.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Per-frame constants shared by the visibility, scene and debug programs
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    /// xy: culling viewport in pixels, zw: render target size
    pub viewport: [f32; 4],
    /// x: object count
    pub params: [u32; 4],
}

impl FrameUniforms {
    pub fn new(view_proj: Mat4, camera_position: Vec3, cull_size: (u32, u32), target_size: (u32, u32), object_count: u32) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            camera_position: camera_position.extend(1.0).to_array(),
            viewport: [
                cull_size.0 as f32,
                cull_size.1 as f32,
                target_size.0 as f32,
                target_size.1 as f32,
            ],
            params: [object_count, 0, 0, 0],
        }
    }

    pub fn view_proj(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.view_proj)
    }

    pub fn camera_position(&self) -> Vec3 {
        Vec3::new(self.camera_position[0], self.camera_position[1], self.camera_position[2])
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ReprojectUniforms {
    pub prev_inv_view_proj: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    /// Previous depth size in texels
    pub src_size: [u32; 2],
    /// Half-resolution grid size
    pub dst_size: [u32; 2],
}

/// Source and destination sizes for grid-to-grid and grid-to-screen programs
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct GridUniforms {
    pub src_size: [u32; 2],
    pub dst_size: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct CompactionUniforms {
    pub object_count: u32,
    pub capacity: u32,
    pub _padding: [u32; 2],
}

/// Arguments of one indexed indirect draw
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DrawIndexedArgs {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    /// Carries the object index into the scene program
    pub first_instance: u32,
}

/// Static per-object draw record; the first five words are the indirect arguments
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawTemplate {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
    pub material_index: u32,
    pub _padding: [u32; 2],
}

impl DrawTemplate {
    pub fn args(&self) -> DrawIndexedArgs {
        DrawIndexedArgs {
            index_count: self.index_count,
            instance_count: self.instance_count,
            first_index: self.first_index,
            base_vertex: self.base_vertex,
            first_instance: self.first_instance,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ObjectGpuData {
    pub model: [[f32; 4]; 4],
    pub material_index: u32,
    pub _padding: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialGpuData {
    pub base_color: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ProxyVertex {
    pub position: [f32; 3],
}

pub const DRAW_ARGS_STRIDE: u64 = std::mem::size_of::<DrawIndexedArgs>() as u64;
