//! Pipeline construction for each program kind

use std::mem::size_of;

use super::to_wgpu_format;
use crate::error::{program_error, PipelineError, PipelineResult};
use crate::gpu::layout::{MeshVertex, ProxyVertex};
use crate::gpu::preprocessor::WgslPreprocessor;
use crate::gpu::program::{BindingKind, ShaderStages};
use crate::gpu::{BackendCapabilities, ProgramDesc, ProgramKind, TextureFormat};

const COMMON: &str = include_str!("../../shaders/common.wgsl");
const COMPACT_COMMON: &str = include_str!("../../shaders/compact_common.wgsl");

fn shader_source(kind: ProgramKind) -> (&'static str, &'static str) {
    match kind {
        ProgramKind::Reproject => ("reproject.wgsl", include_str!("../../shaders/reproject.wgsl")),
        ProgramKind::Downsample => ("downsample.wgsl", include_str!("../../shaders/downsample.wgsl")),
        ProgramKind::DepthCopy => ("depth_copy.wgsl", include_str!("../../shaders/depth_copy.wgsl")),
        ProgramKind::VisibilityTest => ("visibility.wgsl", include_str!("../../shaders/visibility.wgsl")),
        ProgramKind::CompactCompute => (
            "compact_compute.wgsl",
            include_str!("../../shaders/compact_compute.wgsl"),
        ),
        ProgramKind::CompactPointStream => (
            "compact_points.wgsl",
            include_str!("../../shaders/compact_points.wgsl"),
        ),
        ProgramKind::SceneMesh => ("mesh.wgsl", include_str!("../../shaders/mesh.wgsl")),
        ProgramKind::DebugBoxes => ("debug_boxes.wgsl", include_str!("../../shaders/debug_boxes.wgsl")),
        ProgramKind::DebugDepth => ("debug_depth.wgsl", include_str!("../../shaders/debug_depth.wgsl")),
    }
}

pub(super) enum Pipeline {
    Compute(wgpu::ComputePipeline),
    Render(wgpu::RenderPipeline),
}

pub(super) struct Program {
    pub kind: ProgramKind,
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub pipeline: Pipeline,
}

/// Fixed-function state that differs between graphics kinds
struct RasterState {
    topology: wgpu::PrimitiveTopology,
    depth_write: bool,
    depth_compare: wgpu::CompareFunction,
    vertex_layout: Option<VertexLayout>,
    fragment: bool,
}

#[derive(Clone, Copy)]
enum VertexLayout {
    Proxy,
    Mesh,
}

const PROXY_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x3];
const MESH_ATTRIBUTES: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];

impl VertexLayout {
    fn buffer_layout(self) -> wgpu::VertexBufferLayout<'static> {
        match self {
            Self::Proxy => wgpu::VertexBufferLayout {
                array_stride: size_of::<ProxyVertex>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &PROXY_ATTRIBUTES,
            },
            Self::Mesh => wgpu::VertexBufferLayout {
                array_stride: size_of::<MeshVertex>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &MESH_ATTRIBUTES,
            },
        }
    }
}

fn raster_state(kind: ProgramKind) -> RasterState {
    use wgpu::CompareFunction as Cmp;
    use wgpu::PrimitiveTopology as Topo;

    let state = |topology, depth_write, depth_compare, vertex_layout, fragment| RasterState {
        topology,
        depth_write,
        depth_compare,
        vertex_layout,
        fragment,
    };
    match kind {
        ProgramKind::DepthCopy => state(Topo::TriangleList, true, Cmp::Always, None, true),
        // Tests against the estimate without disturbing it
        ProgramKind::VisibilityTest => state(Topo::TriangleList, false, Cmp::LessEqual, Some(VertexLayout::Proxy), true),
        ProgramKind::CompactPointStream => state(Topo::PointList, false, Cmp::Always, None, false),
        ProgramKind::SceneMesh => state(Topo::TriangleList, true, Cmp::Less, Some(VertexLayout::Mesh), true),
        ProgramKind::DebugBoxes => state(Topo::LineList, false, Cmp::Always, Some(VertexLayout::Proxy), true),
        ProgramKind::DebugDepth => state(Topo::TriangleList, false, Cmp::Always, None, true),
        ProgramKind::Reproject | ProgramKind::Downsample | ProgramKind::CompactCompute => {
            state(Topo::TriangleList, false, Cmp::Always, None, false)
        }
    }
}

fn shader_stages(stages: ShaderStages) -> wgpu::ShaderStages {
    let mut out = wgpu::ShaderStages::NONE;
    if stages.contains(ShaderStages::VERTEX) {
        out |= wgpu::ShaderStages::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        out |= wgpu::ShaderStages::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        out |= wgpu::ShaderStages::COMPUTE;
    }
    out
}

fn binding_type(kind: BindingKind) -> wgpu::BindingType {
    let buffer = |ty| wgpu::BindingType::Buffer {
        ty,
        has_dynamic_offset: false,
        min_binding_size: None,
    };
    match kind {
        BindingKind::Uniform => buffer(wgpu::BufferBindingType::Uniform),
        BindingKind::StorageRead => buffer(wgpu::BufferBindingType::Storage { read_only: true }),
        BindingKind::StorageReadWrite => buffer(wgpu::BufferBindingType::Storage { read_only: false }),
        BindingKind::DepthTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Depth,
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
    }
}

/// Expand includes and load-time constants of a program's shader
pub(super) fn shader_code(desc: &ProgramDesc) -> PipelineResult<String> {
    let (name, source) = shader_source(desc.kind);
    let mut preprocessor = WgslPreprocessor::new();
    preprocessor
        .add_source("common.wgsl", COMMON)
        .add_source("compact_common.wgsl", COMPACT_COMMON)
        .define("GROUP_SIZE", desc.workgroup_size[0]);
    preprocessor.process(name, source)
}

pub(super) fn create_program(
    device: &wgpu::Device,
    desc: &ProgramDesc,
    caps: &BackendCapabilities,
) -> PipelineResult<Program> {
    let label = desc.kind.label();
    if desc.kind == ProgramKind::CompactPointStream && !caps.vertex_writable_storage {
        return Err(PipelineError::Unsupported { feature: "vertex writable storage" });
    }
    if desc.kind.is_compute() && desc.threads_per_group() > caps.max_compute_invocations_per_group {
        return Err(program_error(
            label,
            format!("{} invocations per group", desc.threads_per_group()),
        ));
    }
    let code = shader_code(desc)?;

    // Shader and pipeline errors are reported here instead of through the device handler
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(code.into()),
    });
    let entries: Vec<_> = desc
        .kind
        .bindings()
        .iter()
        .map(|slot| wgpu::BindGroupLayoutEntry {
            binding: slot.binding,
            visibility: shader_stages(slot.stages),
            ty: binding_type(slot.kind),
            count: None,
        })
        .collect();
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    });
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let pipeline = if desc.kind.is_compute() {
        Pipeline::Compute(device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&layout),
            module: &module,
            entry_point: "cs_main",
        }))
    } else {
        Pipeline::Render(create_render_pipeline(device, desc, &layout, &module))
    };

    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        return Err(program_error(label, error));
    }
    log::debug!("[create_program] {} ready", label);

    Ok(Program {
        kind: desc.kind,
        bind_group_layout,
        pipeline,
    })
}

fn create_render_pipeline(
    device: &wgpu::Device,
    desc: &ProgramDesc,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
) -> wgpu::RenderPipeline {
    let raster = raster_state(desc.kind);
    let vertex_buffers: Vec<_> = raster.vertex_layout.map(VertexLayout::buffer_layout).into_iter().collect();
    let color_targets: Vec<Option<wgpu::ColorTargetState>> = desc
        .color_format
        .map(|format: TextureFormat| wgpu::ColorTargetState {
            format: to_wgpu_format(format),
            blend: Some(wgpu::BlendState::REPLACE),
            write_mask: wgpu::ColorWrites::ALL,
        })
        .into_iter()
        .map(Some)
        .collect();

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(desc.kind.label()),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: "vs_main",
            buffers: &vertex_buffers,
        },
        primitive: wgpu::PrimitiveState {
            topology: raster.topology,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            unclipped_depth: false,
            polygon_mode: wgpu::PolygonMode::Fill,
            conservative: desc.conservative && desc.kind == ProgramKind::VisibilityTest,
        },
        depth_stencil: desc.depth_format.map(|format| wgpu::DepthStencilState {
            format: to_wgpu_format(format),
            depth_write_enabled: raster.depth_write,
            depth_compare: raster.depth_compare,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        fragment: raster.fragment.then_some(wgpu::FragmentState {
            module,
            entry_point: "fs_main",
            targets: &color_targets,
        }),
        multiview: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::culling::resources::DEPTH_FORMAT;

    const GRAPHICS: [ProgramKind; 6] = [
        ProgramKind::DepthCopy,
        ProgramKind::VisibilityTest,
        ProgramKind::CompactPointStream,
        ProgramKind::SceneMesh,
        ProgramKind::DebugBoxes,
        ProgramKind::DebugDepth,
    ];

    /// Parse and validate the expanded WGSL without a device
    fn validate(desc: &ProgramDesc) -> Result<(), String> {
        let code = shader_code(desc).map_err(|e| e.to_string())?;
        let module = naga::front::wgsl::parse_str(&code).map_err(|e| e.emit_to_string(&code))?;
        naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all())
            .validate(&module)
            .map(|_| ())
            .map_err(|e| format!("{:?}", e.into_inner()))
    }

    #[test]
    fn test_compute_shaders_validate() {
        for (kind, size) in [
            (ProgramKind::Reproject, [16, 16]),
            (ProgramKind::Downsample, [8, 8]),
            (ProgramKind::CompactCompute, [64, 1]),
        ] {
            let desc = ProgramDesc::compute(kind, size);
            if let Err(e) = validate(&desc) {
                panic!("{}: {}", kind.label(), e);
            }
        }
    }

    #[test]
    fn test_graphics_shaders_validate() {
        for kind in GRAPHICS {
            let desc = ProgramDesc::graphics(kind, Some(TextureFormat::Bgra8UnormSrgb), Some(DEPTH_FORMAT));
            if let Err(e) = validate(&desc) {
                panic!("{}: {}", kind.label(), e);
            }
        }
    }

    #[test]
    fn test_group_size_is_substituted() {
        let code = shader_code(&ProgramDesc::compute(ProgramKind::Reproject, [16, 16])).unwrap();
        assert!(code.contains("@workgroup_size(16, 16, 1)"));
        assert!(!code.contains("{{"));
        assert_eq!(code.matches("struct FrameUniforms").count(), 1);
    }

    #[test]
    fn test_only_visibility_writes_no_depth_after_test() {
        assert!(!raster_state(ProgramKind::VisibilityTest).depth_write);
        assert_eq!(raster_state(ProgramKind::VisibilityTest).depth_compare, wgpu::CompareFunction::LessEqual);
        assert!(raster_state(ProgramKind::DepthCopy).depth_write);
        assert!(!raster_state(ProgramKind::CompactPointStream).fragment);
    }
}
