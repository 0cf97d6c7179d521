//! Frame passes
//!
//! Every stage of a frame is one [`Pass`] variant holding only the program
//! handles it runs. Passes record into a [`CommandList`] from a borrowed
//! [`FrameContext`]; every resource they touch is handed back in the state it
//! was found in, so passes can be skipped or reordered by toggles without
//! breaking the barrier chain.

use crate::config::{CompactionVariant, DepthView, PipelineConfig, Toggles};
use crate::error::PipelineResult;
use crate::gpu::{
    Binding, ColorAttachment, CommandList, DepthAttachment, GpuBackend, LoadOp, ProgramDesc,
    ProgramHandle, ProgramKind, RenderPassRecorder, ResourceState, TextureHandle, Transition,
    Viewport,
};

use super::proxy::ProxyGeometry;
use super::resources::{DepthGrid, DepthTargets, FrameSlot, SceneBuffers, DEPTH_FORMAT};
use super::RenderPath;

pub const CLEAR_COLOR: [f32; 4] = [0.05, 0.06, 0.08, 1.0];

/// Everything a pass reads while recording one frame
pub struct FrameContext<'a> {
    pub path: RenderPath,
    pub toggles: &'a Toggles,
    pub slot: &'a FrameSlot,
    pub targets: &'a DepthTargets,
    pub scene: &'a SceneBuffers,
    pub proxy: &'a ProxyGeometry,
    pub backbuffer: TextureHandle,
    pub backbuffer_size: (u32, u32),
    /// Objects that survived CPU frustum culling (baseline path only)
    pub direct_draws: &'a [u32],
    /// Whether the device reads the draw count from the counter
    pub indirect_count: bool,
}

impl FrameContext<'_> {
    pub fn cull_grid(&self) -> &DepthGrid {
        self.targets.cull_grid(self.toggles.downsample)
    }

    /// Grid shown by the depth visualization, if any
    pub fn viewed_grid(&self) -> Option<&DepthGrid> {
        match self.toggles.depth_view {
            DepthView::Off => None,
            DepthView::Half => Some(&self.targets.half),
            DepthView::Quarter => Some(self.cull_grid()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Reproject {
        program: ProgramHandle,
        group_size: u32,
    },
    Downsample {
        program: ProgramHandle,
        group_size: u32,
    },
    DepthCopy {
        program: ProgramHandle,
    },
    VisibilityTest {
        program: ProgramHandle,
    },
    Compaction {
        compute: ProgramHandle,
        group_size: u32,
        /// Absent when the device has no vertex-stage storage writes
        point_stream: Option<ProgramHandle>,
    },
    IndirectDraw {
        program: ProgramHandle,
    },
    DirectDraw {
        program: ProgramHandle,
    },
    DebugOverlay {
        boxes: ProgramHandle,
        depth_view: ProgramHandle,
    },
}

fn groups(extent: u32, group_size: u32) -> u32 {
    extent.div_ceil(group_size.max(1))
}

impl Pass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reproject { .. } => "Reproject",
            Self::Downsample { .. } => "Downsample",
            Self::DepthCopy { .. } => "Depth Copy",
            Self::VisibilityTest { .. } => "Visibility Test",
            Self::Compaction { .. } => "Compaction",
            Self::IndirectDraw { .. } => "Indirect Draw",
            Self::DirectDraw { .. } => "Direct Draw",
            Self::DebugOverlay { .. } => "Debug Overlay",
        }
    }

    pub fn is_active(&self, path: RenderPath, toggles: &Toggles) -> bool {
        let occlusion = path == RenderPath::Occlusion;
        match self {
            Self::Reproject { .. }
            | Self::DepthCopy { .. }
            | Self::VisibilityTest { .. }
            | Self::Compaction { .. }
            | Self::IndirectDraw { .. } => occlusion,
            Self::Downsample { .. } => occlusion && toggles.downsample,
            Self::DirectDraw { .. } => !occlusion,
            Self::DebugOverlay { .. } => {
                toggles.wireframe || (occlusion && toggles.depth_view != DepthView::Off)
            }
        }
    }

    pub fn record(&self, ctx: &FrameContext<'_>, list: &mut CommandList) {
        match *self {
            Self::Reproject { program, group_size } => record_reproject(program, group_size, ctx, list),
            Self::Downsample { program, group_size } => record_downsample(program, group_size, ctx, list),
            Self::DepthCopy { program } => record_depth_copy(program, ctx, list),
            Self::VisibilityTest { program } => record_visibility(program, ctx, list),
            Self::Compaction {
                compute,
                group_size,
                point_stream,
            } => {
                let variant = match (ctx.toggles.compaction, point_stream) {
                    (CompactionVariant::PointStream, Some(points)) => Compaction::PointStream(points),
                    _ => Compaction::Compute(compute, group_size),
                };
                record_compaction(variant, ctx, list)
            }
            Self::IndirectDraw { program } => record_indirect_draw(program, ctx, list),
            Self::DirectDraw { program } => record_direct_draw(program, ctx, list),
            Self::DebugOverlay { boxes, depth_view } => record_debug_overlay(boxes, depth_view, ctx, list),
        }
    }
}

/// Build every pass in frame order
///
/// Group sizes are clamped to the device limits; optional features the device
/// lacks are disabled with a warning.
pub fn create_passes<B: GpuBackend + ?Sized>(backend: &mut B, config: &PipelineConfig) -> PipelineResult<Vec<Pass>> {
    let caps = backend.capabilities().clone();
    let color_format = Some(backend.backbuffer_format());

    let reproject_group = caps.clamp_square_group(config.reproject_group_size);
    if reproject_group != config.reproject_group_size {
        log::warn!(
            "[create_passes] Reproject group {}x{} exceeds device limits, using {}x{}",
            config.reproject_group_size,
            config.reproject_group_size,
            reproject_group,
            reproject_group
        );
    }
    let compaction_group = caps.clamp_linear_group(config.compaction_group_size);
    if compaction_group != config.compaction_group_size {
        log::warn!(
            "[create_passes] Compaction group {} exceeds device limits, using {}",
            config.compaction_group_size,
            compaction_group
        );
    }

    let conservative = config.conservative_raster && caps.conservative_rasterization;
    if config.conservative_raster && !conservative {
        log::warn!("[create_passes] Conservative rasterization unsupported, visibility test uses standard raster");
    }

    let reproject = backend.create_program(&ProgramDesc::compute(
        ProgramKind::Reproject,
        [reproject_group, reproject_group],
    ))?;
    let downsample = backend.create_program(&ProgramDesc::compute(
        ProgramKind::Downsample,
        [reproject_group, reproject_group],
    ))?;
    let depth_copy = backend.create_program(&ProgramDesc::graphics(
        ProgramKind::DepthCopy,
        None,
        Some(DEPTH_FORMAT),
    ))?;
    let visibility = backend.create_program(
        &ProgramDesc::graphics(ProgramKind::VisibilityTest, None, Some(DEPTH_FORMAT))
            .with_conservative(conservative),
    )?;
    let compact_compute = backend.create_program(&ProgramDesc::compute(
        ProgramKind::CompactCompute,
        [compaction_group, 1],
    ))?;
    let point_stream = if caps.vertex_writable_storage {
        match backend.create_program(&ProgramDesc::graphics(
            ProgramKind::CompactPointStream,
            None,
            Some(DEPTH_FORMAT),
        )) {
            Ok(program) => Some(program),
            Err(e) => {
                log::warn!("[create_passes] Point-stream compaction disabled: {}", e);
                None
            }
        }
    } else {
        log::warn!("[create_passes] No vertex-stage storage writes, point-stream compaction disabled");
        None
    };
    let scene_mesh = backend.create_program(&ProgramDesc::graphics(
        ProgramKind::SceneMesh,
        color_format,
        Some(DEPTH_FORMAT),
    ))?;
    let debug_boxes = backend.create_program(&ProgramDesc::graphics(ProgramKind::DebugBoxes, color_format, None))?;
    let debug_depth = backend.create_program(&ProgramDesc::graphics(ProgramKind::DebugDepth, color_format, None))?;

    log::info!(
        "[create_passes] Programs ready on '{}' (reproject group {}, compaction group {}, conservative {}, point stream {})",
        backend.name(),
        reproject_group,
        compaction_group,
        conservative,
        point_stream.is_some()
    );

    Ok(vec![
        Pass::Reproject {
            program: reproject,
            group_size: reproject_group,
        },
        Pass::Downsample {
            program: downsample,
            group_size: reproject_group,
        },
        Pass::DepthCopy { program: depth_copy },
        Pass::VisibilityTest { program: visibility },
        Pass::Compaction {
            compute: compact_compute,
            group_size: compaction_group,
            point_stream,
        },
        Pass::IndirectDraw { program: scene_mesh },
        Pass::DirectDraw { program: scene_mesh },
        Pass::DebugOverlay {
            boxes: debug_boxes,
            depth_view: debug_depth,
        },
    ])
}

/// Far-fill the depth attachment so the next reprojection sees no occluders
pub fn record_depth_prefill(depth: TextureHandle, list: &mut CommandList) {
    let _pass = list.begin_render_pass(
        "Depth Prefill",
        None,
        Some(DepthAttachment {
            texture: depth,
            load: LoadOp::Clear(1.0),
        }),
    );
}

fn record_reproject(program: ProgramHandle, group_size: u32, ctx: &FrameContext<'_>, list: &mut CommandList) {
    let depth = ctx.targets.depth;
    let half = &ctx.targets.half;

    list.barrier([
        Transition::new(depth, ResourceState::DepthWrite, ResourceState::ShaderResource),
        Transition::new(half.buffer, ResourceState::ShaderResource, ResourceState::CopyDest),
    ]);
    list.clear_buffer(half.buffer, 0, None);
    list.transition(half.buffer, ResourceState::CopyDest, ResourceState::UnorderedAccess);
    {
        let mut pass = list.begin_compute_pass("Reproject");
        pass.set_program(program);
        pass.set_bindings([
            Binding::buffer(0, ctx.slot.reproject_uniforms),
            Binding::texture(1, depth),
            Binding::buffer(2, half.buffer),
        ]);
        pass.dispatch(groups(half.width, group_size), groups(half.height, group_size), 1);
    }
    list.barrier([
        Transition::new(half.buffer, ResourceState::UnorderedAccess, ResourceState::ShaderResource),
        Transition::new(depth, ResourceState::ShaderResource, ResourceState::DepthWrite),
    ]);
}

fn record_downsample(program: ProgramHandle, group_size: u32, ctx: &FrameContext<'_>, list: &mut CommandList) {
    let quarter = &ctx.targets.quarter;
    list.transition(quarter.buffer, ResourceState::ShaderResource, ResourceState::UnorderedAccess);
    {
        let mut pass = list.begin_compute_pass("Downsample");
        pass.set_program(program);
        pass.set_bindings([
            Binding::buffer(0, ctx.slot.downsample_uniforms),
            Binding::buffer(1, ctx.targets.half.buffer),
            Binding::buffer(2, quarter.buffer),
        ]);
        pass.dispatch(groups(quarter.width, group_size), groups(quarter.height, group_size), 1);
    }
    list.transition(quarter.buffer, ResourceState::UnorderedAccess, ResourceState::ShaderResource);
}

fn record_depth_copy(program: ProgramHandle, ctx: &FrameContext<'_>, list: &mut CommandList) {
    let grid = ctx.cull_grid();
    let mut pass = list.begin_render_pass(
        "Depth Copy",
        None,
        Some(DepthAttachment {
            texture: ctx.targets.depth,
            load: LoadOp::Load,
        }),
    );
    pass.set_program(program);
    pass.set_viewport(Viewport::from_size(grid.width, grid.height));
    pass.set_bindings([
        Binding::buffer(0, ctx.slot.copy_uniforms),
        Binding::buffer(1, grid.buffer),
    ]);
    pass.draw(3, 1);
}

fn record_visibility(program: ProgramHandle, ctx: &FrameContext<'_>, list: &mut CommandList) {
    let visibility = ctx.slot.visibility;
    let grid = ctx.cull_grid();

    list.transition(visibility, ResourceState::ShaderResource, ResourceState::CopyDest);
    list.clear_buffer(visibility, 0, None);
    list.transition(visibility, ResourceState::CopyDest, ResourceState::UnorderedAccess);
    {
        let mut pass = list.begin_render_pass(
            "Visibility Test",
            None,
            Some(DepthAttachment {
                texture: ctx.targets.depth,
                load: LoadOp::Load,
            }),
        );
        pass.set_program(program);
        pass.set_viewport(Viewport::from_size(grid.width, grid.height));
        pass.set_bindings([
            Binding::buffer(0, ctx.slot.frame_uniforms),
            Binding::buffer(1, ctx.scene.aabb_transforms),
            Binding::buffer(2, visibility),
        ]);
        pass.set_vertex_buffer(ctx.proxy.vertex_buffer, 0);
        pass.set_index_buffer(ctx.proxy.index_buffer, 0);
        pass.draw_indexed(ProxyGeometry::INDEX_COUNT, ctx.scene.object_count, 0, 0, 0);
    }
    list.transition(visibility, ResourceState::UnorderedAccess, ResourceState::ShaderResource);
}

#[derive(Debug, Clone, Copy)]
enum Compaction {
    Compute(ProgramHandle, u32),
    PointStream(ProgramHandle),
}

fn record_compaction(variant: Compaction, ctx: &FrameContext<'_>, list: &mut CommandList) {
    let compacted = ctx.slot.compacted;
    let layout = ctx.scene.append_layout;
    let count = ctx.scene.object_count;

    list.transition(compacted, ResourceState::IndirectArgument, ResourceState::CopyDest);
    list.copy_buffer(ctx.scene.zero, 0, compacted, layout.counter_offset, 4);
    if !ctx.indirect_count {
        // The full capacity is drawn; stale entries must be no-ops
        list.clear_buffer(compacted, 0, Some(layout.entries_size));
    }
    list.transition(compacted, ResourceState::CopyDest, ResourceState::UnorderedAccess);

    let bindings = [
        Binding::buffer(0, ctx.scene.compaction_uniforms),
        Binding::buffer(1, ctx.slot.visibility),
        Binding::buffer(2, ctx.scene.templates),
        Binding::buffer_range(3, compacted, 0, layout.entries_size),
        Binding::buffer_range(4, compacted, layout.counter_offset, 4),
    ];
    match variant {
        Compaction::Compute(program, group_size) => {
            let mut pass = list.begin_compute_pass("Compaction");
            pass.set_program(program);
            pass.set_bindings(bindings);
            pass.dispatch(groups(count, group_size), 1, 1);
        }
        Compaction::PointStream(program) => {
            // Attachment only satisfies the pass; points are clipped away
            let mut pass = list.begin_render_pass(
                "Compaction (point stream)",
                None,
                Some(DepthAttachment {
                    texture: ctx.targets.depth,
                    load: LoadOp::Load,
                }),
            );
            pass.set_program(program);
            pass.set_bindings(bindings);
            pass.draw(count, 1);
        }
    }
    list.transition(compacted, ResourceState::UnorderedAccess, ResourceState::IndirectArgument);
}

fn scene_pass<'l>(
    ctx: &FrameContext<'_>,
    list: &'l mut CommandList,
    label: &str,
    program: ProgramHandle,
) -> RenderPassRecorder<'l> {
    let mut pass = list.begin_render_pass(
        label,
        Some(ColorAttachment {
            texture: ctx.backbuffer,
            load: LoadOp::Clear(CLEAR_COLOR),
        }),
        Some(DepthAttachment {
            texture: ctx.targets.depth,
            load: LoadOp::Clear(1.0),
        }),
    );
    pass.set_program(program);
    pass.set_viewport(Viewport::from_size(ctx.backbuffer_size.0, ctx.backbuffer_size.1));
    pass.set_bindings([
        Binding::buffer(0, ctx.slot.frame_uniforms),
        Binding::buffer(1, ctx.scene.objects),
        Binding::buffer(2, ctx.scene.materials),
    ]);
    pass.set_vertex_buffer(ctx.scene.vertex_buffer, 0);
    pass.set_index_buffer(ctx.scene.index_buffer, 0);
    pass
}

fn record_indirect_draw(program: ProgramHandle, ctx: &FrameContext<'_>, list: &mut CommandList) {
    let compacted = ctx.slot.compacted;
    let layout = ctx.scene.append_layout;
    let mut pass = scene_pass(ctx, list, "Indirect Draw", program);
    pass.draw_indexed_indirect_count(compacted, 0, compacted, layout.counter_offset, layout.capacity);
}

fn record_direct_draw(program: ProgramHandle, ctx: &FrameContext<'_>, list: &mut CommandList) {
    let mut pass = scene_pass(ctx, list, "Direct Draw", program);
    for &object in ctx.direct_draws {
        if let Some(t) = ctx.scene.draw_templates.get(object as usize) {
            pass.draw_indexed(t.index_count, t.instance_count, t.first_index, t.base_vertex, t.first_instance);
        }
    }
}

fn record_debug_overlay(boxes: ProgramHandle, depth_view: ProgramHandle, ctx: &FrameContext<'_>, list: &mut CommandList) {
    let mut pass = list.begin_render_pass(
        "Debug Overlay",
        Some(ColorAttachment {
            texture: ctx.backbuffer,
            load: LoadOp::Load,
        }),
        None,
    );
    pass.set_viewport(Viewport::from_size(ctx.backbuffer_size.0, ctx.backbuffer_size.1));

    let occlusion = ctx.path == RenderPath::Occlusion;
    if occlusion {
        if let Some(grid) = ctx.viewed_grid() {
            pass.set_program(depth_view);
            pass.set_bindings([
                Binding::buffer(0, ctx.slot.debug_uniforms),
                Binding::buffer(1, grid.buffer),
            ]);
            pass.draw(3, 1);
        }
    }

    if ctx.toggles.wireframe {
        let visibility = if occlusion {
            ctx.slot.visibility
        } else {
            ctx.scene.all_visible
        };
        pass.set_program(boxes);
        pass.set_bindings([
            Binding::buffer(0, ctx.slot.frame_uniforms),
            Binding::buffer(1, ctx.scene.aabb_transforms),
            Binding::buffer(2, visibility),
        ]);
        pass.set_vertex_buffer(ctx.proxy.vertex_buffer, 0);
        pass.set_index_buffer(ctx.proxy.line_index_buffer, 0);
        pass.draw_indexed(ProxyGeometry::LINE_INDEX_COUNT, ctx.scene.object_count, 0, 0, 0);
    }
}
