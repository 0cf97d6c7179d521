//! Closed set of GPU programs and their binding layouts
//!
//! Each program kind has a fixed descriptor table. Backends build their
//! pipeline layouts from [`ProgramKind::bindings`], and the state validator
//! uses the same table to check what state bound resources must be in.

use bitflags::bitflags;

use super::TextureFormat;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// How a binding slot is accessed by the program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Uniform,
    StorageRead,
    StorageReadWrite,
    DepthTexture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingSlot {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: ShaderStages,
}

const fn slot(binding: u32, kind: BindingKind, stages: ShaderStages) -> BindingSlot {
    BindingSlot {
        binding,
        kind,
        stages,
    }
}

const VS: ShaderStages = ShaderStages::VERTEX;
const FS: ShaderStages = ShaderStages::FRAGMENT;
const CS: ShaderStages = ShaderStages::COMPUTE;
const VS_FS: ShaderStages = ShaderStages::VERTEX.union(ShaderStages::FRAGMENT);

const REPROJECT_BINDINGS: [BindingSlot; 3] = [
    slot(0, BindingKind::Uniform, CS),
    slot(1, BindingKind::DepthTexture, CS),
    slot(2, BindingKind::StorageReadWrite, CS),
];

const DOWNSAMPLE_BINDINGS: [BindingSlot; 3] = [
    slot(0, BindingKind::Uniform, CS),
    slot(1, BindingKind::StorageRead, CS),
    slot(2, BindingKind::StorageReadWrite, CS),
];

const GRID_VIEW_BINDINGS: [BindingSlot; 2] = [
    slot(0, BindingKind::Uniform, FS),
    slot(1, BindingKind::StorageRead, FS),
];

const VISIBILITY_BINDINGS: [BindingSlot; 3] = [
    slot(0, BindingKind::Uniform, VS_FS),
    slot(1, BindingKind::StorageRead, VS),
    slot(2, BindingKind::StorageReadWrite, FS),
];

const COMPACT_COMPUTE_BINDINGS: [BindingSlot; 5] = [
    slot(0, BindingKind::Uniform, CS),
    slot(1, BindingKind::StorageRead, CS),
    slot(2, BindingKind::StorageRead, CS),
    slot(3, BindingKind::StorageReadWrite, CS),
    slot(4, BindingKind::StorageReadWrite, CS),
];

const COMPACT_POINT_BINDINGS: [BindingSlot; 5] = [
    slot(0, BindingKind::Uniform, VS),
    slot(1, BindingKind::StorageRead, VS),
    slot(2, BindingKind::StorageRead, VS),
    slot(3, BindingKind::StorageReadWrite, VS),
    slot(4, BindingKind::StorageReadWrite, VS),
];

const SCENE_BINDINGS: [BindingSlot; 3] = [
    slot(0, BindingKind::Uniform, VS_FS),
    slot(1, BindingKind::StorageRead, VS),
    slot(2, BindingKind::StorageRead, FS),
];

const DEBUG_BOX_BINDINGS: [BindingSlot; 3] = [
    slot(0, BindingKind::Uniform, VS),
    slot(1, BindingKind::StorageRead, VS),
    slot(2, BindingKind::StorageRead, VS),
];

/// Every program the pipeline runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    /// Previous depth into current clip space at half resolution
    Reproject,
    /// Conservative max reduction of a depth grid
    Downsample,
    /// Full-screen triangle writing a depth grid into the depth attachment
    DepthCopy,
    /// Instanced AABB proxies marking visibility
    VisibilityTest,
    /// Compute append of visible draw templates
    CompactCompute,
    /// Point-list append of visible draw templates
    CompactPointStream,
    /// Scene geometry drawn from the shared vertex/index buffers
    SceneMesh,
    /// AABB wireframe colored by visibility
    DebugBoxes,
    /// Grayscale view of a depth grid
    DebugDepth,
}

impl ProgramKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Reproject => "Reproject",
            Self::Downsample => "Downsample",
            Self::DepthCopy => "Depth Copy",
            Self::VisibilityTest => "Visibility Test",
            Self::CompactCompute => "Compact (compute)",
            Self::CompactPointStream => "Compact (point stream)",
            Self::SceneMesh => "Scene Mesh",
            Self::DebugBoxes => "Debug Boxes",
            Self::DebugDepth => "Debug Depth",
        }
    }

    pub fn is_compute(self) -> bool {
        matches!(
            self,
            Self::Reproject | Self::Downsample | Self::CompactCompute
        )
    }

    pub fn bindings(self) -> &'static [BindingSlot] {
        match self {
            Self::Reproject => &REPROJECT_BINDINGS,
            Self::Downsample => &DOWNSAMPLE_BINDINGS,
            Self::DepthCopy | Self::DebugDepth => &GRID_VIEW_BINDINGS,
            Self::VisibilityTest => &VISIBILITY_BINDINGS,
            Self::CompactCompute => &COMPACT_COMPUTE_BINDINGS,
            Self::CompactPointStream => &COMPACT_POINT_BINDINGS,
            Self::SceneMesh => &SCENE_BINDINGS,
            Self::DebugBoxes => &DEBUG_BOX_BINDINGS,
        }
    }
}

/// Everything a backend needs to build a program
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDesc {
    pub kind: ProgramKind,
    pub color_format: Option<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    /// Thread group size for compute kinds; `[x, 1]` for linear kernels
    pub workgroup_size: [u32; 2],
    /// Conservative rasterization, only honored by the visibility test
    pub conservative: bool,
}

impl ProgramDesc {
    pub fn compute(kind: ProgramKind, workgroup_size: [u32; 2]) -> Self {
        Self {
            kind,
            color_format: None,
            depth_format: None,
            workgroup_size,
            conservative: false,
        }
    }

    pub fn graphics(
        kind: ProgramKind,
        color_format: Option<TextureFormat>,
        depth_format: Option<TextureFormat>,
    ) -> Self {
        Self {
            kind,
            color_format,
            depth_format,
            workgroup_size: [1, 1],
            conservative: false,
        }
    }

    pub fn with_conservative(mut self, conservative: bool) -> Self {
        self.conservative = conservative;
        self
    }

    pub fn threads_per_group(&self) -> u32 {
        self.workgroup_size[0] * self.workgroup_size[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ProgramKind; 9] = [
        ProgramKind::Reproject,
        ProgramKind::Downsample,
        ProgramKind::DepthCopy,
        ProgramKind::VisibilityTest,
        ProgramKind::CompactCompute,
        ProgramKind::CompactPointStream,
        ProgramKind::SceneMesh,
        ProgramKind::DebugBoxes,
        ProgramKind::DebugDepth,
    ];

    #[test]
    fn test_bindings_are_dense() {
        for kind in ALL {
            for (i, slot) in kind.bindings().iter().enumerate() {
                assert_eq!(slot.binding as usize, i, "{:?}", kind);
            }
        }
    }

    #[test]
    fn test_compute_kinds_bind_compute_stage_only() {
        for kind in ALL.into_iter().filter(|k| k.is_compute()) {
            assert!(kind
                .bindings()
                .iter()
                .all(|slot| slot.stages == ShaderStages::COMPUTE));
        }
    }

    #[test]
    fn test_compaction_variants_share_layout_shape() {
        let compute = ProgramKind::CompactCompute.bindings();
        let points = ProgramKind::CompactPointStream.bindings();
        assert_eq!(compute.len(), points.len());
        for (a, b) in compute.iter().zip(points) {
            assert_eq!(a.kind, b.kind);
        }
    }
}
