//! GPU occlusion culling
//!
//! Frame flow on the occlusion path:
//!
//! 1. reproject last frame's depth into the current view (half resolution)
//! 2. optionally reduce it to quarter resolution
//! 3. copy the estimate into the hardware depth attachment
//! 4. rasterize one AABB proxy per object and mark survivors
//! 5. append the draw templates of marked objects into the compacted buffer
//! 6. draw everything with one indirect call whose count the GPU reads
//!
//! The baseline path replaces all of it with CPU frustum culling and one
//! direct draw per surviving object.

pub mod frustum;
pub mod passes;
pub mod proxy;
pub mod resources;

pub use frustum::{cull_objects, Frustum};
pub use passes::{create_passes, FrameContext, Pass};
pub use proxy::{build_aabb_transforms, build_draw_templates, ProxyGeometry};
pub use resources::{AppendBufferLayout, DepthGrid, DepthTargets, FrameSlot, SceneBuffers};

use std::fmt;

/// Which path renders the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPath {
    Occlusion,
    Baseline,
}

impl fmt::Display for RenderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Occlusion => write!(f, "occlusion"),
            Self::Baseline => write!(f, "baseline"),
        }
    }
}
