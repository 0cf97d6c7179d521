//! GPU occlusion culling with reprojected depth
//!
//! Each frame reprojects the previous frame's depth into the current view,
//! tests one box proxy per object against that estimate, compacts the draw
//! arguments of the survivors on the GPU and draws them with a single indirect
//! call. See [`culling`] for the pass sequence and [`renderer`] for frame
//! orchestration.

pub mod camera;
pub mod config;
pub mod culling;
pub mod error;
pub mod gpu;
pub mod profiling;
pub mod renderer;
pub mod scene;

pub use camera::{Camera, CameraController};
pub use config::{CompactionVariant, DepthView, EngineConfig, PipelineConfig, Toggles};
pub use culling::RenderPath;
pub use error::{PipelineError, PipelineResult};
pub use gpu::{GpuBackend, SoftwareBackend, WgpuBackend};
pub use profiling::FrameTimings;
pub use renderer::{FrameReport, OcclusionRenderer};
pub use scene::{LoadStatus, Scene, SceneSource, SyntheticScene};
