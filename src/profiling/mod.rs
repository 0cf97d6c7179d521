//! GPU stage timing

pub mod timer;

pub use timer::{ticks_to_ms, FrameTimings, GpuTimer, StageTiming, TimerQuery};
