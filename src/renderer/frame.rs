use glam::Mat4;

use crate::culling::RenderPath;
use crate::gpu::FenceValue;

/// What the last submitted frame did
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub path: RenderPath,
    pub slot: usize,
    /// Objects handed to the draw stage: all objects on the occlusion path,
    /// frustum survivors on the baseline path
    pub draw_candidates: u32,
}

/// Frame numbering, slot fences and reprojection history
#[derive(Debug, Clone)]
pub struct FrameCounters {
    pub frame_index: u64,
    slot_fences: Vec<Option<FenceValue>>,
    /// Whether the depth buffer holds a frame rendered with `prev_view_proj`
    pub history_valid: bool,
    pub prev_view_proj: Mat4,
}

impl FrameCounters {
    pub fn new(slots: usize) -> Self {
        Self {
            frame_index: 0,
            slot_fences: vec![None; slots.max(1)],
            history_valid: false,
            prev_view_proj: Mat4::IDENTITY,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_fences.len()
    }

    pub fn slot_index(&self) -> usize {
        (self.frame_index % self.slot_fences.len() as u64) as usize
    }

    /// Fence of the last submission that used `slot`
    pub fn slot_fence(&self, slot: usize) -> Option<FenceValue> {
        self.slot_fences.get(slot).copied().flatten()
    }

    pub fn finish_frame(&mut self, fence: FenceValue, view_proj: Mat4, depth_written: bool) {
        let slot = self.slot_index();
        self.slot_fences[slot] = Some(fence);
        self.prev_view_proj = view_proj;
        self.history_valid = depth_written;
        self.frame_index += 1;
    }

    /// Next frame starts from a far-filled depth buffer
    pub fn invalidate_history(&mut self) {
        self.history_valid = false;
    }

    /// After a resize: the GPU is idle and the depth buffer is new
    pub fn reset(&mut self) {
        self.slot_fences.iter_mut().for_each(|f| *f = None);
        self.history_valid = false;
    }
}
