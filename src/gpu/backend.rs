use super::{
    BufferDesc, BufferHandle, CommandList, ProgramDesc, ProgramHandle, QueryHeapHandle,
    TextureDesc, TextureFormat, TextureHandle,
};
use crate::error::PipelineResult;

/// Monotonic value signalled by the queue when a submission completes
pub type FenceValue = u64;

/// Optional device features, probed once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCapabilities {
    pub timestamp_queries: bool,
    /// Ticks per second of the queue timestamp counter
    pub timestamp_frequency: f64,
    pub conservative_rasterization: bool,
    /// Storage writes from the vertex stage (point-stream compaction)
    pub vertex_writable_storage: bool,
    /// GPU-sourced draw counts for indirect draws
    pub indirect_count: bool,
    /// Multiple indirect draws from one command without a count buffer
    pub multi_draw_indirect: bool,
    /// Non-zero `first_instance` in indirect arguments
    pub indirect_first_instance: bool,
    pub max_compute_invocations_per_group: u32,
    pub max_compute_group_size_x: u32,
    pub max_compute_group_size_y: u32,
}

impl BackendCapabilities {
    /// Largest square group edge the device accepts, at most `requested`
    pub fn clamp_square_group(&self, requested: u32) -> u32 {
        let mut edge = requested
            .min(self.max_compute_group_size_x)
            .min(self.max_compute_group_size_y)
            .max(1);
        while edge > 1 && edge * edge > self.max_compute_invocations_per_group {
            edge /= 2;
        }
        edge
    }

    /// Largest linear group size the device accepts, at most `requested`
    pub fn clamp_linear_group(&self, requested: u32) -> u32 {
        requested
            .min(self.max_compute_group_size_x)
            .min(self.max_compute_invocations_per_group)
            .max(1)
    }
}

/// Low-level GPU device the pipeline records against
///
/// Resources are referenced by opaque handles. Command lists are validated
/// against tracked resource states by backends that enable validation.
pub trait GpuBackend {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &BackendCapabilities;

    fn create_buffer(&mut self, desc: &BufferDesc) -> PipelineResult<BufferHandle>;

    /// Create a buffer and upload its initial contents
    fn create_buffer_init(&mut self, desc: &BufferDesc, contents: &[u8]) -> PipelineResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        self.write_buffer(handle, 0, contents)?;
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_texture(&mut self, desc: &TextureDesc) -> PipelineResult<TextureHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn create_program(&mut self, desc: &ProgramDesc) -> PipelineResult<ProgramHandle>;

    fn create_timestamp_heap(&mut self, count: u32) -> PipelineResult<QueryHeapHandle>;

    /// Queue-ordered upload into a buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> PipelineResult<()>;

    /// Queue-ordered upload of a whole texture; the texture must be in `CopyDest`
    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) -> PipelineResult<()>;

    /// Blocking readback of a buffer range
    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> PipelineResult<Vec<u8>>;

    fn backbuffer(&self) -> TextureHandle;

    fn backbuffer_format(&self) -> TextureFormat;

    fn backbuffer_size(&self) -> (u32, u32);

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> PipelineResult<()>;

    /// Acquire the backbuffer for the next frame
    fn begin_frame(&mut self) -> PipelineResult<()>;

    /// Submit a command list; returns the fence value signalled on completion
    fn submit(&mut self, commands: CommandList) -> PipelineResult<FenceValue>;

    fn present(&mut self) -> PipelineResult<()>;

    fn completed_fence(&mut self) -> FenceValue;

    fn wait_for_fence(&mut self, value: FenceValue) -> PipelineResult<()>;

    fn wait_idle(&mut self) -> PipelineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(invocations: u32) -> BackendCapabilities {
        BackendCapabilities {
            timestamp_queries: true,
            timestamp_frequency: 1.0e9,
            conservative_rasterization: false,
            vertex_writable_storage: true,
            indirect_count: true,
            multi_draw_indirect: true,
            indirect_first_instance: true,
            max_compute_invocations_per_group: invocations,
            max_compute_group_size_x: 256,
            max_compute_group_size_y: 256,
        }
    }

    #[test]
    fn test_square_group_clamped_to_invocation_limit() {
        assert_eq!(caps(1024).clamp_square_group(32), 32);
        assert_eq!(caps(256).clamp_square_group(32), 16);
        assert_eq!(caps(64).clamp_square_group(32), 8);
        assert_eq!(caps(256).clamp_square_group(0), 1);
    }

    #[test]
    fn test_linear_group_clamp() {
        assert_eq!(caps(256).clamp_linear_group(64), 64);
        assert_eq!(caps(32).clamp_linear_group(64), 32);
    }
}
