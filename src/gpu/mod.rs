//! GPU backend boundary
//!
//! The pipeline talks to the device only through opaque handles, resource
//! descriptors and recorded [`CommandList`]s. Two devices implement
//! [`GpuBackend`]: [`WgpuBackend`] for real hardware and [`SoftwareBackend`], a
//! CPU device that executes the same command lists with reference kernels.

pub mod backend;
pub mod command;
pub mod layout;
pub mod preprocessor;
pub mod program;
pub mod software;
pub mod validation;
pub mod wgpu_backend;

pub use backend::{BackendCapabilities, FenceValue, GpuBackend};
pub use command::{
    Binding, BindingResource, ColorAttachment, Command, CommandList, ComputePassRecorder,
    DepthAttachment, LoadOp, RenderPassRecorder, Transition, Viewport,
};
pub use program::{BindingKind, BindingSlot, ProgramDesc, ProgramKind};
pub use software::SoftwareBackend;
pub use validation::StateValidator;
pub use wgpu_backend::WgpuBackend;

use bitflags::bitflags;

/// Required alignment of storage buffer binding offsets
pub const STORAGE_OFFSET_ALIGNMENT: u64 = 256;

/// Round `value` up to a multiple of `alignment` (power of two)
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHeapHandle(pub u32);

/// Any resource whose state is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

impl From<BufferHandle> for ResourceId {
    fn from(handle: BufferHandle) -> Self {
        Self::Buffer(handle)
    }
}

impl From<TextureHandle> for ResourceId {
    fn from(handle: TextureHandle) -> Self {
        Self::Texture(handle)
    }
}

/// Explicit resource states; every hand-off between stages is a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    VertexOrConstant,
    IndexBuffer,
    ShaderResource,
    UnorderedAccess,
    IndirectArgument,
    CopySource,
    CopyDest,
    RenderTarget,
    DepthWrite,
    Present,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const COPY_SRC = 1 << 5;
        const COPY_DST = 1 << 6;
        const READBACK = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const DEPTH_TARGET = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

/// Where a buffer lives and how the CPU updates it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Written once at creation, device local afterwards
    Static,
    /// Rewritten by the CPU every frame
    Dynamic,
    /// GPU writes, CPU maps and reads
    Readback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryKind,
    pub initial_state: ResourceState,
}

impl BufferDesc {
    pub fn new(label: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            memory: MemoryKind::Static,
            initial_state: ResourceState::Common,
        }
    }

    pub fn memory(mut self, memory: MemoryKind) -> Self {
        self.memory = memory;
        self
    }

    pub fn state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Depth32Float,
    R32Float,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float)
    }

    pub fn bytes_per_texel(self) -> u32 {
        4
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(2000, 256), 2048);
        assert_eq!(align_up(13, 4), 16);
    }

    #[test]
    fn test_buffer_desc_builder() {
        let desc = BufferDesc::new("vis", 64, BufferUsage::STORAGE)
            .memory(MemoryKind::Dynamic)
            .state(ResourceState::ShaderResource);
        assert_eq!(desc.memory, MemoryKind::Dynamic);
        assert_eq!(desc.initial_state, ResourceState::ShaderResource);
    }
}
