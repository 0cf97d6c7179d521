//! Command-list recording
//!
//! A [`CommandList`] is a flat, backend-neutral sequence of [`Command`]s. Pass
//! recorders push the matching end command when dropped, so recorded lists are
//! always balanced.

use super::{BufferHandle, ProgramHandle, QueryHeapHandle, ResourceId, ResourceState, TextureHandle};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp<T> {
    Load,
    Clear(T),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub texture: TextureHandle,
    pub load: LoadOp<[f32; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub texture: TextureHandle,
    pub load: LoadOp<f32>,
}

/// Viewport in pixels of the bound attachments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingResource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        /// `None` binds to the end of the buffer
        size: Option<u64>,
    },
    Texture(TextureHandle),
}

/// One entry of a descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binding {
    pub slot: u32,
    pub resource: BindingResource,
}

impl Binding {
    pub fn buffer(slot: u32, buffer: BufferHandle) -> Self {
        Self {
            slot,
            resource: BindingResource::Buffer {
                buffer,
                offset: 0,
                size: None,
            },
        }
    }

    pub fn buffer_range(slot: u32, buffer: BufferHandle, offset: u64, size: u64) -> Self {
        Self {
            slot,
            resource: BindingResource::Buffer {
                buffer,
                offset,
                size: Some(size),
            },
        }
    }

    pub fn texture(slot: u32, texture: TextureHandle) -> Self {
        Self {
            slot,
            resource: BindingResource::Texture(texture),
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        match self.resource {
            BindingResource::Buffer { buffer, .. } => ResourceId::Buffer(buffer),
            BindingResource::Texture(texture) => ResourceId::Texture(texture),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl Transition {
    pub fn new(resource: impl Into<ResourceId>, before: ResourceState, after: ResourceState) -> Self {
        Self {
            resource: resource.into(),
            before,
            after,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(Vec<Transition>),
    ClearBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    WriteTimestamp {
        heap: QueryHeapHandle,
        index: u32,
    },
    ResolveTimestamps {
        heap: QueryHeapHandle,
        first: u32,
        count: u32,
        destination: BufferHandle,
        destination_offset: u64,
    },
    BeginComputePass {
        label: String,
    },
    EndComputePass,
    BeginRenderPass {
        label: String,
        color: Option<ColorAttachment>,
        depth: Option<DepthAttachment>,
    },
    EndRenderPass,
    SetProgram(ProgramHandle),
    SetBindings(Vec<Binding>),
    SetViewport(Viewport),
    SetVertexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    /// Indexed indirect draws; the GPU reads the draw count from `count_buffer`
    DrawIndexedIndirectCount {
        args: BufferHandle,
        args_offset: u64,
        count_buffer: BufferHandle,
        count_offset: u64,
        max_count: u32,
    },
}

/// Recorded GPU work for one submission
#[derive(Debug, Default, Clone)]
pub struct CommandList {
    label: String,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Record a batch of transitions; empty batches are dropped
    pub fn barrier(&mut self, transitions: impl IntoIterator<Item = Transition>) {
        let transitions: Vec<_> = transitions.into_iter().collect();
        if !transitions.is_empty() {
            self.commands.push(Command::Barrier(transitions));
        }
    }

    pub fn transition(
        &mut self,
        resource: impl Into<ResourceId>,
        before: ResourceState,
        after: ResourceState,
    ) {
        self.barrier([Transition::new(resource, before, after)]);
    }

    pub fn clear_buffer(&mut self, buffer: BufferHandle, offset: u64, size: Option<u64>) {
        self.commands.push(Command::ClearBuffer {
            buffer,
            offset,
            size,
        });
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.commands.push(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn write_timestamp(&mut self, heap: QueryHeapHandle, index: u32) {
        self.commands.push(Command::WriteTimestamp { heap, index });
    }

    pub fn resolve_timestamps(
        &mut self,
        heap: QueryHeapHandle,
        first: u32,
        count: u32,
        destination: BufferHandle,
        destination_offset: u64,
    ) {
        self.commands.push(Command::ResolveTimestamps {
            heap,
            first,
            count,
            destination,
            destination_offset,
        });
    }

    pub fn begin_compute_pass(&mut self, label: &str) -> ComputePassRecorder<'_> {
        self.commands.push(Command::BeginComputePass {
            label: label.to_string(),
        });
        ComputePassRecorder { list: self }
    }

    pub fn begin_render_pass(
        &mut self,
        label: &str,
        color: Option<ColorAttachment>,
        depth: Option<DepthAttachment>,
    ) -> RenderPassRecorder<'_> {
        self.commands.push(Command::BeginRenderPass {
            label: label.to_string(),
            color,
            depth,
        });
        RenderPassRecorder { list: self }
    }
}

/// Open compute pass; ends when dropped
pub struct ComputePassRecorder<'a> {
    list: &'a mut CommandList,
}

impl ComputePassRecorder<'_> {
    pub fn set_program(&mut self, program: ProgramHandle) {
        self.list.push(Command::SetProgram(program));
    }

    pub fn set_bindings(&mut self, bindings: impl Into<Vec<Binding>>) {
        self.list.push(Command::SetBindings(bindings.into()));
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.list.push(Command::Dispatch { x, y, z });
    }
}

impl Drop for ComputePassRecorder<'_> {
    fn drop(&mut self) {
        self.list.push(Command::EndComputePass);
    }
}

/// Open render pass; ends when dropped
pub struct RenderPassRecorder<'a> {
    list: &'a mut CommandList,
}

impl RenderPassRecorder<'_> {
    pub fn set_program(&mut self, program: ProgramHandle) {
        self.list.push(Command::SetProgram(program));
    }

    pub fn set_bindings(&mut self, bindings: impl Into<Vec<Binding>>) {
        self.list.push(Command::SetBindings(bindings.into()));
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.list.push(Command::SetViewport(viewport));
    }

    pub fn set_vertex_buffer(&mut self, buffer: BufferHandle, offset: u64) {
        self.list.push(Command::SetVertexBuffer { buffer, offset });
    }

    pub fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64) {
        self.list.push(Command::SetIndexBuffer { buffer, offset });
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.list.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.list.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed_indirect_count(
        &mut self,
        args: BufferHandle,
        args_offset: u64,
        count_buffer: BufferHandle,
        count_offset: u64,
        max_count: u32,
    ) {
        self.list.push(Command::DrawIndexedIndirectCount {
            args,
            args_offset,
            count_buffer,
            count_offset,
            max_count,
        });
    }
}

impl Drop for RenderPassRecorder<'_> {
    fn drop(&mut self) {
        self.list.push(Command::EndRenderPass);
    }
}
