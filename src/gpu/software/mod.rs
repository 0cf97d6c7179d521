//! CPU reference device
//!
//! Executes command lists synchronously with the kernels in [`kernels`]. Every
//! submission goes through the [`StateValidator`], so barrier mistakes surface
//! as errors exactly where a debug-layer GPU run would report them. Timestamps
//! come from a deterministic tick counter advanced by each command's work.

pub mod kernels;

use std::collections::{HashMap, HashSet};

use glam::{Mat4, Vec3, Vec4};

use self::kernels::{DepthSurface, PixelRect};
use super::command::{Binding, BindingResource, Command, CommandList, Viewport};
use super::layout::{
    CompactionUniforms, DrawIndexedArgs, DrawTemplate, FrameUniforms, GridUniforms, MeshVertex,
    ObjectGpuData, ProxyVertex, ReprojectUniforms, DRAW_ARGS_STRIDE,
};
use super::{
    BackendCapabilities, BufferDesc, BufferHandle, FenceValue, GpuBackend, ProgramDesc,
    ProgramHandle, ProgramKind, QueryHeapHandle, ResourceState, StateValidator, TextureDesc,
    TextureFormat, TextureHandle, TextureUsage,
};
use crate::error::{resource_error, PipelineError, PipelineResult};

/// Fixed cost of any command in timestamp ticks
const COMMAND_TICKS: u64 = 100;

/// Work counters of the last submission
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SoftwareStats {
    pub dispatches: u32,
    /// Direct draw commands
    pub draws: u32,
    /// Indirect draw commands
    pub indirect_calls: u32,
    /// Non-empty draws executed from indirect arguments
    pub indirect_draws: u32,
    pub barriers: u32,
    pub programs_used: Vec<ProgramKind>,
    /// Every buffer referenced by a descriptor table
    pub bound_buffers: HashSet<BufferHandle>,
}

struct SoftBuffer {
    desc: BufferDesc,
    words: Vec<u32>,
}

struct SoftTexture {
    desc: TextureDesc,
    texels: Vec<f32>,
}

#[derive(Default)]
struct DrawState {
    depth: Option<TextureHandle>,
    viewport: Option<Viewport>,
    program: Option<ProgramHandle>,
    bindings: Vec<Binding>,
    vertex_buffer: Option<(BufferHandle, u64)>,
    index_buffer: Option<(BufferHandle, u64)>,
}

pub struct SoftwareBackend {
    capabilities: BackendCapabilities,
    buffers: Vec<Option<SoftBuffer>>,
    textures: Vec<Option<SoftTexture>>,
    programs: Vec<ProgramDesc>,
    query_heaps: Vec<Vec<u64>>,
    validator: StateValidator,
    backbuffer: TextureHandle,
    clock: u64,
    submitted: FenceValue,
    stats: SoftwareStats,
    presented_frames: u64,
    last_submission: Option<CommandList>,
}

impl SoftwareBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capabilities(width, height, Self::default_capabilities())
    }

    pub fn default_capabilities() -> BackendCapabilities {
        BackendCapabilities {
            timestamp_queries: true,
            timestamp_frequency: 1.0e9,
            conservative_rasterization: true,
            vertex_writable_storage: true,
            indirect_count: true,
            multi_draw_indirect: true,
            indirect_first_instance: true,
            max_compute_invocations_per_group: 1024,
            max_compute_group_size_x: 1024,
            max_compute_group_size_y: 1024,
        }
    }

    pub fn with_capabilities(width: u32, height: u32, capabilities: BackendCapabilities) -> Self {
        let mut backend = Self {
            capabilities,
            buffers: Vec::new(),
            textures: Vec::new(),
            programs: Vec::new(),
            query_heaps: Vec::new(),
            validator: StateValidator::new(),
            backbuffer: TextureHandle(0),
            clock: 0,
            submitted: 0,
            stats: SoftwareStats::default(),
            presented_frames: 0,
            last_submission: None,
        };
        let desc = TextureDesc {
            label: "Backbuffer".to_string(),
            width: width.max(1),
            height: height.max(1),
            format: TextureFormat::Bgra8UnormSrgb,
            usage: TextureUsage::RENDER_TARGET,
            initial_state: ResourceState::Present,
        };
        backend.backbuffer = backend.insert_texture(desc);
        backend
    }

    /// Counters of the most recent submission
    pub fn stats(&self) -> &SoftwareStats {
        &self.stats
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented_frames
    }

    /// The most recently executed command list
    pub fn last_submission(&self) -> Option<&CommandList> {
        self.last_submission.as_ref()
    }

    pub fn resource_state(&self, resource: impl Into<super::ResourceId>) -> Option<ResourceState> {
        self.validator.state(resource)
    }

    pub fn buffer_desc(&self, buffer: BufferHandle) -> Option<&BufferDesc> {
        self.buffers.get(buffer.0 as usize)?.as_ref().map(|b| &b.desc)
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<&TextureDesc> {
        self.textures.get(texture.0 as usize)?.as_ref().map(|t| &t.desc)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    /// Copy of a texture's texels (channel 0)
    pub fn read_texture(&self, texture: TextureHandle) -> PipelineResult<Vec<f32>> {
        Ok(self.texture(texture)?.texels.clone())
    }

    fn insert_texture(&mut self, desc: TextureDesc) -> TextureHandle {
        let handle = TextureHandle(self.textures.len() as u32);
        self.validator.register(handle, desc.initial_state);
        let texels = vec![0.0; (desc.width * desc.height) as usize];
        self.textures.push(Some(SoftTexture { desc, texels }));
        handle
    }

    fn buffer(&self, handle: BufferHandle) -> PipelineResult<&SoftBuffer> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(PipelineError::InvalidHandle { kind: "buffer", index: handle.0 })
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> PipelineResult<&mut SoftBuffer> {
        self.buffers
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(PipelineError::InvalidHandle { kind: "buffer", index: handle.0 })
    }

    fn texture(&self, handle: TextureHandle) -> PipelineResult<&SoftTexture> {
        self.textures
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(PipelineError::InvalidHandle { kind: "texture", index: handle.0 })
    }

    fn texture_mut(&mut self, handle: TextureHandle) -> PipelineResult<&mut SoftTexture> {
        self.textures
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(PipelineError::InvalidHandle { kind: "texture", index: handle.0 })
    }

    fn program(&self, handle: ProgramHandle) -> PipelineResult<&ProgramDesc> {
        self.programs
            .get(handle.0 as usize)
            .ok_or(PipelineError::InvalidHandle { kind: "program", index: handle.0 })
    }

    fn check_range(desc: &BufferDesc, offset: u64, size: u64) -> PipelineResult<()> {
        if offset % 4 != 0 || size % 4 != 0 || offset + size > desc.size.next_multiple_of(4) {
            return Err(PipelineError::OutOfBounds {
                label: desc.label.clone(),
                offset,
                size,
                capacity: desc.size,
            });
        }
        Ok(())
    }

    /// Word range of a buffer binding
    fn binding_range(&self, binding: &Binding) -> PipelineResult<(BufferHandle, std::ops::Range<usize>)> {
        match binding.resource {
            BindingResource::Buffer { buffer, offset, size } => {
                let desc = &self.buffer(buffer)?.desc;
                let size = size.unwrap_or(desc.size.saturating_sub(offset));
                Self::check_range(desc, offset, size.next_multiple_of(4))?;
                let start = (offset / 4) as usize;
                Ok((buffer, start..start + (size / 4) as usize))
            }
            BindingResource::Texture(texture) => Err(PipelineError::CommandList {
                message: format!("texture {} bound to a buffer slot", texture.0),
            }),
        }
    }

    fn bound_words(&self, state: &DrawState, slot: u32) -> PipelineResult<&[u32]> {
        let binding = Self::find_binding(state, slot)?;
        let (buffer, range) = self.binding_range(binding)?;
        Ok(&self.buffer(buffer)?.words[range])
    }

    fn bound_uniform<T: bytemuck::Pod>(&self, state: &DrawState, slot: u32) -> PipelineResult<T> {
        let words = self.bound_words(state, slot)?;
        let bytes: &[u8] = bytemuck::cast_slice(words);
        if bytes.len() < std::mem::size_of::<T>() {
            return Err(PipelineError::CommandList {
                message: format!("uniform at slot {} is too small", slot),
            });
        }
        Ok(bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<T>()]))
    }

    fn bound_records<T: bytemuck::Pod>(&self, state: &DrawState, slot: u32) -> PipelineResult<Vec<T>> {
        let words = self.bound_words(state, slot)?;
        let bytes: &[u8] = bytemuck::cast_slice(words);
        let size = std::mem::size_of::<T>();
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    fn find_binding(state: &DrawState, slot: u32) -> PipelineResult<&Binding> {
        state
            .bindings
            .iter()
            .find(|b| b.slot == slot)
            .ok_or_else(|| PipelineError::CommandList {
                message: format!("no binding at slot {}", slot),
            })
    }

    fn bound_texture(state: &DrawState, slot: u32) -> PipelineResult<TextureHandle> {
        match Self::find_binding(state, slot)?.resource {
            BindingResource::Texture(texture) => Ok(texture),
            BindingResource::Buffer { buffer, .. } => Err(PipelineError::CommandList {
                message: format!("buffer {} bound to a texture slot", buffer.0),
            }),
        }
    }

    /// Take a bound buffer's storage out for writing; must be handed back with `restore_words`
    fn take_words(&mut self, buffer: BufferHandle) -> PipelineResult<Vec<u32>> {
        Ok(std::mem::take(&mut self.buffer_mut(buffer)?.words))
    }

    fn restore_words(&mut self, buffer: BufferHandle, words: Vec<u32>) -> PipelineResult<()> {
        self.buffer_mut(buffer)?.words = words;
        Ok(())
    }

    fn viewport_rect(state: &DrawState, width: u32, height: u32) -> PixelRect {
        match state.viewport {
            Some(v) => PixelRect {
                x: v.x.max(0.0) as u32,
                y: v.y.max(0.0) as u32,
                width: (v.width.max(0.0) as u32).min(width),
                height: (v.height.max(0.0) as u32).min(height),
            },
            None => PixelRect { x: 0, y: 0, width, height },
        }
    }

    fn execute(&mut self, list: &CommandList) -> PipelineResult<()> {
        let mut state = DrawState::default();

        for command in list.commands() {
            self.clock += COMMAND_TICKS;
            match command {
                Command::Barrier(transitions) => {
                    self.stats.barriers += transitions.len() as u32;
                }
                Command::ClearBuffer { buffer, offset, size } => {
                    let target = self.buffer_mut(*buffer)?;
                    let size = size.unwrap_or(target.desc.size.saturating_sub(*offset));
                    Self::check_range(&target.desc, *offset, size)?;
                    let start = (*offset / 4) as usize;
                    target.words[start..start + (size / 4) as usize].fill(0);
                }
                Command::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                    let source = self.buffer(*src)?;
                    Self::check_range(&source.desc, *src_offset, *size)?;
                    let start = (*src_offset / 4) as usize;
                    let words = source.words[start..start + (*size / 4) as usize].to_vec();
                    let target = self.buffer_mut(*dst)?;
                    Self::check_range(&target.desc, *dst_offset, *size)?;
                    let start = (*dst_offset / 4) as usize;
                    target.words[start..start + words.len()].copy_from_slice(&words);
                }
                Command::WriteTimestamp { heap, index } => {
                    let clock = self.clock;
                    let slot = self
                        .query_heaps
                        .get_mut(heap.0 as usize)
                        .and_then(|h| h.get_mut(*index as usize))
                        .ok_or(PipelineError::InvalidHandle { kind: "query", index: *index })?;
                    *slot = clock;
                }
                Command::ResolveTimestamps { heap, first, count, destination, destination_offset } => {
                    let values: Vec<u64> = self
                        .query_heaps
                        .get(heap.0 as usize)
                        .and_then(|h| h.get(*first as usize..(*first + *count) as usize))
                        .ok_or(PipelineError::InvalidHandle { kind: "query heap", index: heap.0 })?
                        .to_vec();
                    let words: &[u32] = bytemuck::cast_slice(&values);
                    let target = self.buffer_mut(*destination)?;
                    Self::check_range(&target.desc, *destination_offset, words.len() as u64 * 4)?;
                    let start = (*destination_offset / 4) as usize;
                    target.words[start..start + words.len()].copy_from_slice(words);
                }
                Command::BeginComputePass { .. } => {
                    state = DrawState::default();
                }
                Command::BeginRenderPass { color: _, depth, .. } => {
                    state = DrawState::default();
                    if let Some(depth) = depth {
                        if let super::LoadOp::Clear(value) = depth.load {
                            self.texture_mut(depth.texture)?.texels.fill(value);
                        }
                        state.depth = Some(depth.texture);
                    }
                }
                Command::EndComputePass | Command::EndRenderPass => {
                    state = DrawState::default();
                }
                Command::SetProgram(program) => {
                    let kind = self.program(*program)?.kind;
                    if !self.stats.programs_used.contains(&kind) {
                        self.stats.programs_used.push(kind);
                    }
                    state.program = Some(*program);
                }
                Command::SetBindings(bindings) => {
                    for binding in bindings {
                        if let BindingResource::Buffer { buffer, .. } = binding.resource {
                            self.stats.bound_buffers.insert(buffer);
                        }
                    }
                    state.bindings = bindings.clone();
                }
                Command::SetViewport(viewport) => state.viewport = Some(*viewport),
                Command::SetVertexBuffer { buffer, offset } => state.vertex_buffer = Some((*buffer, *offset)),
                Command::SetIndexBuffer { buffer, offset } => state.index_buffer = Some((*buffer, *offset)),
                Command::Dispatch { x, y, z } => {
                    self.stats.dispatches += 1;
                    self.dispatch(&state, [*x, *y, *z])?;
                }
                Command::Draw { vertex_count, instance_count, first_vertex, .. } => {
                    self.stats.draws += 1;
                    self.draw(&state, *first_vertex..*first_vertex + *vertex_count, *instance_count)?;
                }
                Command::DrawIndexed { index_count, instance_count, first_index, base_vertex, first_instance } => {
                    self.stats.draws += 1;
                    let args = DrawIndexedArgs {
                        index_count: *index_count,
                        instance_count: *instance_count,
                        first_index: *first_index,
                        base_vertex: *base_vertex,
                        first_instance: *first_instance,
                    };
                    self.draw_indexed(&state, &args)?;
                }
                Command::DrawIndexedIndirectCount { args, args_offset, count_buffer, count_offset, max_count } => {
                    self.stats.indirect_calls += 1;
                    let count = {
                        let counter = self.buffer(*count_buffer)?;
                        Self::check_range(&counter.desc, *count_offset, 4)?;
                        counter.words[(*count_offset / 4) as usize].min(*max_count)
                    };
                    let entries: Vec<DrawIndexedArgs> = {
                        let source = self.buffer(*args)?;
                        let size = count as u64 * DRAW_ARGS_STRIDE;
                        Self::check_range(&source.desc, *args_offset, size)?;
                        let start = (*args_offset / 4) as usize;
                        bytemuck::cast_slice::<u32, u8>(&source.words[start..start + (size / 4) as usize])
                            .chunks_exact(DRAW_ARGS_STRIDE as usize)
                            .map(bytemuck::pod_read_unaligned::<DrawIndexedArgs>)
                            .collect()
                    };
                    for entry in entries.iter().filter(|e| e.index_count > 0 && e.instance_count > 0) {
                        self.stats.indirect_draws += 1;
                        self.draw_indexed(&state, entry)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, state: &DrawState, groups: [u32; 3]) -> PipelineResult<()> {
        let program = state.program.ok_or_else(|| PipelineError::CommandList {
            message: "dispatch without program".into(),
        })?;
        let desc = self.program(program)?.clone();
        let threads = (
            groups[0] * desc.workgroup_size[0],
            groups[1] * desc.workgroup_size[1] * groups[2],
        );
        self.clock += threads.0 as u64 * threads.1 as u64;

        match desc.kind {
            ProgramKind::Reproject => {
                let params: ReprojectUniforms = self.bound_uniform(state, 0)?;
                let depth = self.texture(Self::bound_texture(state, 1)?)?.texels.clone();
                let (grid, range) = self.binding_range(Self::find_binding(state, 2)?)?;
                let mut words = self.take_words(grid)?;
                kernels::reproject(&params, &depth, &mut words[range], threads);
                self.restore_words(grid, words)
            }
            ProgramKind::Downsample => {
                let params: GridUniforms = self.bound_uniform(state, 0)?;
                let src = self.bound_words(state, 1)?.to_vec();
                let (dst, range) = self.binding_range(Self::find_binding(state, 2)?)?;
                let mut words = self.take_words(dst)?;
                kernels::downsample(&params, &src, &mut words[range], threads);
                self.restore_words(dst, words)
            }
            ProgramKind::CompactCompute => self.compact(state, (0..threads.0).collect()),
            other => Err(PipelineError::CommandList {
                message: format!("{} is not a compute program", other.label()),
            }),
        }
    }

    fn compact(&mut self, state: &DrawState, order: Vec<u32>) -> PipelineResult<()> {
        let params: CompactionUniforms = self.bound_uniform(state, 0)?;
        let visibility = self.bound_words(state, 1)?.to_vec();
        let templates: Vec<DrawTemplate> = self.bound_records(state, 2)?;
        let (entries_buffer, entries_range) = self.binding_range(Self::find_binding(state, 3)?)?;
        let (counter_buffer, counter_range) = self.binding_range(Self::find_binding(state, 4)?)?;

        let mut entries_words = self.take_words(entries_buffer)?;
        let mut counter = if counter_buffer == entries_buffer {
            entries_words[counter_range.start]
        } else {
            self.buffer(counter_buffer)?.words[counter_range.start]
        };

        let mut entries: Vec<DrawIndexedArgs> = bytemuck::cast_slice::<u32, u8>(&entries_words[entries_range.clone()])
            .chunks_exact(DRAW_ARGS_STRIDE as usize)
            .map(bytemuck::pod_read_unaligned::<DrawIndexedArgs>)
            .collect();
        kernels::compact(&params, &visibility, &templates, &mut entries, &mut counter, order.into_iter());

        let packed: &[u32] = bytemuck::cast_slice(&entries);
        entries_words[entries_range.start..entries_range.start + packed.len()].copy_from_slice(packed);
        if counter_buffer == entries_buffer {
            entries_words[counter_range.start] = counter;
            self.restore_words(entries_buffer, entries_words)
        } else {
            self.restore_words(entries_buffer, entries_words)?;
            self.buffer_mut(counter_buffer)?.words[counter_range.start] = counter;
            Ok(())
        }
    }

    fn draw(&mut self, state: &DrawState, vertices: std::ops::Range<u32>, _instances: u32) -> PipelineResult<()> {
        let program = state.program.ok_or_else(|| PipelineError::CommandList {
            message: "draw without program".into(),
        })?;
        match self.program(program)?.kind {
            ProgramKind::DepthCopy => {
                let params: GridUniforms = self.bound_uniform(state, 0)?;
                let grid = self.bound_words(state, 1)?.to_vec();
                let depth = state.depth.ok_or_else(|| PipelineError::CommandList {
                    message: "depth copy without depth attachment".into(),
                })?;
                let (width, height) = {
                    let desc = &self.texture(depth)?.desc;
                    (desc.width, desc.height)
                };
                let viewport = Self::viewport_rect(state, width, height);
                self.clock += viewport.width as u64 * viewport.height as u64;
                let target = self.texture_mut(depth)?;
                let mut surface = DepthSurface { texels: &mut target.texels, width, height };
                kernels::copy_grid_to_depth(&params, &grid, &mut surface, viewport);
                Ok(())
            }
            ProgramKind::CompactPointStream => {
                // Vertex invocation order is unspecified; walk backwards
                self.compact(state, vertices.rev().collect())
            }
            _ => Ok(()),
        }
    }

    fn draw_indexed(&mut self, state: &DrawState, args: &DrawIndexedArgs) -> PipelineResult<()> {
        let program = state.program.ok_or_else(|| PipelineError::CommandList {
            message: "draw without program".into(),
        })?;
        let (kind, conservative) = {
            let desc = self.program(program)?;
            (desc.kind, desc.conservative)
        };
        if !matches!(kind, ProgramKind::VisibilityTest | ProgramKind::SceneMesh) {
            return Ok(());
        }

        let depth = state.depth.ok_or_else(|| PipelineError::CommandList {
            message: format!("{} without depth attachment", kind.label()),
        })?;
        let indices = self.fetch_indices(state, args)?;
        let frame: FrameUniforms = self.bound_uniform(state, 0)?;
        let (width, height) = {
            let desc = &self.texture(depth)?.desc;
            (desc.width, desc.height)
        };
        let viewport = Self::viewport_rect(state, width, height);

        match kind {
            ProgramKind::VisibilityTest => {
                let positions: Vec<ProxyVertex> = self.vertex_records(state)?;
                let triangles: Vec<Vec3> = indices
                    .iter()
                    .filter_map(|&i| positions.get((i as i64 + args.base_vertex as i64) as usize))
                    .map(|v| Vec3::from_array(v.position))
                    .collect();
                let transforms: Vec<Mat4> = self
                    .bound_records::<[[f32; 4]; 4]>(state, 1)?
                    .iter()
                    .map(Mat4::from_cols_array_2d)
                    .collect();
                let (vis_buffer, vis_range) = self.binding_range(Self::find_binding(state, 2)?)?;
                let instances = args.first_instance..args.first_instance + args.instance_count;
                self.clock += args.instance_count as u64 * 8;

                let mut vis_words = self.take_words(vis_buffer)?;
                let mut texels = std::mem::take(&mut self.texture_mut(depth)?.texels);
                let surface = DepthSurface { texels: &mut texels, width, height };
                kernels::visibility_test(
                    &frame,
                    &transforms,
                    &triangles,
                    &surface,
                    viewport,
                    conservative,
                    &mut vis_words[vis_range],
                    instances,
                );
                self.texture_mut(depth)?.texels = texels;
                self.restore_words(vis_buffer, vis_words)
            }
            _ => {
                let vertices: Vec<MeshVertex> = self.vertex_records(state)?;
                let objects: Vec<ObjectGpuData> = self.bound_records(state, 1)?;
                let view_proj = frame.view_proj();
                let mut texels = std::mem::take(&mut self.texture_mut(depth)?.texels);
                let mut surface = DepthSurface { texels: &mut texels, width, height };
                let mut fragments = 0u64;
                for instance in 0..args.instance_count {
                    let object = (args.first_instance + instance) as usize;
                    let Some(object) = objects.get(object) else { continue };
                    let mvp = view_proj * Mat4::from_cols_array_2d(&object.model);
                    for tri in indices.chunks_exact(3) {
                        let mut clip = [Vec4::ZERO; 3];
                        for (corner, &index) in clip.iter_mut().zip(tri) {
                            let vertex = (index as i64 + args.base_vertex as i64) as usize;
                            let Some(vertex) = vertices.get(vertex) else { continue };
                            *corner = mvp * Vec3::from_array(vertex.position).extend(1.0);
                        }
                        fragments += kernels::rasterize_triangle(&mut surface, viewport, clip) as u64 + 1;
                    }
                }
                self.clock += fragments;
                self.texture_mut(depth)?.texels = texels;
                Ok(())
            }
        }
    }

    fn fetch_indices(&self, state: &DrawState, args: &DrawIndexedArgs) -> PipelineResult<Vec<u32>> {
        let (buffer, offset) = state.index_buffer.ok_or_else(|| PipelineError::CommandList {
            message: "indexed draw without index buffer".into(),
        })?;
        let source = self.buffer(buffer)?;
        let start = (offset / 4) as usize + args.first_index as usize;
        let end = start + args.index_count as usize;
        source.words.get(start..end).map(<[u32]>::to_vec).ok_or_else(|| PipelineError::OutOfBounds {
            label: source.desc.label.clone(),
            offset: end as u64 * 4,
            size: 0,
            capacity: source.desc.size,
        })
    }

    fn vertex_records<T: bytemuck::Pod>(&self, state: &DrawState) -> PipelineResult<Vec<T>> {
        let (buffer, offset) = state.vertex_buffer.ok_or_else(|| PipelineError::CommandList {
            message: "draw without vertex buffer".into(),
        })?;
        let source = self.buffer(buffer)?;
        let bytes: &[u8] = bytemuck::cast_slice(&source.words);
        let bytes = bytes.get(offset as usize..source.desc.size as usize).unwrap_or(&[]);
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> PipelineResult<BufferHandle> {
        if desc.size == 0 {
            return Err(resource_error(&desc.label, "zero-sized buffer"));
        }
        let handle = BufferHandle(self.buffers.len() as u32);
        self.validator.register(handle, desc.initial_state);
        self.buffers.push(Some(SoftBuffer {
            desc: desc.clone(),
            words: vec![0; desc.size.div_ceil(4) as usize],
        }));
        log::trace!("[SoftwareBackend::create_buffer] {} ({} bytes)", desc.label, desc.size);
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(slot) = self.buffers.get_mut(buffer.0 as usize) {
            *slot = None;
            self.validator.forget(buffer);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> PipelineResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(resource_error(&desc.label, "zero-sized texture"));
        }
        Ok(self.insert_texture(desc.clone()))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(slot) = self.textures.get_mut(texture.0 as usize) {
            *slot = None;
            self.validator.forget(texture);
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> PipelineResult<ProgramHandle> {
        if desc.kind.is_compute() {
            let invocations = desc.threads_per_group();
            if invocations == 0 || invocations > self.capabilities.max_compute_invocations_per_group {
                return Err(crate::error::program_error(
                    desc.kind.label(),
                    format!("{} invocations per group", invocations),
                ));
            }
        }
        if desc.kind == ProgramKind::CompactPointStream && !self.capabilities.vertex_writable_storage {
            return Err(PipelineError::Unsupported { feature: "vertex writable storage" });
        }
        let handle = ProgramHandle(self.programs.len() as u32);
        self.programs.push(desc.clone());
        Ok(handle)
    }

    fn create_timestamp_heap(&mut self, count: u32) -> PipelineResult<QueryHeapHandle> {
        if !self.capabilities.timestamp_queries {
            return Err(PipelineError::Unsupported { feature: "timestamp queries" });
        }
        let handle = QueryHeapHandle(self.query_heaps.len() as u32);
        self.query_heaps.push(vec![0; count as usize]);
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> PipelineResult<()> {
        let target = self.buffer_mut(buffer)?;
        Self::check_range(&target.desc, offset, (data.len() as u64).next_multiple_of(4))?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut target.words);
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) -> PipelineResult<()> {
        self.validator.expect_state(texture, ResourceState::CopyDest, "texture upload")?;
        let target = self.texture_mut(texture)?;
        let expected = (target.desc.width * target.desc.height * target.desc.format.bytes_per_texel()) as usize;
        if data.len() != expected {
            return Err(PipelineError::OutOfBounds {
                label: target.desc.label.clone(),
                offset: 0,
                size: data.len() as u64,
                capacity: expected as u64,
            });
        }
        target.texels = bytemuck::pod_collect_to_vec::<u8, f32>(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> PipelineResult<Vec<u8>> {
        let source = self.buffer(buffer)?;
        let bytes: &[u8] = bytemuck::cast_slice(&source.words);
        bytes
            .get(offset as usize..(offset + size) as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| PipelineError::OutOfBounds {
                label: source.desc.label.clone(),
                offset,
                size,
                capacity: source.desc.size,
            })
    }

    fn backbuffer(&self) -> TextureHandle {
        self.backbuffer
    }

    fn backbuffer_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn backbuffer_size(&self) -> (u32, u32) {
        self.texture(self.backbuffer)
            .map(|t| (t.desc.width, t.desc.height))
            .unwrap_or((0, 0))
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> PipelineResult<()> {
        let backbuffer = self.backbuffer;
        let target = self.texture_mut(backbuffer)?;
        target.desc.width = width.max(1);
        target.desc.height = height.max(1);
        target.texels = vec![0.0; (target.desc.width * target.desc.height) as usize];
        Ok(())
    }

    fn begin_frame(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    fn submit(&mut self, commands: CommandList) -> PipelineResult<FenceValue> {
        let programs: HashMap<u32, ProgramKind> = self
            .programs
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u32, p.kind))
            .collect();
        self.validator.validate(&commands, |h| programs.get(&h.0).copied())?;

        self.stats = SoftwareStats::default();
        self.execute(&commands)?;
        self.submitted += 1;
        log::trace!(
            "[SoftwareBackend::submit] '{}' executed {} commands (fence {})",
            commands.label(),
            commands.len(),
            self.submitted
        );
        self.last_submission = Some(commands);
        Ok(self.submitted)
    }

    fn present(&mut self) -> PipelineResult<()> {
        self.presented_frames += 1;
        Ok(())
    }

    fn completed_fence(&mut self) -> FenceValue {
        self.submitted
    }

    fn wait_for_fence(&mut self, _value: FenceValue) -> PipelineResult<()> {
        Ok(())
    }

    fn wait_idle(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BufferUsage, MemoryKind};

    #[test]
    fn test_buffer_upload_and_readback() {
        let mut backend = SoftwareBackend::new(4, 4);
        let buffer = backend
            .create_buffer(&BufferDesc::new("data", 10, BufferUsage::STORAGE | BufferUsage::COPY_DST))
            .unwrap();
        backend.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read_buffer(buffer, 4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(backend.write_buffer(buffer, 12, &[0; 4]).is_err());
    }

    #[test]
    fn test_copy_requires_copy_states() {
        let mut backend = SoftwareBackend::new(4, 4);
        let src = backend
            .create_buffer(&BufferDesc::new("zero", 4, BufferUsage::COPY_SRC).state(ResourceState::CopySource))
            .unwrap();
        let dst = backend
            .create_buffer(
                &BufferDesc::new("counter", 4, BufferUsage::STORAGE)
                    .memory(MemoryKind::Static)
                    .state(ResourceState::UnorderedAccess),
            )
            .unwrap();

        let mut list = CommandList::new("copy");
        list.copy_buffer(src, 0, dst, 0, 4);
        assert!(matches!(
            backend.submit(list),
            Err(PipelineError::StateMismatch { actual: ResourceState::UnorderedAccess, .. })
        ));
    }

    #[test]
    fn test_depth_upload_round_trips() {
        let mut backend = SoftwareBackend::new(4, 4);
        let depth = backend
            .create_texture(&TextureDesc {
                label: "depth".to_string(),
                width: 2,
                height: 2,
                format: TextureFormat::Depth32Float,
                usage: TextureUsage::DEPTH_TARGET | TextureUsage::COPY_DST,
                initial_state: ResourceState::CopyDest,
            })
            .unwrap();

        let texels = [0.25f32, 0.5, 0.75, 1.0];
        backend.write_texture(depth, bytemuck::cast_slice(&texels)).unwrap();
        assert_eq!(backend.read_texture(depth).unwrap(), texels.to_vec());
        assert!(backend.write_texture(depth, &[0; 12]).is_err());
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut backend = SoftwareBackend::new(4, 4);
        let heap = backend.create_timestamp_heap(2).unwrap();
        let readback = backend
            .create_buffer(&BufferDesc::new("ts", 16, BufferUsage::READBACK).state(ResourceState::CopyDest))
            .unwrap();

        let mut list = CommandList::new("ts");
        list.write_timestamp(heap, 0);
        list.write_timestamp(heap, 1);
        list.resolve_timestamps(heap, 0, 2, readback, 0);
        backend.submit(list).unwrap();

        let bytes = backend.read_buffer(readback, 0, 16).unwrap();
        let ticks: Vec<u64> = bytemuck::pod_collect_to_vec(&bytes);
        assert!(ticks[1] > ticks[0]);
    }
}
