//! Hardware device on wgpu
//!
//! Handles map onto slot tables of wgpu objects. Barriers are recorded for the
//! state validator only: wgpu tracks usage itself, so they encode to nothing.
//! Command lists are replayed into one command encoder per submission.

mod encode;
mod programs;

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use winit::window::Window;

use self::programs::Program;
use super::command::{Binding, BindingResource};
use super::{
    BackendCapabilities, BufferDesc, BufferHandle, BufferUsage, CommandList, FenceValue,
    GpuBackend, ProgramDesc, ProgramHandle, QueryHeapHandle, ResourceId, ResourceState,
    StateValidator, TextureDesc, TextureFormat, TextureHandle, TextureUsage,
};
use crate::config::EngineConfig;
use crate::error::{resource_error, PipelineError, PipelineResult};

const TIMESTAMP_BYTES: u64 = 8;

struct GpuBuffer {
    desc: BufferDesc,
    buffer: wgpu::Buffer,
}

struct GpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct QueryHeap {
    set: wgpu::QuerySet,
    /// Queries resolve here first; resolve offsets must be 256-aligned
    resolve: wgpu::Buffer,
}

/// Where frames end up
enum Target {
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
    },
    /// Offscreen color texture owned by the texture table
    Offscreen,
}

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_name: String,
    capabilities: BackendCapabilities,
    target: Target,
    backbuffer: TextureHandle,
    backbuffer_format: TextureFormat,
    backbuffer_size: (u32, u32),
    buffers: Vec<Option<GpuBuffer>>,
    textures: Vec<Option<GpuTexture>>,
    programs: Vec<Program>,
    query_heaps: Vec<QueryHeap>,
    bind_groups: HashMap<(ProgramHandle, Vec<Binding>), wgpu::BindGroup>,
    validator: Option<StateValidator>,
    submitted: FenceValue,
    completed: Arc<AtomicU64>,
    in_flight: VecDeque<(FenceValue, wgpu::SubmissionIndex)>,
}

/// Features used when the adapter has them; none are required
const OPTIONAL_FEATURES: wgpu::Features = wgpu::Features::TIMESTAMP_QUERY
    .union(wgpu::Features::TIMESTAMP_QUERY_INSIDE_PASSES)
    .union(wgpu::Features::CONSERVATIVE_RASTERIZATION)
    .union(wgpu::Features::VERTEX_WRITABLE_STORAGE)
    .union(wgpu::Features::MULTI_DRAW_INDIRECT)
    .union(wgpu::Features::MULTI_DRAW_INDIRECT_COUNT)
    .union(wgpu::Features::INDIRECT_FIRST_INSTANCE);

fn probe_capabilities(features: wgpu::Features, limits: &wgpu::Limits, timestamp_period: f32) -> BackendCapabilities {
    BackendCapabilities {
        timestamp_queries: features
            .contains(wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_PASSES),
        timestamp_frequency: if timestamp_period > 0.0 {
            1.0e9 / timestamp_period as f64
        } else {
            0.0
        },
        conservative_rasterization: features.contains(wgpu::Features::CONSERVATIVE_RASTERIZATION),
        vertex_writable_storage: features.contains(wgpu::Features::VERTEX_WRITABLE_STORAGE),
        indirect_count: features.contains(wgpu::Features::MULTI_DRAW_INDIRECT_COUNT),
        multi_draw_indirect: features.contains(wgpu::Features::MULTI_DRAW_INDIRECT),
        indirect_first_instance: features.contains(wgpu::Features::INDIRECT_FIRST_INSTANCE),
        max_compute_invocations_per_group: limits.max_compute_invocations_per_workgroup,
        max_compute_group_size_x: limits.max_compute_workgroup_size_x,
        max_compute_group_size_y: limits.max_compute_workgroup_size_y,
    }
}

fn to_wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
    }
}

fn from_wgpu_format(format: wgpu::TextureFormat) -> Option<TextureFormat> {
    match format {
        wgpu::TextureFormat::Rgba8Unorm => Some(TextureFormat::Rgba8Unorm),
        wgpu::TextureFormat::Rgba8UnormSrgb => Some(TextureFormat::Rgba8UnormSrgb),
        wgpu::TextureFormat::Bgra8Unorm => Some(TextureFormat::Bgra8Unorm),
        wgpu::TextureFormat::Bgra8UnormSrgb => Some(TextureFormat::Bgra8UnormSrgb),
        _ => None,
    }
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    if usage.contains(BufferUsage::READBACK) {
        return wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
    }
    // Every GPU buffer can be uploaded to and read back through a staging copy
    let mut out = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    for (ours, theirs) in [
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::INDIRECT, wgpu::BufferUsages::INDIRECT),
    ] {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn texture_usages(usage: TextureUsage, format: TextureFormat) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.intersects(TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_TARGET) {
        out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        out |= wgpu::TextureUsages::COPY_SRC;
    }
    // Depth32Float is never a copy destination
    if usage.contains(TextureUsage::COPY_DST) && !format.is_depth() {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    out
}

async fn request_device(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'static>>,
) -> PipelineResult<(wgpu::Adapter, wgpu::Device, wgpu::Queue)> {
    let mut options = wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: surface,
        force_fallback_adapter: false,
    };
    let adapter = match instance.request_adapter(&options).await {
        Some(adapter) => adapter,
        None => {
            log::warn!("[WgpuBackend] No high-performance adapter found, trying fallback...");
            options.force_fallback_adapter = true;
            instance
                .request_adapter(&options)
                .await
                .ok_or_else(|| PipelineError::DeviceInit {
                    message: "no suitable GPU adapter".to_string(),
                })?
        }
    };

    let info = adapter.get_info();
    log::info!("[WgpuBackend] Adapter: {} ({:?}, {:?})", info.name, info.device_type, info.backend);

    let features = adapter.features() & OPTIONAL_FEATURES;
    let missing = OPTIONAL_FEATURES - features;
    if !missing.is_empty() {
        log::info!("[WgpuBackend] Optional features unavailable: {:?}", missing);
    }

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Occlusion Device"),
                required_features: features,
                required_limits: adapter.limits(),
            },
            None,
        )
        .await
        .map_err(|e| PipelineError::DeviceInit { message: e.to_string() })?;

    device.on_uncaptured_error(Box::new(|error| {
        log::error!("[GPU] Uncaptured device error: {}", error);
    }));

    Ok((adapter, device, queue))
}

impl WgpuBackend {
    /// Open a device presenting to `window`
    pub fn new(window: Arc<Window>, config: &EngineConfig) -> PipelineResult<Self> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance
            .create_surface(window)
            .map_err(|e| PipelineError::Surface { message: e.to_string() })?;
        let (adapter, device, queue) = pollster::block_on(request_device(&instance, Some(&surface)))?;

        let surface_caps = surface.get_capabilities(&adapter);
        let (format, wgpu_format) = surface_caps
            .formats
            .iter()
            .copied()
            .filter(|f| f.is_srgb())
            .chain(surface_caps.formats.iter().copied())
            .find_map(|f| from_wgpu_format(f).map(|ours| (ours, f)))
            .ok_or_else(|| PipelineError::Surface {
                message: format!("no usable surface format in {:?}", surface_caps.formats),
            })?;

        let present_mode = if config.window.vsync {
            wgpu::PresentMode::Fifo
        } else {
            [wgpu::PresentMode::Mailbox, wgpu::PresentMode::Immediate]
                .into_iter()
                .find(|mode| surface_caps.present_modes.contains(mode))
                .unwrap_or(wgpu::PresentMode::Fifo)
        };
        let (width, height) = (size.width.max(1), size.height.max(1));
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: wgpu_format,
            width,
            height,
            present_mode,
            desired_maximum_frame_latency: config.pipeline.frames_in_flight.max(1),
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };
        surface.configure(&device, &surface_config);
        log::info!(
            "[WgpuBackend::new] Surface {}x{} {:?} {:?}",
            width,
            height,
            wgpu_format,
            present_mode
        );

        let target = Target::Surface {
            surface,
            config: surface_config,
            frame: None,
        };
        Ok(Self::assemble(adapter, device, queue, target, format, (width, height), config))
    }

    /// Open a device rendering into an offscreen color texture
    pub fn headless(width: u32, height: u32, config: &EngineConfig) -> PipelineResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let (adapter, device, queue) = pollster::block_on(request_device(&instance, None))?;
        let size = (width.max(1), height.max(1));
        let mut backend = Self::assemble(
            adapter,
            device,
            queue,
            Target::Offscreen,
            TextureFormat::Rgba8UnormSrgb,
            size,
            config,
        );
        backend.backbuffer = backend.create_texture(&backend.backbuffer_desc())?;
        log::info!("[WgpuBackend::headless] Offscreen target {}x{}", size.0, size.1);
        Ok(backend)
    }

    fn assemble(
        adapter: wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        target: Target,
        backbuffer_format: TextureFormat,
        backbuffer_size: (u32, u32),
        config: &EngineConfig,
    ) -> Self {
        let capabilities = probe_capabilities(device.features(), &device.limits(), queue.get_timestamp_period());
        log::info!("[WgpuBackend] Capabilities: {:?}", capabilities);

        let mut validator = config.pipeline.validate_states.then(StateValidator::new);
        // The surface texture changes every frame; its state lives on one handle
        let backbuffer = TextureHandle(0);
        if let Some(validator) = validator.as_mut() {
            validator.register(backbuffer, ResourceState::Present);
        }
        let mut textures = Vec::new();
        if matches!(target, Target::Surface { .. }) {
            textures.push(None);
        }

        Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_name: adapter.get_info().name,
            capabilities,
            target,
            backbuffer,
            backbuffer_format,
            backbuffer_size,
            buffers: Vec::new(),
            textures,
            programs: Vec::new(),
            query_heaps: Vec::new(),
            bind_groups: HashMap::new(),
            validator,
            submitted: 0,
            completed: Arc::new(AtomicU64::new(0)),
            in_flight: VecDeque::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn backbuffer_desc(&self) -> TextureDesc {
        TextureDesc {
            label: "Offscreen Backbuffer".to_string(),
            width: self.backbuffer_size.0,
            height: self.backbuffer_size.1,
            format: self.backbuffer_format,
            usage: TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC,
            initial_state: ResourceState::Present,
        }
    }

    fn register(&mut self, resource: impl Into<ResourceId>, state: ResourceState) {
        if let Some(validator) = self.validator.as_mut() {
            validator.register(resource, state);
        }
    }

    fn forget(&mut self, resource: impl Into<ResourceId>) {
        let resource = resource.into();
        if let Some(validator) = self.validator.as_mut() {
            validator.forget(resource);
        }
        self.bind_groups
            .retain(|(_, bindings), _| !bindings.iter().any(|b| b.resource_id() == resource));
    }

    fn gpu_buffer(&self, handle: BufferHandle) -> PipelineResult<&GpuBuffer> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(PipelineError::InvalidHandle {
                kind: "buffer",
                index: handle.0,
            })
    }

    fn buffer(&self, handle: BufferHandle) -> PipelineResult<&wgpu::Buffer> {
        self.gpu_buffer(handle).map(|b| &b.buffer)
    }

    fn texture_view(&self, handle: TextureHandle) -> PipelineResult<&wgpu::TextureView> {
        if let Target::Surface { frame, .. } = &self.target {
            if handle == self.backbuffer {
                return frame.as_ref().map(|(_, view)| view).ok_or_else(|| PipelineError::Surface {
                    message: "backbuffer used outside begin_frame/present".to_string(),
                });
            }
        }
        self.textures
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .map(|t| &t.view)
            .ok_or(PipelineError::InvalidHandle {
                kind: "texture",
                index: handle.0,
            })
    }

    fn program(&self, handle: ProgramHandle) -> PipelineResult<&Program> {
        self.programs.get(handle.0 as usize).ok_or(PipelineError::InvalidHandle {
            kind: "program",
            index: handle.0,
        })
    }

    fn query_heap(&self, handle: QueryHeapHandle) -> PipelineResult<&QueryHeap> {
        self.query_heaps.get(handle.0 as usize).ok_or(PipelineError::InvalidHandle {
            kind: "query heap",
            index: handle.0,
        })
    }

    fn bind_group(&self, program: ProgramHandle, bindings: &[Binding]) -> PipelineResult<&wgpu::BindGroup> {
        self.bind_groups
            .get(&(program, bindings.to_vec()))
            .ok_or_else(|| PipelineError::CommandList {
                message: format!("no bind group prepared for program {}", program.0),
            })
    }

    /// Build every bind group the list references that is not cached yet
    fn prepare_bind_groups(&mut self, list: &CommandList) -> PipelineResult<()> {
        let mut program = None;
        for command in list.commands() {
            match command {
                super::Command::SetProgram(handle) => program = Some(*handle),
                super::Command::SetBindings(bindings) => {
                    let handle = program.ok_or_else(|| PipelineError::CommandList {
                        message: format!("'{}': bindings set before a program", list.label()),
                    })?;
                    let key = (handle, bindings.clone());
                    if !self.bind_groups.contains_key(&key) {
                        let group = self.create_bind_group(handle, bindings)?;
                        self.bind_groups.insert(key, group);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn create_bind_group(&self, handle: ProgramHandle, bindings: &[Binding]) -> PipelineResult<wgpu::BindGroup> {
        let program = self.program(handle)?;
        let entries = bindings
            .iter()
            .map(|binding| {
                let resource = match binding.resource {
                    BindingResource::Buffer { buffer, offset, size } => {
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: self.buffer(buffer)?,
                            offset,
                            size: size.and_then(NonZeroU64::new),
                        })
                    }
                    BindingResource::Texture(texture) => {
                        wgpu::BindingResource::TextureView(self.texture_view(texture)?)
                    }
                };
                Ok(wgpu::BindGroupEntry {
                    binding: binding.slot,
                    resource,
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(program.kind.label()),
            layout: &program.bind_group_layout,
            entries: &entries,
        }))
    }

    /// Map a readback buffer and copy out a byte range
    fn map_and_copy(&self, buffer: &wgpu::Buffer, offset: u64, size: u64) -> PipelineResult<Vec<u8>> {
        let slice = buffer.slice(..);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| PipelineError::Readback { message: e.to_string() })?
            .map_err(|e| PipelineError::Readback { message: e.to_string() })?;

        let bytes = {
            let mapped = slice.get_mapped_range();
            mapped
                .get(offset as usize..(offset + size) as usize)
                .map(<[u8]>::to_vec)
        };
        buffer.unmap();
        bytes.ok_or_else(|| PipelineError::Readback {
            message: format!("range {}+{} outside mapped buffer", offset, size),
        })
    }

    fn retire(&mut self, value: FenceValue) {
        self.completed.fetch_max(value, Ordering::AcqRel);
        while self.in_flight.front().is_some_and(|(fence, _)| *fence <= value) {
            self.in_flight.pop_front();
        }
    }
}

impl GpuBackend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> PipelineResult<BufferHandle> {
        if desc.size == 0 {
            return Err(resource_error(&desc.label, "zero-sized buffer"));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size: desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: buffer_usages(desc.usage),
            mapped_at_creation: false,
        });
        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(Some(GpuBuffer {
            desc: desc.clone(),
            buffer,
        }));
        self.register(handle, desc.initial_state);
        log::trace!("[WgpuBackend::create_buffer] {} ({} bytes)", desc.label, desc.size);
        Ok(handle)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(slot) = self.buffers.get_mut(buffer.0 as usize) {
            if let Some(gpu) = slot.take() {
                gpu.buffer.destroy();
            }
            self.forget(buffer);
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> PipelineResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(resource_error(&desc.label, "zero-sized texture"));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: to_wgpu_format(desc.format),
            usage: texture_usages(desc.usage, desc.format),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = TextureHandle(self.textures.len() as u32);
        self.textures.push(Some(GpuTexture {
            desc: desc.clone(),
            texture,
            view,
        }));
        self.register(handle, desc.initial_state);
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(slot) = self.textures.get_mut(texture.0 as usize) {
            if let Some(gpu) = slot.take() {
                gpu.texture.destroy();
            }
            self.forget(texture);
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> PipelineResult<ProgramHandle> {
        let program = programs::create_program(&self.device, desc, &self.capabilities)?;
        let handle = ProgramHandle(self.programs.len() as u32);
        self.programs.push(program);
        Ok(handle)
    }

    fn create_timestamp_heap(&mut self, count: u32) -> PipelineResult<QueryHeapHandle> {
        if !self.capabilities.timestamp_queries {
            return Err(PipelineError::Unsupported { feature: "timestamp queries" });
        }
        let set = self.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("Stage Timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count,
        });
        let resolve = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Timestamp Resolve"),
            size: count as u64 * TIMESTAMP_BYTES,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let handle = QueryHeapHandle(self.query_heaps.len() as u32);
        self.query_heaps.push(QueryHeap { set, resolve });
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> PipelineResult<()> {
        let target = self.gpu_buffer(buffer)?;
        let padded = (data.len() as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if offset + padded > target.buffer.size() {
            return Err(PipelineError::OutOfBounds {
                label: target.desc.label.clone(),
                offset,
                size: data.len() as u64,
                capacity: target.desc.size,
            });
        }
        if padded == data.len() as u64 {
            self.queue.write_buffer(&target.buffer, offset, data);
        } else {
            let mut bytes = data.to_vec();
            bytes.resize(padded as usize, 0);
            self.queue.write_buffer(&target.buffer, offset, &bytes);
        }
        Ok(())
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) -> PipelineResult<()> {
        if let Some(validator) = self.validator.as_ref() {
            validator.expect_state(texture, ResourceState::CopyDest, "texture upload")?;
        }
        let target = self
            .textures
            .get(texture.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(PipelineError::InvalidHandle {
                kind: "texture",
                index: texture.0,
            })?;
        if target.desc.format.is_depth() {
            return Err(PipelineError::Unsupported { feature: "depth texture uploads" });
        }
        let row = target.desc.width * target.desc.format.bytes_per_texel();
        let expected = (row * target.desc.height) as usize;
        if data.len() != expected {
            return Err(PipelineError::OutOfBounds {
                label: target.desc.label.clone(),
                offset: 0,
                size: data.len() as u64,
                capacity: expected as u64,
            });
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(row),
                rows_per_image: Some(target.desc.height),
            },
            wgpu::Extent3d {
                width: target.desc.width,
                height: target.desc.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> PipelineResult<Vec<u8>> {
        let source = self.gpu_buffer(buffer)?;
        if offset + size > source.desc.size {
            return Err(PipelineError::OutOfBounds {
                label: source.desc.label.clone(),
                offset,
                size,
                capacity: source.desc.size,
            });
        }
        if source.desc.usage.contains(BufferUsage::READBACK) {
            return self.map_and_copy(&source.buffer, offset, size);
        }

        // Device-local buffers go through a staging copy
        let aligned_offset = offset - offset % wgpu::COPY_BUFFER_ALIGNMENT;
        let aligned_size = (offset + size - aligned_offset).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size: aligned_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback"),
        });
        encoder.copy_buffer_to_buffer(&source.buffer, aligned_offset, &staging, 0, aligned_size);
        self.queue.submit(Some(encoder.finish()));
        let bytes = self.map_and_copy(&staging, offset - aligned_offset, size);
        staging.destroy();
        bytes
    }

    fn backbuffer(&self) -> TextureHandle {
        self.backbuffer
    }

    fn backbuffer_format(&self) -> TextureFormat {
        self.backbuffer_format
    }

    fn backbuffer_size(&self) -> (u32, u32) {
        self.backbuffer_size
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> PipelineResult<()> {
        let size = (width.max(1), height.max(1));
        self.backbuffer_size = size;
        if let Target::Surface { surface, config, frame } = &mut self.target {
            *frame = None;
            config.width = size.0;
            config.height = size.1;
            surface.configure(&self.device, config);
            self.register(self.backbuffer, ResourceState::Present);
        } else {
            self.destroy_texture(self.backbuffer);
            self.backbuffer = self.create_texture(&self.backbuffer_desc())?;
        }
        log::debug!("[WgpuBackend::resize_backbuffer] {}x{}", size.0, size.1);
        Ok(())
    }

    fn begin_frame(&mut self) -> PipelineResult<()> {
        let Target::Surface { surface, config, frame } = &mut self.target else {
            return Ok(());
        };
        let texture = match surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                log::warn!("[WgpuBackend::begin_frame] Surface lost or outdated, reconfiguring");
                surface.configure(&self.device, config);
                surface
                    .get_current_texture()
                    .map_err(|e| PipelineError::Surface { message: e.to_string() })?
            }
            Err(e) => return Err(PipelineError::Surface { message: e.to_string() }),
        };
        let view = texture.texture.create_view(&wgpu::TextureViewDescriptor::default());
        *frame = Some((texture, view));
        Ok(())
    }

    fn submit(&mut self, commands: CommandList) -> PipelineResult<FenceValue> {
        if let Some(validator) = self.validator.as_mut() {
            let programs = &self.programs;
            validator.validate(&commands, |h| programs.get(h.0 as usize).map(|p| p.kind))?;
        }
        self.prepare_bind_groups(&commands)?;
        let command_buffer = self.encode(&commands)?;

        let index = self.queue.submit(Some(command_buffer));
        self.submitted += 1;
        let fence = self.submitted;
        let completed = Arc::clone(&self.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(fence, Ordering::AcqRel);
        });
        self.in_flight.push_back((fence, index));
        log::trace!(
            "[WgpuBackend::submit] '{}' with {} commands (fence {})",
            commands.label(),
            commands.len(),
            fence
        );
        Ok(fence)
    }

    fn present(&mut self) -> PipelineResult<()> {
        if let Target::Surface { frame, .. } = &mut self.target {
            if let Some((texture, view)) = frame.take() {
                drop(view);
                texture.present();
            }
        }
        Ok(())
    }

    fn completed_fence(&mut self) -> FenceValue {
        self.device.poll(wgpu::Maintain::Poll);
        self.completed.load(Ordering::Acquire)
    }

    fn wait_for_fence(&mut self, value: FenceValue) -> PipelineResult<()> {
        if self.completed.load(Ordering::Acquire) >= value {
            return Ok(());
        }
        let index = self
            .in_flight
            .iter()
            .find(|(fence, _)| *fence >= value)
            .map(|(_, index)| index.clone());
        match index {
            Some(index) => {
                self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
            }
            None => {
                self.device.poll(wgpu::Maintain::Wait);
            }
        }
        // Queue completion is in submission order
        self.retire(value.min(self.submitted));
        Ok(())
    }

    fn wait_idle(&mut self) -> PipelineResult<()> {
        self.device.poll(wgpu::Maintain::Wait);
        self.retire(self.submitted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readback_buffers_are_mappable_only() {
        let usages = buffer_usages(BufferUsage::READBACK | BufferUsage::COPY_DST);
        assert_eq!(usages, wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST);
    }

    #[test]
    fn test_gpu_buffers_keep_copy_access() {
        let usages = buffer_usages(BufferUsage::STORAGE | BufferUsage::INDIRECT);
        assert!(usages.contains(wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST));
        assert!(usages.contains(wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT));
    }

    #[test]
    fn test_depth_textures_drop_copy_destination() {
        let usages = texture_usages(
            TextureUsage::DEPTH_TARGET | TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            TextureFormat::Depth32Float,
        );
        assert!(!usages.contains(wgpu::TextureUsages::COPY_DST));
        assert!(usages.contains(wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING));
    }

    #[test]
    fn test_capabilities_follow_features() {
        let limits = wgpu::Limits::default();
        let caps = probe_capabilities(wgpu::Features::TIMESTAMP_QUERY, &limits, 1.0);
        assert!(!caps.timestamp_queries);
        assert!(!caps.indirect_count);

        let caps = probe_capabilities(OPTIONAL_FEATURES, &limits, 1.0);
        assert!(caps.timestamp_queries);
        assert_eq!(caps.timestamp_frequency, 1.0e9);
        assert_eq!(caps.max_compute_invocations_per_group, limits.max_compute_invocations_per_workgroup);
    }

    #[test]
    fn test_surface_formats_round_trip() {
        for format in [TextureFormat::Bgra8UnormSrgb, TextureFormat::Rgba8Unorm] {
            assert_eq!(from_wgpu_format(to_wgpu_format(format)), Some(format));
        }
        assert_eq!(from_wgpu_format(wgpu::TextureFormat::Rgb10a2Unorm), None);
    }
}
