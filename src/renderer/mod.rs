//! Frame orchestration
//!
//! [`OcclusionRenderer`] owns the backend, the passes and every pipeline
//! resource. Each [`OcclusionRenderer::render`] call records one command list
//! for the next frame slot, waiting only when that slot is still in flight.

mod frame;

pub use frame::{FrameCounters, FrameReport};

use glam::Mat4;

use crate::camera::{Camera, CameraController};
use crate::config::{DepthView, EngineConfig, Toggles};
use crate::culling::passes::{record_depth_prefill, CLEAR_COLOR};
use crate::culling::{
    create_passes, cull_objects, DepthTargets, FrameContext, FrameSlot, Frustum, Pass,
    ProxyGeometry, RenderPath, SceneBuffers,
};
use crate::error::{PipelineError, PipelineResult};
use crate::gpu::layout::{FrameUniforms, ReprojectUniforms};
use crate::gpu::{ColorAttachment, CommandList, GpuBackend, LoadOp, ResourceState};
use crate::profiling::{FrameTimings, GpuTimer};
use crate::scene::{LoadStatus, Scene, SceneLoadTask, SceneSource};

/// A scene resident on the device
struct LoadedScene {
    scene: Scene,
    buffers: SceneBuffers,
    slots: Vec<FrameSlot>,
}

impl LoadedScene {
    fn destroy<B: GpuBackend + ?Sized>(&self, backend: &mut B) {
        for slot in &self.slots {
            slot.destroy(backend);
        }
        self.buffers.destroy(backend);
    }
}

pub struct OcclusionRenderer<B: GpuBackend> {
    backend: B,
    toggles: Toggles,
    camera: Camera,
    controller: CameraController,
    passes: Vec<Pass>,
    proxy: ProxyGeometry,
    targets: DepthTargets,
    scene: Option<LoadedScene>,
    loader: Option<SceneLoadTask>,
    load_status: LoadStatus,
    timer: Option<GpuTimer>,
    counters: FrameCounters,
    last_frame: Option<FrameReport>,
    released: bool,
}

impl<B: GpuBackend> OcclusionRenderer<B> {
    pub fn new(mut backend: B, config: &EngineConfig) -> PipelineResult<Self> {
        let mut config = config.clone();
        config.sanitize();
        let pipeline = config.pipeline;

        let caps = backend.capabilities().clone();
        if !caps.indirect_first_instance {
            log::warn!(
                "[OcclusionRenderer::new] Indirect first-instance unsupported, rendering the baseline path only"
            );
        }
        if !caps.indirect_count {
            log::info!("[OcclusionRenderer::new] No indirect count support, drawing full capacity with cleared entries");
        }

        let passes = create_passes(&mut backend, &pipeline)?;
        let proxy = ProxyGeometry::create(&mut backend)?;
        let (width, height) = backend.backbuffer_size();
        let targets = DepthTargets::create(&mut backend, width, height)?;
        let timer = GpuTimer::new(&mut backend, passes.len(), pipeline.timestamp_delay)?;

        log::info!(
            "[OcclusionRenderer::new] {} backend, {}x{}, {} frames in flight",
            backend.name(),
            width,
            height,
            pipeline.frames_in_flight
        );

        Ok(Self {
            counters: FrameCounters::new(pipeline.frames_in_flight as usize),
            backend,
            toggles: config.toggles,
            camera: Camera::new(width, height),
            controller: CameraController::default(),
            passes,
            proxy,
            targets,
            scene: None,
            loader: None,
            load_status: LoadStatus::Pending,
            timer,
            last_frame: None,
            released: false,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn controller_mut(&mut self) -> &mut CameraController {
        &mut self.controller
    }

    pub fn toggles(&self) -> &Toggles {
        &self.toggles
    }

    pub fn toggles_mut(&mut self) -> &mut Toggles {
        &mut self.toggles
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn targets(&self) -> &DepthTargets {
        &self.targets
    }

    pub fn scene_buffers(&self) -> Option<&SceneBuffers> {
        self.scene.as_ref().map(|s| &s.buffers)
    }

    pub fn frame_slot(&self, index: usize) -> Option<&FrameSlot> {
        self.scene.as_ref().and_then(|s| s.slots.get(index))
    }

    /// Slot the next [`OcclusionRenderer::render`] records into
    pub fn next_slot_index(&self) -> usize {
        self.counters.slot_index()
    }

    pub fn frame_index(&self) -> u64 {
        self.counters.frame_index
    }

    /// Scene load progress; `Ready` only once the scene buffers exist
    pub fn status(&self) -> LoadStatus {
        match &self.loader {
            Some(task) => task.status(),
            None => self.load_status.clone(),
        }
    }

    /// Per-stage timings of the most recent frame read back from the GPU
    pub fn timings(&self) -> Option<&FrameTimings> {
        self.timer.as_ref().and_then(GpuTimer::latest)
    }

    pub fn last_frame(&self) -> Option<&FrameReport> {
        self.last_frame.as_ref()
    }

    /// Start loading a scene in the background; replaces any load in progress
    pub fn load_scene<S: SceneSource>(&mut self, source: S) -> PipelineResult<()> {
        self.loader = Some(SceneLoadTask::spawn(source)?);
        self.load_status = LoadStatus::Pending;
        Ok(())
    }

    /// Upload an assembled scene, replacing the current one
    pub fn set_scene(&mut self, scene: Scene) -> PipelineResult<()> {
        self.backend.wait_idle()?;
        if let Some(old) = self.scene.take() {
            old.destroy(&mut self.backend);
        }

        let buffers = SceneBuffers::upload(&mut self.backend, &scene)?;
        let slots = (0..self.counters.slot_count())
            .map(|i| FrameSlot::create(&mut self.backend, i, buffers.object_count, &buffers.append_layout))
            .collect::<PipelineResult<Vec<_>>>()?;

        self.load_status = LoadStatus::Ready {
            objects: scene.objects.len(),
        };
        self.scene = Some(LoadedScene { scene, buffers, slots });
        self.counters.invalidate_history();
        Ok(())
    }

    /// Advance the camera and pick up a finished scene load
    pub fn update(&mut self, delta_time: f32) -> PipelineResult<()> {
        self.controller.update(&mut self.camera, delta_time);

        let finished = self.loader.as_mut().and_then(SceneLoadTask::poll);
        if let Some(outcome) = finished {
            let name = self.loader.take().map(|t| t.name().to_string()).unwrap_or_default();
            match outcome {
                Ok(scene) => {
                    log::info!(
                        "[OcclusionRenderer::update] Scene '{}' loaded: {} objects, {} triangles",
                        name,
                        scene.objects.len(),
                        scene.indices.len() / 3
                    );
                    self.load_status = LoadStatus::Uploading {
                        objects: scene.objects.len(),
                    };
                    if let Err(e) = self.set_scene(scene) {
                        self.load_status = LoadStatus::Failed(e.to_string());
                        return Err(e);
                    }
                }
                Err(e) => {
                    log::error!("[OcclusionRenderer::update] Scene '{}' failed to load: {}", name, e);
                    self.load_status = LoadStatus::Failed(e.to_string());
                }
            }
        }
        Ok(())
    }

    /// Path the next frame takes
    pub fn render_path(&self) -> RenderPath {
        if self.toggles.occlusion && self.backend.capabilities().indirect_first_instance {
            RenderPath::Occlusion
        } else {
            RenderPath::Baseline
        }
    }

    pub fn render(&mut self) -> PipelineResult<()> {
        if self.released {
            return Err(PipelineError::CommandList {
                message: "render after shutdown".into(),
            });
        }
        let slot_index = self.counters.slot_index();
        if let Some(fence) = self.counters.slot_fence(slot_index) {
            self.backend.wait_for_fence(fence)?;
        }
        self.backend.begin_frame()?;

        let path = self.render_path();
        let frame_index = self.counters.frame_index;
        let backbuffer = self.backend.backbuffer();
        let backbuffer_size = self.backend.backbuffer_size();
        let view_proj = self.camera.view_projection();

        let mut list = CommandList::new(format!("Frame {}", frame_index));
        if let Some(timer) = self.timer.as_mut() {
            timer.begin_frame(&mut self.backend, &mut list, path)?;
        }
        list.transition(backbuffer, ResourceState::Present, ResourceState::RenderTarget);

        let mut draw_candidates = 0;
        match &self.scene {
            Some(loaded) => {
                if !self.counters.history_valid {
                    record_depth_prefill(self.targets.depth, &mut list);
                }
                let prev_view_proj = if self.counters.history_valid {
                    self.counters.prev_view_proj
                } else {
                    view_proj
                };

                let direct_draws = match path {
                    RenderPath::Baseline => cull_objects(&Frustum::from_view_projection(&view_proj), &loaded.scene.objects),
                    RenderPath::Occlusion => Vec::new(),
                };
                draw_candidates = match path {
                    RenderPath::Baseline => direct_draws.len() as u32,
                    RenderPath::Occlusion => loaded.buffers.object_count,
                };

                let slot = &loaded.slots[slot_index];
                write_frame_uniforms(
                    &mut self.backend,
                    slot,
                    &self.targets,
                    &self.toggles,
                    &self.camera,
                    view_proj,
                    prev_view_proj,
                    loaded.buffers.object_count,
                    backbuffer_size,
                )?;

                let ctx = FrameContext {
                    path,
                    toggles: &self.toggles,
                    slot,
                    targets: &self.targets,
                    scene: &loaded.buffers,
                    proxy: &self.proxy,
                    backbuffer,
                    backbuffer_size,
                    direct_draws: &direct_draws,
                    indirect_count: self.backend.capabilities().indirect_count,
                };
                for pass in self.passes.iter().filter(|p| p.is_active(path, &self.toggles)) {
                    let scope = self.timer.as_mut().and_then(|t| t.begin(&mut list, pass.label()));
                    pass.record(&ctx, &mut list);
                    if let Some(timer) = self.timer.as_mut() {
                        timer.end(&mut list, scope);
                    }
                }
            }
            None => {
                let _pass = list.begin_render_pass(
                    "Clear",
                    Some(ColorAttachment {
                        texture: backbuffer,
                        load: LoadOp::Clear(CLEAR_COLOR),
                    }),
                    None,
                );
            }
        }

        list.transition(backbuffer, ResourceState::RenderTarget, ResourceState::Present);
        if let Some(timer) = self.timer.as_mut() {
            timer.end_frame(&mut list);
        }

        let fence = self.backend.submit(list)?;
        if let Some(timer) = self.timer.as_mut() {
            timer.mark_submitted(fence);
        }
        self.backend.present()?;

        self.counters.finish_frame(fence, view_proj, self.scene.is_some());
        self.last_frame = Some(FrameReport {
            frame_index,
            path,
            slot: slot_index,
            draw_candidates,
        });
        log::trace!(
            "[OcclusionRenderer::render] Frame {} submitted on the {} path (fence {})",
            frame_index,
            path,
            fence
        );
        Ok(())
    }

    /// Rebuild resolution-dependent targets; zero sizes are ignored
    pub fn resize(&mut self, width: u32, height: u32) -> PipelineResult<()> {
        if width == 0 || height == 0 {
            log::debug!("[OcclusionRenderer::resize] Ignoring zero size {}x{}", width, height);
            return Ok(());
        }
        self.backend.wait_idle()?;
        self.backend.resize_backbuffer(width, height)?;
        self.targets.destroy(&mut self.backend);
        self.targets = DepthTargets::create(&mut self.backend, width, height)?;
        self.camera.resize(width, height);
        self.counters.reset();
        if let Some(timer) = self.timer.as_mut() {
            timer.reset();
        }
        log::info!("[OcclusionRenderer::resize] Targets rebuilt at {}x{}", width, height);
        Ok(())
    }

    /// Wait for the GPU and release every pipeline resource
    ///
    /// The renderer renders nothing afterwards; calling it twice is a no-op.
    pub fn shutdown(&mut self) -> PipelineResult<()> {
        if self.released {
            return Ok(());
        }
        self.backend.wait_idle()?;
        self.loader = None;
        if let Some(loaded) = self.scene.take() {
            loaded.destroy(&mut self.backend);
        }
        if let Some(timer) = self.timer.take() {
            timer.destroy(&mut self.backend);
        }
        self.targets.destroy(&mut self.backend);
        self.proxy.destroy(&mut self.backend);
        self.released = true;
        log::info!("[OcclusionRenderer::shutdown] Released pipeline resources");
        Ok(())
    }
}

impl<B: GpuBackend> Drop for OcclusionRenderer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("[OcclusionRenderer::drop] Failed to wait for GPU idle: {}", e);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_frame_uniforms<B: GpuBackend + ?Sized>(
    backend: &mut B,
    slot: &FrameSlot,
    targets: &DepthTargets,
    toggles: &Toggles,
    camera: &Camera,
    view_proj: Mat4,
    prev_view_proj: Mat4,
    object_count: u32,
    backbuffer_size: (u32, u32),
) -> PipelineResult<()> {
    let grid = targets.cull_grid(toggles.downsample);
    let frame = FrameUniforms::new(view_proj, camera.position, grid.size(), backbuffer_size, object_count);
    backend.write_buffer(slot.frame_uniforms, 0, bytemuck::bytes_of(&frame))?;

    let reproject = ReprojectUniforms {
        prev_inv_view_proj: prev_view_proj.inverse().to_cols_array_2d(),
        view_proj: view_proj.to_cols_array_2d(),
        src_size: [targets.width, targets.height],
        dst_size: [targets.half.width, targets.half.height],
    };
    backend.write_buffer(slot.reproject_uniforms, 0, bytemuck::bytes_of(&reproject))?;

    let downsample = targets.half.uniforms_to(targets.quarter.size());
    backend.write_buffer(slot.downsample_uniforms, 0, bytemuck::bytes_of(&downsample))?;

    let copy = grid.uniforms_to(grid.size());
    backend.write_buffer(slot.copy_uniforms, 0, bytemuck::bytes_of(&copy))?;

    let viewed = match toggles.depth_view {
        DepthView::Half => &targets.half,
        _ => grid,
    };
    let debug = viewed.uniforms_to(backbuffer_size);
    backend.write_buffer(slot.debug_uniforms, 0, bytemuck::bytes_of(&debug))?;
    Ok(())
}
