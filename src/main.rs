//! Occlusion culling demo
//!
//! Usage: `occlusion-demo [config.toml]` (or set `OCCLUSION_CONFIG`).
//!
//! Keys: O occlusion, W wireframe, D downsample, C compaction variant,
//! V depth view, arrows move/turn, R/F up/down, PageUp/PageDown look,
//! Shift boost, Escape quit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glam::Vec3;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, Event, KeyEvent, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::WindowBuilder;

use occlusion_engine::{
    Camera, EngineConfig, LoadStatus, OcclusionRenderer, PipelineError, SyntheticScene, WgpuBackend,
};

const TIMING_LOG_INTERVAL: Duration = Duration::from_secs(1);

fn handle_key(renderer: &mut OcclusionRenderer<WgpuBackend>, key: KeyCode, pressed: bool) {
    let controller = renderer.controller_mut();
    match key {
        KeyCode::ArrowUp => controller.forward = pressed,
        KeyCode::ArrowDown => controller.backward = pressed,
        KeyCode::ArrowLeft => controller.turn_left = pressed,
        KeyCode::ArrowRight => controller.turn_right = pressed,
        KeyCode::KeyR => controller.up = pressed,
        KeyCode::KeyF => controller.down = pressed,
        KeyCode::PageUp => controller.look_up = pressed,
        KeyCode::PageDown => controller.look_down = pressed,
        KeyCode::ShiftLeft | KeyCode::ShiftRight => controller.boost = pressed,
        _ if !pressed => {}
        KeyCode::KeyO => {
            let toggles = renderer.toggles_mut();
            toggles.occlusion = !toggles.occlusion;
            log::info!("[main] Occlusion culling {}", on_off(toggles.occlusion));
        }
        KeyCode::KeyW => {
            let toggles = renderer.toggles_mut();
            toggles.wireframe = !toggles.wireframe;
            log::info!("[main] Wireframe {}", on_off(toggles.wireframe));
        }
        KeyCode::KeyD => {
            let toggles = renderer.toggles_mut();
            toggles.downsample = !toggles.downsample;
            log::info!("[main] Quarter-resolution downsample {}", on_off(toggles.downsample));
        }
        KeyCode::KeyC => {
            let toggles = renderer.toggles_mut();
            toggles.compaction = toggles.compaction.toggled();
            log::info!("[main] Compaction variant {:?}", toggles.compaction);
        }
        KeyCode::KeyV => {
            let toggles = renderer.toggles_mut();
            toggles.depth_view = toggles.depth_view.next();
            log::info!("[main] Depth view {:?}", toggles.depth_view);
        }
        _ => {}
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn window_title(base: &str, renderer: &OcclusionRenderer<WgpuBackend>) -> String {
    match renderer.status() {
        LoadStatus::Ready { objects } => {
            let toggles = renderer.toggles();
            format!(
                "{} | {} objects | {} path | compaction {:?}",
                base,
                objects,
                renderer.render_path(),
                toggles.compaction
            )
        }
        status => format!("{} | {}", base, status),
    }
}

fn log_timings(renderer: &OcclusionRenderer<WgpuBackend>) {
    let Some(timings) = renderer.timings() else {
        return;
    };
    let stages: Vec<String> = timings
        .stages
        .iter()
        .map(|s| format!("{} {:.3}", s.label, s.milliseconds))
        .collect();
    log::info!(
        "[main] Frame {} ({}): GPU {:.3} ms | {}",
        timings.frame_index,
        timings.path,
        timings.total_ms,
        stages.join(" | ")
    );
}

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let config = EngineConfig::resolve(config_path.as_deref()).context("failed to load config")?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.filter)).init();
    log::info!("[main] Starting occlusion demo");

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title(&config.window.title)
            .with_inner_size(PhysicalSize::new(config.window.width, config.window.height))
            .build(&event_loop)?,
    );

    let backend = WgpuBackend::new(Arc::clone(&window), &config)?;
    log::info!("[main] Rendering on {}", backend.adapter_name());
    let mut renderer = OcclusionRenderer::new(backend, &config)?;

    let scene = SyntheticScene::new(config.scene.clone());
    let (_, extent_z) = scene.extent();
    let size = window.inner_size();
    // Street level at the near edge of the grid, looking across it
    *renderer.camera_mut() = Camera::looking_at(
        Vec3::new(0.0, 2.0, extent_z * 0.5 + 5.0),
        Vec3::new(0.0, 2.0, 0.0),
        size.width,
        size.height,
    );
    renderer.load_scene(scene)?;

    let title = config.window.title.clone();
    let mut last_update = Instant::now();
    let mut last_timing_log = Instant::now();

    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);
        match event {
            Event::WindowEvent { event, window_id } if window_id == window.id() => match event {
                WindowEvent::CloseRequested => elwt.exit(),
                WindowEvent::Resized(size) => {
                    if let Err(e) = renderer.resize(size.width, size.height) {
                        log::error!("[main] Resize failed: {}", e);
                        elwt.exit();
                    }
                }
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(key),
                            state,
                            repeat: false,
                            ..
                        },
                    ..
                } => {
                    if key == KeyCode::Escape {
                        elwt.exit();
                    } else {
                        handle_key(&mut renderer, key, state == ElementState::Pressed);
                    }
                }
                WindowEvent::RedrawRequested => {
                    let now = Instant::now();
                    let delta_time = (now - last_update).as_secs_f32();
                    last_update = now;

                    if let Err(e) = renderer.update(delta_time) {
                        log::error!("[main] Update failed: {}", e);
                        elwt.exit();
                        return;
                    }
                    match renderer.render() {
                        Ok(()) => {}
                        // Lost or outdated surfaces recover on the next acquire
                        Err(PipelineError::Surface { message }) => {
                            log::warn!("[main] Skipped frame: {}", message);
                        }
                        Err(e) => {
                            log::error!("[main] Render failed: {}", e);
                            elwt.exit();
                            return;
                        }
                    }

                    if now - last_timing_log >= TIMING_LOG_INTERVAL {
                        last_timing_log = now;
                        log_timings(&renderer);
                        window.set_title(&window_title(&title, &renderer));
                    }
                }
                _ => {}
            },
            Event::AboutToWait => window.request_redraw(),
            Event::LoopExiting => {
                if let Err(e) = renderer.shutdown() {
                    log::error!("[main] Shutdown failed: {}", e);
                }
            }
            _ => {}
        }
    })?;

    Ok(())
}
