//! Occlusion Pipeline Integration Tests
//!
//! Drives full frames through the software device and checks visibility,
//! compaction, indirect draw counts and resource states end to end.

use glam::{Mat4, Vec3};
use occlusion_engine::culling::RenderPath;
use occlusion_engine::gpu::layout::{DrawIndexedArgs, DrawTemplate};
use occlusion_engine::gpu::{Command, CommandList, GpuBackend, ResourceState};
use occlusion_engine::scene::{MeshData, ObjectDesc, SceneDescription};
use occlusion_engine::{
    Camera, CompactionVariant, EngineConfig, OcclusionRenderer, PipelineError, Scene, SoftwareBackend,
};

const GRID: u32 = 10;
const SPACING: f32 = 2.0;
const WIDTH: u32 = 400;
const HEIGHT: u32 = 400;

/// 100 unit cubes on a 10x10 grid in the z = 0 plane, object i at column i % 10
fn cube_wall() -> Scene {
    let offset = (GRID - 1) as f32 * SPACING / 2.0;
    let objects = (0..GRID * GRID)
        .map(|i| ObjectDesc {
            mesh: 0,
            transform: Mat4::from_translation(cell_center(i, offset)),
            material: 0,
        })
        .collect();
    Scene::assemble(SceneDescription {
        meshes: vec![MeshData::cube()],
        objects,
        materials: vec![],
    })
    .unwrap()
}

fn cell_center(object: u32, offset: f32) -> Vec3 {
    Vec3::new(
        (object % GRID) as f32 * SPACING - offset,
        offset - (object / GRID) as f32 * SPACING,
        0.0,
    )
}

/// Object whose grid cell contains a point of the z = 0 plane
fn cell_at(point: Vec3) -> Option<u32> {
    let offset = (GRID - 1) as f32 * SPACING / 2.0;
    let column = ((point.x + offset) / SPACING).round();
    let row = ((offset - point.y) / SPACING).round();
    let in_grid = |v: f32| (0.0..GRID as f32).contains(&v);
    if !in_grid(column) || !in_grid(row) {
        return None;
    }
    let object = row as u32 * GRID + column as u32;
    let center = cell_center(object, offset);
    let half = SPACING / 2.0;
    ((point.x - center.x).abs() <= half && (point.y - center.y).abs() <= half).then_some(object)
}

fn renderer_with(backend: SoftwareBackend) -> OcclusionRenderer<SoftwareBackend> {
    let mut renderer = OcclusionRenderer::new(backend, &EngineConfig::default()).unwrap();
    let (width, height) = renderer.backend().backbuffer_size();
    *renderer.camera_mut() = Camera::looking_at(Vec3::new(0.0, 0.0, 20.0), Vec3::ZERO, width, height);
    renderer
}

fn wall_renderer() -> OcclusionRenderer<SoftwareBackend> {
    let mut renderer = renderer_with(SoftwareBackend::new(WIDTH, HEIGHT));
    renderer.toggles_mut().downsample = false;
    renderer.set_scene(cube_wall()).unwrap();
    renderer
}

/// Replace the scene depth with a near occluder over the cells of `hidden`
///
/// The depth attachment goes through CopyDest for the upload and is handed
/// back in DepthWrite, so the next frame reprojects exactly this buffer.
fn inject_occluders(renderer: &mut OcclusionRenderer<SoftwareBackend>, hidden: impl Fn(u32) -> bool) {
    let targets = *renderer.targets();
    let view_proj = renderer.camera().view_projection();
    let inverse = view_proj.inverse();
    let occluder_depth = view_proj.project_point3(Vec3::new(0.0, 0.0, 10.0)).z;

    let mut texels = Vec::with_capacity((targets.width * targets.height) as usize);
    for y in 0..targets.height {
        for x in 0..targets.width {
            let ndc_x = (x as f32 + 0.5) / targets.width as f32 * 2.0 - 1.0;
            let ndc_y = 1.0 - (y as f32 + 0.5) / targets.height as f32 * 2.0;
            let near = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 0.0));
            let far = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 1.0));
            let t = near.z / (near.z - far.z);
            let hit = near + (far - near) * t;
            let covered = cell_at(hit).is_some_and(&hidden);
            texels.push(if covered { occluder_depth } else { 1.0 });
        }
    }

    let backend = renderer.backend_mut();
    let mut list = CommandList::new("Inject Depth");
    list.transition(targets.depth, ResourceState::DepthWrite, ResourceState::CopyDest);
    backend.submit(list).unwrap();
    backend.write_texture(targets.depth, bytemuck::cast_slice(&texels)).unwrap();
    let mut list = CommandList::new("Restore Depth");
    list.transition(targets.depth, ResourceState::CopyDest, ResourceState::DepthWrite);
    backend.submit(list).unwrap();
}

/// Counter and entries of the compacted buffer written by the last frame
fn compacted(renderer: &mut OcclusionRenderer<SoftwareBackend>) -> (u32, Vec<DrawIndexedArgs>) {
    let slot = renderer.last_frame().unwrap().slot;
    let buffer = renderer.frame_slot(slot).unwrap().compacted;
    let layout = renderer.scene_buffers().unwrap().append_layout;

    let backend = renderer.backend_mut();
    let counter = backend.read_buffer(buffer, layout.counter_offset, 4).unwrap();
    let counter = u32::from_le_bytes([counter[0], counter[1], counter[2], counter[3]]);
    let bytes = backend.read_buffer(buffer, 0, layout.entries_size).unwrap();
    let entries = bytes
        .chunks_exact(20)
        .map(bytemuck::pod_read_unaligned::<DrawIndexedArgs>)
        .collect();
    (counter, entries)
}

fn drawn_objects(counter: u32, entries: &[DrawIndexedArgs]) -> Vec<u32> {
    let mut objects: Vec<u32> = entries[..counter as usize].iter().map(|e| e.first_instance).collect();
    objects.sort_unstable();
    objects
}

fn visibility_flags(renderer: &mut OcclusionRenderer<SoftwareBackend>) -> Vec<u32> {
    let slot = renderer.last_frame().unwrap().slot;
    let buffer = renderer.frame_slot(slot).unwrap().visibility;
    let bytes = renderer.backend_mut().read_buffer(buffer, 0, 400).unwrap();
    bytemuck::pod_collect_to_vec(&bytes)
}

fn pass_labels(list: &CommandList) -> Vec<&str> {
    list.commands()
        .iter()
        .filter_map(|c| match c {
            Command::BeginComputePass { label } | Command::BeginRenderPass { label, .. } => Some(label.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_first_frame_draws_everything() {
    let mut renderer = wall_renderer();
    renderer.render().unwrap();

    let (counter, entries) = compacted(&mut renderer);
    assert_eq!(counter, 100);
    assert_eq!(drawn_objects(counter, &entries), (0..100).collect::<Vec<_>>());
    assert_eq!(renderer.backend().stats().indirect_draws, 100);
    assert_eq!(renderer.last_frame().unwrap().path, RenderPath::Occlusion);
}

#[test]
fn test_occluded_objects_are_not_drawn() {
    let mut renderer = wall_renderer();
    renderer.render().unwrap();

    inject_occluders(&mut renderer, |object| object < 63);
    renderer.render().unwrap();

    let (counter, entries) = compacted(&mut renderer);
    assert_eq!(counter, 37);
    assert_eq!(drawn_objects(counter, &entries), (63..100).collect::<Vec<_>>());

    let stats = renderer.backend().stats();
    assert_eq!(stats.indirect_calls, 1);
    assert_eq!(stats.indirect_draws, 37);
    assert_eq!(stats.draws, 2, "depth copy and visibility test");
}

#[test]
fn test_fully_occluded_frame_draws_nothing() {
    let mut renderer = wall_renderer();
    renderer.render().unwrap();

    inject_occluders(&mut renderer, |_| true);
    renderer.render().unwrap();

    let (counter, _) = compacted(&mut renderer);
    assert_eq!(counter, 0);
    assert!(visibility_flags(&mut renderer).iter().all(|&flag| flag == 0));

    let stats = renderer.backend().stats();
    assert_eq!(stats.indirect_calls, 1);
    assert_eq!(stats.indirect_draws, 0);
}

#[test]
fn test_compaction_matches_visibility_flags() {
    let mut renderer = wall_renderer();
    renderer.render().unwrap();
    inject_occluders(&mut renderer, |object| object % 3 == 0);
    renderer.render().unwrap();

    let flags = visibility_flags(&mut renderer);
    let (counter, entries) = compacted(&mut renderer);
    let visible: Vec<u32> = (0..100).filter(|&i| flags[i as usize] == 1).collect();

    assert_eq!(counter as usize, visible.len());
    assert_eq!(drawn_objects(counter, &entries), visible);
    assert!(visible.iter().all(|i| i % 3 != 0));

    let templates = renderer.scene_buffers().unwrap().draw_templates.clone();
    for entry in &entries[..counter as usize] {
        assert_eq!(*entry, templates[entry.first_instance as usize].args());
    }
}

#[test]
fn test_compute_and_point_stream_compaction_agree() {
    let mut renderer = wall_renderer();
    renderer.render().unwrap();

    let mut results = Vec::new();
    for variant in [CompactionVariant::Compute, CompactionVariant::PointStream] {
        renderer.toggles_mut().compaction = variant;
        inject_occluders(&mut renderer, |object| (object / GRID + object) % 4 == 0);
        renderer.render().unwrap();

        let submission = renderer.backend().last_submission().unwrap();
        let labels = pass_labels(submission);
        match variant {
            CompactionVariant::Compute => assert!(labels.contains(&"Compaction")),
            CompactionVariant::PointStream => assert!(labels.contains(&"Compaction (point stream)")),
        }

        let (counter, entries) = compacted(&mut renderer);
        results.push(drawn_objects(counter, &entries));
    }
    assert!(!results[0].is_empty());
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_baseline_path_ignores_visibility() {
    let mut renderer = wall_renderer();
    renderer.render().unwrap();
    inject_occluders(&mut renderer, |object| object < 63);

    renderer.toggles_mut().occlusion = false;
    renderer.render().unwrap();

    let report = renderer.last_frame().unwrap().clone();
    assert_eq!(report.path, RenderPath::Baseline);
    assert!(report.draw_candidates <= 100);
    assert_eq!(report.draw_candidates, 100, "whole wall is inside the frustum");

    let visibility = renderer.frame_slot(report.slot).unwrap().visibility;
    let stats = renderer.backend().stats();
    assert_eq!(stats.draws, report.draw_candidates);
    assert_eq!(stats.indirect_calls, 0);
    assert_eq!(stats.dispatches, 0);
    assert!(!stats.bound_buffers.contains(&visibility));
}

#[test]
fn test_baseline_culls_outside_frustum() {
    let mut renderer = wall_renderer();
    renderer.toggles_mut().occlusion = false;
    // Looking away from the wall
    *renderer.camera_mut() = Camera::looking_at(Vec3::new(0.0, 0.0, 20.0), Vec3::new(0.0, 0.0, 40.0), WIDTH, HEIGHT);
    renderer.render().unwrap();

    assert_eq!(renderer.last_frame().unwrap().draw_candidates, 0);
    assert_eq!(renderer.backend().stats().draws, 0);
}

#[test]
fn test_missing_indirect_first_instance_forces_baseline() {
    let mut caps = SoftwareBackend::default_capabilities();
    caps.indirect_first_instance = false;
    let mut renderer = renderer_with(SoftwareBackend::with_capabilities(WIDTH, HEIGHT, caps));
    renderer.set_scene(cube_wall()).unwrap();

    assert!(renderer.toggles().occlusion);
    assert_eq!(renderer.render_path(), RenderPath::Baseline);
    renderer.render().unwrap();
    assert_eq!(renderer.backend().stats().indirect_calls, 0);
}

#[test]
fn test_stale_entries_cleared_without_indirect_count() {
    let mut caps = SoftwareBackend::default_capabilities();
    caps.indirect_count = false;
    let mut renderer = renderer_with(SoftwareBackend::with_capabilities(WIDTH, HEIGHT, caps));
    renderer.toggles_mut().downsample = false;
    renderer.set_scene(cube_wall()).unwrap();

    // Fill both slots with 100 entries first
    renderer.render().unwrap();
    renderer.render().unwrap();
    inject_occluders(&mut renderer, |object| object < 63);
    renderer.render().unwrap();

    let (counter, entries) = compacted(&mut renderer);
    assert_eq!(counter, 37);
    assert!(entries[counter as usize..].iter().all(|e| *e == DrawIndexedArgs::default()));
}

#[test]
fn test_frame_records_passes_in_order() {
    let mut renderer = renderer_with(SoftwareBackend::new(WIDTH, HEIGHT));
    renderer.set_scene(cube_wall()).unwrap();

    renderer.render().unwrap();
    let first = renderer.backend().last_submission().unwrap();
    assert_eq!(pass_labels(first)[0], "Depth Prefill");

    renderer.render().unwrap();
    let second = renderer.backend().last_submission().unwrap();
    assert_eq!(
        pass_labels(second),
        vec!["Reproject", "Downsample", "Depth Copy", "Visibility Test", "Compaction", "Indirect Draw"]
    );
}

#[test]
fn test_resources_return_to_rest_states() {
    let mut renderer = renderer_with(SoftwareBackend::new(WIDTH, HEIGHT));
    renderer.set_scene(cube_wall()).unwrap();
    renderer.toggles_mut().wireframe = true;
    renderer.toggles_mut().depth_view = occlusion_engine::DepthView::Quarter;

    for _ in 0..3 {
        renderer.render().unwrap();
    }

    let targets = *renderer.targets();
    let slot = renderer.frame_slot(0).unwrap().clone();
    let backend = renderer.backend();
    assert_eq!(backend.resource_state(targets.depth), Some(ResourceState::DepthWrite));
    assert_eq!(backend.resource_state(targets.half.buffer), Some(ResourceState::ShaderResource));
    assert_eq!(backend.resource_state(targets.quarter.buffer), Some(ResourceState::ShaderResource));
    assert_eq!(backend.resource_state(slot.visibility), Some(ResourceState::ShaderResource));
    assert_eq!(backend.resource_state(slot.compacted), Some(ResourceState::IndirectArgument));
    assert_eq!(backend.resource_state(backend.backbuffer()), Some(ResourceState::Present));
    assert_eq!(backend.presented_frames(), 3);
}

#[test]
fn test_resize_rebuilds_targets_only() {
    let mut renderer = wall_renderer();
    renderer.render().unwrap();
    let before = renderer.scene_buffers().unwrap().clone();
    let template_bytes = 100 * std::mem::size_of::<DrawTemplate>() as u64;
    let transform_bytes = 100 * std::mem::size_of::<[[f32; 4]; 4]>() as u64;
    let templates = renderer.backend_mut().read_buffer(before.templates, 0, template_bytes).unwrap();
    let transforms = renderer.backend_mut().read_buffer(before.aabb_transforms, 0, transform_bytes).unwrap();

    renderer.resize(300, 200).unwrap();
    let targets = *renderer.targets();
    assert_eq!((targets.width, targets.height), (300, 200));
    assert_eq!(targets.half.size(), (150, 100));
    assert_eq!(targets.quarter.size(), (75, 50));
    assert_eq!(renderer.backend().backbuffer_size(), (300, 200));

    let after = renderer.scene_buffers().unwrap().clone();
    assert_eq!(after.templates, before.templates);
    assert_eq!(after.aabb_transforms, before.aabb_transforms);
    assert_eq!(after.draw_templates, before.draw_templates);
    let backend = renderer.backend_mut();
    assert_eq!(backend.read_buffer(after.templates, 0, template_bytes).unwrap(), templates);
    assert_eq!(backend.read_buffer(after.aabb_transforms, 0, transform_bytes).unwrap(), transforms);

    // History is gone: the next frame starts from a far depth buffer
    renderer.render().unwrap();
    let (counter, _) = compacted(&mut renderer);
    assert_eq!(counter, 100);
}

#[test]
fn test_zero_size_resize_is_ignored() {
    let mut renderer = wall_renderer();
    renderer.resize(0, 720).unwrap();
    assert_eq!(renderer.targets().width, WIDTH);
    assert_eq!(renderer.backend().backbuffer_size(), (WIDTH, HEIGHT));
}

#[test]
fn test_timings_arrive_after_delay() {
    let mut renderer = wall_renderer();
    let delay = EngineConfig::default().pipeline.timestamp_delay;

    for _ in 0..delay {
        renderer.render().unwrap();
        assert!(renderer.timings().is_none());
    }
    renderer.render().unwrap();

    let timings = renderer.timings().unwrap();
    assert_eq!(timings.frame_index, 0);
    assert_eq!(timings.path, RenderPath::Occlusion);
    for stage in ["Reproject", "Depth Copy", "Visibility Test", "Compaction", "Indirect Draw"] {
        assert!(timings.stage(stage).unwrap() > 0.0, "{} not timed", stage);
    }
    assert!(timings.stage("Direct Draw").is_none());
    assert!(timings.total_ms >= timings.stage_sum());
}

#[test]
fn test_invalid_transition_is_reported() {
    let mut renderer = wall_renderer();
    let depth = renderer.targets().depth;

    let mut list = CommandList::new("Bad Barrier");
    list.transition(depth, ResourceState::ShaderResource, ResourceState::DepthWrite);
    let result = renderer.backend_mut().submit(list);
    assert!(matches!(
        result,
        Err(PipelineError::InvalidTransition {
            expected: ResourceState::ShaderResource,
            actual: ResourceState::DepthWrite,
            ..
        })
    ));
}

#[test]
fn test_render_without_scene_clears_backbuffer() {
    let mut renderer = renderer_with(SoftwareBackend::new(64, 64));
    renderer.render().unwrap();

    let submission = renderer.backend().last_submission().unwrap();
    assert_eq!(pass_labels(submission), vec!["Clear"]);
    assert_eq!(renderer.last_frame().unwrap().draw_candidates, 0);
}

#[test]
fn test_shutdown_releases_resources() {
    let mut renderer = wall_renderer();
    renderer.render().unwrap();
    renderer.shutdown().unwrap();

    assert!(renderer.render().is_err());
    assert!(renderer.shutdown().is_ok());
    assert_eq!(renderer.backend().live_buffers(), 0);
}

#[test]
fn test_background_load_is_ready_after_upload() {
    use occlusion_engine::config::SceneConfig;
    use occlusion_engine::{LoadStatus, SyntheticScene};

    let mut renderer = renderer_with(SoftwareBackend::new(64, 64));
    renderer
        .load_scene(SyntheticScene::new(SceneConfig {
            grid_x: 4,
            grid_z: 4,
            spacing: 4.0,
            occluder_walls: 1,
            seed: 7,
        }))
        .unwrap();
    // Frames render (clear only) while the worker runs
    renderer.render().unwrap();

    // Without an update the assembled scene never reaches the device
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !matches!(renderer.status(), LoadStatus::Uploading { .. } | LoadStatus::Failed(_))
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert!(matches!(renderer.status(), LoadStatus::Uploading { .. }), "{}", renderer.status());
    assert!(renderer.scene_buffers().is_none());

    while !renderer.status().is_finished() && std::time::Instant::now() < deadline {
        renderer.update(0.0).unwrap();
        if matches!(renderer.status(), LoadStatus::Ready { .. }) {
            assert!(renderer.scene_buffers().is_some());
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let LoadStatus::Ready { objects } = renderer.status() else {
        panic!("scene did not load: {}", renderer.status());
    };
    assert!(objects > 16);
    assert_eq!(renderer.scene_buffers().unwrap().object_count as usize, objects);
    renderer.render().unwrap();
    assert_eq!(renderer.last_frame().unwrap().path, RenderPath::Occlusion);
}
