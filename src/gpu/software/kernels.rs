//! CPU versions of the pipeline shaders
//!
//! Compute kernels follow their WGSL counterparts thread for thread, including
//! the bounds checks. Graphics kernels rasterize the same triangles with the
//! pipeline's depth test, so the software device produces the same buffers.

use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};

use crate::gpu::layout::{
    CompactionUniforms, DrawIndexedArgs, DrawTemplate, FrameUniforms, GridUniforms,
    ReprojectUniforms,
};

/// Cleared depth value; nothing behind it can be occluded
pub const FAR_DEPTH: f32 = 1.0;

/// Stored grid value for a depth; zero is reserved for "unwritten"
pub fn encode_depth(depth: f32) -> u32 {
    depth.clamp(0.0, FAR_DEPTH).to_bits()
}

/// Unwritten grid texels read back as far
pub fn decode_depth(bits: u32) -> f32 {
    if bits == 0 {
        FAR_DEPTH
    } else {
        f32::from_bits(bits)
    }
}

/// Pixel-space viewport a kernel writes into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// 2D depth surface view used by the raster kernels
pub struct DepthSurface<'a> {
    pub texels: &'a mut [f32],
    pub width: u32,
    pub height: u32,
}

impl DepthSurface<'_> {
    fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }
}

/// Reproject one half-resolution texel: farthest depth of the 2x2 source block
/// is unprojected with the previous inverse view-projection and scattered into
/// the current-view grid with an atomic max.
pub fn reproject_texel(params: &ReprojectUniforms, depth: &[f32], grid: &mut [u32], x: u32, y: u32) {
    let [src_w, src_h] = params.src_size;
    let [dst_w, dst_h] = params.dst_size;
    if x >= dst_w || y >= dst_h || src_w == 0 || src_h == 0 {
        return;
    }

    let mut farthest = 0.0f32;
    for j in 0..2 {
        for i in 0..2 {
            let sx = (x * 2 + i).min(src_w - 1);
            let sy = (y * 2 + j).min(src_h - 1);
            farthest = farthest.max(depth[(sy * src_w + sx) as usize]);
        }
    }
    if farthest >= FAR_DEPTH {
        return;
    }

    let u = ((x * 2 + 1) as f32) / src_w as f32;
    let v = ((y * 2 + 1) as f32) / src_h as f32;
    let ndc = Vec4::new(u * 2.0 - 1.0, 1.0 - v * 2.0, farthest, 1.0);
    let world = Mat4::from_cols_array_2d(&params.prev_inv_view_proj) * ndc;
    if world.w.abs() <= f32::EPSILON {
        return;
    }
    let world = world / world.w;

    let clip = Mat4::from_cols_array_2d(&params.view_proj) * world;
    if clip.w <= f32::EPSILON {
        return;
    }
    let ndc = clip.xyz() / clip.w;
    if ndc.z < 0.0 || ndc.z > FAR_DEPTH {
        return;
    }

    let px = ((ndc.x * 0.5 + 0.5) * dst_w as f32).floor();
    let py = ((0.5 - ndc.y * 0.5) * dst_h as f32).floor();
    if px < 0.0 || py < 0.0 || px >= dst_w as f32 || py >= dst_h as f32 {
        return;
    }

    let slot = &mut grid[(py as u32 * dst_w + px as u32) as usize];
    *slot = (*slot).max(encode_depth(ndc.z));
}

pub fn reproject(params: &ReprojectUniforms, depth: &[f32], grid: &mut [u32], threads: (u32, u32)) {
    for y in 0..threads.1 {
        for x in 0..threads.0 {
            reproject_texel(params, depth, grid, x, y);
        }
    }
}

/// Conservative 2x2 max reduction between two grids
pub fn downsample(params: &GridUniforms, src: &[u32], dst: &mut [u32], threads: (u32, u32)) {
    let [src_w, src_h] = params.src_size;
    let [dst_w, dst_h] = params.dst_size;
    if src_w == 0 || src_h == 0 {
        return;
    }
    for y in 0..threads.1.min(dst_h) {
        for x in 0..threads.0.min(dst_w) {
            let mut farthest = 0.0f32;
            for j in 0..2 {
                for i in 0..2 {
                    let sx = (x * 2 + i).min(src_w - 1);
                    let sy = (y * 2 + j).min(src_h - 1);
                    farthest = farthest.max(decode_depth(src[(sy * src_w + sx) as usize]));
                }
            }
            dst[(y * dst_w + x) as usize] = encode_depth(farthest);
        }
    }
}

/// Full-screen copy of a grid into the depth attachment (compare Always)
pub fn copy_grid_to_depth(params: &GridUniforms, grid: &[u32], target: &mut DepthSurface<'_>, viewport: PixelRect) {
    let [src_w, src_h] = params.src_size;
    for y in viewport.y..(viewport.y + viewport.height).min(target.height) {
        for x in viewport.x..(viewport.x + viewport.width).min(target.width) {
            let gx = (x - viewport.x).min(src_w.saturating_sub(1));
            let gy = (y - viewport.y).min(src_h.saturating_sub(1));
            let depth = decode_depth(grid[(gy * src_w + gx) as usize]);
            let index = target.index(x, y);
            target.texels[index] = depth;
        }
    }
}

fn aabb_contains(transform: &Mat4, point: Vec3) -> bool {
    let local = transform.inverse().transform_point3(point);
    local.abs().max_element() <= 0.5
}

/// Clip a triangle against the near plane (`z >= 0` in clip space)
///
/// Returns the clipped polygon, empty when the whole triangle is behind it.
fn clip_near(clip: [Vec4; 3]) -> Vec<Vec4> {
    let mut polygon = Vec::with_capacity(4);
    for i in 0..3 {
        let a = clip[i];
        let b = clip[(i + 1) % 3];
        if a.z >= 0.0 {
            polygon.push(a);
        }
        if (a.z >= 0.0) != (b.z >= 0.0) {
            let t = a.z / (a.z - b.z);
            polygon.push(a + (b - a) * t);
        }
    }
    polygon
}

fn to_screen(viewport: PixelRect, clip: Vec4) -> Vec3 {
    let ndc = clip.xyz() / clip.w;
    Vec3::new(
        viewport.x as f32 + (ndc.x * 0.5 + 0.5) * viewport.width as f32,
        viewport.y as f32 + (0.5 - ndc.y * 0.5) * viewport.height as f32,
        ndc.z,
    )
}

fn edge(a: Vec3, b: Vec3, px: f32, py: f32) -> f32 {
    (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x)
}

/// Visit the fragments of a screen-space triangle until `fragment` returns true
///
/// Standard coverage samples pixel centers. Conservative coverage takes every
/// pixel the triangle touches, with depth clamped to the triangle's range.
fn visit_fragments(
    tri: [Vec3; 3],
    bounds: PixelRect,
    conservative: bool,
    mut fragment: impl FnMut(u32, u32, f32) -> bool,
) -> bool {
    let area = edge(tri[0], tri[1], tri[2].x, tri[2].y);
    if area.abs() <= f32::EPSILON {
        return false;
    }
    let orientation = area.signum();
    let edges = [(tri[1], tri[2]), (tri[2], tri[0]), (tri[0], tri[1])];
    // Distance from the pixel center to the corner furthest inside each edge
    let reach = edges.map(|(a, b)| {
        if conservative {
            0.5 * ((b.x - a.x).abs() + (b.y - a.y).abs())
        } else {
            0.0
        }
    });
    let (z_min, z_max) = tri.iter().fold((f32::MAX, f32::MIN), |(lo, hi), p| (lo.min(p.z), hi.max(p.z)));

    let right = (bounds.x + bounds.width) as f32;
    let bottom = (bounds.y + bounds.height) as f32;
    let min_x = tri.iter().map(|p| p.x).fold(f32::MAX, f32::min).floor().max(bounds.x as f32);
    let max_x = tri.iter().map(|p| p.x).fold(f32::MIN, f32::max).ceil().min(right);
    let min_y = tri.iter().map(|p| p.y).fold(f32::MAX, f32::min).floor().max(bounds.y as f32);
    let max_y = tri.iter().map(|p| p.y).fold(f32::MIN, f32::max).ceil().min(bottom);
    if min_x >= max_x || min_y >= max_y {
        return false;
    }

    for y in min_y as u32..max_y as u32 {
        for x in min_x as u32..max_x as u32 {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            let mut weights = [0.0; 3];
            let mut inside = true;
            for (i, (a, b)) in edges.iter().enumerate() {
                let e = edge(*a, *b, px, py);
                if e * orientation + reach[i] < 0.0 {
                    inside = false;
                    break;
                }
                weights[i] = e / area;
            }
            if !inside {
                continue;
            }
            let mut z = weights[0] * tri[0].z + weights[1] * tri[1].z + weights[2] * tri[2].z;
            if conservative {
                z = z.clamp(z_min, z_max);
            }
            if !(0.0..=FAR_DEPTH).contains(&z) {
                continue;
            }
            if fragment(x, y, z) {
                return true;
            }
        }
    }
    false
}

/// Rasterize one clip-space triangle, clipped to the near plane and `viewport`
fn raster_clipped(
    clip: [Vec4; 3],
    viewport: PixelRect,
    surface: (u32, u32),
    conservative: bool,
    mut fragment: impl FnMut(u32, u32, f32) -> bool,
) -> bool {
    let bounds = PixelRect {
        x: viewport.x,
        y: viewport.y,
        width: viewport.width.min(surface.0.saturating_sub(viewport.x)),
        height: viewport.height.min(surface.1.saturating_sub(viewport.y)),
    };
    let polygon = clip_near(clip);
    if polygon.len() < 3 || polygon.iter().any(|c| c.w <= f32::EPSILON) {
        return false;
    }
    let screen: Vec<Vec3> = polygon.iter().map(|&c| to_screen(viewport, c)).collect();
    (1..screen.len() - 1).any(|i| visit_fragments([screen[0], screen[i], screen[i + 1]], bounds, conservative, &mut fragment))
}

/// Whether any proxy fragment passes a LessEqual test against `depth`
///
/// `triangles` is the proxy's triangle list in model space, instanced with
/// `transform`. Depth is only read. A camera inside the box always survives,
/// matching the near-plane fallback of the vertex shader.
pub fn proxy_survives(
    frame: &FrameUniforms,
    transform: &Mat4,
    triangles: &[Vec3],
    depth: &DepthSurface<'_>,
    viewport: PixelRect,
    conservative: bool,
) -> bool {
    if aabb_contains(transform, frame.camera_position()) {
        return true;
    }

    let mvp = frame.view_proj() * *transform;
    triangles.chunks_exact(3).any(|tri| {
        let clip = [0, 1, 2].map(|i| mvp * tri[i].extend(1.0));
        raster_clipped(clip, viewport, (depth.width, depth.height), conservative, |x, y, z| {
            z <= depth.texels[depth.index(x, y)]
        })
    })
}

/// Instanced visibility test; marking is an idempotent store of 1
#[allow(clippy::too_many_arguments)]
pub fn visibility_test(
    frame: &FrameUniforms,
    transforms: &[Mat4],
    triangles: &[Vec3],
    depth: &DepthSurface<'_>,
    viewport: PixelRect,
    conservative: bool,
    visibility: &mut [u32],
    instances: std::ops::Range<u32>,
) {
    for instance in instances {
        let (Some(transform), Some(flag)) = (
            transforms.get(instance as usize),
            visibility.get_mut(instance as usize),
        ) else {
            continue;
        };
        if proxy_survives(frame, transform, triangles, depth, viewport, conservative) {
            *flag = 1;
        }
    }
}

/// Append the template of every visible object, visiting threads in `order`
///
/// Returns the final counter value. Slots past `capacity` are dropped, which
/// cannot happen while capacity equals the object count.
pub fn compact(
    params: &CompactionUniforms,
    visibility: &[u32],
    templates: &[DrawTemplate],
    entries: &mut [DrawIndexedArgs],
    counter: &mut u32,
    order: impl Iterator<Item = u32>,
) -> u32 {
    for thread in order {
        if thread >= params.object_count {
            continue;
        }
        let index = thread as usize;
        if visibility.get(index).copied().unwrap_or(0) == 0 {
            continue;
        }
        let slot = *counter;
        *counter += 1;
        if slot < params.capacity {
            if let (Some(entry), Some(template)) = (entries.get_mut(slot as usize), templates.get(index)) {
                *entry = template.args();
            }
        }
    }
    *counter
}

/// Clip-space triangle raster with a Less depth test and depth writes
pub fn rasterize_triangle(target: &mut DepthSurface<'_>, viewport: PixelRect, clip: [Vec4; 3]) -> u32 {
    let surface = (target.width, target.height);
    let mut written = 0;
    raster_clipped(clip, viewport, surface, false, |x, y, z| {
        let index = target.index(x, y);
        if z < target.texels[index] {
            target.texels[index] = z;
            written += 1;
        }
        false
    });
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::culling::proxy::{PROXY_INDICES, PROXY_VERTICES};

    fn frame(view_proj: Mat4, eye: Vec3, count: u32) -> FrameUniforms {
        FrameUniforms::new(view_proj, eye, (8, 8), (16, 16), count)
    }

    fn proxy_triangles() -> Vec<Vec3> {
        PROXY_INDICES
            .iter()
            .map(|&i| Vec3::from_array(PROXY_VERTICES[i as usize].position))
            .collect()
    }

    fn camera() -> (Mat4, Vec3) {
        let eye = Vec3::new(0.0, 0.0, 10.0);
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        (proj * view, eye)
    }

    #[test]
    fn test_grid_encoding_treats_zero_as_far() {
        assert_eq!(decode_depth(0), FAR_DEPTH);
        assert_eq!(decode_depth(encode_depth(0.25)), 0.25);
        assert!(encode_depth(0.5) > encode_depth(0.25));
    }

    #[test]
    fn test_far_depth_marks_everything_visible() {
        let (vp, eye) = camera();
        let mut texels = vec![FAR_DEPTH; 64];
        let depth = DepthSurface { texels: &mut texels, width: 8, height: 8 };
        let viewport = PixelRect { x: 0, y: 0, width: 8, height: 8 };
        let transforms = vec![
            Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)),
            Mat4::from_translation(Vec3::new(2.0, 1.0, -20.0)),
        ];
        let mut visibility = vec![0; 2];
        visibility_test(&frame(vp, eye, 2), &transforms, &proxy_triangles(), &depth, viewport, true, &mut visibility, 0..2);
        assert_eq!(visibility, vec![1, 1]);
    }

    #[test]
    fn test_near_depth_occludes_proxy() {
        let (vp, eye) = camera();
        let mut texels = vec![0.01; 64];
        let depth = DepthSurface { texels: &mut texels, width: 8, height: 8 };
        let viewport = PixelRect { x: 0, y: 0, width: 8, height: 8 };
        let transforms = vec![Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0))];
        let mut visibility = vec![0];
        visibility_test(&frame(vp, eye, 1), &transforms, &proxy_triangles(), &depth, viewport, true, &mut visibility, 0..1);
        assert_eq!(visibility, vec![0]);
    }

    #[test]
    fn test_camera_inside_box_is_visible() {
        let (vp, eye) = camera();
        let mut texels = vec![0.0; 64];
        let depth = DepthSurface { texels: &mut texels, width: 8, height: 8 };
        let viewport = PixelRect { x: 0, y: 0, width: 8, height: 8 };
        let transform = Mat4::from_scale_rotation_translation(Vec3::splat(4.0), Default::default(), eye);
        assert!(proxy_survives(&frame(vp, eye, 1), &transform, &proxy_triangles(), &depth, viewport, false));
    }

    #[test]
    fn test_marking_is_idempotent() {
        let (vp, eye) = camera();
        let mut texels = vec![FAR_DEPTH; 64];
        let depth = DepthSurface { texels: &mut texels, width: 8, height: 8 };
        let viewport = PixelRect { x: 0, y: 0, width: 8, height: 8 };
        let transforms = vec![Mat4::IDENTITY];
        let mut visibility = vec![0];
        for _ in 0..3 {
            visibility_test(&frame(vp, eye, 1), &transforms, &proxy_triangles(), &depth, viewport, true, &mut visibility, 0..1);
        }
        assert_eq!(visibility, vec![1]);
    }

    /// Depth 0 over exactly the texels whose centers the proxy covers
    fn depth_over_footprint(view_proj: Mat4, size: u32) -> Vec<f32> {
        let viewport = PixelRect { x: 0, y: 0, width: size, height: size };
        let mut footprint = vec![FAR_DEPTH; (size * size) as usize];
        let mut surface = DepthSurface { texels: &mut footprint, width: size, height: size };
        for tri in proxy_triangles().chunks_exact(3) {
            let clip = [0, 1, 2].map(|i| view_proj * tri[i].extend(1.0));
            rasterize_triangle(&mut surface, viewport, clip);
        }
        footprint.iter().map(|&d| if d < FAR_DEPTH { 0.0 } else { FAR_DEPTH }).collect()
    }

    #[test]
    fn test_proxy_occluded_by_its_own_footprint() {
        let eye = Vec3::splat(10.0);
        let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0);
        let view_proj = proj * view;

        let mut texels = depth_over_footprint(view_proj, 64);
        let covered = texels.iter().filter(|&&d| d == 0.0).count();
        assert!(covered > 0 && covered < texels.len());

        let depth = DepthSurface { texels: &mut texels, width: 64, height: 64 };
        let viewport = PixelRect { x: 0, y: 0, width: 64, height: 64 };
        let uniforms = FrameUniforms::new(view_proj, eye, (64, 64), (128, 128), 1);
        let triangles = proxy_triangles();
        assert!(!proxy_survives(&uniforms, &Mat4::IDENTITY, &triangles, &depth, viewport, false));
        // Partially covered edge texels are still far
        assert!(proxy_survives(&uniforms, &Mat4::IDENTITY, &triangles, &depth, viewport, true));
    }

    #[test]
    fn test_proxy_fragment_depth_is_per_texel() {
        let (vp, eye) = camera();
        let transform = Mat4::from_scale_rotation_translation(Vec3::splat(4.0), Default::default(), Vec3::new(0.0, 0.0, -5.0));
        // Slightly behind the box front face everywhere
        let front = vp.project_point3(Vec3::new(0.0, 0.0, -3.0)).z;
        let mut texels = vec![front + 1e-4; 64];
        let depth = DepthSurface { texels: &mut texels, width: 8, height: 8 };
        let viewport = PixelRect { x: 0, y: 0, width: 8, height: 8 };
        assert!(proxy_survives(&frame(vp, eye, 1), &transform, &proxy_triangles(), &depth, viewport, false));

        let mut texels = vec![front - 1e-3; 64];
        let depth = DepthSurface { texels: &mut texels, width: 8, height: 8 };
        assert!(!proxy_survives(&frame(vp, eye, 1), &transform, &proxy_triangles(), &depth, viewport, true));
    }

    #[test]
    fn test_triangle_behind_eye_is_clipped() {
        let (vp, _) = camera();
        let mut texels = vec![FAR_DEPTH; 64];
        let mut target = DepthSurface { texels: &mut texels, width: 8, height: 8 };
        let viewport = PixelRect { x: 0, y: 0, width: 8, height: 8 };
        // Camera sits at z = 10 looking down -z
        let behind = [Vec3::new(-1.0, -1.0, 12.0), Vec3::new(1.0, -1.0, 12.0), Vec3::new(0.0, 1.0, 12.0)];
        let clip = behind.map(|p| vp * p.extend(1.0));
        assert_eq!(rasterize_triangle(&mut target, viewport, clip), 0);

        // Crossing the near plane keeps only the part in front
        let crossing = [Vec3::new(-1.0, -1.0, 12.0), Vec3::new(1.0, -1.0, 12.0), Vec3::new(0.0, 0.0, 0.0)];
        let clip = crossing.map(|p| vp * p.extend(1.0));
        assert!(rasterize_triangle(&mut target, viewport, clip) > 0);
        assert!(texels.iter().all(|&d| (0.0..=FAR_DEPTH).contains(&d)));
    }

    #[test]
    fn test_downsample_keeps_farthest() {
        let params = GridUniforms { src_size: [4, 2], dst_size: [2, 1] };
        let src = vec![
            encode_depth(0.1), encode_depth(0.2), encode_depth(0.3), encode_depth(0.3),
            encode_depth(0.4), encode_depth(0.1), 0, encode_depth(0.2),
        ];
        let mut dst = vec![0; 2];
        downsample(&params, &src, &mut dst, (2, 1));
        assert_eq!(decode_depth(dst[0]), 0.4);
        assert_eq!(decode_depth(dst[1]), FAR_DEPTH);
    }

    #[test]
    fn test_reprojection_with_unchanged_camera_preserves_depth() {
        let (vp, _) = camera();
        let params = ReprojectUniforms {
            prev_inv_view_proj: vp.inverse().to_cols_array_2d(),
            view_proj: vp.to_cols_array_2d(),
            src_size: [8, 8],
            dst_size: [4, 4],
        };
        let depth = vec![0.5; 64];
        let mut grid = vec![0; 16];
        reproject(&params, &depth, &mut grid, (4, 4));
        for bits in grid {
            assert!((decode_depth(bits) - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn test_reprojection_skips_far_texels() {
        let (vp, _) = camera();
        let params = ReprojectUniforms {
            prev_inv_view_proj: vp.inverse().to_cols_array_2d(),
            view_proj: vp.to_cols_array_2d(),
            src_size: [8, 8],
            dst_size: [4, 4],
        };
        let depth = vec![FAR_DEPTH; 64];
        let mut grid = vec![0; 16];
        reproject(&params, &depth, &mut grid, (4, 4));
        assert!(grid.iter().all(|&bits| bits == 0));
    }

    #[test]
    fn test_compaction_order_independent_set() {
        let params = CompactionUniforms { object_count: 6, capacity: 6, _padding: [0; 2] };
        let visibility = vec![1, 0, 1, 1, 0, 1];
        let templates: Vec<_> = (0..6)
            .map(|i| DrawTemplate { index_count: 36, instance_count: 1, first_instance: i, ..Default::default() })
            .collect();

        let mut forward = vec![DrawIndexedArgs::default(); 6];
        let mut counter = 0;
        assert_eq!(compact(&params, &visibility, &templates, &mut forward, &mut counter, 0..6), 4);

        let mut reverse = vec![DrawIndexedArgs::default(); 6];
        let mut counter = 0;
        compact(&params, &visibility, &templates, &mut reverse, &mut counter, (0..6).rev());

        let mut a: Vec<_> = forward[..4].iter().map(|e| e.first_instance).collect();
        let mut b: Vec<_> = reverse[..4].iter().map(|e| e.first_instance).collect();
        assert_ne!(a, b);
        a.sort();
        b.sort();
        assert_eq!(a, vec![0, 2, 3, 5]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rasterize_writes_nearer_depth_only() {
        let mut texels = vec![FAR_DEPTH; 16];
        let mut target = DepthSurface { texels: &mut texels, width: 4, height: 4 };
        let viewport = PixelRect { x: 0, y: 0, width: 4, height: 4 };
        let tri = [
            Vec4::new(-1.0, -1.0, 0.5, 1.0),
            Vec4::new(3.0, -1.0, 0.5, 1.0),
            Vec4::new(-1.0, 3.0, 0.5, 1.0),
        ];
        assert_eq!(rasterize_triangle(&mut target, viewport, tri), 16);
        assert_eq!(rasterize_triangle(&mut target, viewport, tri), 0);
        assert!(texels.iter().all(|&d| d == 0.5));
    }
}
