//! Fly camera
//!
//! Right-handed, Y up, depth in [0, 1] with 1.0 at the far plane.

use glam::{Mat4, Vec3};

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// Radians, 0 looks down -Z
    pub yaw: f32,
    /// Radians, clamped just short of straight up/down
    pub pitch: f32,
    pub fov_y: f32,
    pub aspect: f32,
    pub z_near: f32,
    pub z_far: f32,
}

const PITCH_LIMIT: f32 = std::f32::consts::FRAC_PI_2 - 0.01;

impl Camera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            position: Vec3::new(0.0, 6.0, 40.0),
            yaw: 0.0,
            pitch: -0.1,
            fov_y: 60f32.to_radians(),
            aspect: aspect_ratio(width, height),
            z_near: 0.1,
            z_far: 1000.0,
        }
    }

    pub fn looking_at(position: Vec3, target: Vec3, width: u32, height: u32) -> Self {
        let mut camera = Self::new(width, height);
        camera.position = position;
        let dir = (target - position).normalize_or_zero();
        camera.yaw = (-dir.x).atan2(-dir.z);
        camera.pitch = dir.y.clamp(-1.0, 1.0).asin().clamp(-PITCH_LIMIT, PITCH_LIMIT);
        camera
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.aspect = aspect_ratio(width, height);
    }

    pub fn forward(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        Vec3::new(-sin_yaw * cos_pitch, sin_pitch, -cos_yaw * cos_pitch)
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize_or_zero()
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), Vec3::Y)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.z_near, self.z_far)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    pub fn rotate(&mut self, delta_yaw: f32, delta_pitch: f32) {
        self.yaw += delta_yaw;
        self.pitch = (self.pitch + delta_pitch).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }
}

fn aspect_ratio(width: u32, height: u32) -> f32 {
    width.max(1) as f32 / height.max(1) as f32
}

/// Held-key state driving the camera each update
#[derive(Debug, Clone, Default)]
pub struct CameraController {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub turn_left: bool,
    pub turn_right: bool,
    pub look_up: bool,
    pub look_down: bool,
    pub boost: bool,
}

impl CameraController {
    pub const MOVE_SPEED: f32 = 12.0;
    pub const TURN_SPEED: f32 = 1.5;

    pub fn is_idle(&self) -> bool {
        !(self.forward
            || self.backward
            || self.left
            || self.right
            || self.up
            || self.down
            || self.turn_left
            || self.turn_right
            || self.look_up
            || self.look_down)
    }

    pub fn update(&self, camera: &mut Camera, dt: f32) {
        let axis = |pos: bool, neg: bool| (pos as i32 - neg as i32) as f32;
        let speed = Self::MOVE_SPEED * if self.boost { 4.0 } else { 1.0 } * dt;

        let movement = camera.forward() * axis(self.forward, self.backward)
            + camera.right() * axis(self.right, self.left)
            + Vec3::Y * axis(self.up, self.down);
        camera.position += movement.normalize_or_zero() * speed;

        camera.rotate(
            axis(self.turn_left, self.turn_right) * Self::TURN_SPEED * dt,
            axis(self.look_up, self.look_down) * Self::TURN_SPEED * dt,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_range_is_zero_to_one() {
        let camera = Camera::looking_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -1.0), 16, 9);
        let vp = camera.view_projection();

        let near = vp.project_point3(Vec3::new(0.0, 0.0, -camera.z_near));
        let far = vp.project_point3(Vec3::new(0.0, 0.0, -camera.z_far));
        assert!(near.z.abs() < 1e-4);
        assert!((far.z - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_looking_at_faces_target() {
        let camera = Camera::looking_at(Vec3::new(10.0, 5.0, 10.0), Vec3::ZERO, 4, 3);
        let expected = (Vec3::ZERO - camera.position).normalize();
        assert!(camera.forward().dot(expected) > 0.999);
    }

    #[test]
    fn test_controller_moves_forward() {
        let mut camera = Camera::new(4, 3);
        let start = camera.position;
        let controller = CameraController {
            forward: true,
            ..Default::default()
        };
        controller.update(&mut camera, 1.0);
        let moved = camera.position - start;
        assert!((moved.length() - CameraController::MOVE_SPEED).abs() < 1e-3);
        assert!(moved.normalize().dot(camera.forward()) > 0.999);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = Camera::new(4, 3);
        camera.rotate(0.0, 10.0);
        assert!(camera.pitch < std::f32::consts::FRAC_PI_2);
    }
}
