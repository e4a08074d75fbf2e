//! Camera state captured once per frame and shared by all lighting stages.
//!
//! View space is right-handed and looks down -Z. Projection matrices map
//! depth into [0, 1] (or [1, 0] with reverse depth).

use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};
use serde::{Deserialize, Serialize};

/// Smallest w kept before the homogeneous divide
const MIN_CLIP_W: f32 = 1.0e-14;

/// Camera view for the frame being lit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraView {
    /// World-space position
    pub position: Vec3,
    /// World to view transform
    pub view: Mat4,
    /// View to clip transform
    pub projection: Mat4,
    /// Viewport width in pixels
    pub width: u32,
    /// Viewport height in pixels
    pub height: u32,
    /// Near clip distance
    pub near: f32,
    /// Far clip distance
    pub far: f32,
    /// Depth is stored reversed (near = 1)
    pub reverse_depth: bool,
    /// Rendering with a mirrored projection (cubemap capture, reflections)
    pub mirrored: bool,
}

impl CameraView {
    /// Perspective camera looking from `position` towards `target`
    pub fn look_at(
        position: Vec3,
        target: Vec3,
        up: Vec3,
        fov_y: f32,
        width: u32,
        height: u32,
        near: f32,
        far: f32,
    ) -> Self {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        Self {
            position,
            view: Mat4::look_at_rh(position, target, up),
            projection: Mat4::perspective_rh(fov_y, aspect, near, far),
            width,
            height,
            near,
            far,
            reverse_depth: false,
            mirrored: false,
        }
    }

    /// Combined world to clip transform
    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    /// Camera basis vectors in world space (right, up, forward)
    pub fn basis(&self) -> (Vec3, Vec3, Vec3) {
        let inv = self.view.inverse();
        let right = inv.x_axis.xyz().normalize_or_zero();
        let up = inv.y_axis.xyz().normalize_or_zero();
        let forward = -inv.z_axis.xyz().normalize_or_zero();
        (right, up, forward)
    }

    /// Forward direction in world space
    pub fn forward(&self) -> Vec3 {
        self.basis().2
    }

    /// World-space near plane as (normal, d), normal pointing into the frustum
    pub fn near_plane(&self) -> Vec4 {
        let forward = self.forward();
        let point = self.position + forward * self.near;
        forward.extend(-forward.dot(point))
    }

    /// Transform a world-space point to view space
    pub fn to_view(&self, world: Vec3) -> Vec3 {
        self.view.transform_point3(world)
    }

    /// Project a view-space point to window coordinates in [0, 1]
    ///
    /// X and Y are clamped to [-w, w] before the divide so points behind the
    /// near plane land on the screen border instead of flipping sides.
    /// Returns the window position and the post-divide z.
    pub fn project_clamped(&self, view_point: Vec3) -> (Vec2, f32) {
        let mut clip = self.projection * view_point.extend(1.0);
        clip.w = clip.w.max(MIN_CLIP_W);
        clip.x = clip.x.clamp(-clip.w, clip.w);
        clip.y = clip.y.clamp(-clip.w, clip.w);
        let ndc = clip / clip.w;

        let window = Vec2::new((1.0 + ndc.x) * 0.5, (1.0 + ndc.y) * 0.5);
        (window.clamp(Vec2::ZERO, Vec2::ONE), ndc.z)
    }

    /// Depth buffer value of a view-space depth (distance along -Z)
    pub fn depth_of(&self, view_distance: f32) -> f32 {
        let distance = view_distance.clamp(self.near, self.far);
        let clip = self.projection * Vec4::new(0.0, 0.0, -distance, 1.0);
        let depth = (clip.z / clip.w.max(MIN_CLIP_W)).clamp(0.0, 1.0);
        if self.reverse_depth {
            1.0 - depth
        } else {
            depth
        }
    }

    /// Viewport area in pixels
    pub fn screen_area(&self) -> f32 {
        self.width as f32 * self.height as f32
    }
}

impl Default for CameraView {
    fn default() -> Self {
        Self::look_at(
            Vec3::ZERO,
            Vec3::NEG_Z,
            Vec3::Y,
            core::f32::consts::FRAC_PI_2,
            1280,
            720,
            0.25,
            1024.0,
        )
    }
}
