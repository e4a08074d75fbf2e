//! Light Classification
//!
//! Per-light screen bounds, depth bounds and draw technique selection, plus
//! the light and probe orderings applied before the passes run.
//!
//! # Technique selection
//!
//! Every light is drawn one of three ways:
//!
//! - **Full-screen triangle**: cheapest setup, shades every pixel in the scissor
//! - **Stencil prepass**: the light shape is culled into the stencil first
//! - **Light volume**: a proxy sphere or box is rasterized with back-face culling
//!
//! A volume is only usable when it does not cross the camera near plane;
//! otherwise the stencil prepass takes over. Tiny lights skip the volume
//! since its vertex work costs more than the pixels it saves.

use core::cmp::Ordering;

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};
use serde::{Deserialize, Serialize};

use crate::camera::CameraView;
use crate::config::{LightSortMode, LightVolumeConfig};
use crate::light::{Light, LightFlags, ScissorRect};

/// Expansion applied to light volumes so tessellated proxies cover the sphere
pub const LIGHT_VOLUME_EXPANSION: f32 = 1.08;

/// Bias added to small light radii before the camera-inside test
const SMALL_LIGHT_BIAS: f32 = 0.5;

/// Widest projector half angle used for bounds (just under 90 degrees)
const MAX_PROJECTOR_HALF_ANGLE: f32 = 1.56;

/// Proxy mesh tessellation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeshDetail {
    /// Default proxy
    #[default]
    Low,
    /// Finer proxy for lights covering a large share of the screen
    Medium,
    /// Finest proxy
    High,
}

/// How a light is drawn
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightRenderSettings {
    /// Cull the light shape into the stencil before shading
    pub stencil_prepass: bool,
    /// Rasterize a proxy volume instead of a full-screen triangle
    pub light_volume: bool,
    /// Proxy tessellation
    pub mesh: MeshDetail,
}

/// Oriented box used by the near-plane test and the volume draws
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrientedBox {
    /// Center in world space
    pub center: Vec3,
    /// Unit axes as columns
    pub axes: Mat3,
    /// Half extents along each axis
    pub half_extents: Vec3,
}

impl OrientedBox {
    /// Box from an orientation that may carry scale
    pub fn new(center: Vec3, basis: Mat3, half_extents: Vec3) -> Self {
        Self {
            center,
            axes: Mat3::from_cols(
                basis.x_axis.normalize_or_zero(),
                basis.y_axis.normalize_or_zero(),
                basis.z_axis.normalize_or_zero(),
            ),
            half_extents,
        }
    }

    /// Whether the box straddles a plane `(normal, d)`
    ///
    /// Separating-axis test: the box's projected radius on the plane normal
    /// against the signed distance of its center.
    pub fn intersects_plane(&self, plane: Vec4) -> bool {
        let n = plane.xyz();
        let projected = self.half_extents.x * n.dot(self.axes.x_axis).abs()
            + self.half_extents.y * n.dot(self.axes.y_axis).abs()
            + self.half_extents.z * n.dot(self.axes.z_axis).abs();
        let distance = n.dot(self.center) + plane.w;
        distance.abs() <= projected
    }

    /// Transform mapping the unit cube [-1, 1]^3 onto the box
    pub fn unit_cube_to_world(&self) -> Mat4 {
        Mat4::from_cols(
            (self.axes.x_axis * self.half_extents.x).extend(0.0),
            (self.axes.y_axis * self.half_extents.y).extend(0.0),
            (self.axes.z_axis * self.half_extents.z).extend(0.0),
            self.center.extend(1.0),
        )
    }
}

/// Box volume of an area light, reaching `reach` in front of the surface
pub fn area_light_volume(light: &Light, reach: f32) -> OrientedBox {
    let forward = light.basis.z_axis.normalize_or_zero();
    OrientedBox::new(
        light.position + forward * (reach * 0.5),
        light.basis,
        Vec3::new(light.area_width + reach, light.area_height + reach, reach * 0.5),
    )
}

/// Box volume of an environment probe
pub fn probe_volume(light: &Light) -> OrientedBox {
    OrientedBox::new(light.position, light.basis, light.probe_extents)
}

/// Transform of the sphere or box proxy drawn for a light
pub fn light_volume_transform(light: &Light) -> Mat4 {
    let reach = light.radius * LIGHT_VOLUME_EXPANSION;
    if light.is_area() {
        area_light_volume(light, reach).unit_cube_to_world()
    } else {
        Mat4::from_scale_rotation_translation(Vec3::splat(reach), glam::Quat::IDENTITY, light.position)
    }
}

/// View-space points where planes through the eye touch a sphere
///
/// For each of the x and y axes the two tangent planes containing the
/// other axis are solved in closed form. The discriminant is clamped so an
/// eye exactly on the tangent boundary still yields finite points.
fn sphere_tangent_points(center: Vec3, radius: f32) -> [Vec3; 4] {
    let mut points = [center; 4];
    let r2 = radius * radius;

    for (slot, axis) in [0usize, 1].into_iter().enumerate() {
        let l = center[axis];
        let lz = center.z;
        let denom = l * l + lz * lz;
        let disc = (r2 * l * l - denom * (r2 - lz * lz)).max(0.0).sqrt();

        for (side, sign) in [1.0f32, -1.0].into_iter().enumerate() {
            let nl = if denom != 0.0 { (radius * l + sign * disc) / denom } else { 1.0 };
            let nz = if lz != 0.0 { (radius - nl * l) / lz } else { 1.0 };

            let mut normal = Vec3::ZERO;
            normal[axis] = nl;
            normal.z = nz;
            points[slot * 2 + side] = center - normal.normalize_or_zero() * radius;
        }
    }
    points
}

/// World-space pyramid of a projector: apex then four base corners
fn projector_pyramid(light: &Light) -> [Vec3; 5] {
    let right = light.basis.x_axis.normalize_or_zero();
    let up = light.basis.y_axis.normalize_or_zero();
    let front = light.basis.z_axis.normalize_or_zero();

    let angle = light.projector_angle.min(MAX_PROJECTOR_HALF_ANGLE);
    let cone_radius = light.radius * angle.tan();
    let corner = core::f32::consts::SQRT_2 * cone_radius;

    let diag_a = (up + right).normalize_or_zero() * corner;
    let diag_b = (up - right).normalize_or_zero() * corner;
    let base = light.position + front * light.radius;

    [light.position, base + diag_a, base - diag_a, base + diag_b, base - diag_b]
}

#[derive(Clone, Copy)]
struct WindowBounds {
    min: Vec2,
    max: Vec2,
}

impl WindowBounds {
    fn empty() -> Self {
        Self { min: Vec2::ONE, max: Vec2::ZERO }
    }

    fn add(&mut self, window: Vec2) {
        self.min = self.min.min(window);
        self.max = self.max.max(window);
    }

    fn clamp_into(self, outer: WindowBounds) -> Self {
        Self {
            min: self.min.clamp(outer.min, outer.max),
            max: self.max.clamp(outer.min, outer.max),
        }
    }
}

/// Screen-space scissor rectangle covering the light's influence
///
/// A camera inside the influence radius gets the whole viewport. The
/// rectangle is in pixels with a top-left origin and never extends past the
/// viewport.
pub fn calculate_scissor_rect(light: &Light, camera: &CameraView) -> ScissorRect {
    let radius = light.influence_radius();
    if camera.position.distance(light.position) <= radius {
        return ScissorRect::full(camera.width, camera.height);
    }

    let center = camera.to_view(light.position);
    let mut sphere = WindowBounds::empty();
    for point in sphere_tangent_points(center, radius) {
        sphere.add(camera.project_clamped(point).0);
    }

    let mut bounds = sphere;
    if light.is_projective() {
        let mut pyramid = WindowBounds::empty();
        let mut min_z = f32::MAX;
        for vertex in projector_pyramid(light) {
            let (window, z) = camera.project_clamped(camera.to_view(vertex));
            pyramid.add(window);
            min_z = min_z.min(z);
        }
        // A pyramid crossing the near plane projects unreliably
        if min_z >= 0.0 {
            bounds = pyramid.clamp_into(sphere);
        }
    }

    to_pixels(bounds, camera.width, camera.height)
}

fn to_pixels(bounds: WindowBounds, width: u32, height: u32) -> ScissorRect {
    let w = width as f32;
    let h = height as f32;

    let x = ((bounds.min.x * w) as u32).min(width);
    let y = (((1.0 - bounds.max.y) * h) as u32).min(height);
    let rect_w = (((bounds.max.x - bounds.min.x).max(0.0) * w).ceil() as u32).min(width - x);
    let rect_h = (((bounds.max.y - bounds.min.y).max(0.0) * h).ceil() as u32).min(height - y);

    ScissorRect::new(x as u16, y as u16, rect_w as u16, rect_h as u16)
}

/// Depth buffer interval `(min, max)` touched by the light sphere
pub fn light_depth_bounds(light: &Light, camera: &CameraView) -> (f32, f32) {
    let distance = -camera.to_view(light.position).z;
    let radius = light.influence_radius();
    let near = camera.depth_of(distance - radius);
    let far = camera.depth_of(distance + radius);
    (near.min(far), near.max(far))
}

/// Choose between full-screen, stencil prepass and light volume
///
/// `light.scissor` must already hold this frame's rectangle.
pub fn light_render_settings(light: &Light, camera: &CameraView, config: &LightVolumeConfig) -> LightRenderSettings {
    let mut settings = LightRenderSettings::default();

    if config.light_volumes {
        let camera_clear = if light.is_area() {
            let reach = light.radius * LIGHT_VOLUME_EXPANSION;
            !area_light_volume(light, reach).intersects_plane(camera.near_plane())
        } else {
            let r = light.radius;
            let biased = (r * (-0.1 * r + 1.5).max(1.22)).max(r + SMALL_LIGHT_BIAS);
            biased * biased < light.position.distance_squared(camera.position)
        };

        if camera_clear {
            settings.light_volume = true;
        } else {
            settings.stencil_prepass = true;
        }
    }

    if config.lod_ratio != 0.0 {
        let ratio = config.lod_ratio * light.scissor.area() as f32 / camera.screen_area().max(1.0);
        if ratio < config.min_volume_ratio {
            settings.light_volume = false;
        }
        if config.stencil_ratio > config.stencil_ratio_gate {
            if ratio > config.high_detail_multiple * config.stencil_ratio {
                settings.mesh = MeshDetail::High;
            } else if ratio > config.medium_detail_multiple * config.stencil_ratio {
                settings.mesh = MeshDetail::Medium;
            }
        }
    }

    settings
}

/// Whether a probe's box crosses the camera near plane
pub fn probe_crosses_near_plane(light: &Light, camera: &CameraView) -> bool {
    probe_volume(light).intersects_plane(camera.near_plane())
}

fn score_order(a: &Light, b: &Light, camera: &CameraView) -> Ordering {
    b.scissor
        .area()
        .cmp(&a.scissor.area())
        .then_with(|| {
            let da = a.position.distance_squared(camera.position);
            let db = b.position.distance_squared(camera.position);
            da.total_cmp(&db)
        })
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}

/// Order lights before shadow packing
///
/// Packed lights move to the front when the mode prefers them (a stable
/// partition); each partition is then score sorted when the mode asks.
pub fn sort_lights(
    lights: &mut [Light],
    mode: LightSortMode,
    camera: &CameraView,
    is_packed: impl Fn(&Light) -> bool,
) {
    let split = if mode.prefers_packed() {
        lights.sort_by_key(|light| !is_packed(light));
        lights.iter().take_while(|light| is_packed(light)).count()
    } else {
        0
    };

    if mode.scores() {
        let (packed, rest) = lights.split_at_mut(split);
        packed.sort_by(|a, b| score_order(a, b, camera));
        rest.sort_by(|a, b| score_order(a, b, camera));
    }
}

/// Probe ordering: priority ascending, larger probes first, entity id
///
/// `reverse` flips the whole ordering for the tiled path, which truncates a
/// fixed-size list from the end.
pub fn sort_cubemaps(cubemaps: &mut [Light], reverse: bool) {
    cubemaps.sort_by(|a, b| {
        let order = a
            .sort_priority
            .cmp(&b.sort_priority)
            .then_with(|| b.radius.total_cmp(&a.radius))
            .then_with(|| a.entity_id.cmp(&b.entity_id));
        if reverse {
            order.reverse()
        } else {
            order
        }
    });
}

/// Whether the first sorted probe is the global environment probe
pub fn is_global_probe(light: &Light, radius_threshold: f32) -> bool {
    light.flags.contains(LightFlags::DEFERRED_CUBEMAP)
        && light.diffuse_cubemap.is_some()
        && light.radius >= radius_threshold
}
