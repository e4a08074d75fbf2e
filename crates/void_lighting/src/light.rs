//! Deferred Lights
//!
//! Lights are submitted once per frame into a single array per frame key.
//! Each light carries a [`LightKind`] tag picked from its flags at
//! submission, and the array stays stably partitioned by kind so every stage
//! can borrow the deferred, cubemap or ambient lights as one slice.
//!
//! # Usage
//!
//! ```ignore
//! let mut lights = LightList::new();
//! lights.add(Light::point(42, Vec3::new(0.0, 2.0, -5.0), 4.0, Vec3::ONE), 1.0)?;
//! lights.add(Light::cubemap(7, Vec3::ZERO, Vec3::splat(10.0)), 1.0)?;
//!
//! for light in lights.lights(LightKind::Deferred) {
//!     // ...
//! }
//! ```

use glam::{Mat3, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{LightingError, Result};
use crate::shadow::ShadowFrustum;
use crate::texture::TextureId;

/// Bucket a light is processed in
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LightKind {
    /// Point, spot, area and projective lights
    Deferred,
    /// Environment probes
    Cubemap,
    /// Ambient-only lights
    Ambient,
}

impl LightKind {
    /// Every kind, in partition order
    pub const ALL: [LightKind; 3] = [Self::Deferred, Self::Cubemap, Self::Ambient];

    /// Kind implied by a light's flags
    pub fn from_flags(flags: LightFlags) -> Self {
        if flags.contains(LightFlags::DEFERRED_CUBEMAP) {
            Self::Cubemap
        } else if flags.contains(LightFlags::AMBIENT) {
            Self::Ambient
        } else {
            Self::Deferred
        }
    }
}

/// Light type and behaviour flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LightFlags(u32);

impl LightFlags {
    /// No flags
    pub const NONE: Self = Self(0);

    /// Directional light accumulated outside the per-light passes
    pub const DIRECTIONAL: Self = Self(1 << 0);

    /// Omnidirectional point light
    pub const POINT: Self = Self(1 << 1);

    /// Projective (spot) light with a frustum
    pub const PROJECTIVE: Self = Self(1 << 2);

    /// Rectangular area light
    pub const AREA: Self = Self(1 << 3);

    /// Ambient-only light blended multiplicatively
    pub const AMBIENT: Self = Self(1 << 4);

    /// Environment probe
    pub const DEFERRED_CUBEMAP: Self = Self(1 << 5);

    /// Box-projected probe
    pub const BOX_PROJECTION: Self = Self(1 << 6);

    /// Casts shadows this frame
    pub const CASTS_SHADOWS: Self = Self(1 << 7);

    /// Editor helper, never shaded
    pub const FAKE: Self = Self(1 << 8);

    /// Only contributes to volumetric fog
    pub const VOLUMETRIC_FOG_ONLY: Self = Self(1 << 9);

    /// The sun
    pub const SUN: Self = Self(1 << 10);

    /// Light is restricted to its clip volumes
    pub const CLIP_VOLUMES: Self = Self(1 << 11);

    /// Create flags from raw bits
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get raw bits
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check if all specified flags are set
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if any of the specified flags are set
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Insert flags
    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Remove flags
    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for LightFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Screen-space rectangle in pixels
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScissorRect {
    /// Left edge
    pub x: u16,
    /// Top edge
    pub y: u16,
    /// Width
    pub width: u16,
    /// Height
    pub height: u16,
}

impl ScissorRect {
    /// Create a rectangle
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle covering the whole viewport
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width.min(u16::MAX as u32) as u16, height.min(u16::MAX as u32) as u16)
    }

    /// Area in pixels
    pub fn area(&self) -> u32 {
        self.width as u32 * self.height as u32
    }

    /// Grow width and height by one pixel, saturating
    pub fn padded(self) -> Self {
        Self::new(self.x, self.y, self.width.saturating_add(1), self.height.saturating_add(1))
    }
}

/// Bulb size of lights that do not author one
pub const DEFAULT_BULB_SIZE: f32 = 0.05;

/// Intensity multiplier that makes an area light reach its authored
/// brightness one meter from its surface: solves `I / (1 + d / b)^2 = 1`
/// at `d = 1` for `I`.
#[inline]
pub fn bulb_intensity_multiplier(bulb_size: f32) -> f32 {
    let k = 1.0 + 1.0 / bulb_size;
    k * k
}

/// A light submitted for the current frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Light {
    /// Stable entity id, the light's identity across frames
    pub entity_id: u64,
    /// Index within its bucket, assigned at submission
    pub light_id: u16,
    /// Bucket
    pub kind: LightKind,
    /// Type and behaviour flags
    pub flags: LightFlags,
    /// World-space position
    pub position: Vec3,
    /// Influence radius
    pub radius: f32,
    /// Authored attenuation bulb size of non-area lights
    pub attenuation_bulb_size: f32,
    /// Linear RGB color
    pub color: Vec3,
    /// Specular multiplier
    pub specular_mult: f32,
    /// Orientation; columns are the light's right, up and forward axes
    pub basis: Mat3,
    /// Area light half width
    pub area_width: f32,
    /// Area light half height
    pub area_height: f32,
    /// Projector half angle in radians
    pub projector_angle: f32,
    /// Near plane of the projector frustum
    pub projector_near_plane: f32,
    /// Projected texture
    pub projector_texture: Option<TextureId>,
    /// Probe box half extents
    pub probe_extents: Vec3,
    /// Probe fade out factor
    pub probe_attenuation: f32,
    /// Probe attenuation falloff
    pub probe_falloff: f32,
    /// Probe diffuse cubemap
    pub diffuse_cubemap: Option<TextureId>,
    /// Probe specular cubemap
    pub specular_cubemap: Option<TextureId>,
    /// Width of the specular cubemap's top mip
    pub specular_cubemap_width: u32,
    /// Probe sort priority, higher renders later
    pub sort_priority: u8,
    /// Stencil refs of the clip volumes this light is restricted to
    pub clip_volume_refs: [u8; 2],
    /// Lens flare occlusion query handle
    pub occlusion_query: Option<u32>,
    /// Screen-space bounds, updated each frame
    pub scissor: ScissorRect,
    /// Shadow frustum set
    pub shadow: Option<ShadowFrustum>,
}

impl Light {
    fn base(entity_id: u64, flags: LightFlags, position: Vec3, radius: f32, color: Vec3) -> Self {
        Self {
            entity_id,
            light_id: 0,
            kind: LightKind::from_flags(flags),
            flags,
            position,
            radius,
            attenuation_bulb_size: DEFAULT_BULB_SIZE,
            color,
            specular_mult: 1.0,
            basis: Mat3::IDENTITY,
            area_width: 0.0,
            area_height: 0.0,
            projector_angle: 0.0,
            projector_near_plane: 0.0,
            projector_texture: None,
            probe_extents: Vec3::ZERO,
            probe_attenuation: 1.0,
            probe_falloff: 0.0,
            diffuse_cubemap: None,
            specular_cubemap: None,
            specular_cubemap_width: 0,
            sort_priority: 0,
            clip_volume_refs: [0; 2],
            occlusion_query: None,
            scissor: ScissorRect::default(),
            shadow: None,
        }
    }

    /// Omnidirectional point light
    pub fn point(entity_id: u64, position: Vec3, radius: f32, color: Vec3) -> Self {
        Self::base(entity_id, LightFlags::POINT, position, radius, color)
    }

    /// Projective spot light facing along `basis.z_axis`
    pub fn spot(entity_id: u64, position: Vec3, radius: f32, color: Vec3, basis: Mat3, half_angle: f32) -> Self {
        let mut light = Self::base(entity_id, LightFlags::PROJECTIVE, position, radius, color);
        light.basis = basis;
        light.projector_angle = half_angle;
        light
    }

    /// Rectangular area light with half extents `width` x `height`
    pub fn area(entity_id: u64, position: Vec3, radius: f32, color: Vec3, basis: Mat3, width: f32, height: f32) -> Self {
        let mut light = Self::base(entity_id, LightFlags::AREA, position, radius, color);
        light.basis = basis;
        light.area_width = width;
        light.area_height = height;
        light.projector_angle = core::f32::consts::FRAC_PI_2;
        light
    }

    /// Ambient-only light
    pub fn ambient(entity_id: u64, position: Vec3, radius: f32, color: Vec3) -> Self {
        Self::base(entity_id, LightFlags::AMBIENT | LightFlags::POINT, position, radius, color)
    }

    /// Environment probe with box extents
    pub fn cubemap(entity_id: u64, position: Vec3, extents: Vec3) -> Self {
        let mut light = Self::base(entity_id, LightFlags::DEFERRED_CUBEMAP, position, extents.length(), Vec3::ONE);
        light.probe_extents = extents;
        light
    }

    /// Attach a shadow frustum and mark the light as a caster
    pub fn with_shadow(mut self, frustum: ShadowFrustum) -> Self {
        self.shadow = Some(frustum);
        self.flags.insert(LightFlags::CASTS_SHADOWS);
        self
    }

    /// Add flags
    pub fn with_flags(mut self, flags: LightFlags) -> Self {
        self.flags.insert(flags);
        self.kind = LightKind::from_flags(self.flags);
        self
    }

    /// Attach probe cubemaps
    pub fn with_cubemaps(mut self, diffuse: TextureId, specular: TextureId, specular_width: u32) -> Self {
        self.diffuse_cubemap = Some(diffuse);
        self.specular_cubemap = Some(specular);
        self.specular_cubemap_width = specular_width;
        self
    }

    /// Has a usable area rectangle
    pub fn is_area(&self) -> bool {
        self.flags.contains(LightFlags::AREA) && self.area_width > 0.0 && self.area_height > 0.0
    }

    /// Projects through a frustum
    pub fn is_projective(&self) -> bool {
        self.flags.contains(LightFlags::PROJECTIVE)
    }

    /// Casts shadows this frame
    pub fn casts_shadows(&self) -> bool {
        self.flags.contains(LightFlags::CASTS_SHADOWS)
    }

    /// Is an ambient-only light
    pub fn is_ambient(&self) -> bool {
        self.flags.contains(LightFlags::AMBIENT)
    }

    /// Never shaded by the per-light passes
    pub fn is_skipped(&self) -> bool {
        self.flags.intersects(LightFlags::FAKE | LightFlags::VOLUMETRIC_FOG_ONLY)
    }

    /// Rec. 709 luminance of the light color
    pub fn luminance(&self) -> f32 {
        self.color.dot(Vec3::new(0.2126, 0.7152, 0.0722))
    }

    /// Radius of the volume the camera must be inside for full-screen bounds
    pub fn influence_radius(&self) -> f32 {
        if self.flags.contains(LightFlags::DEFERRED_CUBEMAP) {
            self.probe_extents.length()
        } else if self.is_area() {
            self.radius + self.area_width.max(self.area_height)
        } else {
            self.radius
        }
    }

    /// Size of the attenuation bulb used to renormalize intensity
    pub fn bulb_size(&self) -> f32 {
        if self.is_area() {
            (self.area_width + self.area_height) * 0.5
        } else {
            self.attenuation_bulb_size
        }
    }
}

/// Order lights by kind while keeping submission order within each kind
pub fn stable_partition_by_kind(lights: &mut [Light]) {
    lights.sort_by_key(|light| light.kind);
}

/// Lights of one kind a frame key can hold, ids stay below this
pub const MAX_LIGHTS_PER_KIND: usize = u16::MAX as usize;

/// The lights of one frame key
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LightList {
    lights: Vec<Light>,
    #[serde(skip)]
    full_warned: bool,
}

impl LightList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from unordered lights, ids assigned per bucket in input order
    pub fn from_lights(lights: Vec<Light>) -> Self {
        let mut list = Self {
            lights,
            full_warned: false,
        };
        for light in &mut list.lights {
            light.kind = LightKind::from_flags(light.flags);
        }
        stable_partition_by_kind(&mut list.lights);
        for kind in LightKind::ALL {
            let range = list.range(kind);
            if range.len() > MAX_LIGHTS_PER_KIND {
                log::warn!(
                    "Dropping {} {:?} lights past the {} light limit",
                    range.len() - MAX_LIGHTS_PER_KIND,
                    kind,
                    MAX_LIGHTS_PER_KIND
                );
                list.lights.drain(range.start + MAX_LIGHTS_PER_KIND..range.end);
            }
            for (index, light) in list.lights_mut(kind).iter_mut().enumerate() {
                light.light_id = index as u16;
            }
        }
        list
    }

    /// Submit a light scaled by `mult`, returning its id within its bucket
    ///
    /// Deferred lights scale color and specular; ambient lights fade their
    /// color from white; probes scale their attenuation.
    ///
    /// A bucket holding [`MAX_LIGHTS_PER_KIND`] lights refuses the light with
    /// [`LightingError::LightTableFull`], warning once until cleared.
    pub fn add(&mut self, mut light: Light, mult: f32) -> Result<u16> {
        light.kind = LightKind::from_flags(light.flags);
        let range = self.range(light.kind);
        if range.len() >= MAX_LIGHTS_PER_KIND {
            if !self.full_warned {
                self.full_warned = true;
                log::warn!(
                    "Light table full: {:?} light {} and later submissions are dropped",
                    light.kind,
                    light.entity_id
                );
            }
            return Err(LightingError::LightTableFull {
                kind: light.kind,
                max: MAX_LIGHTS_PER_KIND,
            });
        }

        match light.kind {
            LightKind::Deferred => {
                light.color *= mult;
                light.specular_mult *= mult;
            }
            LightKind::Ambient => {
                light.color = Vec3::ONE.lerp(light.color, mult);
            }
            LightKind::Cubemap => {
                light.probe_attenuation *= mult;
            }
        }

        // Bounded by the check above
        let id = range.len() as u16;
        light.light_id = id;
        self.lights.insert(range.end, light);
        Ok(id)
    }

    fn range(&self, kind: LightKind) -> core::ops::Range<usize> {
        let start = self.lights.partition_point(|l| l.kind < kind);
        let end = self.lights.partition_point(|l| l.kind <= kind);
        start..end
    }

    /// Lights of a kind
    pub fn lights(&self, kind: LightKind) -> &[Light] {
        &self.lights[self.range(kind)]
    }

    /// Mutable lights of a kind
    pub fn lights_mut(&mut self, kind: LightKind) -> &mut [Light] {
        let range = self.range(kind);
        &mut self.lights[range]
    }

    /// Every light, partitioned by kind
    pub fn all(&self) -> &[Light] {
        &self.lights
    }

    /// Every light, mutable
    pub fn all_mut(&mut self) -> &mut [Light] {
        &mut self.lights
    }

    /// Number of lights of a kind
    pub fn count(&self, kind: LightKind) -> usize {
        self.range(kind).len()
    }

    /// Total number of lights
    pub fn len(&self) -> usize {
        self.lights.len()
    }

    /// No lights submitted
    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    /// Light of a kind by its submission id
    pub fn by_id(&self, kind: LightKind, light_id: u16) -> Option<&Light> {
        self.lights(kind).iter().find(|l| l.light_id == light_id)
    }

    /// Drop every light
    pub fn clear(&mut self) {
        self.lights.clear();
        self.full_warned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_kind_from_flags() {
        assert_eq!(LightKind::from_flags(LightFlags::POINT), LightKind::Deferred);
        assert_eq!(LightKind::from_flags(LightFlags::AMBIENT), LightKind::Ambient);
        assert_eq!(
            LightKind::from_flags(LightFlags::AMBIENT | LightFlags::DEFERRED_CUBEMAP),
            LightKind::Cubemap
        );
    }

    #[test]
    fn test_add_keeps_partition_and_ids() {
        let mut list = LightList::new();
        assert_eq!(list.add(Light::point(1, Vec3::ZERO, 1.0, Vec3::ONE), 1.0).unwrap(), 0);
        assert_eq!(list.add(Light::cubemap(2, Vec3::ZERO, Vec3::ONE), 1.0).unwrap(), 0);
        assert_eq!(list.add(Light::point(3, Vec3::ZERO, 1.0, Vec3::ONE), 1.0).unwrap(), 1);
        assert_eq!(list.add(Light::ambient(4, Vec3::ZERO, 1.0, Vec3::ONE), 1.0).unwrap(), 0);

        let kinds: Vec<_> = list.all().iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![LightKind::Deferred, LightKind::Deferred, LightKind::Cubemap, LightKind::Ambient]
        );
        let deferred: Vec<_> = list.lights(LightKind::Deferred).iter().map(|l| l.entity_id).collect();
        assert_eq!(deferred, vec![1, 3]);
        assert_eq!(list.by_id(LightKind::Deferred, 1).map(|l| l.entity_id), Some(3));
        assert_eq!(list.count(LightKind::Cubemap), 1);
    }

    #[test]
    fn test_submission_scaling() {
        let mut list = LightList::new();
        list.add(Light::point(1, Vec3::ZERO, 1.0, Vec3::splat(2.0)), 0.5).unwrap();
        list.add(Light::ambient(2, Vec3::ZERO, 1.0, Vec3::ZERO), 0.25).unwrap();
        let mut probe = Light::cubemap(3, Vec3::ZERO, Vec3::ONE);
        probe.probe_attenuation = 0.8;
        list.add(probe, 0.5).unwrap();

        let point = &list.lights(LightKind::Deferred)[0];
        assert_relative_eq!(point.color.x, 1.0);
        assert_relative_eq!(point.specular_mult, 0.5);

        let ambient = &list.lights(LightKind::Ambient)[0];
        assert_relative_eq!(ambient.color.x, 0.75);

        let probe = &list.lights(LightKind::Cubemap)[0];
        assert_relative_eq!(probe.probe_attenuation, 0.4);
    }

    #[test]
    fn test_from_lights_is_stable() {
        let lights = vec![
            Light::ambient(10, Vec3::ZERO, 1.0, Vec3::ONE),
            Light::point(11, Vec3::ZERO, 1.0, Vec3::ONE),
            Light::ambient(12, Vec3::ZERO, 1.0, Vec3::ONE),
            Light::point(13, Vec3::ZERO, 1.0, Vec3::ONE),
        ];
        let list = LightList::from_lights(lights);
        let order: Vec<_> = list.all().iter().map(|l| (l.entity_id, l.light_id)).collect();
        assert_eq!(order, vec![(11, 0), (13, 1), (10, 0), (12, 1)]);
    }

    #[test]
    fn test_bulb_formula() {
        for b in [0.001f32, 1.0, 100.0] {
            let expected = (1.0 + 1.0 / b) * (1.0 + 1.0 / b);
            assert_relative_eq!(bulb_intensity_multiplier(b), expected, max_relative = 1e-6);
        }
        assert_relative_eq!(bulb_intensity_multiplier(1.0), 4.0);
    }

    #[test]
    fn test_influence_radius() {
        let point = Light::point(1, Vec3::ZERO, 3.0, Vec3::ONE);
        assert_relative_eq!(point.influence_radius(), 3.0);

        let area = Light::area(2, Vec3::ZERO, 3.0, Vec3::ONE, Mat3::IDENTITY, 2.0, 4.0);
        assert_relative_eq!(area.influence_radius(), 7.0);
        assert_relative_eq!(area.bulb_size(), 3.0);
        assert_relative_eq!(point.bulb_size(), DEFAULT_BULB_SIZE);

        let probe = Light::cubemap(3, Vec3::ZERO, Vec3::new(3.0, 4.0, 0.0));
        assert_relative_eq!(probe.influence_radius(), 5.0);
    }

    #[test]
    fn test_scissor_helpers() {
        let rect = ScissorRect::full(1920, 1080);
        assert_eq!(rect.area(), 1920 * 1080);
        assert_eq!(ScissorRect::new(1, 2, 3, 4).padded(), ScissorRect::new(1, 2, 4, 5));
    }
}
