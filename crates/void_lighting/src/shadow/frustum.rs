//! Shadow frustum set of one light.

use serde::{Deserialize, Serialize};

use super::packer::PackRect;
use crate::texture::TextureId;

/// Cube faces of an unwrapped omnidirectional shadow
pub const MAX_SHADOW_FACES: usize = 6;

/// Shadow-casting viewpoints of a light, filled by the culling stage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShadowFrustum {
    /// Requested shadow map size in texels (power of 2)
    pub texture_size: u32,

    /// Omnidirectional light unwrapped into six faces
    pub omni_unwrapped: bool,

    /// Atlas rectangle per face, valid while the face's allocation is live
    pub face_rects: [PackRect; MAX_SHADOW_FACES],

    /// Faces that need a shadow map render this frame
    pub shadow_gen_mask: u8,

    /// Frames between refreshes (0 = refresh every frame)
    pub update_rate: u8,

    /// Constant depth bias
    pub depth_const_bias: f32,

    /// Slope-scaled depth bias
    pub depth_slope_bias: f32,

    /// Lives in the shared shadow pool
    pub use_pool: bool,

    /// Sample with hardware comparison filtering
    pub hw_pcf: bool,

    /// Dedicated depth texture when not pooled
    pub depth_texture: Option<TextureId>,
}

impl ShadowFrustum {
    /// Pooled single-face frustum
    pub fn new(texture_size: u32) -> Self {
        Self {
            texture_size,
            omni_unwrapped: false,
            face_rects: [PackRect::default(); MAX_SHADOW_FACES],
            shadow_gen_mask: 0,
            update_rate: 0,
            depth_const_bias: 0.0001,
            depth_slope_bias: 1.0,
            use_pool: true,
            hw_pcf: true,
            depth_texture: None,
        }
    }

    /// Pooled six-face frustum of a point light
    pub fn omni(texture_size: u32) -> Self {
        Self {
            omni_unwrapped: true,
            ..Self::new(texture_size)
        }
    }

    /// Set the refresh interval
    pub fn with_update_rate(mut self, update_rate: u8) -> Self {
        self.update_rate = update_rate;
        self
    }

    /// Number of faces; area lights always use one
    pub fn face_count(&self, area_light: bool) -> usize {
        if self.omni_unwrapped && !area_light {
            MAX_SHADOW_FACES
        } else {
            1
        }
    }

    /// Mask with one bit per face
    pub fn all_faces_mask(&self, area_light: bool) -> u8 {
        ((1u16 << self.face_count(area_light)) - 1) as u8
    }

    /// Whether a face needs a shadow map render this frame
    pub fn needs_render(&self, face: usize) -> bool {
        self.shadow_gen_mask & (1 << face) != 0
    }
}
