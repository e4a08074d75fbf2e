//! Shader Technique Contract
//!
//! The lighting passes never see shader code. Each draw names a technique,
//! sets a permutation mask and uploads named float4 parameters; the material
//! system behind the device resolves the rest.

use serde::{Deserialize, Serialize};

/// Technique names
pub mod technique {
    /// Full-screen ambient term
    pub const AMBIENT_PASS: &str = "AmbientPass";
    /// Per-light full-screen shading
    pub const LIGHT_PASS: &str = "DeferredLightPass";
    /// Per-light proxy volume shading
    pub const LIGHT_VOLUME: &str = "DeferredLightVolume";
    /// Environment probe, full screen
    pub const CUBEMAP_PASS: &str = "DeferredCubemapPass";
    /// Environment probe, box volume
    pub const CUBEMAP_VOLUME: &str = "DeferredCubemapVolume";
    /// Final composite
    pub const SHADING_PASS: &str = "DeferredShadingPass";
    /// Normal/gloss filtering of the G-buffer
    pub const FILTER_GBUFFER: &str = "FilterGBuffer";
    /// Decal projected through a box
    pub const DECAL_VOLUME: &str = "DeferredDecalVolume";
    /// Emissive decal
    pub const DECAL_EMISSIVE: &str = "DeferredDecalEmissive";
    /// Emissive decal drawn as a volume
    pub const DECAL_EMISSIVE_VOLUME: &str = "DeferredDecalEmissiveVolume";
    /// Portal blend weights between clip volumes
    pub const PORTAL_BLEND: &str = "PortalBlendVal";
    /// Stencil copy into a sampleable texture
    pub const RESOLVE_STENCIL: &str = "ResolveStencil";
    /// Screen-space reflection trace
    pub const SSR_TRACE: &str = "SSR_Raytrace";
    /// Screen-space reflection composite
    pub const APPLY_SSR: &str = "ApplySSR";
    /// Height-map ambient occlusion
    pub const HEIGHT_MAP_AO: &str = "HeightMapAOPass";
    /// Height-map ambient occlusion blur
    pub const HEIGHT_MAP_AO_BLUR: &str = "HMAO_Blur";
    /// Directional occlusion
    pub const SSDO: &str = "DirOccPass";
    /// Directional occlusion blur
    pub const SSDO_BLUR: &str = "SSDO_Blur";
    /// Subsurface scattering blur
    pub const SSS_BLUR: &str = "SSSSS_Blur";
    /// Water caustics projected on the G-buffer
    pub const WATER_CAUSTICS: &str = "DeferredWaterCaustics";
    /// Volumetric fog clip-volume stencil
    pub const VOLUMETRIC_FOG_STENCIL: &str = "VolFogClipVolumeStencil";
    /// Tiled compute lighting
    pub const TILED_SHADING: &str = "TiledDeferredShading";
    /// Stencil clear drawn as a full-screen pass
    pub const CLEAR_STENCIL: &str = "ClearStencil";
}

/// Parameter names
pub mod param {
    /// Light position relative to the camera, inverse radius in w
    pub const LIGHT_POS: &str = "g_LightPos";
    /// Light color, specular multiplier in w
    pub const LIGHT_DIFFUSE: &str = "g_LightDiffuse";
    /// Bulb size and packed clip-volume stencil refs
    pub const ATTEN_PARAMS: &str = "g_AttenParams";
    /// Area light basis and size
    pub const AREA_LIGHT_MATRIX: &str = "g_AreaLightMatrix";
    /// Projector matrix
    pub const LIGHT_PROJ_MATRIX: &str = "g_mLightProj";
    /// Shadow kernel, atlas scale and bias
    pub const SHADOW_PARAMS: &str = "g_ShadowParams";
    /// Atlas rectangle of the bound shadow face
    pub const SHADOW_RECT: &str = "g_ShadowRect";
    /// Per-stencil-id clip volume table
    pub const CLIP_VOLUME_PARAMS: &str = "g_vVisAreasParams";
    /// Probe box axes and inverse extents
    pub const OBB_PARAMS: &str = "g_mObbParams";
    /// Probe or global cubemap mip bias
    pub const CUBEMAP_MIP: &str = "g_CubemapMip";
    /// Ambient color
    pub const AMBIENT: &str = "g_Ambient";
    /// Ambient ground color
    pub const AMBIENT_GROUND: &str = "g_AmbientGround";
    /// Height falloff (min, max, 1 / max)
    pub const AMBIENT_HEIGHT: &str = "g_AmbientHeightParams";
    /// Global cubemap diffuse color
    pub const CUBEMAP_DIFFUSE: &str = "g_CubemapDiffuse";
    /// Sun color, specular multiplier in w
    pub const SUN_COLOR: &str = "g_SunColor";
    /// Stencil id of a portal blend volume
    pub const PORTAL_REF: &str = "g_PortalRef";
    /// Blend planes of a portal blend volume
    pub const PORTAL_PLANES: &str = "g_PortalPlanes";
    /// Decal normal map to world rotation
    pub const DECAL_TS: &str = "g_mDecalTS";
    /// Decal diffuse color, opacity in w
    pub const DECAL_DIFFUSE: &str = "g_DecalDiffuse";
    /// Decal specular color, smoothness in w
    pub const DECAL_SPECULAR: &str = "g_DecalSpecular";
    /// Decal angle attenuation
    pub const DECAL_ANGLE_ATTENUATION: &str = "g_DecalAngleAttenuation";
    /// Decal alpha multiplier, falloff, diffuse opacity and grow alpha ref
    pub const DECAL_PARAMS: &str = "g_GeneralParams";
    /// Decal emissive color and intensity
    pub const DECAL_EMISSIVE: &str = "g_DecalEmissive";
    /// Current view-projection
    pub const VIEW_PROJ: &str = "g_mViewProj";
    /// View-projection of the frame the history target was rendered with
    pub const VIEW_PROJ_PREV: &str = "g_mViewProjPrev";
    /// Directional occlusion radius and clamp
    pub const SSDO_PARAMS: &str = "SSDOParams";
    /// Height map occlusion amount and texel density
    pub const HMAO_PARAMS: &str = "HMAO_Params";
    /// World to height map transform
    pub const HMAO_TRANSFORM: &str = "HMAO_Transform";
    /// Subsurface blur direction
    pub const SSS_BLUR_DIR: &str = "SSSBlurDir";
    /// View-space reconstruction from the projection
    pub const VIEW_SPACE_PARAMS: &str = "ViewSpaceParams";
    /// Water caustics height, intensity and tiling
    pub const CAUSTICS_PARAMS: &str = "g_CausticsParams";
    /// Decal texture rectangle and mip level
    pub const TEX_TRANSFORMS: &str = "g_TexTransforms";
    /// Inverse decal projection for the volume vertices
    pub const INV_LIGHT_PROJ: &str = "g_mInvLightProj";
    /// Light counts of the tiled dispatch
    pub const TILED_LIGHT_COUNTS: &str = "g_TiledLightCounts";
}

/// Shader permutation bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShaderFlags(u32);

impl ShaderFlags {
    /// No permutation
    pub const NONE: Self = Self(0);

    /// Multiplicative ambient-only light
    pub const AMBIENT_LIGHT: Self = Self(1 << 0);

    /// Area lights are shaded this frame
    pub const AREA_LIGHTS_ENABLED: Self = Self(1 << 1);

    /// Light projects a texture
    pub const TEX_PROJECT: Self = Self(1 << 2);

    /// Projection is a 2D cookie rather than a cubemap
    pub const LIGHT_TEX_PROJ: Self = Self(1 << 3);

    /// Rectangular area light
    pub const AREA_LIGHT: Self = Self(1 << 4);

    /// Mask by clip volume stencil id
    pub const CLIP_VOLUME_ID: Self = Self(1 << 5);

    /// Apply directional occlusion
    pub const APPLY_SSDO: Self = Self(1 << 6);

    /// Drawn as a proxy volume
    pub const LIGHT_VOLUME: Self = Self(1 << 7);

    /// Box-projected probe
    pub const BOX_PROJECTION: Self = Self(1 << 8);

    /// Sample the specular cubemap
    pub const SPECULAR_CUBEMAP: Self = Self(1 << 9);

    /// Sample the global cubemap in the ambient pass
    pub const GLOBAL_CUBEMAP: Self = Self(1 << 10);

    /// Sample a shadow map
    pub const SHADOW_MAP: Self = Self(1 << 11);

    /// Shadow map read with hardware comparison
    pub const HW_PCF: Self = Self(1 << 12);

    /// Composite splits subsurface irradiance into a second target
    pub const SSS_SPLIT: Self = Self(1 << 13);

    /// Sun light present in the composite
    pub const SUN: Self = Self(1 << 14);

    /// Tile memory path
    pub const GMEM: Self = Self(1 << 15);

    /// Height map occlusion is available to directional occlusion
    pub const HEIGHT_MAP_AO: Self = Self(1 << 16);

    /// Decal grows its alpha test towards the edges
    pub const DECAL_GROW_ALPHA: Self = Self(1 << 17);

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

    /// Check if empty
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if all specified flags are set
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
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

    /// Set or clear flags
    #[inline]
    pub fn set(&mut self, other: Self, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl core::ops::BitOr for ShaderFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ShaderFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Clip volume stencil refs of a light, as read by the light shader
///
/// The shader receives both ids in one 32-bit word, each offset by one so a
/// zero half means "no volume".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StencilRefPair {
    /// First clip volume
    pub ref_a: u16,
    /// Second clip volume
    pub ref_b: u16,
}

impl StencilRefPair {
    /// Create a pair
    pub const fn new(ref_a: u16, ref_b: u16) -> Self {
        Self { ref_a, ref_b }
    }

    /// `((ref_b + 1) << 16) | (ref_a + 1)`
    pub const fn packed(self) -> u32 {
        ((self.ref_b as u32 + 1) << 16) | (self.ref_a as u32 + 1)
    }

    /// Packed word reinterpreted as the float the shader parameter carries
    pub fn to_param(self) -> f32 {
        f32::from_bits(self.packed())
    }
}

impl From<[u8; 2]> for StencilRefPair {
    fn from(refs: [u8; 2]) -> Self {
        Self::new(refs[0] as u16, refs[1] as u16)
    }
}
