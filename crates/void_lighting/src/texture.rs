//! Texture Handles
//!
//! Named render targets shared by every lighting stage, and resolution of
//! material texture slots to concrete textures or engine defaults.
//!
//! Handles are opaque: the registry never creates GPU resources, it only
//! records which backend texture answers to which name.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{LightingError, Result};

/// Opaque texture handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TextureId(pub u64);

impl TextureId {
    /// Create from a name (FNV-1a)
    pub fn from_name(name: &str) -> Self {
        let mut hash = 0xcbf29ce484222325u64;
        for byte in name.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        Self(hash)
    }
}

/// Texel format of a registered target
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    /// 8-bit RGBA
    #[default]
    Rgba8Unorm,
    /// 10-10-10-2
    Rgb10A2Unorm,
    /// Packed float RGB
    Rg11B10Float,
    /// 16-bit float RGBA
    Rgba16Float,
    /// 32-bit float depth
    Depth32Float,
    /// 24-bit depth, 8-bit stencil
    Depth24Stencil8,
    /// 8-bit stencil view
    Stencil8,
}

impl TextureFormat {
    /// Whether the format can be an additive blend target
    pub fn supports_additive_blend(self) -> bool {
        matches!(self, Self::Rgba8Unorm | Self::Rgb10A2Unorm | Self::Rg11B10Float | Self::Rgba16Float)
    }
}

/// Description of a registered texture
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDesc {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: TextureFormat,
}

impl TextureDesc {
    /// Create a description
    pub const fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self { width, height, format }
    }
}

/// Render targets referenced by the lighting stages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderTarget {
    /// Linearized depth
    ZTarget,
    /// Scene depth/stencil buffer
    DepthStencil,
    /// G-buffer normals
    SceneNormals,
    /// G-buffer albedo
    SceneDiffuse,
    /// G-buffer specular + gloss
    SceneSpecular,
    /// Diffuse light accumulation
    DiffuseAccumulation,
    /// Specular light accumulation
    SpecularAccumulation,
    /// Shared shadow atlas
    ShadowPool,
    /// Screen-space shadow mask
    ShadowMask,
    /// Resolved clip-volume stencil
    ResolvedStencil,
    /// Directional occlusion result
    Ssdo,
    /// Screen-space reflection result
    Ssr,
    /// Subsurface irradiance split from the composite
    SceneTargetSss,
    /// HDR scene target the composite writes to
    HdrScene,
    /// Previous frame's HDR scene, read by reflections
    HdrScenePrev,
    /// Height map occlusion
    HeightMapAo,
}

impl RenderTarget {
    /// Every named target
    pub const ALL: [RenderTarget; 16] = [
        Self::ZTarget,
        Self::DepthStencil,
        Self::SceneNormals,
        Self::SceneDiffuse,
        Self::SceneSpecular,
        Self::DiffuseAccumulation,
        Self::SpecularAccumulation,
        Self::ShadowPool,
        Self::ShadowMask,
        Self::ResolvedStencil,
        Self::Ssdo,
        Self::Ssr,
        Self::SceneTargetSss,
        Self::HdrScene,
        Self::HdrScenePrev,
        Self::HeightMapAo,
    ];

    /// Canonical name
    pub fn name(self) -> &'static str {
        match self {
            Self::ZTarget => "$ZTarget",
            Self::DepthStencil => "$DepthStencil",
            Self::SceneNormals => "$SceneNormalsMap",
            Self::SceneDiffuse => "$SceneDiffuse",
            Self::SceneSpecular => "$SceneSpecular",
            Self::DiffuseAccumulation => "$SceneDiffuseAcc",
            Self::SpecularAccumulation => "$SceneSpecularAcc",
            Self::ShadowPool => "$ShadowPool",
            Self::ShadowMask => "$ShadowMask",
            Self::ResolvedStencil => "$ResolvedStencil",
            Self::Ssdo => "$SSDO",
            Self::Ssr => "$SSReflections",
            Self::SceneTargetSss => "$SceneTargetSSS",
            Self::HdrScene => "$HDRTarget",
            Self::HdrScenePrev => "$HDRTargetPrev",
            Self::HeightMapAo => "$HeightMapAO",
        }
    }

    /// Look up a target by canonical name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

/// Texture slots a material may fill
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaterialSlot {
    /// Albedo
    Diffuse,
    /// Tangent-space normals
    Normals,
    /// Specular color + gloss
    Specular,
    /// Opacity mask
    Opacity,
    /// Emissive color
    Emissive,
    /// Height / displacement
    Height,
}

impl MaterialSlot {
    /// Name of the engine default bound when the material leaves the slot empty
    pub fn default_texture(self) -> &'static str {
        match self {
            Self::Diffuse | Self::Specular | Self::Opacity => "$White",
            Self::Normals => "$FlatBump",
            Self::Emissive | Self::Height => "$Black",
        }
    }
}

/// Textures assigned to a material's slots
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialTextures {
    slots: HashMap<MaterialSlot, TextureId>,
}

impl MaterialTextures {
    /// Create an empty material
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a texture to a slot
    pub fn with(mut self, slot: MaterialSlot, texture: TextureId) -> Self {
        self.slots.insert(slot, texture);
        self
    }

    /// Texture assigned to a slot
    pub fn get(&self, slot: MaterialSlot) -> Option<TextureId> {
        self.slots.get(&slot).copied()
    }
}

/// Registry of named render targets and default textures
#[derive(Clone, Debug, Default)]
pub struct TextureRegistry {
    targets: HashMap<RenderTarget, (TextureId, TextureDesc)>,
    defaults: HashMap<&'static str, TextureId>,
    redirects: HashMap<RenderTarget, RenderTarget>,
}

impl TextureRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every named target at screen resolution with the usual formats
    pub fn with_screen_targets(width: u32, height: u32) -> Self {
        let mut registry = Self::new();
        for target in RenderTarget::ALL {
            let format = match target {
                RenderTarget::ZTarget => TextureFormat::Depth32Float,
                RenderTarget::DepthStencil => TextureFormat::Depth24Stencil8,
                RenderTarget::ResolvedStencil => TextureFormat::Stencil8,
                RenderTarget::DiffuseAccumulation
                | RenderTarget::SpecularAccumulation
                | RenderTarget::SceneTargetSss => TextureFormat::Rg11B10Float,
                RenderTarget::HdrScene | RenderTarget::HdrScenePrev => TextureFormat::Rgba16Float,
                _ => TextureFormat::Rgba8Unorm,
            };
            registry.register(target, TextureDesc::new(width, height, format));
        }
        for name in ["$White", "$Black", "$FlatBump", "$ShadowJitterMap", "$AOVOJitter", "$EnvironmentBRDF"] {
            registry.register_default(name);
        }
        registry
    }

    /// Register a named target, returning its handle
    pub fn register(&mut self, target: RenderTarget, desc: TextureDesc) -> TextureId {
        let id = TextureId::from_name(target.name());
        self.targets.insert(target, (id, desc));
        id
    }

    /// Register a default texture by name
    pub fn register_default(&mut self, name: &'static str) -> TextureId {
        let id = TextureId::from_name(name);
        self.defaults.insert(name, id);
        id
    }

    /// Make reads of `target` resolve to `to`, or restore it with `None`
    pub fn redirect(&mut self, target: RenderTarget, to: Option<RenderTarget>) {
        match to {
            Some(to) => {
                self.redirects.insert(target, to);
            }
            None => {
                self.redirects.remove(&target);
            }
        }
    }

    /// Handle of a named target, following redirects
    pub fn get(&self, target: RenderTarget) -> Option<TextureId> {
        let target = self.redirects.get(&target).copied().unwrap_or(target);
        self.targets.get(&target).map(|(id, _)| *id)
    }

    /// Description of a named target
    pub fn desc(&self, target: RenderTarget) -> Option<TextureDesc> {
        self.targets.get(&target).map(|(_, desc)| *desc)
    }

    /// Handle of a target looked up by its canonical name
    pub fn by_name(&self, name: &str) -> Result<TextureId> {
        RenderTarget::from_name(name)
            .and_then(|target| self.get(target))
            .ok_or_else(|| LightingError::UnknownRenderTarget(name.to_string()))
    }

    /// Default texture by name
    pub fn default_texture(&self, name: &str) -> Option<TextureId> {
        self.defaults.get(name).copied()
    }

    /// Resolve a material slot to its texture or the slot's default
    pub fn resolve(&self, material: &MaterialTextures, slot: MaterialSlot) -> Option<TextureId> {
        material
            .get(slot)
            .or_else(|| self.default_texture(slot.default_texture()))
    }
}

/// Named targets shared by every pass of a frame
///
/// Built once per frame by the pass setup. On the tile memory path the
/// resolved stencil shares the linearized depth target, so reads of
/// [`RenderTarget::ResolvedStencil`] are redirected there.
#[derive(Clone, Debug)]
pub struct RenderContext {
    /// Target registry
    pub registry: TextureRegistry,
    /// Viewport width in pixels
    pub width: u32,
    /// Viewport height in pixels
    pub height: u32,
    /// Tile memory path active
    pub gmem: bool,
}

impl RenderContext {
    /// Context over a registry
    pub fn new(registry: TextureRegistry, width: u32, height: u32) -> Self {
        Self {
            registry,
            width,
            height,
            gmem: false,
        }
    }

    /// Select the regular or tile memory bindings for this frame
    pub fn setup(&mut self, gmem: bool) {
        self.gmem = gmem;
        let stencil_source = gmem.then_some(RenderTarget::ZTarget);
        self.registry.redirect(RenderTarget::ResolvedStencil, stencil_source);
    }

    /// Handle of a target, following redirects
    pub fn texture(&self, target: RenderTarget) -> Option<TextureId> {
        self.registry.get(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_targets_registered() {
        let registry = TextureRegistry::with_screen_targets(1280, 720);
        for target in RenderTarget::ALL {
            assert!(registry.get(target).is_some(), "{:?} missing", target);
        }
        let desc = registry.desc(RenderTarget::DiffuseAccumulation).unwrap();
        assert_eq!((desc.width, desc.height), (1280, 720));
        assert!(desc.format.supports_additive_blend());
    }

    #[test]
    fn test_lookup_by_name() {
        let registry = TextureRegistry::with_screen_targets(64, 64);
        assert_eq!(
            registry.by_name("$ShadowPool").unwrap(),
            TextureId::from_name("$ShadowPool")
        );
        assert!(matches!(
            registry.by_name("$Nope"),
            Err(LightingError::UnknownRenderTarget(_))
        ));
    }

    #[test]
    fn test_redirect() {
        let mut registry = TextureRegistry::with_screen_targets(64, 64);
        let normals = registry.get(RenderTarget::SceneNormals).unwrap();

        registry.redirect(RenderTarget::DiffuseAccumulation, Some(RenderTarget::SceneNormals));
        assert_eq!(registry.get(RenderTarget::DiffuseAccumulation), Some(normals));

        registry.redirect(RenderTarget::DiffuseAccumulation, None);
        assert_ne!(registry.get(RenderTarget::DiffuseAccumulation), Some(normals));
    }

    #[test]
    fn test_gmem_redirects_resolved_stencil() {
        let mut context = RenderContext::new(TextureRegistry::with_screen_targets(64, 64), 64, 64);
        let resolved = context.texture(RenderTarget::ResolvedStencil);

        context.setup(true);
        assert_eq!(context.texture(RenderTarget::ResolvedStencil), context.texture(RenderTarget::ZTarget));

        context.setup(false);
        assert_eq!(context.texture(RenderTarget::ResolvedStencil), resolved);
    }

    #[test]
    fn test_material_slot_defaults() {
        let registry = TextureRegistry::with_screen_targets(64, 64);
        let albedo = TextureId::from_name("bricks_diff");
        let material = MaterialTextures::new().with(MaterialSlot::Diffuse, albedo);

        assert_eq!(registry.resolve(&material, MaterialSlot::Diffuse), Some(albedo));
        assert_eq!(
            registry.resolve(&material, MaterialSlot::Normals),
            Some(TextureId::from_name("$FlatBump"))
        );
        assert_eq!(
            registry.resolve(&material, MaterialSlot::Emissive),
            Some(TextureId::from_name("$Black"))
        );
    }
}
