//! Screen-space passes around the light accumulation.
//!
//! G-buffer filtering, directional and height map occlusion, screen-space
//! reflections, deferred decals, the subsurface blur, water caustics and the
//! tiled compute dispatch. None of them keeps state between frames; the
//! reflection history is owned by the engine and handed in.
//!
//! # Scratch targets
//!
//! Blurs ping-pong through targets that are idle at that point of the
//! frame: occlusion uses the subsurface irradiance target before the
//! composite has written it, and the subsurface blur uses the diffuse
//! accumulation target after the composite has consumed it.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use super::{PassContext, CLEAR_MEDIAN};
use crate::config::TiledMode;
use crate::device::{BlendMode, CompareFunc, CullMode, DepthTest, DeviceCommand, DrawShape, SamplerKind, StencilTest};
use crate::light::Light;
use crate::shader::{param, technique, ShaderFlags};
use crate::shadow::STENCIL_RESERVED_BIT;
use crate::texture::{MaterialSlot, MaterialTextures, RenderTarget, TextureId};

/// World-space radius of the directional occlusion kernel
const SSDO_RADIUS: f32 = 1.2;
/// Screen-space clamp of the occlusion kernel
const SSDO_RADIUS_MIN: f32 = 0.1;
const SSDO_RADIUS_MAX: f32 = 0.4;

/// Depth range a decal projects over, relative to its plane
const DECAL_NEAR: f32 = -0.3;
const DECAL_FAR: f32 = 0.5;

/// Edge of a screen tile in the tiled compute pass
pub const TILE_SIZE: u32 = 16;

/// Lights a single tiled dispatch can address
pub const MAX_TILED_LIGHTS: usize = 255;

/// Clip space to texture space
const CLIP_TO_UV: Mat4 = Mat4::from_cols(
    Vec4::new(0.5, 0.0, 0.0, 0.0),
    Vec4::new(0.0, -0.5, 0.0, 0.0),
    Vec4::new(0.0, 0.0, 1.0, 0.0),
    Vec4::new(0.5, 0.5, 0.0, 1.0),
);

fn matrix_param(matrix: Mat4) -> [Vec4; 4] {
    matrix.to_cols_array_2d().map(Vec4::from_array)
}

/// `(2 / P00, 2 / P11, -1 / P00, -1 / P11)`, rebuilding view positions from uv
fn view_space_params(ctx: &PassContext<'_>) -> Vec4 {
    let p00 = ctx.camera.projection.x_axis.x;
    let p11 = ctx.camera.projection.y_axis.y;
    Vec4::new(2.0 / p00, 2.0 / p11, -1.0 / p00, -1.0 / p11)
}

/// Smooth specular aliasing out of the G-buffer before any light reads it
pub fn filter_gbuffer(ctx: &mut PassContext<'_>) -> bool {
    if !ctx.config.pipeline.filter_gbuffer || ctx.targets.gmem {
        return false;
    }

    // The specular accumulation target is idle until the ambient pass
    ctx.device.submit(DeviceCommand::CopyTarget {
        source: RenderTarget::SceneSpecular,
        destination: RenderTarget::SpecularAccumulation,
    });

    ctx.device.push_targets(&[RenderTarget::SceneSpecular], None);
    ctx.device.bind_technique(technique::FILTER_GBUFFER, ctx.flags);
    ctx.device.set_depth_test(DepthTest::Disabled);
    ctx.device.set_blend(BlendMode::Opaque);
    ctx.bind_target(0, RenderTarget::SceneNormals, SamplerKind::Point);
    ctx.bind_target(1, RenderTarget::SpecularAccumulation, SamplerKind::Point);
    ctx.bind_target(2, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.device.draw_full_screen();
    ctx.device.pop_targets();
    true
}

/// Sun occlusion baked from a top-down depth map of the terrain
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeightMapOcclusion {
    /// Top-down depth map
    pub depth_map: TextureId,
    /// World to depth map texture space
    pub world_to_map: Mat4,
    /// Depth map edge in texels
    pub resolution: u32,
    /// Occlusion strength
    pub amount: f32,
}

/// Project the height map occlusion into screen space
///
/// The raw term goes to the irradiance scratch target and is blurred into
/// [`RenderTarget::HeightMapAo`], respecting clip volumes.
pub fn height_map_occlusion_pass(ctx: &mut PassContext<'_>, height_map: &HeightMapOcclusion) -> bool {
    if height_map.resolution == 0 || height_map.amount <= 0.0 {
        return false;
    }

    ctx.device.push_targets(&[RenderTarget::SceneTargetSss], None);
    ctx.device.bind_technique(technique::HEIGHT_MAP_AO, ctx.flags);
    ctx.device.set_depth_test(DepthTest::Disabled);
    ctx.device.set_blend(BlendMode::Opaque);
    ctx.bind_target(0, RenderTarget::SceneNormals, SamplerKind::Point);
    ctx.bind_target(1, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.device.bind_texture(2, height_map.depth_map, SamplerKind::Point);
    ctx.device.set_param(
        param::HMAO_PARAMS,
        &[Vec4::new(height_map.amount, 1.0 / height_map.resolution as f32, 0.0, 0.0)],
    );
    ctx.device
        .set_param(param::HMAO_TRANSFORM, &matrix_param(height_map.world_to_map));
    ctx.device.draw_full_screen();
    ctx.device.pop_targets();

    let mut flags = ctx.flags;
    flags.set(ShaderFlags::CLIP_VOLUME_ID, ctx.uses_clip_volumes());
    ctx.device.push_targets(&[RenderTarget::HeightMapAo], None);
    ctx.device.bind_technique(technique::HEIGHT_MAP_AO_BLUR, flags);
    ctx.bind_target(0, RenderTarget::SceneTargetSss, SamplerKind::Linear);
    ctx.bind_target(1, RenderTarget::ZTarget, SamplerKind::Point);
    if ctx.uses_clip_volumes() {
        ctx.bind_target(2, RenderTarget::ResolvedStencil, SamplerKind::Point);
        ctx.upload_clip_volume_params();
    }
    ctx.device.set_cull(CullMode::Back, false);
    ctx.device.draw_full_screen();
    ctx.device.pop_targets();
    true
}

/// Screen-space directional occlusion into [`RenderTarget::Ssdo`]
///
/// With occlusion disabled the target is cleared to the neutral value so
/// passes sampling it stay unaffected.
pub fn directional_occlusion_pass(ctx: &mut PassContext<'_>, height_map: Option<&HeightMapOcclusion>) -> bool {
    if !ctx.config.pipeline.ssdo {
        if !ctx.targets.gmem {
            ctx.device.submit(DeviceCommand::ClearTarget {
                target: RenderTarget::Ssdo,
                color: CLEAR_MEDIAN,
            });
        }
        return false;
    }

    let height_map = height_map.filter(|height_map| height_map_occlusion_pass(ctx, height_map));

    let mut flags = ctx.flags;
    flags.set(ShaderFlags::HEIGHT_MAP_AO, height_map.is_some());

    ctx.device.push_targets(&[RenderTarget::SceneTargetSss], None);
    ctx.set_sky_depth_bounds();
    ctx.device.bind_technique(technique::SSDO, flags);
    ctx.device.set_depth_test(DepthTest::Disabled);
    ctx.device.set_blend(BlendMode::Opaque);

    ctx.bind_target(0, RenderTarget::SceneNormals, SamplerKind::Point);
    ctx.bind_target(1, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.bind_default(3, "$AOVOJitter", SamplerKind::Point);
    ctx.bind_target(5, RenderTarget::ZTarget, SamplerKind::Linear);

    let radius = SSDO_RADIUS / ctx.camera.far.max(f32::EPSILON);
    let projection = ctx.camera.projection;
    ctx.device.set_param(
        param::SSDO_PARAMS,
        &[Vec4::new(
            radius * 0.5 * projection.x_axis.x,
            radius * 0.5 * projection.y_axis.y,
            SSDO_RADIUS_MIN,
            SSDO_RADIUS_MAX,
        )],
    );
    let view_space = view_space_params(ctx);
    ctx.device.set_param(param::VIEW_SPACE_PARAMS, &[view_space]);

    if let Some(height_map) = height_map {
        ctx.bind_target(11, RenderTarget::HeightMapAo, SamplerKind::Point);
        ctx.device.bind_texture(12, height_map.depth_map, SamplerKind::Point);
        ctx.device
            .set_param(param::HMAO_TRANSFORM, &matrix_param(height_map.world_to_map));
    }

    ctx.device.draw_full_screen();
    ctx.clear_depth_bounds();
    ctx.device.pop_targets();

    ctx.device.push_targets(&[RenderTarget::Ssdo], None);
    ctx.device.bind_technique(technique::SSDO_BLUR, ctx.flags);
    ctx.bind_target(0, RenderTarget::SceneTargetSss, SamplerKind::Linear);
    ctx.bind_target(1, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.device.draw_full_screen();
    ctx.device.pop_targets();
    true
}

/// Ray-march reflections into [`RenderTarget::Ssr`]
///
/// `prev_view_proj` is the view-projection of the frame whose HDR target is
/// now [`RenderTarget::HdrScenePrev`]; with several GPUs that is the frame
/// rendered on the same GPU, not the previous one.
pub fn screen_space_reflection_pass(ctx: &mut PassContext<'_>, prev_view_proj: Mat4) -> bool {
    if !ctx.config.pipeline.ssr || ctx.targets.gmem {
        return false;
    }

    ctx.device.push_targets(&[RenderTarget::Ssr], None);
    ctx.device.submit(DeviceCommand::SetViewport {
        width: ctx.targets.width,
        height: ctx.targets.height,
    });
    ctx.device.bind_technique(technique::SSR_TRACE, ctx.flags);
    ctx.device.set_depth_test(DepthTest::Disabled);
    ctx.device.set_blend(BlendMode::Opaque);

    ctx.bind_target(0, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.bind_target(1, RenderTarget::SceneNormals, SamplerKind::Linear);
    ctx.bind_target(2, RenderTarget::SceneSpecular, SamplerKind::Linear);
    ctx.bind_target(4, RenderTarget::HdrScenePrev, SamplerKind::Linear);

    ctx.device
        .set_param(param::VIEW_PROJ, &matrix_param(ctx.camera.view_projection()));
    ctx.device
        .set_param(param::VIEW_PROJ_PREV, &matrix_param(CLIP_TO_UV * prev_view_proj));

    ctx.device.draw_full_screen();
    ctx.device.pop_targets();
    true
}

/// Blend the traced reflections into the specular accumulation
pub fn apply_ssr(ctx: &mut PassContext<'_>) -> bool {
    if !ctx.config.pipeline.ssr {
        return false;
    }

    if !ctx.targets.gmem {
        ctx.device.push_targets(&[RenderTarget::SpecularAccumulation], None);
    }
    ctx.device.bind_technique(technique::APPLY_SSR, ctx.flags);
    ctx.device.set_blend(BlendMode::AlphaBlend);
    ctx.device.set_depth_test(DepthTest::Disabled);

    ctx.bind_target(0, RenderTarget::Ssr, SamplerKind::Linear);
    ctx.bind_target(1, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.bind_target(2, RenderTarget::SceneNormals, SamplerKind::Point);
    ctx.bind_target(3, RenderTarget::SceneDiffuse, SamplerKind::Point);
    ctx.bind_target(4, RenderTarget::SceneSpecular, SamplerKind::Point);
    ctx.bind_default(5, "$EnvironmentBRDF", SamplerKind::Linear);

    ctx.device.draw_full_screen();
    if !ctx.targets.gmem {
        ctx.device.pop_targets();
    }
    true
}

/// State for the occlusion that is applied inside the composite
///
/// Lifts the scissor and keeps sky pixels out. The tiled deferred path
/// applies occlusion in its compute pass.
pub fn ambient_occlusion_passes(ctx: &mut PassContext<'_>) {
    if ctx.tiled_deferred() {
        return;
    }
    ctx.set_scissor(None);
    ctx.set_sky_depth_bounds();
}

/// Projected decal blended into the G-buffer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredDecal {
    /// Unit cube to world; the axes carry the half extents
    pub projection: Mat4,
    /// Material textures, `None` when the material failed to load
    pub material: Option<MaterialTextures>,
    /// Atlas rectangle `(x, y, width, height)` in uv
    pub texture_rect: Vec4,
    /// Albedo tint
    pub diffuse: Vec3,
    /// Material opacity
    pub opacity: f32,
    /// Specular color
    pub specular: Vec3,
    /// Material smoothness
    pub smoothness: f32,
    /// Instance fade
    pub alpha: f32,
    /// Fade on surfaces facing away from the projection
    pub angle_attenuation: f32,
    /// Alpha reference of the growing reveal, 0 when unused
    pub grow_alpha_ref: f32,
    /// Material alpha multiplier
    pub alpha_mult: f32,
    /// Edge falloff
    pub falloff: f32,
    /// Albedo opacity
    pub diffuse_opacity: f32,
    /// Emissive map gamma
    pub emittance_gamma: f32,
    /// Emissive color
    pub emissive: Vec3,
    /// Emissive intensity, 0 for non-emissive materials
    pub emissive_intensity: f32,
}

impl Default for DeferredDecal {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            material: Some(MaterialTextures::new()),
            texture_rect: Vec4::new(0.0, 0.0, 1.0, 1.0),
            diffuse: Vec3::ONE,
            opacity: 1.0,
            specular: Vec3::splat(0.04),
            smoothness: 0.5,
            alpha: 1.0,
            angle_attenuation: 0.0,
            grow_alpha_ref: 0.0,
            alpha_mult: 1.0,
            falloff: 1.0,
            diffuse_opacity: 1.0,
            emittance_gamma: 1.0,
            emissive: Vec3::ZERO,
            emissive_intensity: 0.0,
        }
    }
}

impl DeferredDecal {
    /// Decal projected through a unit-cube-to-world transform
    pub fn new(projection: Mat4, material: MaterialTextures) -> Self {
        Self {
            projection,
            material: Some(material),
            ..Default::default()
        }
    }

    /// Has an emissive contribution
    pub fn is_emissive(&self) -> bool {
        self.emissive_intensity > 0.0
    }

    fn axes(&self) -> (Vec3, Vec3, Vec3) {
        (
            self.projection.x_axis.truncate(),
            self.projection.y_axis.truncate(),
            self.projection.z_axis.truncate(),
        )
    }

    /// Larger of the decal's two surface edges
    fn size(&self) -> f32 {
        let (x, y, _) = self.axes();
        (x.length() * 2.0).max(y.length() * 2.0)
    }

    /// World position to decal texture coordinates and depth
    fn texture_projection(&self) -> Mat4 {
        let depth_scale = 1.0 / (DECAL_NEAR - DECAL_FAR);
        let texture_and_depth = Mat4::from_cols(
            Vec4::new(0.5, 0.0, 0.0, 0.0),
            Vec4::new(0.0, -0.5, 0.0, 0.0),
            Vec4::new(0.0, 0.0, depth_scale, 0.0),
            Vec4::new(0.5, 0.5, DECAL_NEAR * depth_scale, 1.0),
        );
        texture_and_depth * self.projection.inverse()
    }

    /// Tangent space to world rows
    fn tangent_frame(&self) -> [Vec4; 4] {
        let (x, y, z) = self.axes();
        [
            x.normalize_or_zero().extend(0.0),
            (-y.normalize_or_zero()).extend(0.0),
            z.normalize_or_zero().extend(0.0),
            Vec4::W,
        ]
    }

    /// Content checks shared by the decal passes
    fn validate(&self) -> Option<&MaterialTextures> {
        let Some(material) = self.material.as_ref() else {
            log::warn!("Decal missing material");
            return None;
        };
        if self.texture_rect.z * self.texture_rect.w <= 0.0 {
            log::warn!("Decal texture rect has invalid dimensions {:?}", self.texture_rect);
            return None;
        }
        if self.size() <= 0.0 || self.projection.determinant() == 0.0 {
            log::warn!("Decal projection is degenerate");
            return None;
        }
        Some(material)
    }
}

/// Depth test and culling of a decal box: the back faces are drawn when the
/// near plane cuts the box
fn decal_volume_state(ctx: &PassContext<'_>, decal: &DeferredDecal) -> (DepthTest, CullMode) {
    let forward = ctx.camera.forward();
    let (x, y, z) = decal.axes();
    let reach = x.dot(forward).abs() + y.dot(forward).abs() + z.dot(forward).abs();
    let distance = forward.dot(decal.projection.w_axis.truncate() - ctx.camera.position);
    if distance.abs() - ctx.camera.near <= reach {
        (DepthTest::Enabled(CompareFunc::GreaterEqual), CullMode::Front)
    } else {
        (DepthTest::Enabled(CompareFunc::LessEqual), CullMode::Back)
    }
}

/// `[rect, (mip factor, 0, 0, 0)]`, the mip factor scaling texture size to
/// a mip level at the decal's screen footprint
fn texture_transform(ctx: &PassContext<'_>, decal: &DeferredDecal) -> [Vec4; 2] {
    let rect = decal.texture_rect;
    let screen_res = (ctx.camera.width as f32 + ctx.camera.height as f32) * 0.5;
    let fov = 2.0 * (1.0 / ctx.camera.projection.y_axis.y).atan();
    let texture_scale = rect.z.max(rect.w);
    let mip_factor = fov.tan() * texture_scale / (decal.size() * screen_res.max(1.0));
    [rect, Vec4::new(mip_factor, 0.0, 0.0, 0.0)]
}

fn draw_decal_volume(ctx: &mut PassContext<'_>, decal: &DeferredDecal, projection: Mat4, cull: CullMode) {
    ctx.device
        .set_param(param::INV_LIGHT_PROJ, &matrix_param(projection.inverse()));
    ctx.device
        .set_param(param::VIEW_PROJ, &matrix_param(ctx.camera.view_projection()));
    ctx.device.set_cull(cull, ctx.camera.mirrored);
    ctx.device.draw(DrawShape::Box, decal.projection);
}

/// Blend one decal into the G-buffer
///
/// Only pixels whose reserved stencil bit is set receive decals. Returns
/// false for decals without a material or with a degenerate projection.
pub fn deferred_decal_pass(ctx: &mut PassContext<'_>, decal: &DeferredDecal) -> bool {
    let Some(material) = decal.validate() else {
        return false;
    };

    ctx.set_scissor(None);
    ctx.clear_depth_bounds();

    let registry = &ctx.targets.registry;
    let textures = [
        (2, MaterialSlot::Diffuse),
        (3, MaterialSlot::Normals),
        (4, MaterialSlot::Specular),
        (5, MaterialSlot::Opacity),
    ]
    .map(|(slot, material_slot)| (slot, registry.resolve(material, material_slot)));
    for (slot, texture) in textures {
        if let Some(texture) = texture {
            ctx.device.bind_texture(slot, texture, SamplerKind::Trilinear);
        }
    }
    ctx.bind_target(6, RenderTarget::SceneNormals, SamplerKind::Point);
    if !ctx.targets.gmem {
        ctx.bind_target(0, RenderTarget::ZTarget, SamplerKind::Point);
    }

    let reserved = STENCIL_RESERVED_BIT as u8;
    ctx.device.set_stencil_test(Some(StencilTest {
        func: CompareFunc::Equal,
        reference: reserved,
        read_mask: reserved,
    }));

    let mut flags = ctx.flags;
    flags.set(ShaderFlags::DECAL_GROW_ALPHA, decal.grow_alpha_ref > 0.0);
    flags.insert(ShaderFlags::LIGHT_VOLUME);
    ctx.device.bind_technique(technique::DECAL_VOLUME, flags);

    let projection = decal.texture_projection();
    let tex_transform = texture_transform(ctx, decal);
    ctx.device.set_param(param::TEX_TRANSFORMS, &tex_transform);
    ctx.device.set_param(param::DECAL_TS, &decal.tangent_frame());
    ctx.device
        .set_param(param::LIGHT_PROJ_MATRIX, &matrix_param(projection));
    ctx.device
        .set_param(param::DECAL_DIFFUSE, &[decal.diffuse.extend(decal.opacity * decal.alpha)]);
    ctx.device.set_param(
        param::DECAL_ANGLE_ATTENUATION,
        &[Vec4::new(decal.angle_attenuation, 0.0, 0.0, 0.0)],
    );
    ctx.device
        .set_param(param::DECAL_SPECULAR, &[decal.specular.extend(decal.smoothness)]);
    ctx.device.set_param(
        param::DECAL_PARAMS,
        &[Vec4::new(decal.alpha_mult, decal.falloff, decal.diffuse_opacity, decal.grow_alpha_ref)],
    );

    let (depth, cull) = decal_volume_state(ctx, decal);
    ctx.device.set_blend(BlendMode::AlphaBlend);
    ctx.device.set_depth_test(depth);
    draw_decal_volume(ctx, decal, projection, cull);

    ctx.device.set_stencil_test(None);
    true
}

/// Add a decal's emissive term to the lit scene
///
/// Everything but the emission was lit by the deferred passes through the
/// G-buffer. Non-emissive decals are skipped.
pub fn decal_emissive_pass(ctx: &mut PassContext<'_>, decal: &DeferredDecal) -> bool {
    let Some(material) = decal.validate() else {
        return false;
    };
    if !decal.is_emissive() {
        return false;
    }

    ctx.set_scissor(None);
    ctx.clear_depth_bounds();

    let registry = &ctx.targets.registry;
    let textures = [(3, MaterialSlot::Emissive), (5, MaterialSlot::Opacity)]
        .map(|(slot, material_slot)| (slot, registry.resolve(material, material_slot)));
    for (slot, texture) in textures {
        if let Some(texture) = texture {
            ctx.device.bind_texture(slot, texture, SamplerKind::Trilinear);
        }
    }
    ctx.bind_target(0, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.bind_target(6, RenderTarget::SceneNormals, SamplerKind::Point);

    let mut flags = ctx.flags;
    flags.set(ShaderFlags::DECAL_GROW_ALPHA, decal.grow_alpha_ref > 0.0);
    flags.insert(ShaderFlags::LIGHT_VOLUME);
    ctx.device.bind_technique(technique::DECAL_EMISSIVE_VOLUME, flags);

    let projection = decal.texture_projection();
    ctx.device.set_param(
        param::DECAL_PARAMS,
        &[Vec4::new(decal.alpha_mult, decal.falloff, decal.emittance_gamma, decal.grow_alpha_ref)],
    );
    let tex_transform = texture_transform(ctx, decal);
    ctx.device.set_param(param::TEX_TRANSFORMS, &tex_transform);
    ctx.device
        .set_param(param::LIGHT_PROJ_MATRIX, &matrix_param(projection));
    ctx.device.set_param(param::DECAL_TS, &decal.tangent_frame());
    ctx.device
        .set_param(param::DECAL_EMISSIVE, &[decal.emissive.extend(decal.emissive_intensity)]);

    let (depth, cull) = decal_volume_state(ctx, decal);
    ctx.device.set_blend(BlendMode::Additive);
    ctx.device.set_depth_test(depth);
    draw_decal_volume(ctx, decal, projection, cull);
    true
}

/// Separable screen-space subsurface blur
///
/// Reads the irradiance the composite split into
/// [`RenderTarget::SceneTargetSss`], blurs it horizontally through the
/// diffuse accumulation target and adds the vertical pass to the HDR scene.
pub fn subsurface_scattering(ctx: &mut PassContext<'_>) -> bool {
    if !ctx.config.pipeline.sss || ctx.targets.gmem {
        return false;
    }

    let projection = ctx.camera.projection;
    let view_space = view_space_params(ctx);

    ctx.bind_target(1, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.bind_target(2, RenderTarget::SceneNormals, SamplerKind::Point);
    ctx.bind_target(3, RenderTarget::SceneDiffuse, SamplerKind::Point);
    ctx.bind_target(4, RenderTarget::SceneSpecular, SamplerKind::Point);
    ctx.device.set_depth_test(DepthTest::Disabled);

    ctx.device.push_targets(&[RenderTarget::DiffuseAccumulation], None);
    ctx.device.set_blend(BlendMode::Opaque);
    ctx.device.bind_technique(technique::SSS_BLUR, ctx.flags);
    ctx.bind_target(0, RenderTarget::SceneTargetSss, SamplerKind::Point);
    ctx.device.set_param(param::VIEW_SPACE_PARAMS, &[view_space]);
    ctx.device.set_param(
        param::SSS_BLUR_DIR,
        &[Vec4::new(0.5 * projection.x_axis.x, 0.0, 0.0, 0.0)],
    );
    ctx.device.draw_full_screen();
    ctx.device.pop_targets();

    let mut flags = ctx.flags;
    flags.insert(ShaderFlags::SSS_SPLIT);
    ctx.device.push_targets(&[RenderTarget::HdrScene], None);
    ctx.device.set_blend(BlendMode::Additive);
    ctx.device.bind_technique(technique::SSS_BLUR, flags);
    ctx.bind_target(0, RenderTarget::DiffuseAccumulation, SamplerKind::Point);
    ctx.bind_target(5, RenderTarget::SceneTargetSss, SamplerKind::Point);
    ctx.device.set_param(param::VIEW_SPACE_PARAMS, &[view_space]);
    ctx.device.set_param(
        param::SSS_BLUR_DIR,
        &[Vec4::new(0.0, 0.5 * projection.y_axis.y, 0.0, 0.0)],
    );
    ctx.device.draw_full_screen();
    ctx.device.pop_targets();
    true
}

/// Caustics cast by the visible water volumes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaterCaustics {
    /// Generated caustics map, `None` before the first generation
    pub caustics_map: Option<TextureId>,
    /// Visible water volumes with caustics enabled
    pub volumes: u32,
    /// World height of the water surface
    pub water_level: f32,
    /// Caustics brightness
    pub intensity: f32,
    /// Map repetitions per meter
    pub tiling: f32,
}

/// Add water caustics to the diffuse light accumulation
///
/// Not available on the tile memory path.
pub fn water_caustics(ctx: &mut PassContext<'_>, caustics: &WaterCaustics) -> bool {
    if ctx.targets.gmem || caustics.volumes == 0 || caustics.intensity <= 0.0 {
        return false;
    }
    let Some(map) = caustics.caustics_map else {
        return false;
    };

    ctx.device.push_targets(&[RenderTarget::DiffuseAccumulation], None);
    ctx.set_sky_depth_bounds();
    ctx.device.bind_technique(technique::WATER_CAUSTICS, ctx.flags);
    ctx.device.set_blend(BlendMode::Additive);
    ctx.device.set_depth_test(DepthTest::Disabled);
    ctx.bind_target(0, RenderTarget::ZTarget, SamplerKind::Point);
    ctx.bind_target(1, RenderTarget::SceneNormals, SamplerKind::Point);
    ctx.device.bind_texture(2, map, SamplerKind::Trilinear);
    ctx.device.set_param(
        param::CAUSTICS_PARAMS,
        &[Vec4::new(caustics.water_level, caustics.intensity, caustics.tiling, 0.0)],
    );
    ctx.device.draw_full_screen();
    ctx.clear_depth_bounds();
    ctx.device.pop_targets();
    true
}

/// Light all tiles with one compute dispatch
///
/// The dispatch addresses at most [`MAX_TILED_LIGHTS`] lights: deferred
/// lights first, then ambient lights, then probes. Probes are sorted most
/// important first for this path, so truncation drops the least important.
/// Returns the number of lights submitted.
pub fn tiled_shading(ctx: &mut PassContext<'_>, cubemaps: &[Light], ambient_lights: &[Light], lights: &[Light]) -> usize {
    let mode = ctx.config.pipeline.tiled;
    if mode == TiledMode::Off {
        return 0;
    }

    let visible = |list: &[Light]| list.iter().filter(|light| !light.is_skipped()).count();
    let mut remaining = MAX_TILED_LIGHTS;
    let mut take = |count: usize| {
        let taken = count.min(remaining);
        remaining -= taken;
        taken
    };
    let light_count = take(visible(lights));
    let ambient_count = take(visible(ambient_lights));
    let cubemap_count = take(visible(cubemaps));
    let submitted = light_count + ambient_count + cubemap_count;
    let requested = visible(lights) + visible(ambient_lights) + visible(cubemaps);
    if submitted < requested {
        log::debug!("Tiled shading truncated {} of {} lights", requested - submitted, requested);
    }

    let pipeline = &ctx.config.pipeline;
    let mut flags = ctx.flags;
    flags.set(ShaderFlags::CLIP_VOLUME_ID, ctx.uses_clip_volumes());
    flags.set(ShaderFlags::AREA_LIGHTS_ENABLED, pipeline.area_lights);
    flags.set(ShaderFlags::APPLY_SSDO, pipeline.ssdo);
    let ssdo = pipeline.ssdo;
    ctx.device.bind_technique(technique::TILED_SHADING, flags);

    ctx.bind_gbuffer();
    ctx.bind_target(3, RenderTarget::ShadowPool, SamplerKind::LinearCompare);
    if ssdo {
        ctx.bind_target(8, RenderTarget::Ssdo, SamplerKind::Point);
    }
    ctx.bind_clip_volumes(11);
    ctx.bind_default(10, "$EnvironmentBRDF", SamplerKind::Linear);

    let mode_id = match mode {
        TiledMode::Culling => 1.0,
        _ => 2.0,
    };
    ctx.device.set_param(
        param::TILED_LIGHT_COUNTS,
        &[Vec4::new(light_count as f32, ambient_count as f32, cubemap_count as f32, mode_id)],
    );
    ctx.device.submit(DeviceCommand::Dispatch {
        groups_x: ctx.targets.width.div_ceil(TILE_SIZE),
        groups_y: ctx.targets.height.div_ceil(TILE_SIZE),
    });

    if mode == TiledMode::Deferred {
        ctx.stats.lights_processed += submitted as u32;
    }
    submitted
}
