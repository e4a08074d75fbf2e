//! Final deferred composite.
//!
//! One full-screen pass per frame combines the light accumulation with the
//! G-buffer, sun shadow mask and occlusion into the HDR scene target. When
//! subsurface scattering is on, the diffuse irradiance is split into a second
//! target and blurred afterwards.

use glam::Vec4;

use super::auxiliary::subsurface_scattering;
use super::PassContext;
use crate::device::{BlendMode, CullMode, DepthTest, SamplerKind};
use crate::light::Light;
use crate::shader::{param, technique, ShaderFlags};
use crate::texture::RenderTarget;

/// Sun disc diameter at the 10 km sun distance, for a 0.54 degree disc
const SUN_SOURCE_DIAMETER: f32 = 94.0;

/// Composite the lit scene
///
/// `sun` is the frame's sun light when it is visible; without it the sun
/// term is compiled out of the shader.
pub fn deferred_shading_pass(ctx: &mut PassContext<'_>, sun: Option<&Light>) -> bool {
    let config = ctx.config;
    let gmem = ctx.targets.gmem;
    let split_sss = config.pipeline.sss && !gmem;

    let mut flags = ctx.flags;
    flags.set(ShaderFlags::SSS_SPLIT, split_sss);
    flags.set(ShaderFlags::AREA_LIGHTS_ENABLED, config.pipeline.area_lights);
    flags.set(ShaderFlags::CLIP_VOLUME_ID, ctx.uses_clip_volumes());
    flags.set(ShaderFlags::SUN, sun.is_some());
    flags.set(ShaderFlags::APPLY_SSDO, config.pipeline.ssdo);

    ctx.device.set_cull(CullMode::Back, false);
    ctx.set_sky_depth_bounds();

    if split_sss {
        ctx.device
            .push_targets(&[RenderTarget::HdrScene, RenderTarget::SceneTargetSss], None);
    } else if !gmem {
        ctx.device.push_targets(&[RenderTarget::HdrScene], None);
    }

    ctx.device.bind_technique(technique::SHADING_PASS, flags);
    ctx.device.set_depth_test(DepthTest::Disabled);
    ctx.device.set_blend(BlendMode::Opaque);

    ctx.bind_target(2, RenderTarget::SceneDiffuse, SamplerKind::Point);
    ctx.bind_target(3, RenderTarget::SceneSpecular, SamplerKind::Point);
    ctx.bind_target(4, RenderTarget::SceneNormals, SamplerKind::Point);
    ctx.bind_target(5, RenderTarget::ZTarget, SamplerKind::Point);
    if !gmem {
        // Resident in tile memory otherwise
        ctx.bind_target(0, RenderTarget::DiffuseAccumulation, SamplerKind::Point);
        ctx.bind_target(1, RenderTarget::SpecularAccumulation, SamplerKind::Point);
        ctx.bind_target(6, RenderTarget::ResolvedStencil, SamplerKind::Point);
        ctx.bind_target(8, RenderTarget::ShadowMask, SamplerKind::Point);
        ctx.bind_target(9, RenderTarget::ZTarget, SamplerKind::Point);
    }
    if config.pipeline.ssdo {
        ctx.bind_target(7, RenderTarget::Ssdo, SamplerKind::Point);
    }

    let sun_color = sun.map_or(Vec4::ZERO, |sun| sun.color.extend(sun.specular_mult));
    ctx.device.set_param(param::SUN_COLOR, &[sun_color]);
    ctx.upload_clip_volume_params();
    ctx.device.set_param(
        param::AREA_LIGHT_MATRIX,
        &[
            Vec4::X,
            Vec4::Y,
            Vec4::Z,
            Vec4::new(SUN_SOURCE_DIAMETER, SUN_SOURCE_DIAMETER, 0.0, 1.0),
        ],
    );

    ctx.device.draw_full_screen();
    ctx.clear_depth_bounds();

    if split_sss || !gmem {
        ctx.device.pop_targets();
    }
    if split_sss {
        subsurface_scattering(ctx);
    }
    true
}
