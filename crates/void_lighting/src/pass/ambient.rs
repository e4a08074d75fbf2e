//! Full-screen ambient pass.
//!
//! Writes the ambient term into the accumulation targets before any light is
//! added. A global environment probe is sampled when it is bright enough;
//! its specular cubemap only when the specular contribution is too.

use glam::Vec4;

use super::PassContext;
use crate::device::{BlendMode, CullMode, DepthTest, SamplerKind};
use crate::light::Light;
use crate::shader::{param, technique, ShaderFlags};
use crate::texture::RenderTarget;

/// Mip bias selecting the 4x4 mip of a specular cubemap for the roughest surfaces
pub fn cubemap_mip_bias(specular_width: u32) -> f32 {
    specular_width.max(1).ilog2() as f32 - 2.0
}

/// Render the ambient term
///
/// `outdoor_visible` is forced on when no clip volume is registered, since
/// everything on screen is then outdoors.
pub fn ambient_pass(ctx: &mut PassContext<'_>, global_probe: Option<&Light>, outdoor_visible: &mut bool) -> bool {
    let config = ctx.config;
    let thresholds = &config.ambient;
    let mut flags = ctx.flags;

    if ctx.uses_clip_volumes() {
        flags.insert(ShaderFlags::CLIP_VOLUME_ID);
    } else {
        *outdoor_visible = true;
    }

    let probe = global_probe.filter(|probe| probe.luminance() > thresholds.diffuse_luminance_threshold);
    if let Some(probe) = probe {
        flags.insert(ShaderFlags::GLOBAL_CUBEMAP);
        if probe.luminance() * probe.specular_mult >= thresholds.specular_luminance_threshold {
            flags.insert(ShaderFlags::SPECULAR_CUBEMAP);
        }
        if config.pipeline.ssdo {
            flags.insert(ShaderFlags::APPLY_SSDO);
        }
    } else if global_probe.is_some() {
        log::trace!("Global probe too dull, ambient pass skips cubemap sampling");
    }

    ctx.device.set_cull(CullMode::Back, false);
    if !ctx.targets.gmem {
        ctx.device.push_targets(
            &[RenderTarget::DiffuseAccumulation, RenderTarget::SpecularAccumulation],
            Some(RenderTarget::DepthStencil),
        );
    }
    ctx.set_sky_depth_bounds();

    ctx.device.bind_technique(technique::AMBIENT_PASS, flags);
    ctx.device.set_depth_test(DepthTest::Disabled);
    ctx.device.set_blend(BlendMode::Opaque);

    let environment = ctx.environment;
    ctx.device.set_param(param::AMBIENT, &[environment.ambient.extend(0.0)]);
    ctx.device
        .set_param(param::AMBIENT_GROUND, &[environment.ambient_ground.extend(0.0)]);
    ctx.device.set_param(param::AMBIENT_HEIGHT, &[environment.height_falloff()]);
    ctx.upload_clip_volume_params();

    if let Some(probe) = probe {
        if let Some(diffuse) = probe.diffuse_cubemap {
            ctx.device.bind_texture(1, diffuse, SamplerKind::Linear);
        }
        if let Some(specular) = probe.specular_cubemap {
            ctx.device.bind_texture(2, specular, SamplerKind::Trilinear);
        }
        let color = probe.color * environment.cubemap_multiplier;
        ctx.device.set_param(param::CUBEMAP_DIFFUSE, &[color.extend(probe.specular_mult)]);
        ctx.device.set_param(
            param::CUBEMAP_MIP,
            &[Vec4::new(cubemap_mip_bias(probe.specular_cubemap_width), 0.0, 0.0, 0.0)],
        );
        if config.pipeline.ssdo {
            ctx.bind_target(8, RenderTarget::Ssdo, SamplerKind::Point);
        }
    }

    ctx.bind_target(0, RenderTarget::SceneNormals, SamplerKind::Point);
    ctx.bind_target(7, RenderTarget::SceneSpecular, SamplerKind::Point);
    ctx.bind_target(11, RenderTarget::SceneDiffuse, SamplerKind::Point);
    if !ctx.targets.gmem {
        // Depth and stencil views of the same buffer
        ctx.bind_target(3, RenderTarget::ZTarget, SamplerKind::Point);
        ctx.bind_target(4, RenderTarget::DepthStencil, SamplerKind::Point);
    }
    ctx.bind_default(10, "$EnvironmentBRDF", SamplerKind::Linear);

    ctx.device.draw_full_screen();

    if !ctx.targets.gmem {
        ctx.device.pop_targets();
    }
    ctx.bind_default(3, "$Black", SamplerKind::Point);
    ctx.bind_default(4, "$Black", SamplerKind::Point);
    ctx.clear_depth_bounds();

    true
}
