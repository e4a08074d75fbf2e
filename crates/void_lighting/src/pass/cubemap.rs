//! Local environment probes.

use glam::Vec4;

use super::ambient::cubemap_mip_bias;
use super::PassContext;
use crate::classify::{probe_crosses_near_plane, probe_volume};
use crate::device::{BlendMode, CompareFunc, CullMode, DepthTest, DeviceCommand, DrawShape, SamplerKind, StencilCullMode, StencilTest};
use crate::light::{Light, LightFlags};
use crate::shader::{param, technique, ShaderFlags, StencilRefPair};
use crate::texture::RenderTarget;

/// Smallest attenuation falloff sent to the shader
const MIN_FALLOFF: f32 = 1.0e-3;

/// Shade the probes from `start` on, skipping fake and fog-only probes
///
/// Returns the number of probes drawn.
pub fn deferred_cubemaps(ctx: &mut PassContext<'_>, cubemaps: &[Light], start: usize) -> usize {
    if !ctx.config.pipeline.env_probes || start >= cubemaps.len() {
        return 0;
    }

    let mut drawn = 0;
    for probe in cubemaps[start..].iter().filter(|probe| !probe.is_skipped()) {
        if deferred_cubemap_pass(ctx, probe) {
            drawn += 1;
        }
        ctx.stats.cubemaps_processed += 1;
    }
    drawn
}

/// Blend one probe's cubemaps into the accumulation targets
///
/// Probes without a diffuse cubemap, or without the specular cubemap their
/// brightness calls for, are skipped.
pub fn deferred_cubemap_pass(ctx: &mut PassContext<'_>, light: &Light) -> bool {
    let config = ctx.config;

    let fade = light.probe_attenuation;
    let has_specular = light.luminance() * fade * light.specular_mult >= config.ambient.probe_specular_threshold;

    let Some(diffuse) = light.diffuse_cubemap else {
        log::debug!("Probe {} has no diffuse cubemap", light.entity_id);
        return false;
    };
    let specular = light.specular_cubemap;
    if has_specular && specular.is_none() {
        log::debug!("Probe {} has no specular cubemap", light.entity_id);
        return false;
    }

    let mut stencil_prepass = config.light_volumes.stencil_prepass;
    if config.light_volumes.lod_ratio != 0.0 {
        let ratio = light.scissor.area() as f32 / ctx.camera.screen_area().max(1.0);
        if ratio * config.light_volumes.lod_ratio < config.ambient.probe_lod_threshold {
            // Scissor and depth bounds are enough
            stencil_prepass = false;
        }
    }
    let light_volume = config.light_volumes.light_volumes && !probe_crosses_near_plane(light, ctx.camera);

    let volume = probe_volume(light);
    let transform = volume.unit_cube_to_world();

    let mut flags = ctx.flags;
    flags.set(ShaderFlags::BOX_PROJECTION, light.flags.contains(LightFlags::BOX_PROJECTION));
    flags.set(ShaderFlags::CLIP_VOLUME_ID, ctx.uses_clip_volumes());
    flags.set(ShaderFlags::SPECULAR_CUBEMAP, has_specular);
    flags.set(ShaderFlags::APPLY_SSDO, config.pipeline.ssdo);
    flags.set(ShaderFlags::LIGHT_VOLUME, light_volume);

    ctx.set_scissor(Some(light.scissor.padded()));

    if stencil_prepass {
        ctx.clear_depth_bounds();
        let step = ctx.stencil.next_volume_ref();
        if step.needs_clear {
            ctx.clear_stencil();
        }
        ctx.device.submit(DeviceCommand::StencilCull {
            shape: DrawShape::Box,
            transform,
            reference: step.reference,
            mode: StencilCullMode::Replace,
        });
        ctx.device.set_stencil_test(Some(StencilTest::equal(step.reference)));
    } else {
        ctx.set_light_depth_bounds(light);
    }

    let name = if light_volume {
        technique::CUBEMAP_VOLUME
    } else {
        technique::CUBEMAP_PASS
    };
    ctx.device.bind_technique(name, flags);
    // Tile memory blends in the shader
    ctx.device.set_blend(if ctx.targets.gmem {
        BlendMode::Opaque
    } else {
        BlendMode::AlphaBlend
    });
    ctx.device.set_depth_test(DepthTest::Enabled(CompareFunc::LessEqual));

    let inv_radius = if light.radius <= 0.0 { 1.0 } else { 1.0 / light.radius };
    ctx.device
        .set_param(param::LIGHT_POS, &[(light.position - ctx.camera.position).extend(inv_radius)]);
    ctx.device
        .set_param(param::LIGHT_DIFFUSE, &[light.color.extend(light.specular_mult)]);

    let inv_extents = light.probe_extents.max(glam::Vec3::splat(f32::EPSILON)).recip();
    ctx.device.set_param(
        param::OBB_PARAMS,
        &[
            volume.axes.x_axis.extend(inv_extents.x),
            volume.axes.y_axis.extend(inv_extents.y),
            volume.axes.z_axis.extend(inv_extents.z),
        ],
    );
    ctx.device.set_param(
        param::CUBEMAP_MIP,
        &[Vec4::new(cubemap_mip_bias(light.specular_cubemap_width), 0.0, 0.0, 0.0)],
    );
    let refs = StencilRefPair::from(light.clip_volume_refs);
    ctx.device.set_param(
        param::ATTEN_PARAMS,
        &[Vec4::new(fade, refs.to_param(), 0.0, light.probe_falloff.max(MIN_FALLOFF))],
    );

    if !ctx.targets.gmem {
        ctx.bind_target(0, RenderTarget::ZTarget, SamplerKind::Point);
        ctx.bind_target(1, RenderTarget::SceneNormals, SamplerKind::Point);
        ctx.bind_target(2, RenderTarget::SceneDiffuse, SamplerKind::Point);
        ctx.bind_target(3, RenderTarget::SceneSpecular, SamplerKind::Point);
    }
    ctx.device.bind_texture(5, diffuse, SamplerKind::Linear);
    if let Some(specular) = specular {
        ctx.device.bind_texture(6, specular, SamplerKind::Trilinear);
    }
    if config.pipeline.ssdo {
        ctx.bind_target(8, RenderTarget::Ssdo, SamplerKind::Point);
    }
    ctx.bind_clip_volumes(9);
    ctx.bind_default(10, "$EnvironmentBRDF", SamplerKind::Linear);

    if light_volume {
        ctx.device.set_cull(CullMode::Back, ctx.camera.mirrored);
        ctx.device.draw(DrawShape::Box, transform);
    } else {
        ctx.device.set_cull(CullMode::Back, false);
        ctx.device.draw_full_screen();
    }

    if stencil_prepass {
        ctx.device.set_stencil_test(None);
    } else {
        ctx.clear_depth_bounds();
    }
    ctx.set_scissor(None);
    true
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::classify::calculate_scissor_rect;
    use crate::device::CommandRecorder;
    use crate::texture::TextureId;
    use approx::assert_relative_eq;
    use glam::Vec3;

    fn probe(entity_id: u64, position: Vec3, extents: Vec3) -> Light {
        Light::cubemap(entity_id, position, extents).with_cubemaps(
            TextureId::from_name("probe_diffuse"),
            TextureId::from_name("probe_specular"),
            128,
        )
    }

    #[test]
    fn test_distant_probe_draws_box() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let mut light = probe(1, Vec3::new(0.0, 0.0, -30.0), Vec3::new(4.0, 2.0, 3.0));
        light.scissor = calculate_scissor_rect(&light, &fixture.camera);

        assert!(deferred_cubemap_pass(&mut fixture.context(&mut recorder), &light));

        assert_eq!(recorder.techniques(), vec![technique::CUBEMAP_VOLUME]);
        assert!(recorder.commands().contains(&DeviceCommand::SetBlend(BlendMode::AlphaBlend)));
        let obb = recorder.last_param(param::OBB_PARAMS).unwrap();
        assert_relative_eq!(obb[0].w, 0.25);
        assert_relative_eq!(obb[1].w, 0.5);
        assert_eq!(recorder.last_param(param::CUBEMAP_MIP).unwrap()[0].x, 5.0);
    }

    #[test]
    fn test_probe_around_camera_draws_full_screen() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let mut light = probe(2, Vec3::ZERO, Vec3::splat(10.0));
        light.scissor = calculate_scissor_rect(&light, &fixture.camera);

        deferred_cubemap_pass(&mut fixture.context(&mut recorder), &light);

        assert_eq!(recorder.techniques(), vec![technique::CUBEMAP_PASS]);
        assert_eq!(recorder.count(|c| matches!(c, DeviceCommand::StencilCull { .. })), 1);
        assert!(recorder
            .commands()
            .iter()
            .any(|c| matches!(c, DeviceCommand::Draw { shape: DrawShape::FullScreenTriangle, .. })));
    }

    #[test]
    fn test_small_probe_skips_stencil() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let light = probe(3, Vec3::new(0.0, 0.0, -30.0), Vec3::splat(0.5));

        deferred_cubemap_pass(&mut fixture.context(&mut recorder), &light);

        assert_eq!(recorder.count(|c| matches!(c, DeviceCommand::StencilCull { .. })), 0);
    }

    #[test]
    fn test_dim_probe_skips_specular() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let mut light = probe(4, Vec3::new(0.0, 0.0, -30.0), Vec3::splat(2.0));
        light.probe_attenuation = 0.02;

        deferred_cubemap_pass(&mut fixture.context(&mut recorder), &light);

        let flags = recorder.technique_flags(technique::CUBEMAP_VOLUME)[0];
        assert!(!flags.contains(ShaderFlags::SPECULAR_CUBEMAP));
        let atten = recorder.last_param(param::ATTEN_PARAMS).unwrap()[0];
        assert_relative_eq!(atten.x, 0.02);
        assert_relative_eq!(atten.w, MIN_FALLOFF);
    }

    #[test]
    fn test_fake_probes_skipped_and_counted() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let probes = vec![
            probe(5, Vec3::new(0.0, 0.0, -30.0), Vec3::ONE),
            probe(6, Vec3::new(0.0, 0.0, -30.0), Vec3::ONE).with_flags(LightFlags::FAKE),
            probe(7, Vec3::new(0.0, 0.0, -30.0), Vec3::ONE),
        ];

        let drawn = deferred_cubemaps(&mut fixture.context(&mut recorder), &probes, 1);

        assert_eq!(drawn, 1);
        assert_eq!(fixture.stats.cubemaps_processed, 1);
    }

    #[test]
    fn test_missing_cubemap_skipped() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let light = Light::cubemap(8, Vec3::new(0.0, 0.0, -30.0), Vec3::ONE);

        assert!(!deferred_cubemap_pass(&mut fixture.context(&mut recorder), &light));
        assert!(recorder.commands().is_empty());
    }
}
