//! Per-light shading pass.

use glam::{Mat4, Vec3, Vec4};

use super::PassContext;
use crate::camera::CameraView;
use crate::classify::{light_render_settings, light_volume_transform};
use crate::device::{BlendMode, CompareFunc, CullMode, DepthTest, DeviceCommand, DrawShape, SamplerKind, StencilCullMode, StencilTest};
use crate::light::{bulb_intensity_multiplier, Light, LightFlags};
use crate::shader::{param, technique, ShaderFlags, StencilRefPair};
use crate::texture::RenderTarget;

/// Smallest bulb size used to renormalize a light's intensity
const MIN_BULB_SIZE: f32 = 0.001;

/// Widest area light cone a shadow map covers without visible clipping
const MAX_SHADOWED_AREA_FOV: f32 = 135.0;

/// Kernel width in shadow map texels for omni and projected shadows
const OMNI_SHADOW_KERNEL: f32 = 2.5;
const SPOT_SHADOW_KERNEL: f32 = 1.5;

/// Projector matrix of a light, taking camera-relative positions
pub fn projector_matrix(light: &Light, camera: &CameraView) -> Mat4 {
    let forward = light.basis.z_axis.normalize_or_zero();
    let up = light.basis.y_axis.normalize_or_zero();
    let fov = (light.projector_angle * 2.0).clamp(0.01, core::f32::consts::PI - 0.01);
    let near = light.projector_near_plane.max(0.01);
    let far = light.radius.max(near + 0.01);
    Mat4::perspective_rh(fov, 1.0, near, far) * Mat4::look_to_rh(light.position - camera.position, forward, up)
}

/// `g_AreaLightMatrix`: normalized basis rows, then half size and cone cosine
fn area_light_matrix(light: &Light) -> [Vec4; 4] {
    let mut fov = light.projector_angle.to_degrees() * 2.0;
    if light.casts_shadows() && light.is_area() {
        fov = fov.min(MAX_SHADOWED_AREA_FOV);
    }
    let cos_angle = (fov.to_radians() * 0.5).cos();
    [
        light.basis.x_axis.normalize_or_zero().extend(1.0),
        light.basis.y_axis.normalize_or_zero().extend(1.0),
        light.basis.z_axis.normalize_or_zero().extend(1.0),
        Vec4::new(light.area_width, light.area_height, 0.0, cos_angle),
    ]
}

/// Shade one light into the accumulation targets
///
/// Returns false when the light was skipped. `force_stencil_disable` is set
/// by the shadow driver, which has already masked the face footprint.
pub fn light_pass(ctx: &mut PassContext<'_>, light: &Light, force_stencil_disable: bool) -> bool {
    let config = ctx.config;
    let pipeline = &config.pipeline;
    if light.flags.contains(LightFlags::AREA) && !light.is_ambient() && !pipeline.area_lights {
        return false;
    }

    let area = light.is_area();
    let projected_2d = light.is_projective() && light.projector_texture.is_some();

    let mut settings = light_render_settings(light, ctx.camera, &config.light_volumes);
    if config.light_volumes.stencil_prepass && (projected_2d || area) {
        settings.stencil_prepass = true;
    }
    if light.projector_near_plane < 0.0 {
        settings.stencil_prepass = true;
    }
    if force_stencil_disable {
        settings.stencil_prepass = false;
    }

    let mut flags = ctx.flags;
    flags.set(ShaderFlags::AMBIENT_LIGHT, light.is_ambient());
    flags.set(ShaderFlags::AREA_LIGHTS_ENABLED, pipeline.area_lights);
    flags.set(ShaderFlags::TEX_PROJECT, light.is_projective());
    flags.set(ShaderFlags::LIGHT_TEX_PROJ, projected_2d && !area);
    flags.set(ShaderFlags::AREA_LIGHT, area);
    flags.set(ShaderFlags::CLIP_VOLUME_ID, ctx.uses_clip_volumes());
    flags.set(ShaderFlags::APPLY_SSDO, pipeline.ssdo);
    flags.set(ShaderFlags::LIGHT_VOLUME, settings.light_volume);

    let mut bulb = light.bulb_size();
    let mut color = light.color;
    if !light.is_ambient() {
        bulb = bulb.max(MIN_BULB_SIZE);
        color *= bulb_intensity_multiplier(bulb);
    }

    let shape = if area {
        DrawShape::Box
    } else {
        DrawShape::Sphere(settings.mesh)
    };
    let transform = light_volume_transform(light);

    ctx.set_scissor(Some(light.scissor.padded()));

    if settings.stencil_prepass {
        // Stencil prepasses are ROP bound; depth bounds only add to that
        ctx.clear_depth_bounds();
        let (reference, mode) = if light.casts_shadows() {
            (ctx.stencil.current() as u8, StencilCullMode::DecrementOnZFail)
        } else {
            let step = ctx.stencil.next_volume_ref();
            if step.needs_clear {
                ctx.clear_stencil();
            }
            (step.reference, StencilCullMode::Replace)
        };
        ctx.device.submit(DeviceCommand::StencilCull {
            shape,
            transform,
            reference,
            mode,
        });
        ctx.device.set_stencil_test(Some(StencilTest::equal(reference)));
    } else {
        ctx.set_light_depth_bounds(light);
    }

    ctx.device.set_blend(if light.is_ambient() {
        BlendMode::Multiply
    } else {
        BlendMode::Additive
    });
    ctx.device.set_depth_test(DepthTest::Enabled(CompareFunc::LessEqual));

    let name = if settings.light_volume {
        technique::LIGHT_VOLUME
    } else {
        technique::LIGHT_PASS
    };
    ctx.device.bind_technique(name, flags);

    let inv_radius = if light.radius <= 0.0 { 1.0 } else { 1.0 / light.radius };
    let stencil_refs = StencilRefPair::from(light.clip_volume_refs);
    ctx.device
        .set_param(param::LIGHT_POS, &[(light.position - ctx.camera.position).extend(inv_radius)]);
    ctx.device
        .set_param(param::LIGHT_DIFFUSE, &[color.extend(light.specular_mult)]);
    ctx.device
        .set_param(param::ATTEN_PARAMS, &[Vec4::new(bulb, stencil_refs.to_param(), 0.0, 0.0)]);
    ctx.device.set_param(param::AREA_LIGHT_MATRIX, &area_light_matrix(light));

    if light.is_projective() {
        let matrix = projector_matrix(light, ctx.camera);
        ctx.device.set_param(param::LIGHT_PROJ_MATRIX, &matrix.to_cols_array_2d().map(Vec4::from_array));
    }

    if let Some(frustum) = light.shadow.as_ref().filter(|_| light.casts_shadows()) {
        let kernel = if frustum.omni_unwrapped {
            OMNI_SHADOW_KERNEL
        } else {
            SPOT_SHADOW_KERNEL
        };
        let ratio = frustum.texture_size as f32 / ctx.shadow_atlas_size.max(1) as f32;
        ctx.device.set_param(
            param::SHADOW_PARAMS,
            &[Vec4::new(kernel * ratio, frustum.depth_slope_bias, 0.0, frustum.depth_const_bias)],
        );
    }

    if !ctx.targets.gmem {
        ctx.bind_gbuffer();
    }
    if pipeline.ssdo {
        ctx.bind_target(8, RenderTarget::Ssdo, SamplerKind::Point);
    }
    ctx.bind_clip_volumes(11);

    if let Some(texture) = light.projector_texture.filter(|_| light.is_projective()) {
        ctx.device.bind_texture(5, texture, SamplerKind::Trilinear);
    }

    if settings.light_volume {
        ctx.device.set_cull(CullMode::Back, ctx.camera.mirrored);
        ctx.device.draw(shape, transform);
    } else {
        ctx.device.set_cull(CullMode::Back, false);
        ctx.device.draw_full_screen();
    }

    ctx.clear_depth_bounds();
    if settings.stencil_prepass {
        ctx.device.set_stencil_test(None);
    }
    ctx.set_scissor(None);

    ctx.stats.lights_processed += 1;
    log::trace!(
        "Light {} shaded ({}{})",
        light.entity_id,
        name,
        if settings.stencil_prepass { ", stencil" } else { "" }
    );
    true
}

/// Shade lights with a light pass each, skipping fog-only and fake lights
pub(crate) fn shade_lights<'l>(ctx: &mut PassContext<'_>, lights: impl IntoIterator<Item = &'l Light>) -> usize {
    lights
        .into_iter()
        .filter(|light| !light.is_skipped() && !light.flags.contains(LightFlags::DIRECTIONAL))
        .filter(|light| light_pass(ctx, light, false))
        .count()
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Fixture;
    use super::*;
    use crate::device::CommandRecorder;
    use approx::assert_relative_eq;
    use glam::Mat3;

    fn diffuse_param(recorder: &CommandRecorder) -> Vec4 {
        recorder.last_param(param::LIGHT_DIFFUSE).unwrap()[0]
    }

    #[test]
    fn test_point_light_renormalized_by_bulb() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let mut light = Light::point(1, Vec3::new(0.0, 0.0, -20.0), 2.0, Vec3::ONE);
        light.attenuation_bulb_size = 1.0;

        assert!(light_pass(&mut fixture.context(&mut recorder), &light, false));

        assert_relative_eq!(diffuse_param(&recorder).x, 4.0);
        let atten = recorder.last_param(param::ATTEN_PARAMS).unwrap()[0];
        assert_relative_eq!(atten.x, 1.0);
        assert_eq!(atten.y.to_bits(), 0x0001_0001);
        assert!(recorder.commands().contains(&DeviceCommand::SetBlend(BlendMode::Additive)));
        assert_eq!(fixture.stats.lights_processed, 1);
    }

    #[test]
    fn test_ambient_light_multiplies() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let light = Light::ambient(2, Vec3::new(0.0, 0.0, -20.0), 2.0, Vec3::splat(0.5));

        light_pass(&mut fixture.context(&mut recorder), &light, false);

        assert!(recorder.commands().contains(&DeviceCommand::SetBlend(BlendMode::Multiply)));
        assert_relative_eq!(diffuse_param(&recorder).x, 0.5);
        let flags = recorder.technique_flags(technique::LIGHT_PASS);
        assert!(flags[0].contains(ShaderFlags::AMBIENT_LIGHT));
    }

    #[test]
    fn test_distant_light_uses_volume() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let mut light = Light::point(3, Vec3::new(0.0, 0.0, -20.0), 4.0, Vec3::ONE);
        light.scissor = crate::classify::calculate_scissor_rect(&light, &fixture.camera);

        light_pass(&mut fixture.context(&mut recorder), &light, false);

        assert_eq!(recorder.techniques(), vec![technique::LIGHT_VOLUME]);
        assert_eq!(recorder.count(|c| matches!(c, DeviceCommand::StencilCull { .. })), 0);
        assert!(recorder
            .commands()
            .iter()
            .any(|c| matches!(c, DeviceCommand::Draw { shape: DrawShape::Sphere(_), .. })));
    }

    #[test]
    fn test_camera_inside_light_takes_stencil_prepass() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let mut light = Light::point(4, Vec3::new(0.0, 0.0, -1.0), 4.0, Vec3::ONE);
        light.scissor = crate::classify::calculate_scissor_rect(&light, &fixture.camera);

        light_pass(&mut fixture.context(&mut recorder), &light, false);

        assert_eq!(recorder.techniques(), vec![technique::LIGHT_PASS]);
        let culls: Vec<_> = recorder
            .commands()
            .iter()
            .filter_map(|c| match c {
                DeviceCommand::StencilCull { reference, mode, .. } => Some((*reference, *mode)),
                _ => None,
            })
            .collect();
        assert_eq!(culls, vec![(2, StencilCullMode::Replace)]);
        assert!(recorder
            .commands()
            .contains(&DeviceCommand::SetStencilTest(Some(StencilTest::equal(2)))));
        assert_eq!(recorder.commands().last(), Some(&DeviceCommand::SetScissor(None)));
    }

    #[test]
    fn test_forced_stencil_disable() {
        let mut fixture = Fixture::new();
        let mut recorder = CommandRecorder::new();
        let light = Light::point(5, Vec3::new(0.0, 0.0, -1.0), 4.0, Vec3::ONE);

        light_pass(&mut fixture.context(&mut recorder), &light, true);

        assert_eq!(recorder.count(|c| matches!(c, DeviceCommand::StencilCull { .. })), 0);
        assert_eq!(fixture.stencil.current(), 1);
    }

    #[test]
    fn test_area_lights_disabled() {
        let mut fixture = Fixture::new();
        fixture.config.pipeline.area_lights = false;
        let mut recorder = CommandRecorder::new();
        let light = Light::area(6, Vec3::new(0.0, 0.0, -10.0), 5.0, Vec3::ONE, Mat3::IDENTITY, 1.0, 0.5);

        assert!(!light_pass(&mut fixture.context(&mut recorder), &light, false));
        assert!(recorder.commands().is_empty());
    }

    #[test]
    fn test_shadowed_area_light_cone_clamped() {
        let light = Light::area(7, Vec3::ZERO, 5.0, Vec3::ONE, Mat3::IDENTITY, 1.0, 0.5)
            .with_shadow(crate::shadow::ShadowFrustum::new(256));
        let matrix = area_light_matrix(&light);
        assert_relative_eq!(matrix[3].w, (67.5f32).to_radians().cos(), epsilon = 1e-5);
        assert_relative_eq!(matrix[3].x, 1.0);
        assert_relative_eq!(matrix[3].y, 0.5);
    }

    #[test]
    fn test_clip_volumes_flag_and_slot() {
        let mut fixture = Fixture::new();
        fixture.clip_volumes.volume_count = 1;
        fixture.clip_volumes.params = vec![crate::clip_volume::ClipVolumeParams::new(3); 3];
        let mut recorder = CommandRecorder::new();
        let light = Light::point(8, Vec3::new(0.0, 0.0, -20.0), 2.0, Vec3::ONE);

        light_pass(&mut fixture.context(&mut recorder), &light, false);

        let flags = recorder.technique_flags(technique::LIGHT_PASS);
        assert!(flags[0].contains(ShaderFlags::CLIP_VOLUME_ID));
        assert_eq!(recorder.last_param(param::CLIP_VOLUME_PARAMS).map(<[Vec4]>::len), Some(3));
        assert!(recorder
            .commands()
            .iter()
            .any(|c| matches!(c, DeviceCommand::BindTexture { slot: 11, .. })));
    }
}
