//! Shadow pool packing and shadowed light passes.
//!
//! Shadow casters are packed into the shared atlas before anything reads it:
//! the pre-loop runs ahead of the accumulation targets, the lighting loop
//! shades the packed range and packs whatever the pre-loop left. A caster
//! that finds no room, or exceeds the per-frame caster cap, loses its shadow
//! flag for the rest of the frame and is shaded with the unshadowed lights.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use super::light::light_pass;
use super::PassContext;
use crate::config::DepthBoundsMode;
use crate::device::{CullMode, DeviceCommand, DrawShape, SamplerKind, ShadowRenderer, StencilCullMode, StencilTest};
use crate::light::{Light, LightFlags};
use crate::shader::{param, ShaderFlags};
use crate::shadow::{ShadowPoolAllocator, UpdatePolicy};
use crate::texture::RenderTarget;

/// Progress of the packing loop through a frame's light array
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowCursor {
    /// First light of the batch packed last
    pub first_candidate: usize,
    /// Next light to look at
    pub current: usize,
    /// Casters packed this frame
    pub packed: usize,
    cap_warned: bool,
}

impl ShadowCursor {
    /// Cursor at the start of a frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewind for a new light array
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Persistent pool state and the collaborator rendering its shadow maps
pub struct ShadowPacking<'p> {
    /// Atlas allocations
    pub pool: &'p mut ShadowPoolAllocator,
    /// Renders requested faces into the atlas
    pub renderer: &'p mut dyn ShadowRenderer,
    /// Loop progress
    pub cursor: &'p mut ShadowCursor,
}

fn is_shadow_candidate(light: &Light) -> bool {
    light.casts_shadows() && !light.is_skipped() && !light.flags.contains(LightFlags::DIRECTIONAL)
}

fn render_unshadowed(ctx: &mut PassContext<'_>, light: &mut Light) {
    light.flags.remove(LightFlags::CASTS_SHADOWS);
    ctx.stats.unshadowed += 1;
}

/// Pack shadow casters into the atlas and request their shadow maps
///
/// With `pre_loop` set this only packs, ticking the pool first. Otherwise
/// the range packed by the pre-loop is shaded, then the remaining casters
/// are packed and shaded in turn. Tile memory cannot render shadow maps
/// once lighting started, so casters reaching the lighting loop unpacked
/// render unshadowed there.
///
/// Returns the number of casters packed by this call.
pub fn pack_all_shadow_frustums(
    ctx: &mut PassContext<'_>,
    packing: &mut ShadowPacking<'_>,
    lights: &mut [Light],
    pre_loop: bool,
) -> usize {
    let config = ctx.config;
    let pool_config = &config.shadow_pool;
    packing.pool.update_atlas_size(pool_config.atlas_size);
    ctx.shadow_atlas_size = packing.pool.atlas_size();

    let len = lights.len();
    let cursor = &mut *packing.cursor;
    cursor.current = cursor.current.min(len);
    cursor.first_candidate = cursor.first_candidate.min(cursor.current);

    if !pre_loop {
        for light in lights[cursor.first_candidate..cursor.current].iter() {
            if is_shadow_candidate(light) {
                shadow_light_passes(ctx, light);
            }
        }
        cursor.first_candidate = cursor.current;
    }

    while cursor.current < len && !is_shadow_candidate(&lights[cursor.current]) {
        cursor.current += 1;
    }
    if cursor.current >= len {
        return 0;
    }

    if pre_loop {
        if pool_config.max_frames_alive == 0 {
            packing.pool.clear();
        } else {
            packing.pool.tick(pool_config.max_frames_alive);
        }
    }

    let pack_shadows = pre_loop || !ctx.targets.gmem;
    let policy = UpdatePolicy::from(pool_config);
    cursor.first_candidate = cursor.current;
    ctx.set_scissor(None);
    ctx.clear_depth_bounds();

    let mut packed = 0;
    while cursor.current < len {
        let index = cursor.current;
        cursor.current += 1;
        let light = &mut lights[index];
        if !is_shadow_candidate(light) || !pack_shadows {
            continue;
        }

        if light.shadow.is_none() {
            log::debug!("Light {} casts shadows without a frustum", light.entity_id);
            render_unshadowed(ctx, light);
            continue;
        }

        if cursor.packed >= pool_config.max_shadow_lights {
            if !cursor.cap_warned {
                cursor.cap_warned = true;
                log::warn!(
                    "More than {} shadow casting lights: light {} and later casters render unshadowed",
                    pool_config.max_shadow_lights,
                    light.entity_id
                );
            }
            render_unshadowed(ctx, light);
            continue;
        }

        match packing.pool.allocate_or_reuse(light, &policy) {
            Ok(outcome) => {
                cursor.packed += 1;
                packed += 1;
                ctx.stats.shadow_frustums += 1;
                if outcome.needs_render() {
                    let clear_pool = packing.pool.take_clear_flag();
                    packing.renderer.request_shadow_render(light, index, clear_pool);
                }
            }
            Err(err) => {
                log::debug!("{}", err);
                packing.pool.warn_exhausted(light.entity_id);
                render_unshadowed(ctx, light);
            }
        }
    }

    if !pre_loop {
        let mut dropped = 0;
        for light in lights[cursor.first_candidate..cursor.current].iter_mut() {
            if !is_shadow_candidate(light) {
                continue;
            }
            if pack_shadows {
                shadow_light_passes(ctx, light);
            } else {
                render_unshadowed(ctx, light);
                dropped += 1;
            }
        }
        if dropped > 0 {
            log::warn!("{} lights render without shadows: no shadow maps can be rendered during tile memory lighting", dropped);
        }
        cursor.first_candidate = cursor.current;
    }

    log::trace!("Shadow pool packed {} casters ({})", packed, if pre_loop { "pre-loop" } else { "lighting" });
    packed
}

/// Shade a packed shadow caster one cube face at a time
///
/// Every face is stencil-culled with its own reference so neighbouring
/// faces never sample each other's shadow maps. Area lights have a single
/// face and rely on their own volume instead of the stencil.
pub fn shadow_light_passes(ctx: &mut PassContext<'_>, light: &Light) -> bool {
    let Some(frustum) = light.shadow.as_ref() else {
        return false;
    };
    let config = ctx.config;
    let area = light.is_area() && config.pipeline.area_lights;
    let sides = frustum.face_count(area);

    let saved_flags = ctx.flags;
    let hw_pcf = frustum.hw_pcf && ctx.caps.hw_pcf;
    ctx.flags.insert(ShaderFlags::SHADOW_MAP);
    ctx.flags.set(ShaderFlags::HW_PCF, hw_pcf);
    let sampler = if hw_pcf {
        SamplerKind::LinearCompare
    } else {
        SamplerKind::Point
    };

    if !area && ctx.stencil.begin_light(sides as u32) {
        ctx.clear_stencil();
    }

    // Omni faces are unwrapped with flipped winding; mirrored views flip it back
    let requires_mirroring = !(light.is_projective() || light.flags.contains(LightFlags::AREA));
    let mirrored = ctx.camera.mirrored ^ requires_mirroring;
    let face_transform =
        Mat4::from_translation(light.position) * Mat4::from_mat3(light.basis) * Mat4::from_scale(Vec3::splat(light.radius));
    let face_bounds = config.light_volumes.depth_bounds == DepthBoundsMode::LightsAndShadowFaces;
    let atlas = ctx.shadow_atlas_size.max(1) as f32;

    let mut drawn = false;
    for face in 0..sides {
        ctx.set_scissor(Some(light.scissor.padded()));

        if !area {
            if face_bounds {
                ctx.set_light_depth_bounds(light);
            }
            let reference = ctx.stencil.next_face_ref();
            ctx.device.set_cull(CullMode::Back, mirrored);
            ctx.device.submit(DeviceCommand::StencilCull {
                shape: DrawShape::ShadowFace(face as u8),
                transform: face_transform,
                reference,
                mode: StencilCullMode::Replace,
            });
            if face_bounds {
                ctx.clear_depth_bounds();
            }
            ctx.device.set_stencil_test(Some(StencilTest::equal(reference)));
        }

        if frustum.use_pool {
            ctx.bind_target(3, RenderTarget::ShadowPool, sampler);
        } else if let Some(depth) = frustum.depth_texture {
            ctx.device.bind_texture(3, depth, sampler);
        }
        ctx.bind_default(7, "$ShadowJitterMap", SamplerKind::Point);

        let rect = frustum.face_rects[face];
        ctx.device.set_param(
            param::SHADOW_RECT,
            &[Vec4::new(rect.x as f32, rect.y as f32, rect.width as f32, rect.height as f32) / atlas],
        );

        drawn |= light_pass(ctx, light, true);

        if !area {
            ctx.device.set_stencil_test(None);
        }
    }

    if !area {
        ctx.stencil.end_light(sides as u32);
    }
    ctx.flags = saved_flags;
    drawn
}

/// Shade the frame's point, spot and area lights
///
/// Casters go through the shadow pool first. Without `shadows` every caster
/// renders unshadowed. Returns the number of unshadowed lights drawn.
pub fn deferred_lights(ctx: &mut PassContext<'_>, lights: &mut [Light], shadows: Option<&mut ShadowPacking<'_>>) -> usize {
    if lights.is_empty() || !ctx.config.pipeline.deferred_lights {
        return 0;
    }

    match shadows {
        Some(packing) => {
            pack_all_shadow_frustums(ctx, packing, lights, false);
        }
        None => {
            for light in lights.iter_mut().filter(|light| is_shadow_candidate(light)) {
                render_unshadowed(ctx, light);
            }
        }
    }

    let mut drawn = 0;
    for light in lights.iter() {
        if light.is_skipped() || light.casts_shadows() || light.flags.contains(LightFlags::DIRECTIONAL) {
            continue;
        }
        if light_pass(ctx, light, false) {
            drawn += 1;
        }
    }
    drawn
}
