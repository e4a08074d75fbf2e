//! Lighting Passes
//!
//! Every stage of a deferred lighting frame is a free function over a
//! [`PassContext`]: the device, the camera, the frame's named targets and the
//! counters the stages advance. The engine builds one context per frame and
//! walks the stages in order; nothing here keeps state between frames.
//!
//! # Stages
//!
//! - **ambient**: full-screen ambient term with the optional global probe
//! - **cubemap**: local environment probes
//! - **light**: one point, spot, area or ambient-only light
//! - **shadow**: shadow pool packing and the per-face shadowed light passes
//! - **auxiliary**: G-buffer filtering, occlusion, reflections, decals,
//!   subsurface blur, caustics and the tiled dispatch
//! - **composite**: the final deferred shading pass
//!
//! # Texture slots
//!
//! Per-light passes read depth from slot 0, normals from 1, albedo from 2
//! and specular from 4. Slot 11 carries the resolved clip volume stencil
//! whenever a clip volume is registered.

pub mod ambient;
pub mod auxiliary;
pub mod composite;
pub mod cubemap;
pub mod light;
pub mod shadow;

use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

pub use ambient::ambient_pass;
pub use auxiliary::{
    ambient_occlusion_passes,
    apply_ssr,
    decal_emissive_pass,
    deferred_decal_pass,
    directional_occlusion_pass,
    filter_gbuffer,
    height_map_occlusion_pass,
    screen_space_reflection_pass,
    subsurface_scattering,
    tiled_shading,
    water_caustics,
    DeferredDecal,
    HeightMapOcclusion,
    WaterCaustics,
};
pub use composite::deferred_shading_pass;
pub use cubemap::{deferred_cubemap_pass, deferred_cubemaps};
pub use light::{light_pass, projector_matrix};
pub use shadow::{deferred_lights, pack_all_shadow_frustums, shadow_light_passes, ShadowCursor, ShadowPacking};

use crate::camera::CameraView;
use crate::classify::light_depth_bounds;
use crate::clip_volume::ClipVolumeTable;
use crate::config::{DepthBoundsMode, LightingConfig, TiledMode};
use crate::device::{DeviceCaps, DeviceCommand, GraphicsDevice, SamplerKind, StencilTest};
use crate::engine::LightingStats;
use crate::light::{Light, ScissorRect};
use crate::shader::{param, technique, ShaderFlags};
use crate::shadow::StencilRefAllocator;
use crate::texture::{RenderContext, RenderTarget};

/// Far depth bound that keeps sky pixels out of screen-wide passes
pub const SKY_CULL_DEPTH: f32 = 0.9999;

/// Neutral value of lighting and occlusion targets
pub const CLEAR_MEDIAN: Vec4 = Vec4::new(0.5, 0.5, 0.5, 0.5);

/// Lighting environment supplied by the time-of-day collaborator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentParams {
    /// Ambient sky color
    pub ambient: Vec3,
    /// Ambient color reflected from the ground
    pub ambient_ground: Vec3,
    /// Height where the ambient falloff starts
    pub ambient_height_min: f32,
    /// Height where the ambient falloff ends
    pub ambient_height_max: f32,
    /// Global probe multiplier
    pub cubemap_multiplier: f32,
}

impl Default for EnvironmentParams {
    fn default() -> Self {
        Self {
            ambient: Vec3::splat(0.1),
            ambient_ground: Vec3::splat(0.05),
            ambient_height_min: 0.0,
            ambient_height_max: 100.0,
            cubemap_multiplier: 1.0,
        }
    }
}

impl EnvironmentParams {
    /// `(min, max, 1 / max)` with the divisor kept away from zero
    pub fn height_falloff(&self) -> Vec4 {
        Vec4::new(
            self.ambient_height_min,
            self.ambient_height_max,
            1.0 / self.ambient_height_max.max(0.0001),
            0.0,
        )
    }
}

/// Per-frame state shared by the lighting stages
pub struct PassContext<'a> {
    /// Command sink
    pub device: &'a mut dyn GraphicsDevice,
    /// Active configuration
    pub config: &'a LightingConfig,
    /// Camera of the frame
    pub camera: &'a CameraView,
    /// Named targets
    pub targets: &'a RenderContext,
    /// Device features, queried once per frame
    pub caps: DeviceCaps,
    /// Clip volume parameter table
    pub clip_volumes: &'a ClipVolumeTable,
    /// Running light stencil references
    pub stencil: &'a mut StencilRefAllocator,
    /// Frame counters
    pub stats: &'a mut LightingStats,
    /// Time-of-day environment
    pub environment: &'a EnvironmentParams,
    /// Permutation bits every technique of the frame starts from
    pub flags: ShaderFlags,
    /// Shadow atlas dimension in texels
    pub shadow_atlas_size: u32,
    scissor: Option<ScissorRect>,
}

impl<'a> PassContext<'a> {
    /// Context over a frame's collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &'a mut dyn GraphicsDevice,
        config: &'a LightingConfig,
        camera: &'a CameraView,
        targets: &'a RenderContext,
        clip_volumes: &'a ClipVolumeTable,
        stencil: &'a mut StencilRefAllocator,
        stats: &'a mut LightingStats,
        environment: &'a EnvironmentParams,
    ) -> Self {
        let caps = device.caps();
        let mut flags = ShaderFlags::NONE;
        flags.set(ShaderFlags::GMEM, targets.gmem);
        Self {
            device,
            config,
            camera,
            targets,
            caps,
            clip_volumes,
            stencil,
            stats,
            environment,
            flags,
            shadow_atlas_size: config.shadow_pool.atlas_size,
            scissor: None,
        }
    }

    /// Any clip volume registered this frame
    pub fn uses_clip_volumes(&self) -> bool {
        self.clip_volumes.volume_count > 0
    }

    /// Tiled compute lighting replaces the per-light draws
    pub fn tiled_deferred(&self) -> bool {
        self.config.pipeline.tiled == TiledMode::Deferred
    }

    /// Bind a named target if it is registered
    pub fn bind_target(&mut self, slot: u32, target: RenderTarget, sampler: SamplerKind) {
        if let Some(texture) = self.targets.texture(target) {
            self.device.bind_texture(slot, texture, sampler);
        }
    }

    /// Bind an engine default texture by name
    pub fn bind_default(&mut self, slot: u32, name: &str, sampler: SamplerKind) {
        if let Some(texture) = self.targets.registry.default_texture(name) {
            self.device.bind_texture(slot, texture, sampler);
        }
    }

    /// Bind the G-buffer in the per-light slot layout
    pub fn bind_gbuffer(&mut self) {
        self.bind_target(0, RenderTarget::ZTarget, SamplerKind::Point);
        self.bind_target(1, RenderTarget::SceneNormals, SamplerKind::Point);
        self.bind_target(2, RenderTarget::SceneDiffuse, SamplerKind::Point);
        self.bind_target(4, RenderTarget::SceneSpecular, SamplerKind::Point);
    }

    /// Bind the resolved clip volume stencil and its table
    pub fn bind_clip_volumes(&mut self, slot: u32) {
        if !self.uses_clip_volumes() {
            return;
        }
        self.bind_target(slot, RenderTarget::ResolvedStencil, SamplerKind::Point);
        self.clip_volumes.upload(&mut *self.device);
    }

    /// Set or disable the scissor rectangle
    ///
    /// Rectangles are dropped when scissoring is disabled in the pipeline.
    pub fn set_scissor(&mut self, rect: Option<ScissorRect>) {
        let rect = rect.filter(|_| self.config.pipeline.scissor);
        self.scissor = rect;
        self.device.set_scissor(rect);
    }

    /// Scissor rectangle currently set
    pub fn scissor(&self) -> Option<ScissorRect> {
        self.scissor
    }

    /// Depth bounds of a light, when the configuration allows them
    pub fn set_light_depth_bounds(&mut self, light: &Light) {
        if self.config.light_volumes.depth_bounds != DepthBoundsMode::Off {
            let bounds = light_depth_bounds(light, self.camera);
            self.device.set_depth_bounds(Some(bounds));
        }
    }

    /// Depth bounds that keep sky pixels out
    pub fn set_sky_depth_bounds(&mut self) {
        if self.config.light_volumes.depth_bounds == DepthBoundsMode::Off {
            return;
        }
        let bounds = if self.camera.reverse_depth {
            (1.0 - SKY_CULL_DEPTH, 1.0)
        } else {
            (0.0, SKY_CULL_DEPTH)
        };
        self.device.set_depth_bounds(Some(bounds));
    }

    /// Disable the depth bounds test
    pub fn clear_depth_bounds(&mut self) {
        self.device.set_depth_bounds(None);
    }

    /// Clear the stencil after the reference range wrapped
    ///
    /// The clear must cover the whole target, so the scissor is lifted for it
    /// and put back afterwards. Tile memory has no direct clear and uses a
    /// full-screen pass instead.
    pub fn clear_stencil(&mut self) {
        let scissor = self.scissor;
        self.device.set_scissor(None);

        if self.targets.gmem {
            self.device.set_stencil_test(Some(StencilTest {
                func: crate::device::CompareFunc::Always,
                reference: 0,
                read_mask: 0xFF,
            }));
            self.device.bind_technique(technique::CLEAR_STENCIL, self.flags);
            self.device.draw_full_screen();
            self.device.set_stencil_test(None);
        } else {
            self.device.submit(DeviceCommand::ClearStencil { value: 0 });
        }

        self.device.set_scissor(scissor);
        self.stats.stencil_clears += 1;
        log::trace!("Light stencil cleared (clear {})", self.stats.stencil_clears);
    }

    /// Upload the clip volume table parameter
    pub fn upload_clip_volume_params(&mut self) {
        if self.uses_clip_volumes() {
            self.device.set_param(param::CLIP_VOLUME_PARAMS, &self.clip_volumes.to_vec4s());
        }
    }
}
