//! Lighting Engine
//!
//! [`LightingEngine`] owns everything the lighting stages keep between
//! calls: the double-buffered light and clip volume tables, the persistent
//! shadow pool and the stencil reference range. A frame is one call to
//! [`LightingEngine::render`], which walks the [`PassStage`]s in order.
//!
//! # Frame flow
//!
//! ```text
//! Init ─► Ambient ─► Cubemaps ─► AmbientLights ─► Ssr
//!   ─► ShadowPreLoop ─► Lights ─► AmbientOcclusion ─► Composite ─► Done
//! ```
//!
//! The shadow pre-loop runs before the accumulation targets are bound, so
//! its stage is entered early even though it sits after `Ssr` in the stage
//! order: allocation must finish before any shadow map is read.
//!
//! # Threading
//!
//! Lights and clip volumes are submitted into the fill slot from any thread
//! holding a [`SubmissionHandle`]; the render thread processes the other slot
//! and [`LightingEngine::swap_buffers`] flips the two at the frame boundary.

use std::sync::Arc;

use glam::{Mat4, Vec4};
use serde::{Deserialize, Serialize};

use crate::camera::CameraView;
use crate::classify::{calculate_scissor_rect, is_global_probe, sort_cubemaps, sort_lights};
use crate::clip_volume::{
    prepare_clip_volume_data,
    ClipVolumeBlendInfo,
    ClipVolumeOptions,
    ClipVolumeRecord,
    ClipVolumeSet,
    ClipVolumeTable,
};
use crate::config::{LightingConfig, TiledMode};
use crate::device::{DeviceCommand, GraphicsDevice, ShadowRenderer};
use crate::error::Result;
use crate::frame::{BufferSlot, FrameBuffers, FrameKey, RecursionLevel};
use crate::light::{Light, LightFlags, LightKind, LightList};
use crate::pass::{
    ambient_occlusion_passes,
    ambient_pass,
    apply_ssr,
    decal_emissive_pass,
    deferred_cubemaps,
    deferred_decal_pass,
    deferred_lights,
    deferred_shading_pass,
    directional_occlusion_pass,
    filter_gbuffer,
    pack_all_shadow_frustums,
    screen_space_reflection_pass,
    subsurface_scattering,
    tiled_shading,
    water_caustics,
    DeferredDecal,
    EnvironmentParams,
    HeightMapOcclusion,
    PassContext,
    ShadowCursor,
    ShadowPacking,
    WaterCaustics,
    CLEAR_MEDIAN,
};
use crate::shadow::{ShadowPoolAllocator, ShadowPoolState, StencilRefAllocator};
use crate::texture::{RenderContext, RenderTarget};

/// Counters of the last rendered frame
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightingStats {
    /// Light passes drawn, the ambient pass included
    pub lights_processed: u32,
    /// Environment probes visited
    pub cubemaps_processed: u32,
    /// Shadow casters packed into the pool
    pub shadow_frustums: u32,
    /// Fresh pool allocations
    pub shadow_allocations: u32,
    /// Pool faces reused without a new allocation
    pub shadow_reuses: u32,
    /// Pool records evicted
    pub shadow_evictions: u32,
    /// Casters degraded to unshadowed
    pub unshadowed: u32,
    /// Light stencil clears after a reference wrap
    pub stencil_clears: u32,
    /// Clip volumes past the stencil budget
    pub clip_volumes_dropped: u32,
}

/// Stage of the frame currently executing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PassStage {
    /// Setup, scissors and clip volumes
    #[default]
    Init,
    /// Full-screen ambient term
    Ambient,
    /// Local environment probes
    Cubemaps,
    /// Ambient-only lights
    AmbientLights,
    /// Screen-space reflections applied to the specular accumulation
    Ssr,
    /// Shadow pool allocation ahead of the lighting loop
    ShadowPreLoop,
    /// Shadowed then unshadowed lights
    Lights,
    /// Occlusion application
    AmbientOcclusion,
    /// Final composite or tiled dispatch
    Composite,
    /// Frame finished
    Done,
}

/// Light and clip volume submissions of one frame key
#[derive(Clone, Debug, Default)]
pub struct FrameData {
    /// Submitted lights, partitioned by kind
    pub lights: LightList,
    /// Registered clip volumes
    pub clip_volumes: ClipVolumeSet,
    /// Shadow pre-loop already ran on the tile memory path
    gmem_prepared: bool,
}

/// Collaborator data of one rendered frame
pub struct FrameInputs<'a> {
    /// Camera of the frame
    pub camera: &'a CameraView,
    /// Named targets; set up for the device's memory path by the engine
    pub targets: &'a mut RenderContext,
    /// Time-of-day environment
    pub environment: &'a EnvironmentParams,
    /// Sun light when visible and not submitted with the deferred lights
    pub sun: Option<&'a Light>,
    /// Terrain height map occlusion source
    pub height_map: Option<&'a HeightMapOcclusion>,
    /// Water caustics of the frame
    pub caustics: Option<&'a WaterCaustics>,
}

impl<'a> FrameInputs<'a> {
    /// Inputs with no optional collaborator
    pub fn new(camera: &'a CameraView, targets: &'a mut RenderContext, environment: &'a EnvironmentParams) -> Self {
        Self {
            camera,
            targets,
            environment,
            sun: None,
            height_map: None,
            caustics: None,
        }
    }
}

/// Thread-safe submission side of the engine's frame tables
#[derive(Clone)]
pub struct SubmissionHandle {
    frames: Arc<FrameBuffers<FrameData>>,
}

impl SubmissionHandle {
    /// Key of the slot being filled at `level`
    pub fn fill_key(&self, level: RecursionLevel) -> FrameKey {
        FrameKey::new(self.frames.fill_slot(), level)
    }

    /// Submit a light; see [`LightList::add`]
    pub fn add_light(&self, key: FrameKey, light: Light, mult: f32) -> Result<u16> {
        self.frames.with(key, |data| data.lights.add(light, mult))
    }

    /// Register a clip volume, returning its stencil id
    pub fn add_clip_volume(&self, key: FrameKey, volume: ClipVolumeRecord) -> Result<u8> {
        self.frames.with(key, |data| data.clip_volumes.add(volume))
    }

    /// Attach portal blend data to a registered clip volume
    pub fn set_clip_volume_blend_data(&self, key: FrameKey, stencil_ref: u8, blend: &ClipVolumeBlendInfo) -> Result<()> {
        self.frames
            .with(key, |data| data.clip_volumes.set_blend_data(stencil_ref, blend))
    }
}

/// Hot-reload state of the engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LightingEngineState {
    /// Frame counter
    pub frame: u32,
    /// Shadow pool allocations
    pub shadow_pool: ShadowPoolState,
    /// Active configuration
    pub config: LightingConfig,
}

/// Deferred lighting engine
pub struct LightingEngine {
    config: LightingConfig,
    frames: Arc<FrameBuffers<FrameData>>,
    shadow_pool: ShadowPoolAllocator,
    stencil: StencilRefAllocator,
    cursor: ShadowCursor,
    // Previous view-projection per GPU of an alternate frame setup
    prev_view_proj: Vec<Option<Mat4>>,
    frame: u32,
    stage: PassStage,
    stats: LightingStats,
}

impl LightingEngine {
    /// Create an engine, clamping the configuration into range
    pub fn new(mut config: LightingConfig) -> Self {
        config.validate();
        log::info!(
            "Lighting engine created: {0}x{0} shadow atlas, {1} refreshes per frame",
            config.shadow_pool.atlas_size,
            config.shadow_pool.updates_per_frame
        );
        Self {
            shadow_pool: ShadowPoolAllocator::new(&config.shadow_pool),
            prev_view_proj: vec![None; config.shadow_pool.gpu_count.max(1) as usize],
            frames: Arc::new(FrameBuffers::new()),
            stencil: StencilRefAllocator::new(),
            cursor: ShadowCursor::new(),
            frame: 0,
            stage: PassStage::Init,
            stats: LightingStats::default(),
            config,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &LightingConfig {
        &self.config
    }

    /// Replace the configuration
    ///
    /// The shadow atlas follows a size change on the next frame.
    pub fn set_config(&mut self, mut config: LightingConfig) {
        config.validate();
        if config.shadow_pool.atlas_size != self.config.shadow_pool.atlas_size {
            log::info!(
                "Shadow atlas resize requested: {} -> {}",
                self.config.shadow_pool.atlas_size,
                config.shadow_pool.atlas_size
            );
        }
        let gpus = config.shadow_pool.gpu_count.max(1) as usize;
        if gpus != self.prev_view_proj.len() {
            self.prev_view_proj = vec![None; gpus];
        }
        self.config = config;
    }

    /// Load the configuration from JSON
    pub fn load_config(&mut self, json: &str) -> Result<()> {
        let config = LightingConfig::from_json(json)?;
        self.set_config(config);
        Ok(())
    }

    /// Submission side of the frame tables, for producer threads
    pub fn submission_handle(&self) -> SubmissionHandle {
        SubmissionHandle {
            frames: Arc::clone(&self.frames),
        }
    }

    /// Slot being filled by producers
    pub fn fill_slot(&self) -> BufferSlot {
        self.frames.fill_slot()
    }

    /// Slot the render thread processes
    pub fn process_slot(&self) -> BufferSlot {
        self.frames.process_slot()
    }

    /// Hand the filled slot over to the render thread
    pub fn swap_buffers(&self) {
        self.frames.swap();
        log::trace!("Lighting buffers swapped, filling slot {:?}", self.frames.fill_slot());
    }

    /// Submit a light scaled by `mult`, returning its id within its kind
    pub fn add_light(&self, key: FrameKey, light: Light, mult: f32) -> Result<u16> {
        self.frames.with(key, |data| data.lights.add(light, mult))
    }

    /// Drop the lights of one frame key
    pub fn reset_lights(&self, key: FrameKey) {
        self.frames.with(key, |data| {
            data.lights.clear();
            data.gmem_prepared = false;
        });
    }

    /// Drop the lights of every slot and recursion level
    pub fn reset_all_lights(&self) {
        self.frames.for_each(|data| {
            data.lights.clear();
            data.gmem_prepared = false;
        });
    }

    /// Copy of a submitted light
    pub fn light_by_id(&self, key: FrameKey, kind: LightKind, light_id: u16) -> Option<Light> {
        self.frames
            .with(key, |data| data.lights.by_id(kind, light_id).cloned())
    }

    /// Copies of the submitted lights of a kind
    pub fn lights(&self, key: FrameKey, kind: LightKind) -> Vec<Light> {
        self.frames.with(key, |data| data.lights.lights(kind).to_vec())
    }

    /// Number of submitted lights of a kind
    pub fn light_count(&self, key: FrameKey, kind: LightKind) -> usize {
        self.frames.with(key, |data| data.lights.count(kind))
    }

    /// Register a clip volume, returning its stencil id
    ///
    /// Volumes past the stencil budget are kept but treated as outdoors.
    pub fn add_clip_volume(&self, key: FrameKey, volume: ClipVolumeRecord) -> Result<u8> {
        self.frames.with(key, |data| data.clip_volumes.add(volume))
    }

    /// Attach portal blend data to a registered clip volume
    pub fn set_clip_volume_blend_data(&self, key: FrameKey, stencil_ref: u8, blend: &ClipVolumeBlendInfo) -> Result<()> {
        self.frames
            .with(key, |data| data.clip_volumes.set_blend_data(stencil_ref, blend))
    }

    /// Drop the clip volumes of one frame key; ids restart at 1
    pub fn reset_clip_volumes(&self, key: FrameKey) {
        self.frames.with(key, |data| data.clip_volumes.reset());
    }

    /// Drop the clip volumes of every slot and recursion level
    pub fn reset_all_clip_volumes(&self) {
        self.frames.for_each(|data| data.clip_volumes.reset());
    }

    /// Number of clip volumes registered under a key
    pub fn clip_volume_count(&self, key: FrameKey) -> usize {
        self.frames.with(key, |data| data.clip_volumes.len())
    }

    /// Persistent shadow pool
    pub fn shadow_pool(&self) -> &ShadowPoolAllocator {
        &self.shadow_pool
    }

    /// Stage reached by the last frame
    pub fn stage(&self) -> PassStage {
        self.stage
    }

    /// Counters of the last frame
    pub fn stats(&self) -> &LightingStats {
        &self.stats
    }

    /// Frames rendered
    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Serialize state for hot-reload
    pub fn save_state(&self) -> LightingEngineState {
        LightingEngineState {
            frame: self.frame,
            shadow_pool: self.shadow_pool.save_state(),
            config: self.config.clone(),
        }
    }

    /// Restore state from hot-reload
    pub fn restore_state(&mut self, state: LightingEngineState) {
        self.set_config(state.config);
        self.frame = state.frame;
        self.shadow_pool.restore_state(state.shadow_pool);
        log::info!(
            "Lighting engine restored at frame {} with {} shadow records",
            self.frame,
            self.shadow_pool.live_count()
        );
    }

    /// Prepare the tile memory path ahead of the G-buffer pass
    ///
    /// Shadow maps cannot be rendered once the G-buffer lives in tile memory,
    /// so the lights are sorted and the casters packed here; the following
    /// [`Self::render`] of the same key skips those steps.
    pub fn setup_gmem_path(
        &mut self,
        key: FrameKey,
        camera: &CameraView,
        targets: &mut RenderContext,
        environment: &EnvironmentParams,
        device: &mut dyn GraphicsDevice,
        renderer: &mut dyn ShadowRenderer,
    ) {
        targets.setup(true);
        self.begin_frame();

        let Self {
            config,
            frames,
            shadow_pool,
            stencil,
            cursor,
            stats,
            ..
        } = self;
        let mut levels = frames.lock(key.slot);
        let data = &mut levels[key.level.index()];

        update_scissors(&mut data.lights, camera);
        let lights = data.lights.lights_mut(LightKind::Deferred);
        sort_lights(lights, config.pipeline.sort_mode, camera, |light| {
            shadow_pool.contains_light(light.entity_id)
        });

        let table = ClipVolumeTable::default();
        let mut ctx = PassContext::new(device, config, camera, targets, &table, stencil, stats, environment);
        let mut packing = ShadowPacking {
            pool: shadow_pool,
            renderer,
            cursor,
        };
        pack_all_shadow_frustums(&mut ctx, &mut packing, lights, true);
        data.gmem_prepared = true;
        log::debug!("Tile memory path prepared for {:?}", key);
    }

    /// Render the deferred lighting of one frame key
    ///
    /// Consumes the key's submissions read-only apart from per-frame light
    /// state (scissors, sort order, shadow degrades). Returns the frame's
    /// counters.
    pub fn render(
        &mut self,
        key: FrameKey,
        inputs: FrameInputs<'_>,
        device: &mut dyn GraphicsDevice,
        renderer: &mut dyn ShadowRenderer,
    ) -> &LightingStats {
        let caps = device.caps();
        let FrameInputs {
            camera,
            targets,
            environment,
            sun,
            height_map,
            caustics,
        } = inputs;
        targets.setup(caps.gmem);
        let gmem = targets.gmem;
        let targets: &RenderContext = targets;

        let prepared_gmem = self.frames.with(key, |data| data.gmem_prepared);
        if !(gmem && prepared_gmem) {
            self.begin_frame();
        }

        let gpu = self.frame as usize % self.prev_view_proj.len();
        let prev_view_proj = self.prev_view_proj[gpu].unwrap_or_else(|| camera.view_projection());
        self.prev_view_proj[gpu] = Some(camera.view_projection());

        let Self {
            config,
            frames,
            shadow_pool,
            stencil,
            cursor,
            stage,
            stats,
            ..
        } = self;
        let config: &LightingConfig = config;
        let pipeline = &config.pipeline;
        let mut levels = frames.lock(key.slot);
        let data = &mut levels[key.level.index()];

        *stage = PassStage::Init;

        if !(gmem && prepared_gmem) {
            update_scissors(&mut data.lights, camera);
        }
        if gmem && !prepared_gmem && data.lights.lights(LightKind::Deferred).iter().any(Light::casts_shadows) {
            log::debug!("Tile memory frame {:?} was not prepared, casters render unshadowed", key);
        }

        let prepared = prepare_clip_volume_data(
            &data.clip_volumes,
            &mut *device,
            targets,
            camera,
            ClipVolumeOptions {
                vis_areas: pipeline.vis_area_clip_per_pixel,
                portal_blend: pipeline.portal_blend,
                volumetric_fog: pipeline.volumetric_fog,
            },
        );
        stencil.reset(prepared.light_stencil_base);
        let mut outdoor_visible = prepared.table.outdoor_visible;

        let mut ctx = PassContext::new(device, config, camera, targets, &prepared.table, stencil, &mut *stats, environment);
        ctx.set_sky_depth_bounds();

        let tiled_deferred = ctx.tiled_deferred();
        if !gmem {
            sort_lights(
                data.lights.lights_mut(LightKind::Deferred),
                pipeline.sort_mode,
                camera,
                |light| shadow_pool.contains_light(light.entity_id),
            );
            filter_gbuffer(&mut ctx);
            directional_occlusion_pass(&mut ctx, height_map);
            screen_space_reflection_pass(&mut ctx, prev_view_proj);

            advance(stage, PassStage::ShadowPreLoop);
            // Tiled shading samples the atlas too, so casters are packed in every mode
            {
                let mut packing = ShadowPacking {
                    pool: &mut *shadow_pool,
                    renderer: &mut *renderer,
                    cursor: &mut *cursor,
                };
                pack_all_shadow_frustums(
                    &mut ctx,
                    &mut packing,
                    data.lights.lights_mut(LightKind::Deferred),
                    true,
                );
            }
            ctx.device.push_targets(
                &[RenderTarget::DiffuseAccumulation, RenderTarget::SpecularAccumulation],
                Some(RenderTarget::DepthStencil),
            );
        }

        sort_cubemaps(data.lights.lights_mut(LightKind::Cubemap), tiled_deferred);

        if pipeline.wireframe {
            clear_accumulation(&mut ctx, Vec4::ZERO);
            ctx.stencil.reset(1);
        }

        let cubemaps = data.lights.lights(LightKind::Cubemap);
        let global_probe = cubemaps
            .first()
            .filter(|probe| is_global_probe(probe, config.ambient.global_probe_radius))
            .cloned();
        let first_local = usize::from(global_probe.is_some());

        if !tiled_deferred {
            advance(stage, PassStage::Ambient);
            if pipeline.ambient && ambient_pass(&mut ctx, global_probe.as_ref(), &mut outdoor_visible) {
                ctx.stats.lights_processed += 1;
            }

            advance(stage, PassStage::Cubemaps);
            deferred_cubemaps(&mut ctx, data.lights.lights(LightKind::Cubemap), first_local);

            advance(stage, PassStage::AmbientLights);
            if pipeline.ambient_lights {
                deferred_lights(&mut ctx, data.lights.lights_mut(LightKind::Ambient), None);
            }

            advance(stage, PassStage::Ssr);
            apply_ssr(&mut ctx);
        }

        ctx.clear_depth_bounds();

        advance(stage, PassStage::Lights);
        if !tiled_deferred {
            let mut packing = ShadowPacking {
                pool: &mut *shadow_pool,
                renderer: &mut *renderer,
                cursor: &mut *cursor,
            };
            deferred_lights(&mut ctx, data.lights.lights_mut(LightKind::Deferred), Some(&mut packing));
        }

        advance(stage, PassStage::AmbientOcclusion);
        ambient_occlusion_passes(&mut ctx);
        ctx.set_scissor(None);
        ctx.clear_depth_bounds();

        if pipeline.unlit {
            clear_accumulation(&mut ctx, CLEAR_MEDIAN);
        }

        if !gmem {
            ctx.device.pop_targets();
            if let Some(caustics) = caustics {
                water_caustics(&mut ctx, caustics);
            }
        }

        advance(stage, PassStage::Composite);
        let sun = sun.cloned().or_else(|| {
            data.lights
                .lights(LightKind::Deferred)
                .iter()
                .find(|light| light.flags.contains(LightFlags::SUN))
                .cloned()
        });
        if tiled_deferred {
            tiled_shading(
                &mut ctx,
                data.lights.lights(LightKind::Cubemap),
                data.lights.lights(LightKind::Ambient),
                data.lights.lights(LightKind::Deferred),
            );
            subsurface_scattering(&mut ctx);
        } else {
            if pipeline.tiled == TiledMode::Culling {
                sort_cubemaps(data.lights.lights_mut(LightKind::Cubemap), true);
                tiled_shading(
                    &mut ctx,
                    data.lights.lights(LightKind::Cubemap),
                    data.lights.lights(LightKind::Ambient),
                    data.lights.lights(LightKind::Deferred),
                );
            }
            deferred_shading_pass(&mut ctx, sun.as_ref());
        }

        advance(stage, PassStage::Done);
        drop(ctx);

        data.gmem_prepared = false;
        let pool_stats = shadow_pool.stats();
        stats.shadow_allocations = pool_stats.allocations_this_frame;
        stats.shadow_reuses = pool_stats.reuses_this_frame;
        stats.shadow_evictions = pool_stats.evictions_this_frame;
        stats.clip_volumes_dropped = data.clip_volumes.dropped() as u32;
        drop(levels);

        log::trace!(
            "Lighting frame {} done: {} lights, {} probes, {} casters ({} unshadowed)",
            self.frame,
            self.stats.lights_processed,
            self.stats.cubemaps_processed,
            self.stats.shadow_frustums,
            self.stats.unshadowed
        );
        &self.stats
    }

    /// Draw deferred decals into the G-buffer
    ///
    /// Runs after the geometry pass and before [`Self::render`]. Returns the
    /// number of decals drawn.
    pub fn render_decals(
        &mut self,
        decals: &[DeferredDecal],
        camera: &CameraView,
        targets: &RenderContext,
        environment: &EnvironmentParams,
        device: &mut dyn GraphicsDevice,
    ) -> usize {
        let table = ClipVolumeTable::default();
        let mut ctx = PassContext::new(
            device,
            &self.config,
            camera,
            targets,
            &table,
            &mut self.stencil,
            &mut self.stats,
            environment,
        );

        let drawn = decals
            .iter()
            .filter(|decal| deferred_decal_pass(&mut ctx, decal))
            .count();
        for decal in decals.iter().filter(|decal| decal.is_emissive()) {
            decal_emissive_pass(&mut ctx, decal);
        }
        drawn
    }

    fn begin_frame(&mut self) {
        self.frame = self.frame.wrapping_add(1);
        self.shadow_pool.begin_frame(self.frame);
        self.cursor.reset();
        self.stats = LightingStats::default();
    }
}

fn advance(stage: &mut PassStage, next: PassStage) {
    debug_assert!(next >= *stage, "lighting stage {:?} after {:?}", next, stage);
    log::trace!("Lighting stage {:?}", next);
    *stage = next;
}

fn update_scissors(lights: &mut LightList, camera: &CameraView) {
    for light in lights.all_mut() {
        light.scissor = calculate_scissor_rect(light, camera);
    }
}

fn clear_accumulation(ctx: &mut PassContext<'_>, diffuse: Vec4) {
    ctx.device.submit(DeviceCommand::ClearTarget {
        target: RenderTarget::DiffuseAccumulation,
        color: diffuse,
    });
    ctx.device.submit(DeviceCommand::ClearTarget {
        target: RenderTarget::SpecularAccumulation,
        color: Vec4::ZERO,
    });
    ctx.device.submit(DeviceCommand::ClearStencil { value: 0 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CommandRecorder;
    use crate::shader::technique;
    use crate::shadow::ShadowFrustum;
    use crate::texture::TextureRegistry;
    use glam::{Mat3, Vec3};

    struct Harness {
        engine: LightingEngine,
        camera: CameraView,
        targets: RenderContext,
        environment: EnvironmentParams,
        device: CommandRecorder,
        renderer: CommandRecorder,
    }

    impl Harness {
        fn new(config: LightingConfig) -> Self {
            let camera = CameraView::default();
            Self {
                engine: LightingEngine::new(config),
                targets: RenderContext::new(
                    TextureRegistry::with_screen_targets(camera.width, camera.height),
                    camera.width,
                    camera.height,
                ),
                camera,
                environment: EnvironmentParams::default(),
                device: CommandRecorder::new(),
                renderer: CommandRecorder::new(),
            }
        }

        fn render(&mut self, key: FrameKey) -> LightingStats {
            let inputs = FrameInputs::new(&self.camera, &mut self.targets, &self.environment);
            self.engine
                .render(key, inputs, &mut self.device, &mut self.renderer)
                .clone()
        }
    }

    fn key() -> FrameKey {
        FrameKey::default()
    }

    #[test]
    fn test_empty_frame_runs_ambient_and_composite() {
        let mut harness = Harness::new(LightingConfig::default());
        let stats = harness.render(key());

        assert_eq!(harness.engine.stage(), PassStage::Done);
        let techniques = harness.device.techniques();
        let ambient = techniques.iter().position(|t| *t == technique::AMBIENT_PASS);
        let composite = techniques.iter().position(|t| *t == technique::SHADING_PASS);
        assert!(ambient.is_some() && composite.is_some());
        assert!(ambient < composite);
        assert_eq!(stats.lights_processed, 1);
        assert_eq!(
            harness.device.count(|c| matches!(c, DeviceCommand::PushRenderTargets { .. })),
            harness.device.count(|c| matches!(c, DeviceCommand::PopRenderTargets))
        );
    }

    #[test]
    fn test_submission_scales_and_classifies() {
        let engine = LightingEngine::new(LightingConfig::default());
        let id = engine
            .add_light(key(), Light::point(7, Vec3::ZERO, 1.0, Vec3::splat(2.0)), 0.5)
            .unwrap();
        engine.add_light(key(), Light::cubemap(8, Vec3::ZERO, Vec3::ONE), 1.0).unwrap();

        assert_eq!(id, 0);
        assert_eq!(engine.light_count(key(), LightKind::Deferred), 1);
        assert_eq!(engine.light_count(key(), LightKind::Cubemap), 1);
        let light = engine.light_by_id(key(), LightKind::Deferred, 0).unwrap();
        assert_eq!(light.color, Vec3::ONE);

        engine.reset_all_lights();
        assert_eq!(engine.light_count(key(), LightKind::Deferred), 0);
    }

    #[test]
    fn test_handle_fills_other_slot_than_render() {
        let engine = LightingEngine::new(LightingConfig::default());
        let handle = engine.submission_handle();
        let fill = handle.fill_key(RecursionLevel::ROOT);
        handle.add_light(fill, Light::point(1, Vec3::ZERO, 1.0, Vec3::ONE), 1.0).unwrap();

        let process = FrameKey::new(engine.process_slot(), RecursionLevel::ROOT);
        assert_eq!(engine.light_count(process, LightKind::Deferred), 0);

        engine.swap_buffers();
        let process = FrameKey::new(engine.process_slot(), RecursionLevel::ROOT);
        assert_eq!(engine.light_count(process, LightKind::Deferred), 1);
    }

    #[test]
    fn test_caster_packed_and_shaded() {
        let mut harness = Harness::new(LightingConfig::default());
        let caster = Light::spot(3, Vec3::new(0.0, 0.0, -10.0), 8.0, Vec3::ONE, Mat3::IDENTITY, 0.5)
            .with_shadow(ShadowFrustum::new(512));
        harness.engine.add_light(key(), caster, 1.0).unwrap();

        let stats = harness.render(key());

        assert_eq!(stats.shadow_frustums, 1);
        assert_eq!(stats.shadow_allocations, 1);
        assert_eq!(harness.renderer.shadow_requests().len(), 1);
        assert!(harness.engine.shadow_pool().contains_light(3));
    }

    #[test]
    fn test_tiled_deferred_replaces_light_draws() {
        let mut config = LightingConfig::default();
        config.pipeline.tiled = TiledMode::Deferred;
        let mut harness = Harness::new(config);
        harness
            .engine
            .add_light(key(), Light::point(1, Vec3::new(0.0, 0.0, -5.0), 2.0, Vec3::ONE), 1.0)
            .unwrap();
        let caster = Light::spot(2, Vec3::new(0.0, 0.0, -10.0), 8.0, Vec3::ONE, Mat3::IDENTITY, 0.5)
            .with_shadow(ShadowFrustum::new(512));
        harness.engine.add_light(key(), caster, 1.0).unwrap();

        let stats = harness.render(key());

        let techniques = harness.device.techniques();
        assert!(!techniques.contains(&technique::LIGHT_PASS));
        assert!(!techniques.contains(&technique::SHADING_PASS));
        assert!(!techniques.contains(&technique::AMBIENT_PASS));
        assert_eq!(stats.lights_processed, 2);
        assert_eq!(stats.shadow_frustums, 1);
        assert_eq!(harness.renderer.shadow_requests().len(), 1);
        assert!(harness.engine.shadow_pool().contains_light(2));
    }

    #[test]
    fn test_unlit_clears_accumulation() {
        let mut config = LightingConfig::default();
        config.pipeline.unlit = true;
        let mut harness = Harness::new(config);
        harness.render(key());

        assert!(harness.device.commands().contains(&DeviceCommand::ClearTarget {
            target: RenderTarget::DiffuseAccumulation,
            color: CLEAR_MEDIAN,
        }));
    }

    #[test]
    fn test_save_restore_keeps_frame() {
        let mut harness = Harness::new(LightingConfig::default());
        harness.render(key());
        harness.render(key());
        let state = harness.engine.save_state();

        let mut restored = LightingEngine::new(LightingConfig::low_quality());
        restored.restore_state(state);

        assert_eq!(restored.frame(), 2);
        assert_eq!(
            restored.config().shadow_pool.atlas_size,
            LightingConfig::default().shadow_pool.atlas_size
        );
    }
}
