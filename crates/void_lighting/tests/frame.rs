//! Whole-frame tests driving the engine through a recording device

use std::thread;

use glam::{Mat3, Vec3};
use void_lighting::clip_volume::ClipVolumeFlags;
use void_lighting::device::{DeviceCaps, DrawShape};
use void_lighting::shader::technique;
use void_lighting::*;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Frame {
    engine: LightingEngine,
    camera: CameraView,
    targets: RenderContext,
    environment: EnvironmentParams,
    device: CommandRecorder,
    renderer: CommandRecorder,
}

impl Frame {
    fn new(config: LightingConfig) -> Self {
        Self::with_caps(config, DeviceCaps::default())
    }

    fn with_caps(config: LightingConfig, caps: DeviceCaps) -> Self {
        init_logger();
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
            device: CommandRecorder::with_caps(caps),
            renderer: CommandRecorder::new(),
        }
    }

    fn render(&mut self, key: FrameKey) -> LightingStats {
        let inputs = FrameInputs::new(&self.camera, &mut self.targets, &self.environment);
        self.engine
            .render(key, inputs, &mut self.device, &mut self.renderer)
            .clone()
    }

    fn bound_techniques(&self) -> Vec<(&'static str, ShaderFlags)> {
        self.device
            .commands()
            .iter()
            .filter_map(|c| match c {
                DeviceCommand::BindTechnique { name, flags } => Some((*name, *flags)),
                _ => None,
            })
            .collect()
    }
}

fn key() -> FrameKey {
    FrameKey::default()
}

fn probe(entity_id: u64, position: Vec3, extents: Vec3) -> Light {
    Light::cubemap(entity_id, position, extents).with_cubemaps(
        TextureId::from_name("probe_diffuse"),
        TextureId::from_name("probe_specular"),
        128,
    )
}

fn omni_caster(entity_id: u64, size: u32) -> Light {
    Light::point(entity_id, Vec3::new(0.0, 0.0, -10.0), 4.0, Vec3::ONE).with_shadow(ShadowFrustum::omni(size))
}

fn spot_caster(entity_id: u64, size: u32) -> Light {
    Light::spot(entity_id, Vec3::new(0.0, 0.0, -10.0), 8.0, Vec3::ONE, Mat3::IDENTITY, 0.5)
        .with_shadow(ShadowFrustum::new(size))
}

fn face_refs(device: &CommandRecorder) -> Vec<u8> {
    device
        .commands()
        .iter()
        .filter_map(|c| match c {
            DeviceCommand::StencilCull {
                shape: DrawShape::ShadowFace(_),
                reference,
                ..
            } => Some(*reference),
            _ => None,
        })
        .collect()
}

#[test]
fn test_stages_run_in_order() {
    let mut frame = Frame::new(LightingConfig::default());
    let engine = &frame.engine;
    engine.add_light(key(), Light::point(1, Vec3::new(0.0, 0.0, -8.0), 2.0, Vec3::ONE), 1.0).unwrap();
    engine.add_light(key(), Light::ambient(2, Vec3::new(0.0, 0.0, -5.0), 3.0, Vec3::splat(0.5)), 1.0).unwrap();
    engine.add_light(key(), probe(3, Vec3::new(0.0, 0.0, -30.0), Vec3::splat(4.0)), 1.0).unwrap();
    engine.add_light(key(), probe(4, Vec3::ZERO, Vec3::splat(100_000.0)), 1.0).unwrap();

    let stats = frame.render(key());

    let bound = frame.bound_techniques();
    let is_light = |name: &str| name == technique::LIGHT_PASS || name == technique::LIGHT_VOLUME;
    let position = |pred: &dyn Fn(&(&'static str, ShaderFlags)) -> bool| bound.iter().position(pred).unwrap();

    let ambient = position(&|(name, _)| *name == technique::AMBIENT_PASS);
    let probe = position(&|(name, _)| *name == technique::CUBEMAP_PASS || *name == technique::CUBEMAP_VOLUME);
    let ambient_light = position(&|(name, flags)| is_light(name) && flags.contains(ShaderFlags::AMBIENT_LIGHT));
    let light = position(&|(name, flags)| is_light(name) && !flags.contains(ShaderFlags::AMBIENT_LIGHT));
    let composite = position(&|(name, _)| *name == technique::SHADING_PASS);

    assert!(ambient < probe);
    assert!(probe < ambient_light);
    assert!(ambient_light < light);
    assert!(light < composite);
    assert_eq!(frame.engine.stage(), PassStage::Done);

    // The global probe feeds the ambient pass, only the local one is drawn
    assert_eq!(stats.cubemaps_processed, 1);
    assert_eq!(stats.lights_processed, 3);
}

#[test]
fn test_push_and_pop_balance() {
    let mut frame = Frame::new(LightingConfig::high_quality());
    frame.engine.add_light(key(), spot_caster(1, 512), 1.0).unwrap();
    frame
        .engine
        .add_clip_volume(key(), ClipVolumeRecord::new(ClipVolumeFlags::NONE, Vec3::splat(-1.0), Vec3::ONE))
        .unwrap();

    frame.render(key());

    let pushes = frame
        .device
        .count(|c| matches!(c, DeviceCommand::PushRenderTargets { .. }));
    let pops = frame.device.count(|c| matches!(c, DeviceCommand::PopRenderTargets));
    assert!(pushes > 0);
    assert_eq!(pushes, pops);
}

#[test]
fn test_stencil_wrap_clears_exactly_once() {
    let mut frame = Frame::new(LightingConfig::default());
    // Light masks start above the clip volume range at 65 and take 8 refs per omni light
    for entity_id in 1..=24 {
        frame.engine.add_light(key(), omni_caster(entity_id, 128), 1.0).unwrap();
    }

    let stats = frame.render(key());

    assert_eq!(stats.shadow_frustums, 24);
    assert_eq!(stats.stencil_clears, 1);
    assert_eq!(
        frame
            .device
            .count(|c| matches!(c, DeviceCommand::ClearStencil { .. })),
        1
    );
    let refs = face_refs(&frame.device);
    assert_eq!(refs.len(), 24 * 6);
    assert_eq!(&refs[refs.len() - 6..], &[6, 5, 4, 3, 2, 1]);
}

#[test]
fn test_full_pool_degrades_to_unshadowed() {
    let mut config = LightingConfig::default();
    config.shadow_pool.atlas_size = 512;
    let mut frame = Frame::new(config);
    for entity_id in 1..=3 {
        frame.engine.add_light(key(), spot_caster(entity_id, 512), 1.0).unwrap();
    }

    let stats = frame.render(key());

    assert_eq!(stats.shadow_frustums, 1);
    assert_eq!(stats.unshadowed, 2);
    assert_eq!(frame.renderer.shadow_requests().len(), 1);
    // Every light is still drawn
    assert_eq!(stats.lights_processed, 4);
}

fn dispatches(device: &CommandRecorder) -> usize {
    device.count(|c| matches!(c, DeviceCommand::Dispatch { .. }))
}

fn shadowed_lights(engine: &LightingEngine) -> usize {
    engine
        .lights(key(), LightKind::Deferred)
        .iter()
        .filter(|light| light.casts_shadows())
        .count()
}

#[test]
fn test_tiled_deferred_packs_casters_before_dispatch() {
    let mut config = LightingConfig::default();
    config.pipeline.tiled = TiledMode::Deferred;
    let mut frame = Frame::new(config);
    frame.engine.add_light(key(), spot_caster(1, 512), 1.0).unwrap();

    let stats = frame.render(key());

    assert_eq!(dispatches(&frame.device), 1);
    assert_eq!(stats.shadow_frustums, 1);
    assert_eq!(stats.shadow_allocations, 1);
    assert_eq!(stats.unshadowed, 0);
    assert_eq!(frame.renderer.shadow_requests().len(), 1);
    assert!(frame.engine.shadow_pool().contains_light(1));
    assert_eq!(shadowed_lights(&frame.engine), 1);
}

#[test]
fn test_tiled_deferred_full_pool_drops_shadow_flag() {
    let mut config = LightingConfig::default();
    config.pipeline.tiled = TiledMode::Deferred;
    config.shadow_pool.atlas_size = 512;
    let mut frame = Frame::new(config);
    for entity_id in 1..=2 {
        frame.engine.add_light(key(), spot_caster(entity_id, 512), 1.0).unwrap();
    }

    let stats = frame.render(key());

    assert_eq!(dispatches(&frame.device), 1);
    assert_eq!(stats.shadow_frustums, 1);
    assert_eq!(stats.unshadowed, 1);
    assert_eq!(frame.renderer.shadow_requests().len(), 1);
    // The tiled pass must not sample the atlas for the dropped caster
    assert_eq!(shadowed_lights(&frame.engine), 1);
}

#[test]
fn test_tiled_culling_full_pool_degrades_to_unshadowed() {
    let mut config = LightingConfig::default();
    config.pipeline.tiled = TiledMode::Culling;
    config.shadow_pool.atlas_size = 512;
    let mut frame = Frame::new(config);
    for entity_id in 1..=2 {
        frame.engine.add_light(key(), spot_caster(entity_id, 512), 1.0).unwrap();
    }

    let stats = frame.render(key());

    assert_eq!(dispatches(&frame.device), 1);
    assert_eq!(stats.shadow_frustums, 1);
    assert_eq!(stats.unshadowed, 1);
    assert_eq!(frame.renderer.shadow_requests().len(), 1);
    assert_eq!(shadowed_lights(&frame.engine), 1);
}

#[test]
fn test_light_table_full_refuses_submission() {
    let engine = LightingEngine::new(LightingConfig::default());
    for entity_id in 0..MAX_LIGHTS_PER_KIND as u64 {
        engine
            .add_light(key(), Light::point(entity_id, Vec3::ZERO, 1.0, Vec3::ONE), 1.0)
            .unwrap();
    }

    let overflow = engine.add_light(key(), Light::point(u64::MAX, Vec3::ZERO, 1.0, Vec3::ONE), 1.0);
    assert!(matches!(
        overflow,
        Err(LightingError::LightTableFull {
            kind: LightKind::Deferred,
            ..
        })
    ));
    assert_eq!(engine.light_count(key(), LightKind::Deferred), MAX_LIGHTS_PER_KIND);
    let last = engine.light_by_id(key(), LightKind::Deferred, (MAX_LIGHTS_PER_KIND - 1) as u16);
    assert_eq!(last.map(|light| light.entity_id), Some(MAX_LIGHTS_PER_KIND as u64 - 1));

    // Other kinds keep their own ids
    assert_eq!(engine.add_light(key(), Light::cubemap(1, Vec3::ZERO, Vec3::ONE), 1.0).unwrap(), 0);

    engine.reset_lights(key());
    assert_eq!(
        engine.add_light(key(), Light::point(1, Vec3::ZERO, 1.0, Vec3::ONE), 1.0).unwrap(),
        0
    );
}

#[test]
fn test_clip_volume_ids_restart_after_reset() {
    let engine = LightingEngine::new(LightingConfig::default());
    let volume = || ClipVolumeRecord::new(ClipVolumeFlags::NONE, Vec3::splat(-1.0), Vec3::ONE);

    let ids: Vec<u8> = (0..3)
        .map(|_| engine.add_clip_volume(key(), volume()).unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);

    engine.reset_clip_volumes(key());
    assert_eq!(engine.add_clip_volume(key(), volume()).unwrap(), 1);

    assert!(matches!(
        engine.set_clip_volume_blend_data(key(), 9, &ClipVolumeBlendInfo::default()),
        Err(LightingError::UnknownClipVolume(9))
    ));
}

#[test]
fn test_gmem_path_packs_before_lighting() {
    let caps = DeviceCaps {
        gmem: true,
        ..Default::default()
    };
    let mut frame = Frame::with_caps(LightingConfig::default(), caps);
    frame.engine.add_light(key(), spot_caster(1, 512), 1.0).unwrap();

    frame.engine.setup_gmem_path(
        key(),
        &frame.camera,
        &mut frame.targets,
        &frame.environment,
        &mut frame.device,
        &mut frame.renderer,
    );
    assert_eq!(frame.renderer.shadow_requests().len(), 1);

    let stats = frame.render(key());

    assert_eq!(stats.shadow_frustums, 1);
    assert_eq!(stats.unshadowed, 0);
    assert_eq!(frame.renderer.shadow_requests().len(), 1);
    assert_eq!(
        frame
            .device
            .count(|c| matches!(c, DeviceCommand::PushRenderTargets { .. })),
        0
    );
    assert!(frame
        .bound_techniques()
        .iter()
        .any(|(name, flags)| *name == technique::SHADING_PASS && flags.contains(ShaderFlags::GMEM)));
}

#[test]
fn test_unprepared_gmem_casters_render_unshadowed() {
    let caps = DeviceCaps {
        gmem: true,
        ..Default::default()
    };
    let mut frame = Frame::with_caps(LightingConfig::default(), caps);
    frame.engine.add_light(key(), spot_caster(1, 512), 1.0).unwrap();

    let stats = frame.render(key());

    assert_eq!(stats.unshadowed, 1);
    assert!(frame.renderer.shadow_requests().is_empty());
}

#[test]
fn test_producer_thread_fills_next_frame() {
    let engine = LightingEngine::new(LightingConfig::default());
    let handle = engine.submission_handle();

    let producer = thread::spawn(move || {
        let key = handle.fill_key(RecursionLevel::ROOT);
        for entity_id in 0..8 {
            handle.add_light(key, Light::point(entity_id, Vec3::ZERO, 1.0, Vec3::ONE), 1.0).unwrap();
        }
    });
    producer.join().unwrap();

    let processing = FrameKey::new(engine.process_slot(), RecursionLevel::ROOT);
    assert_eq!(engine.light_count(processing, LightKind::Deferred), 0);

    engine.swap_buffers();
    let processing = FrameKey::new(engine.process_slot(), RecursionLevel::ROOT);
    assert_eq!(engine.light_count(processing, LightKind::Deferred), 8);
}

#[test]
fn test_hot_reload_reuses_shadow_maps() {
    let mut frame = Frame::new(LightingConfig::default());
    let mut caster = spot_caster(1, 512);
    if let Some(frustum) = caster.shadow.as_mut() {
        frustum.update_rate = 10;
    }
    frame.engine.add_light(key(), caster.clone(), 1.0).unwrap();
    frame.render(key());
    let state = frame.engine.save_state();

    let mut reloaded = Frame::new(LightingConfig::default());
    reloaded.engine.restore_state(state);
    reloaded.engine.add_light(key(), caster, 1.0).unwrap();
    let stats = reloaded.render(key());

    assert_eq!(stats.shadow_allocations, 0);
    assert_eq!(stats.shadow_reuses, 1);
    assert!(reloaded.renderer.shadow_requests().is_empty());
}

#[test]
fn test_config_loads_from_json() {
    let mut engine = LightingEngine::new(LightingConfig::default());
    let json = LightingConfig::low_quality().to_json().unwrap();

    engine.load_config(&json).unwrap();
    assert_eq!(
        engine.config().shadow_pool.atlas_size,
        LightingConfig::low_quality().shadow_pool.atlas_size
    );

    assert!(matches!(engine.load_config("{ not json"), Err(LightingError::ConfigParse(_))));
}
