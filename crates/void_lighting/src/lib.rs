//! # void_lighting - Deferred Lighting and Shadow Pool Scheduling
//!
//! Lights a G-buffer produced by an earlier geometry pass:
//! - Ambient term, environment probes and per-light passes
//! - Shadow maps packed into one persistent atlas, refreshed on a budget
//! - Clip volumes stamped into the stencil to mask lights per room
//! - Occlusion, reflections, decals and subsurface blur
//! - Final composite into the HDR scene target
//!
//! ## Architecture
//!
//! The crate never talks to a graphics API. Every pass records state changes
//! and draws on a [`GraphicsDevice`], and shadow map renders are requested
//! from a [`ShadowRenderer`]. The engine owns all state that outlives a call:
//!
//! 1. **Frame tables**: double-buffered light and clip volume submissions
//! 2. **Shadow pool**: atlas allocations reused across frames
//! 3. **Stencil range**: reference values of the light masks
//!
//! ## Example
//!
//! ```ignore
//! use void_lighting::prelude::*;
//!
//! let mut engine = LightingEngine::new(LightingConfig::default());
//! let submit = engine.submission_handle();
//!
//! // Scene thread
//! let key = submit.fill_key(RecursionLevel::ROOT);
//! submit.add_light(key, Light::point(1, position, 5.0, color), 1.0)?;
//!
//! // Frame boundary
//! engine.swap_buffers();
//!
//! // Render thread
//! let key = FrameKey::new(engine.process_slot(), RecursionLevel::ROOT);
//! let inputs = FrameInputs::new(&camera, &mut targets, &environment);
//! let stats = engine.render(key, inputs, &mut device, &mut shadow_renderer);
//! ```

pub mod camera;
pub mod classify;
pub mod clip_volume;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod frame;
pub mod light;
pub mod pass;
pub mod shader;
pub mod shadow;
pub mod texture;

pub use camera::CameraView;
pub use classify::{calculate_scissor_rect, light_depth_bounds, light_render_settings, sort_lights, LightRenderSettings, MeshDetail};
pub use clip_volume::{
    prepare_clip_volume_data,
    ClipVolumeBlendInfo,
    ClipVolumeFlags,
    ClipVolumeRecord,
    ClipVolumeSet,
    ClipVolumeTable,
    MeshHandle,
    MAX_CLIP_VOLUME_ID,
    MAX_DEFERRED_CLIP_VOLUMES,
};
pub use config::{
    AmbientConfig,
    DepthBoundsMode,
    LightSortMode,
    LightVolumeConfig,
    LightingConfig,
    PipelineConfig,
    ShadowPoolConfig,
    TiledMode,
};
pub use device::{CommandRecorder, DeviceCaps, DeviceCommand, GraphicsDevice, ShadowRenderer, ShadowRequest};
pub use engine::{FrameData, FrameInputs, LightingEngine, LightingEngineState, LightingStats, PassStage, SubmissionHandle};
pub use error::{LightingError, Result};
pub use frame::{BufferSlot, FrameBuffers, FrameKey, FrameTable, RecursionLevel};
pub use light::{Light, LightFlags, LightKind, LightList, ScissorRect, MAX_LIGHTS_PER_KIND};
pub use pass::{DeferredDecal, EnvironmentParams, HeightMapOcclusion, PassContext, WaterCaustics};
pub use shader::ShaderFlags;
pub use shadow::{ShadowFrustum, ShadowPoolAllocator, StencilRefAllocator};
pub use texture::{MaterialSlot, MaterialTextures, RenderContext, RenderTarget, TextureId, TextureRegistry};

/// Common imports
pub mod prelude {
    pub use crate::camera::CameraView;
    pub use crate::config::LightingConfig;
    pub use crate::device::{GraphicsDevice, ShadowRenderer};
    pub use crate::engine::{FrameInputs, LightingEngine, LightingStats};
    pub use crate::frame::{FrameKey, RecursionLevel};
    pub use crate::light::{Light, LightFlags, LightKind};
    pub use crate::pass::EnvironmentParams;
    pub use crate::texture::{RenderContext, TextureRegistry};
}
