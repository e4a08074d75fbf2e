//! Lighting Configuration
//!
//! Global settings for the deferred lighting pipeline with serde support for
//! hot-reload. Every tuned threshold of the classifier and the ambient passes
//! lives here so it can be recalibrated per target hardware.
//!
//! # Usage
//!
//! ```ignore
//! let mut config = LightingConfig::from_json(&std::fs::read_to_string("lighting.json")?)?;
//! config.shadow_pool.atlas_size = 8192;
//! config.validate();
//! engine.set_config(config);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Global lighting configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    /// Shadow atlas sizing and staleness policy
    pub shadow_pool: ShadowPoolConfig,

    /// Stencil prepass / light volume heuristics
    pub light_volumes: LightVolumeConfig,

    /// Ambient and environment probe thresholds
    pub ambient: AmbientConfig,

    /// Pass enables and ordering options
    pub pipeline: PipelineConfig,
}

impl LightingConfig {
    /// Create a high-quality configuration
    pub fn high_quality() -> Self {
        Self {
            shadow_pool: ShadowPoolConfig {
                atlas_size: 8192,
                updates_per_frame: 2,
                ..Default::default()
            },
            pipeline: PipelineConfig {
                ssdo: true,
                ssr: true,
                sss: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a low-quality configuration for performance
    pub fn low_quality() -> Self {
        Self {
            shadow_pool: ShadowPoolConfig {
                atlas_size: 2048,
                max_frames_alive: 60,
                ..Default::default()
            },
            pipeline: PipelineConfig {
                ssdo: false,
                ssr: false,
                sss: false,
                area_lights: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON and clamp it into range
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(text)?;
        config.validate();
        Ok(config)
    }

    /// Serialize the configuration to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate configuration and clamp values to valid ranges
    pub fn validate(&mut self) {
        self.shadow_pool.validate();
        self.light_volumes.validate();
        self.ambient.validate();
    }
}

/// Shadow atlas ("shadow pool") configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowPoolConfig {
    /// Atlas width and height in texels (power of 2)
    pub atlas_size: u32,

    /// Log2 of the allocation granularity in texels
    pub block_log_size: u32,

    /// Padding in texels on every side of an allocation
    pub border: u32,

    /// Frames an allocation may go unrefreshed before eviction (0 = clear every frame)
    pub max_frames_alive: u32,

    /// Stale shadow maps re-rendered per frame
    pub updates_per_frame: u32,

    /// Number of GPUs in alternate-frame rendering
    pub gpu_count: u32,

    /// Shadow-casting lights accepted per frame
    pub max_shadow_lights: usize,
}

impl Default for ShadowPoolConfig {
    fn default() -> Self {
        Self {
            atlas_size: 4096,
            block_log_size: 5,
            border: 2,
            max_frames_alive: 30,
            updates_per_frame: 1,
            gpu_count: 1,
            max_shadow_lights: 64,
        }
    }
}

impl ShadowPoolConfig {
    /// Validate configuration and clamp values to valid ranges
    pub fn validate(&mut self) {
        self.atlas_size = self.atlas_size.clamp(256, 16384).next_power_of_two();
        self.block_log_size = self.block_log_size.min(8);
        self.border = self.border.min(16);
        self.max_frames_alive = self.max_frames_alive.min(255);
        self.gpu_count = self.gpu_count.max(1);
        self.max_shadow_lights = self.max_shadow_lights.clamp(1, 1024);
    }

    /// Allocation granularity in texels
    pub fn block_size(&self) -> u32 {
        1 << self.block_log_size
    }
}

/// Depth bounds test usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthBoundsMode {
    /// Never use depth bounds
    Off,
    /// Per-light depth bounds in the light pass
    #[default]
    Lights,
    /// Also bound every shadow cube face
    LightsAndShadowFaces,
}

/// Stencil prepass and light-volume heuristics
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LightVolumeConfig {
    /// Draw light volume meshes instead of full-screen quads
    pub light_volumes: bool,

    /// Allow the stencil prepass
    pub stencil_prepass: bool,

    /// Depth bounds test usage
    pub depth_bounds: DepthBoundsMode,

    /// Screen-area LOD multiplier (0 disables the LOD selection)
    pub lod_ratio: f32,

    /// Screen-area ratio driving the proxy mesh detail
    pub stencil_ratio: f32,

    /// Below this screen-area ratio a full-screen quad is cheaper than a volume
    pub min_volume_ratio: f32,

    /// Stencil ratio below which proxy detail stays at its default
    pub stencil_ratio_gate: f32,

    /// Multiple of the stencil ratio selecting the medium proxy mesh
    pub medium_detail_multiple: f32,

    /// Multiple of the stencil ratio selecting the high proxy mesh
    pub high_detail_multiple: f32,
}

impl Default for LightVolumeConfig {
    fn default() -> Self {
        Self {
            light_volumes: true,
            stencil_prepass: true,
            depth_bounds: DepthBoundsMode::Lights,
            lod_ratio: 1.0,
            stencil_ratio: 0.21,
            min_volume_ratio: 0.005,
            stencil_ratio_gate: 0.01,
            medium_detail_multiple: 2.0,
            high_detail_multiple: 4.0,
        }
    }
}

impl LightVolumeConfig {
    /// Validate configuration and clamp values to valid ranges
    pub fn validate(&mut self) {
        self.lod_ratio = self.lod_ratio.max(0.0);
        self.stencil_ratio = self.stencil_ratio.max(0.0);
        self.min_volume_ratio = self.min_volume_ratio.clamp(0.0, 1.0);
        self.stencil_ratio_gate = self.stencil_ratio_gate.max(0.0);
        self.medium_detail_multiple = self.medium_detail_multiple.max(1.0);
        self.high_detail_multiple = self.high_detail_multiple.max(self.medium_detail_multiple);
    }
}

/// Ambient pass and environment probe thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbientConfig {
    /// Probe radius at which a cubemap counts as the global probe
    pub global_probe_radius: f32,

    /// Diffuse luminance required to sample the global cubemap
    pub diffuse_luminance_threshold: f32,

    /// Specular luminance required to sample the global specular cubemap
    pub specular_luminance_threshold: f32,

    /// Specular luminance required to sample a local probe's specular cubemap
    pub probe_specular_threshold: f32,

    /// Screen-area ratio under which local probes skip the volume mesh
    pub probe_lod_threshold: f32,
}

impl Default for AmbientConfig {
    fn default() -> Self {
        Self {
            global_probe_radius: 100_000.0,
            diffuse_luminance_threshold: 0.001,
            specular_luminance_threshold: 0.005,
            probe_specular_threshold: 0.03,
            probe_lod_threshold: 0.01,
        }
    }
}

impl AmbientConfig {
    /// Validate configuration and clamp values to valid ranges
    pub fn validate(&mut self) {
        self.global_probe_radius = self.global_probe_radius.max(1.0);
        self.diffuse_luminance_threshold = self.diffuse_luminance_threshold.max(0.0);
        self.specular_luminance_threshold = self.specular_luminance_threshold.max(0.0);
        self.probe_specular_threshold = self.probe_specular_threshold.max(0.0);
        self.probe_lod_threshold = self.probe_lod_threshold.max(0.0);
    }
}

/// Light ordering applied before the shadow pool pre-loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightSortMode {
    /// Keep submission order
    Off,
    /// Score sort by screen footprint, distance and entity id
    Score,
    /// Move lights with a live shadow allocation to the front
    PreferPacked,
    /// Partition by allocation, then score sort each partition
    #[default]
    Both,
}

impl LightSortMode {
    /// Whether packed lights are partitioned to the front
    pub fn prefers_packed(self) -> bool {
        matches!(self, Self::PreferPacked | Self::Both)
    }

    /// Whether partitions are score sorted
    pub fn scores(self) -> bool {
        matches!(self, Self::Score | Self::Both)
    }
}

/// GPU tiled lighting mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TiledMode {
    /// Per-light draw calls only
    #[default]
    Off,
    /// Tiled culling for forward shading, per-light draws still issued
    Culling,
    /// Single compute invocation replaces the per-light draws
    Deferred,
}

/// Pass enables and ordering options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Light ordering mode
    pub sort_mode: LightSortMode,

    /// Run per-light passes
    pub deferred_lights: bool,

    /// Run the full-screen ambient pass
    pub ambient: bool,

    /// Filter specular aliasing out of the G-buffer before lighting
    pub filter_gbuffer: bool,

    /// Run ambient-only lights
    pub ambient_lights: bool,

    /// Run environment probe passes
    pub env_probes: bool,

    /// Shade area lights
    pub area_lights: bool,

    /// Screen-space directional occlusion
    pub ssdo: bool,

    /// Screen-space reflections
    pub ssr: bool,

    /// Subsurface scattering blur
    pub sss: bool,

    /// Volumetric fog clip-volume stencil
    pub volumetric_fog: bool,

    /// Blend lighting across portals between clip volumes
    pub portal_blend: bool,

    /// Stamp vis areas into the clip volume stencil
    pub vis_area_clip_per_pixel: bool,

    /// Restrict light draws to their scissor rectangle
    pub scissor: bool,

    /// GPU tiled lighting mode
    pub tiled: TiledMode,

    /// Clear lighting to a neutral value (debug)
    pub unlit: bool,

    /// Wireframe debug mode
    pub wireframe: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sort_mode: LightSortMode::Both,
            deferred_lights: true,
            ambient: true,
            filter_gbuffer: false,
            ambient_lights: true,
            env_probes: true,
            area_lights: true,
            ssdo: true,
            ssr: false,
            sss: true,
            volumetric_fog: false,
            portal_blend: true,
            vis_area_clip_per_pixel: true,
            scissor: true,
            tiled: TiledMode::Off,
            unlit: false,
            wireframe: false,
        }
    }
}
