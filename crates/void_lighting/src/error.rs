//! Error types for the lighting pipeline
//!
//! Only caller-correctable conditions are surfaced as errors. Degrades that
//! happen inside a frame (unshadowed lights, dropped clip volumes) are logged
//! and counted in [`crate::engine::LightingStats`] instead.

use thiserror::Error;

use crate::light::LightKind;

/// Lighting pipeline errors
#[derive(Debug, Error)]
pub enum LightingError {
    /// The shadow pool could not fit the requested shadow map
    #[error("Shadow pool exhausted: no room for a {size}x{size} map of light {light}")]
    ShadowPoolExhausted {
        /// Entity id of the light
        light: u64,
        /// Requested size in texels
        size: u32,
    },

    /// More clip volumes were registered than the stencil can address
    #[error("Clip volume budget exceeded ({max} volumes)")]
    ClipVolumeBudgetExceeded {
        /// Maximum addressable volumes
        max: usize,
    },

    /// Blend data was attached to a stencil id that is not registered
    #[error("Unknown clip volume stencil id: {0}")]
    UnknownClipVolume(u8),

    /// Every light id of a bucket is taken for this frame key
    #[error("Light table full: {kind:?} lights are limited to {max} per frame")]
    LightTableFull {
        /// Bucket that ran out of ids
        kind: LightKind,
        /// Maximum lights of one kind
        max: usize,
    },

    /// Recursion level outside of the supported range
    #[error("Recursion level {0} out of range")]
    RecursionLevelOutOfRange(usize),

    /// A render target name was not registered
    #[error("Unknown render target: {0}")]
    UnknownRenderTarget(String),

    /// Invalid configuration
    #[error("Invalid lighting configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed
    #[error("Failed to parse lighting configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// Result type for lighting operations
pub type Result<T> = std::result::Result<T, LightingError>;
