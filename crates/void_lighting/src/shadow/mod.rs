//! Shadow Pool Scheduling
//!
//! Backend-agnostic bookkeeping for the shared shadow atlas and the stencil
//! masks that restrict shadowed light passes to each face's footprint.
//!
//! # Architecture
//!
//! - **Packer**: best-fit run packer over the square atlas
//! - **Frustum**: per-light shadow viewpoints and their atlas rectangles
//! - **Pool**: persistent (light, face) allocations with reuse and eviction
//! - **Stencil**: running stencil reference range with wrap-and-clear
//!
//! # Hot-Reload Support
//!
//! The packer's block table and the allocation records serialize through
//! [`ShadowPoolState`]. The atlas texture content is not preserved, so the
//! first shadow render after a restore carries the clear flag.

pub mod packer;
pub mod frustum;
pub mod pool;
pub mod stencil;

// Re-exports
pub use packer::{AtlasPacker, BlockId, PackRect};

pub use frustum::{ShadowFrustum, MAX_SHADOW_FACES};

pub use pool::{
    LightId,
    PackOutcome,
    PoolStats,
    ShadowAllocationRecord,
    ShadowPoolAllocator,
    ShadowPoolState,
    UpdatePolicy,
};

pub use stencil::{
    clip_volume_stencil_value,
    StencilRefAllocator,
    StencilStep,
    STENCIL_INSIDE_CLIP_VOLUME_BIT,
    STENCIL_MAX_REF,
    STENCIL_RESERVED_BIT,
};
