//! Shadow Pool Allocation
//!
//! Persistent allocation of shadow atlas space to (light, cube face) pairs.
//! Allocations survive across frames so a light that does not move keeps its
//! rectangle and only re-renders when its update rate asks for it. Stale
//! records are evicted one per frame by [`ShadowPoolAllocator::tick`].
//!
//! The allocator is backend-agnostic: it never touches the atlas texture,
//! it only decides which faces need a shadow map render and where.
//!
//! # Usage
//!
//! ```ignore
//! let mut pool = ShadowPoolAllocator::new(&config.shadow_pool);
//!
//! // Per frame
//! pool.begin_frame(frame_number);
//! pool.update_atlas_size(config.shadow_pool.atlas_size);
//! pool.tick(config.shadow_pool.max_frames_alive);
//!
//! for light in shadow_casters {
//!     match pool.allocate_or_reuse(light, &policy) {
//!         Ok(outcome) if outcome.needs_render() => shadows.request_shadow_render(light, 0, pool.take_clear_flag()),
//!         Ok(_) => {}
//!         Err(_) => light.flags.remove(LightFlags::CASTS_SHADOWS),
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};

use super::packer::{AtlasPacker, BlockId, PackRect};
use crate::config::ShadowPoolConfig;
use crate::error::{LightingError, Result};
use crate::light::Light;

/// Entity id of a light
pub type LightId = u64;

/// Bookkeeping entry of one (light, face) allocation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowAllocationRecord {
    /// Packer block, `None` when the record is free
    pub block: Option<BlockId>,
    /// Light entity id
    pub light_id: LightId,
    /// Cube face index
    pub face: u8,
    /// Frame of the last render, 8-bit wrapping
    pub frame: u8,
}

impl ShadowAllocationRecord {
    /// Record holds no block
    pub fn is_free(&self) -> bool {
        self.block.is_none()
    }

    /// Frames since the last render, correct across the 8-bit wrap
    pub fn age(&self, current_frame: u8) -> u8 {
        current_frame.wrapping_sub(self.frame)
    }
}

/// Refresh policy for one frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Stale maps that may be refreshed this frame
    pub updates_per_frame: u32,
    /// GPUs in alternate-frame rendering
    pub gpu_count: u32,
}

impl From<&ShadowPoolConfig> for UpdatePolicy {
    fn from(config: &ShadowPoolConfig) -> Self {
        Self {
            updates_per_frame: config.updates_per_frame,
            gpu_count: config.gpu_count,
        }
    }
}

/// Result of packing one light
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackOutcome {
    /// Faces that received a fresh rectangle and need rendering
    pub faces_to_render: u8,
    /// Faces that kept their previous rectangle
    pub faces_reused: u8,
}

impl PackOutcome {
    /// At least one face needs a shadow map render
    pub fn needs_render(&self) -> bool {
        self.faces_to_render != 0
    }
}

/// Pool statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Fresh allocations made this frame
    pub allocations_this_frame: u32,
    /// Faces reused as-is this frame
    pub reuses_this_frame: u32,
    /// Records evicted this frame
    pub evictions_this_frame: u32,
    /// Lights that did not fit this frame
    pub failures_this_frame: u32,
    /// Total allocations ever made
    pub total_allocations: u64,
    /// Total evictions ever made
    pub total_evictions: u64,
}

/// Persistent shadow atlas allocator
#[derive(Clone, Debug)]
pub struct ShadowPoolAllocator {
    packer: AtlasPacker,
    records: Vec<ShadowAllocationRecord>,
    block_log_size: u32,
    frame: u32,
    updates_this_frame: u32,
    pending_clear: bool,
    warned_this_frame: bool,
    stats: PoolStats,
}

impl ShadowPoolAllocator {
    /// Create an empty allocator
    pub fn new(config: &ShadowPoolConfig) -> Self {
        Self {
            packer: AtlasPacker::new(config.atlas_size, config.border),
            records: Vec::new(),
            block_log_size: config.block_log_size,
            frame: 0,
            updates_this_frame: 0,
            pending_clear: true,
            warned_this_frame: false,
            stats: PoolStats::default(),
        }
    }

    /// Begin a new frame
    pub fn begin_frame(&mut self, frame: u32) {
        self.frame = frame;
        self.updates_this_frame = 0;
        self.warned_this_frame = false;
        self.stats.allocations_this_frame = 0;
        self.stats.reuses_this_frame = 0;
        self.stats.evictions_this_frame = 0;
        self.stats.failures_this_frame = 0;
    }

    /// Current frame number truncated to the record's 8 bits
    #[inline]
    pub fn frame8(&self) -> u8 {
        (self.frame & 0xFF) as u8
    }

    /// Resize the atlas if `size` differs, dropping every allocation
    ///
    /// Returns whether a resize happened.
    pub fn update_atlas_size(&mut self, size: u32) -> bool {
        if size == self.packer.size() {
            return false;
        }
        log::info!("Shadow pool resized {} -> {}", self.packer.size(), size);
        self.packer.resize(size);
        self.records.clear();
        self.pending_clear = true;
        true
    }

    /// Free every block and record
    pub fn clear(&mut self) {
        if !self.records.is_empty() {
            log::debug!("Shadow pool cleared ({} records)", self.records.len());
        }
        self.packer.clear();
        self.records.clear();
        self.pending_clear = true;
    }

    /// Evict at most one record older than `max_frames_alive`
    pub fn tick(&mut self, max_frames_alive: u32) -> Option<ShadowAllocationRecord> {
        let current = self.frame8();
        let index = self.records.iter().position(|r| {
            !r.is_free() && r.age(current) as u32 > max_frames_alive
        })?;

        let evicted = self.records[index];
        if let Some(block) = evicted.block {
            self.packer.remove_block(block);
        }
        self.records[index].block = None;
        self.stats.evictions_this_frame += 1;
        self.stats.total_evictions += 1;
        log::trace!(
            "Evicted shadow face {} of light {} (age {})",
            evicted.face,
            evicted.light_id,
            evicted.age(current)
        );
        Some(evicted)
    }

    /// Texel size of an allocation for a requested shadow map size
    ///
    /// Rounded up to a power-of-two count of blocks, then halved until it
    /// fits the atlas with its border.
    pub fn allocation_size(&self, texture_size: u32) -> u32 {
        let block = 1u32 << self.block_log_size;
        let blocks = texture_size.div_ceil(block).max(1).next_power_of_two();
        let mut size = blocks << self.block_log_size;
        let limit = self.packer.size().saturating_sub(2 * self.packer.border());
        while size > limit && size > block {
            size >>= 1;
        }
        size
    }

    /// Give every face of the light's frustum an atlas rectangle
    ///
    /// Faces whose live allocation still matches the requested size and is
    /// not due for a refresh are reused as-is. Others are released and
    /// packed again. The frustum's `shadow_gen_mask` ends up holding exactly
    /// the faces that need a render.
    pub fn allocate_or_reuse(&mut self, light: &mut Light, policy: &UpdatePolicy) -> Result<PackOutcome> {
        let area = light.is_area();
        let light_id = light.entity_id;
        let Some(frustum) = light.shadow.as_mut() else {
            return Ok(PackOutcome::default());
        };

        let size = self.allocation_size(frustum.texture_size);
        let current = self.frame8();
        let mut outcome = PackOutcome::default();
        frustum.shadow_gen_mask = frustum.all_faces_mask(area);

        for face in 0..frustum.face_count(area) {
            let face_bit = 1u8 << face;
            let existing = self.find(light_id, face as u8);
            let mut frame = current;

            if let Some(index) = existing {
                let record = self.records[index];
                if let Some((block, rect)) = record.block.and_then(|b| self.packer.block(b).map(|r| (b, r))) {
                    let age = record.age(current);
                    let refresh = if frustum.update_rate == 0 {
                        true
                    } else if age > frustum.update_rate && self.updates_this_frame < policy.updates_per_frame {
                        self.updates_this_frame += 1;
                        true
                    } else if policy.gpu_count > 1 && policy.gpu_count > age as u32 {
                        frame = record.frame;
                        true
                    } else {
                        false
                    };

                    if !refresh && rect.width == size {
                        frustum.face_rects[face] = rect;
                        frustum.shadow_gen_mask &= !face_bit;
                        outcome.faces_reused |= face_bit;
                        self.stats.reuses_this_frame += 1;
                        continue;
                    }

                    self.packer.remove_block(block);
                }
                self.records[index].block = None;
            }

            let Some((block, rect)) = self.packer.add_block(size, size) else {
                self.stats.failures_this_frame += 1;
                return Err(LightingError::ShadowPoolExhausted { light: light_id, size });
            };

            let record = ShadowAllocationRecord {
                block: Some(block),
                light_id,
                face: face as u8,
                frame,
            };
            match existing.or_else(|| self.records.iter().position(ShadowAllocationRecord::is_free)) {
                Some(index) => self.records[index] = record,
                None => self.records.push(record),
            }

            frustum.face_rects[face] = rect;
            outcome.faces_to_render |= face_bit;
            self.stats.allocations_this_frame += 1;
            self.stats.total_allocations += 1;
        }

        Ok(outcome)
    }

    fn find(&self, light_id: LightId, face: u8) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.light_id == light_id && r.face == face)
    }

    /// Live record of a (light, face) pair
    pub fn record(&self, light_id: LightId, face: u8) -> Option<&ShadowAllocationRecord> {
        self.find(light_id, face)
            .map(|i| &self.records[i])
            .filter(|r| !r.is_free())
    }

    /// Rectangle of a live (light, face) allocation
    pub fn rect(&self, light_id: LightId, face: u8) -> Option<PackRect> {
        self.record(light_id, face)
            .and_then(|r| r.block)
            .and_then(|b| self.packer.block(b))
    }

    /// Whether the light owns any live allocation
    pub fn contains_light(&self, light_id: LightId) -> bool {
        self.records
            .iter()
            .any(|r| r.light_id == light_id && !r.is_free())
    }

    /// Every record, free ones included
    pub fn records(&self) -> &[ShadowAllocationRecord] {
        &self.records
    }

    /// Number of live records
    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_free()).count()
    }

    /// Underlying packer
    pub fn packer(&self) -> &AtlasPacker {
        &self.packer
    }

    /// Atlas dimension in texels
    pub fn atlas_size(&self) -> u32 {
        self.packer.size()
    }

    /// Fraction of the atlas covered by padded blocks
    pub fn utilization(&self) -> f32 {
        let total = self.packer.size() as f64 * self.packer.size() as f64;
        if total == 0.0 {
            return 0.0;
        }
        (self.packer.used_area() as f64 / total) as f32
    }

    /// Consume the "atlas content is invalid" flag set by a clear or resize
    pub fn take_clear_flag(&mut self) -> bool {
        core::mem::take(&mut self.pending_clear)
    }

    /// Log the exhaustion warning unless it was already logged this frame
    pub fn warn_exhausted(&mut self, light_id: LightId) {
        if !self.warned_this_frame {
            self.warned_this_frame = true;
            log::warn!(
                "Shadow pool full ({}x{}): light {} and possibly others render unshadowed this frame",
                self.packer.size(),
                self.packer.size(),
                light_id
            );
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

/// Shadow pool state for hot-reload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShadowPoolState {
    /// Packer with its block table
    pub packer: AtlasPacker,
    /// Allocation records
    pub records: Vec<ShadowAllocationRecord>,
    /// Current frame
    pub frame: u32,
}

impl ShadowPoolAllocator {
    /// Serialize state for hot-reload
    pub fn save_state(&self) -> ShadowPoolState {
        ShadowPoolState {
            packer: self.packer.clone(),
            records: self.records.clone(),
            frame: self.frame,
        }
    }

    /// Restore state from hot-reload
    pub fn restore_state(&mut self, state: ShadowPoolState) {
        self.packer = state.packer;
        self.packer.restore();
        self.frame = state.frame;

        // Drop records whose block did not survive
        self.records = state.records;
        for record in &mut self.records {
            if record.block.is_some_and(|b| !self.packer.contains(b)) {
                record.block = None;
            }
        }
        self.pending_clear = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::ShadowFrustum;
    use glam::Vec3;

    fn config(atlas_size: u32) -> ShadowPoolConfig {
        ShadowPoolConfig {
            atlas_size,
            ..Default::default()
        }
    }

    fn policy() -> UpdatePolicy {
        UpdatePolicy {
            updates_per_frame: 1,
            gpu_count: 1,
        }
    }

    fn spot(id: u64, size: u32, update_rate: u8) -> Light {
        Light::point(id, Vec3::ZERO, 5.0, Vec3::ONE)
            .with_shadow(ShadowFrustum::new(size).with_update_rate(update_rate))
    }

    #[test]
    fn test_record_age_wraps() {
        let record = ShadowAllocationRecord {
            block: Some(BlockId(0)),
            light_id: 1,
            face: 0,
            frame: 255,
        };
        assert_eq!(record.age(2), 3);
        assert_eq!(record.age(255), 0);
    }

    #[test]
    fn test_first_allocation_renders() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        pool.begin_frame(1);
        let mut light = spot(7, 512, 4);

        let outcome = pool.allocate_or_reuse(&mut light, &policy()).unwrap();
        assert_eq!(outcome.faces_to_render, 0x1);
        let frustum = light.shadow.as_ref().unwrap();
        assert_eq!(frustum.shadow_gen_mask, 0x1);
        assert_eq!(frustum.face_rects[0], PackRect::new(2, 2, 512, 512));
        assert_eq!(pool.record(7, 0).map(|r| r.frame), Some(1));
        assert!(pool.contains_light(7));
    }

    #[test]
    fn test_reuse_under_update_rate() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        let mut light = spot(7, 512, 10);

        pool.begin_frame(1);
        pool.allocate_or_reuse(&mut light, &policy()).unwrap();
        let rect = light.shadow.as_ref().unwrap().face_rects[0];
        let block = pool.record(7, 0).unwrap().block;

        for frame in 2..=10 {
            pool.begin_frame(frame);
            assert!(pool.tick(30).is_none());
            let outcome = pool.allocate_or_reuse(&mut light, &policy()).unwrap();
            assert!(!outcome.needs_render());
            assert_eq!(outcome.faces_reused, 0x1);
            assert_eq!(light.shadow.as_ref().unwrap().face_rects[0], rect);
            assert_eq!(light.shadow.as_ref().unwrap().shadow_gen_mask, 0);
            assert_eq!(pool.record(7, 0).unwrap().block, block);
            assert_eq!(pool.stats().allocations_this_frame, 0);
        }
    }

    #[test]
    fn test_update_rate_zero_always_refreshes() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        let mut light = spot(7, 512, 0);

        pool.begin_frame(1);
        pool.allocate_or_reuse(&mut light, &policy()).unwrap();
        pool.begin_frame(2);
        let outcome = pool.allocate_or_reuse(&mut light, &policy()).unwrap();
        assert!(outcome.needs_render());
        assert_eq!(pool.record(7, 0).unwrap().frame, 2);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_time_sliced_refresh_budget() {
        let mut pool = ShadowPoolAllocator::new(&config(4096));
        let mut a = spot(1, 256, 2);
        let mut b = spot(2, 256, 2);

        pool.begin_frame(1);
        pool.allocate_or_reuse(&mut a, &policy()).unwrap();
        pool.allocate_or_reuse(&mut b, &policy()).unwrap();

        // Both are stale at frame 4, only one refresh fits the budget
        pool.begin_frame(4);
        let first = pool.allocate_or_reuse(&mut a, &policy()).unwrap();
        let second = pool.allocate_or_reuse(&mut b, &policy()).unwrap();
        assert!(first.needs_render());
        assert!(!second.needs_render());

        // The other one gets its turn next frame
        pool.begin_frame(5);
        assert!(!pool.allocate_or_reuse(&mut a, &policy()).unwrap().needs_render());
        assert!(pool.allocate_or_reuse(&mut b, &policy()).unwrap().needs_render());
    }

    #[test]
    fn test_multi_gpu_keeps_frame() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        let policy = UpdatePolicy {
            updates_per_frame: 0,
            gpu_count: 2,
        };
        let mut light = spot(7, 512, 10);

        pool.begin_frame(1);
        pool.allocate_or_reuse(&mut light, &policy).unwrap();

        // Second GPU renders its copy, the record keeps the original frame
        pool.begin_frame(2);
        assert!(pool.allocate_or_reuse(&mut light, &policy).unwrap().needs_render());
        assert_eq!(pool.record(7, 0).unwrap().frame, 1);

        pool.begin_frame(3);
        assert!(!pool.allocate_or_reuse(&mut light, &policy).unwrap().needs_render());
    }

    #[test]
    fn test_size_change_repacks() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        let mut light = spot(7, 512, 10);
        pool.begin_frame(1);
        pool.allocate_or_reuse(&mut light, &policy()).unwrap();

        light.shadow.as_mut().unwrap().texture_size = 256;
        pool.begin_frame(2);
        let outcome = pool.allocate_or_reuse(&mut light, &policy()).unwrap();
        assert!(outcome.needs_render());
        assert_eq!(pool.rect(7, 0).unwrap().width, 256);
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.packer().block_count(), 1);
    }

    #[test]
    fn test_omni_allocates_six_faces() {
        let mut pool = ShadowPoolAllocator::new(&config(4096));
        let mut light = Light::point(3, Vec3::ZERO, 5.0, Vec3::ONE)
            .with_shadow(ShadowFrustum::omni(512).with_update_rate(5));
        pool.begin_frame(1);
        let outcome = pool.allocate_or_reuse(&mut light, &policy()).unwrap();
        assert_eq!(outcome.faces_to_render, 0x3F);
        assert_eq!(pool.live_count(), 6);
        for face in 0..6 {
            assert!(pool.record(3, face).is_some());
        }
    }

    #[test]
    fn test_exhaustion_reports_error() {
        let mut pool = ShadowPoolAllocator::new(&config(1024));
        pool.begin_frame(1);
        let mut big = spot(1, 1024, 5);
        let mut other = spot(2, 512, 5);
        let mut small = spot(3, 256, 5);

        // Clamped to 512 so it fits with its border
        pool.allocate_or_reuse(&mut big, &policy()).unwrap();
        assert_eq!(pool.rect(1, 0).unwrap().width, 512);

        // A second padded 512 block would reach 1032
        let result = pool.allocate_or_reuse(&mut other, &policy());
        assert!(matches!(result, Err(LightingError::ShadowPoolExhausted { light: 2, size: 512 })));
        assert_eq!(pool.stats().failures_this_frame, 1);
        assert!(!pool.contains_light(2));

        pool.allocate_or_reuse(&mut small, &policy()).unwrap();
        assert_eq!(pool.rect(3, 0).unwrap().x, 518);
    }

    #[test]
    fn test_tick_evicts_one_per_frame() {
        let mut pool = ShadowPoolAllocator::new(&config(4096));
        pool.begin_frame(1);
        for id in 1..=3 {
            pool.allocate_or_reuse(&mut spot(id, 256, 5), &policy()).unwrap();
        }

        pool.begin_frame(10);
        assert!(pool.tick(30).is_none());

        pool.begin_frame(40);
        assert_eq!(pool.tick(30).map(|r| r.light_id), Some(1));
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.stats().evictions_this_frame, 1);

        pool.begin_frame(41);
        assert_eq!(pool.tick(30).map(|r| r.light_id), Some(2));
        pool.begin_frame(42);
        assert_eq!(pool.tick(30).map(|r| r.light_id), Some(3));
        assert!(pool.tick(30).is_none());
        assert_eq!(pool.packer().block_count(), 0);
    }

    #[test]
    fn test_tick_across_wraparound() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        pool.begin_frame(254);
        pool.allocate_or_reuse(&mut spot(1, 256, 5), &policy()).unwrap();

        // 254 -> 258 is 4 frames, not a negative age
        pool.begin_frame(258);
        assert!(pool.tick(3).is_some());
    }

    #[test]
    fn test_freed_record_slot_reused() {
        let mut pool = ShadowPoolAllocator::new(&config(4096));
        pool.begin_frame(1);
        pool.allocate_or_reuse(&mut spot(1, 256, 5), &policy()).unwrap();
        pool.begin_frame(50);
        pool.tick(30);
        pool.allocate_or_reuse(&mut spot(2, 256, 5), &policy()).unwrap();
        assert_eq!(pool.records().len(), 1);
        assert_eq!(pool.records()[0].light_id, 2);
    }

    #[test]
    fn test_resize_and_clear_flag() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        assert!(pool.take_clear_flag());
        assert!(!pool.take_clear_flag());

        pool.begin_frame(1);
        pool.allocate_or_reuse(&mut spot(1, 256, 5), &policy()).unwrap();
        assert!(!pool.update_atlas_size(2048));
        assert!(pool.update_atlas_size(4096));
        assert_eq!(pool.live_count(), 0);
        assert!(pool.take_clear_flag());

        pool.allocate_or_reuse(&mut spot(1, 256, 5), &policy()).unwrap();
        pool.clear();
        assert_eq!(pool.packer().block_count(), 0);
        assert!(pool.take_clear_flag());
    }

    #[test]
    fn test_light_without_frustum_is_noop() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        let mut light = Light::point(1, Vec3::ZERO, 1.0, Vec3::ONE);
        let outcome = pool.allocate_or_reuse(&mut light, &policy()).unwrap();
        assert_eq!(outcome, PackOutcome::default());
        assert!(pool.records().is_empty());
    }

    #[test]
    fn test_state_save_restore() {
        let mut pool = ShadowPoolAllocator::new(&config(2048));
        pool.begin_frame(3);
        pool.allocate_or_reuse(&mut spot(1, 512, 5), &policy()).unwrap();
        let rect = pool.rect(1, 0).unwrap();

        let state = pool.save_state();
        let mut restored = ShadowPoolAllocator::new(&config(1024));
        restored.restore_state(state);

        assert_eq!(restored.atlas_size(), 2048);
        assert_eq!(restored.rect(1, 0), Some(rect));
        assert_eq!(restored.frame8(), 3);
    }
}
