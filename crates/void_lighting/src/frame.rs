//! Double-Buffered Frame Tables
//!
//! Per-frame lighting data is indexed by a [`FrameKey`]: the buffer slot
//! being filled or processed, and the recursion level of nested renders
//! (reflections re-enter the pipeline one level deeper).
//!
//! A producer thread fills one slot while the render thread drains the
//! other. Each slot sits behind its own lock, so the two sides never contend
//! as long as they respect the handoff done by [`FrameBuffers::swap`].
//!
//! # Usage
//!
//! ```ignore
//! let buffers = FrameBuffers::<FrameData>::new();
//!
//! // Producer side
//! let key = FrameKey::new(buffers.fill_slot(), RecursionLevel::ROOT);
//! buffers.with(key, |data| data.lights.add(light, 1.0));
//!
//! // Frame boundary
//! buffers.swap();
//!
//! // Render side
//! let key = FrameKey::new(buffers.process_slot(), RecursionLevel::ROOT);
//! buffers.with(key, |data| engine.render(data, ...));
//! ```

use core::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::error::{LightingError, Result};

/// Number of buffer slots (fill + process)
pub const BUFFER_COUNT: usize = 2;

/// Maximum nesting depth of recursive renders
pub const MAX_RECURSION_LEVELS: usize = 2;

/// Which half of the double buffer a table belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferSlot {
    /// First slot
    A,
    /// Second slot
    B,
}

impl BufferSlot {
    /// Slot index
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    /// The other slot
    #[inline]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    const fn from_index(index: u8) -> Self {
        if index == 0 {
            Self::A
        } else {
            Self::B
        }
    }
}

/// Nesting depth of the current render
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecursionLevel(u8);

impl RecursionLevel {
    /// Main view
    pub const ROOT: Self = Self(0);

    /// Create a level, failing when it exceeds [`MAX_RECURSION_LEVELS`]
    pub fn new(level: usize) -> Result<Self> {
        if level < MAX_RECURSION_LEVELS {
            Ok(Self(level as u8))
        } else {
            Err(LightingError::RecursionLevelOutOfRange(level))
        }
    }

    /// Level index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The next nested level, if any
    pub fn deeper(self) -> Option<Self> {
        Self::new(self.index() + 1).ok()
    }
}

/// Key into a frame table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameKey {
    /// Buffer slot
    pub slot: BufferSlot,
    /// Recursion level
    pub level: RecursionLevel,
}

impl FrameKey {
    /// Create a key
    pub const fn new(slot: BufferSlot, level: RecursionLevel) -> Self {
        Self { slot, level }
    }
}

impl Default for FrameKey {
    fn default() -> Self {
        Self::new(BufferSlot::A, RecursionLevel::ROOT)
    }
}

/// Fixed-capacity table with one entry per (slot, level)
#[derive(Clone, Debug)]
pub struct FrameTable<T> {
    entries: [[T; MAX_RECURSION_LEVELS]; BUFFER_COUNT],
}

impl<T: Default> FrameTable<T> {
    /// Create a table of default entries
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| core::array::from_fn(|_| T::default())),
        }
    }
}

impl<T: Default> Default for FrameTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameTable<T> {
    /// Entry for a key
    #[inline]
    pub fn get(&self, key: FrameKey) -> &T {
        &self.entries[key.slot.index()][key.level.index()]
    }

    /// Mutable entry for a key
    #[inline]
    pub fn get_mut(&mut self, key: FrameKey) -> &mut T {
        &mut self.entries[key.slot.index()][key.level.index()]
    }

    /// All entries of a slot
    pub fn slot_mut(&mut self, slot: BufferSlot) -> &mut [T; MAX_RECURSION_LEVELS] {
        &mut self.entries[slot.index()]
    }

    /// Iterate every entry
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().flat_map(|levels| levels.iter_mut())
    }
}

/// Double-buffered per-slot tables shared between producer and renderer
pub struct FrameBuffers<T> {
    slots: [Mutex<[T; MAX_RECURSION_LEVELS]>; BUFFER_COUNT],
    fill: AtomicU8,
}

impl<T: Default> FrameBuffers<T> {
    /// Create empty buffers, filling slot A first
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| {
                Mutex::new(core::array::from_fn(|_| T::default()))
            }),
            fill: AtomicU8::new(0),
        }
    }
}

impl<T: Default> Default for FrameBuffers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameBuffers<T> {
    /// Slot currently filled by the producer
    pub fn fill_slot(&self) -> BufferSlot {
        BufferSlot::from_index(self.fill.load(Ordering::Acquire))
    }

    /// Slot currently consumed by the renderer
    pub fn process_slot(&self) -> BufferSlot {
        self.fill_slot().other()
    }

    /// Flip fill and process roles at the frame boundary
    pub fn swap(&self) {
        self.fill.fetch_xor(1, Ordering::AcqRel);
    }

    /// Lock every level of a slot
    pub fn lock(&self, slot: BufferSlot) -> MutexGuard<'_, [T; MAX_RECURSION_LEVELS]> {
        self.slots[slot.index()].lock()
    }

    /// Run a closure on the entry for a key
    pub fn with<R>(&self, key: FrameKey, f: impl FnOnce(&mut T) -> R) -> R {
        let mut levels = self.lock(key.slot);
        f(&mut levels[key.level.index()])
    }

    /// Run a closure on every entry of every slot
    pub fn for_each(&self, mut f: impl FnMut(&mut T)) {
        for slot in &self.slots {
            for entry in slot.lock().iter_mut() {
                f(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_recursion_level_bounds() {
        assert!(RecursionLevel::new(0).is_ok());
        assert!(RecursionLevel::new(MAX_RECURSION_LEVELS - 1).is_ok());
        assert!(matches!(
            RecursionLevel::new(MAX_RECURSION_LEVELS),
            Err(LightingError::RecursionLevelOutOfRange(_))
        ));
        assert_eq!(RecursionLevel::ROOT.deeper().map(|l| l.index()), Some(1));
    }

    #[test]
    fn test_table_keys_are_independent() {
        let mut table = FrameTable::<u32>::new();
        let a = FrameKey::new(BufferSlot::A, RecursionLevel::ROOT);
        let b = FrameKey::new(BufferSlot::B, RecursionLevel::ROOT);
        let nested = FrameKey::new(BufferSlot::A, RecursionLevel::new(1).unwrap());

        *table.get_mut(a) = 1;
        *table.get_mut(b) = 2;
        *table.get_mut(nested) = 3;

        assert_eq!(*table.get(a), 1);
        assert_eq!(*table.get(b), 2);
        assert_eq!(*table.get(nested), 3);
        assert_eq!(table.iter_mut().count(), BUFFER_COUNT * MAX_RECURSION_LEVELS);
    }

    #[test]
    fn test_swap_flips_roles() {
        let buffers = FrameBuffers::<Vec<u32>>::new();
        assert_eq!(buffers.fill_slot(), BufferSlot::A);
        assert_eq!(buffers.process_slot(), BufferSlot::B);

        buffers.swap();
        assert_eq!(buffers.fill_slot(), BufferSlot::B);
        assert_eq!(buffers.process_slot(), BufferSlot::A);
    }

    #[test]
    fn test_producer_fills_while_renderer_drains() {
        let buffers = Arc::new(FrameBuffers::<Vec<u32>>::new());
        let root = RecursionLevel::ROOT;

        let producer = {
            let buffers = Arc::clone(&buffers);
            std::thread::spawn(move || {
                let key = FrameKey::new(buffers.fill_slot(), root);
                for i in 0..16 {
                    buffers.with(key, |v| v.push(i));
                }
            })
        };
        producer.join().unwrap();

        buffers.swap();
        let key = FrameKey::new(buffers.process_slot(), root);
        let drained = buffers.with(key, |v| core::mem::take(v));
        assert_eq!(drained.len(), 16);
        assert!(buffers.with(key, |v| v.is_empty()));
    }
}
