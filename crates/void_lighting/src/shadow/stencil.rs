//! Running stencil reference allocation for light masks.
//!
//! Every stencil-culled light draw marks its footprint with a reference value
//! no other light used since the last stencil clear. The counter only grows
//! during a frame; when it would exceed [`STENCIL_MAX_REF`] the caller must
//! clear the stencil buffer and numbering restarts near the bottom.

use serde::{Deserialize, Serialize};

/// Largest representable stencil reference
pub const STENCIL_MAX_REF: u32 = 0xFF;

/// Stencil bit reserved by the renderer
pub const STENCIL_RESERVED_BIT: u32 = 0x80;

/// Stencil bit set on pixels inside any clip volume
pub const STENCIL_INSIDE_CLIP_VOLUME_BIT: u32 = 0x40;

/// Outcome of advancing the counter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StencilStep {
    /// Reference to test/write
    pub reference: u8,
    /// Stencil buffer must be cleared before this reference is used
    pub needs_clear: bool,
}

/// Monotonic stencil reference range with wrap-and-clear
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StencilRefAllocator {
    current: u32,
    clears: u32,
}

impl StencilRefAllocator {
    /// Start from reference 1; 0 stays reserved for untouched pixels
    pub fn new() -> Self {
        Self { current: 1, clears: 0 }
    }

    /// Restart the range at `reference`
    pub fn reset(&mut self, reference: u32) {
        self.current = reference.min(STENCIL_MAX_REF);
    }

    /// Current counter value
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Stencil clears requested since creation
    pub fn clears(&self) -> u32 {
        self.clears
    }

    /// Reserve `sides + 2` references for a shadowed light's faces
    ///
    /// Returns true when the range wrapped and the stencil buffer has to be
    /// cleared before the first face is drawn. Faces then take references
    /// downwards from the top of the reservation via [`Self::next_face_ref`].
    pub fn begin_light(&mut self, sides: u32) -> bool {
        self.current += sides + 2;
        if self.current > STENCIL_MAX_REF {
            self.current = sides + 1;
            self.clears += 1;
            log::trace!("Stencil reference range wrapped ({} faces)", sides);
            return true;
        }
        false
    }

    /// Reference for the next face of the light begun last
    pub fn next_face_ref(&mut self) -> u8 {
        self.current = self.current.saturating_sub(1).max(1);
        self.current as u8
    }

    /// Restore the counter to the top of the light's reservation
    pub fn end_light(&mut self, sides: u32) {
        self.current = (self.current + sides).min(STENCIL_MAX_REF);
    }

    /// Reference for a single stencil-culled volume (unshadowed light prepass)
    pub fn next_volume_ref(&mut self) -> StencilStep {
        self.current += 1;
        let needs_clear = self.current > STENCIL_MAX_REF;
        if needs_clear {
            self.current = 2;
            self.clears += 1;
        }
        StencilStep {
            reference: self.current as u8,
            needs_clear,
        }
    }
}

/// Stencil value written for a clip volume
///
/// Ids are stored inverted so they never collide with the reserved bits.
pub fn clip_volume_stencil_value(stencil_ref: u8) -> u8 {
    let reserved = STENCIL_RESERVED_BIT | STENCIL_INSIDE_CLIP_VOLUME_BIT;
    (!(stencil_ref as u32 + 1) & !reserved & STENCIL_MAX_REF) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_refs_unique_per_light() {
        let mut stencil = StencilRefAllocator::new();

        assert!(!stencil.begin_light(6));
        let first: Vec<u8> = (0..6).map(|_| stencil.next_face_ref()).collect();
        stencil.end_light(6);
        assert_eq!(first, vec![8, 7, 6, 5, 4, 3]);
        assert_eq!(stencil.current(), 9);

        assert!(!stencil.begin_light(1));
        assert_eq!(stencil.next_face_ref(), 11);
        stencil.end_light(1);
        assert_eq!(stencil.current(), 12);
    }

    #[test]
    fn test_wrap_restarts_at_one() {
        let mut stencil = StencilRefAllocator::new();
        stencil.reset(250);

        assert!(stencil.begin_light(6));
        assert_eq!(stencil.clears(), 1);
        let refs: Vec<u8> = (0..6).map(|_| stencil.next_face_ref()).collect();
        assert_eq!(refs, vec![6, 5, 4, 3, 2, 1]);
        stencil.end_light(6);
        assert_eq!(stencil.current(), 7);
    }

    #[test]
    fn test_volume_ref_wraps_to_two() {
        let mut stencil = StencilRefAllocator::new();
        stencil.reset(254);
        assert_eq!(stencil.next_volume_ref(), StencilStep { reference: 255, needs_clear: false });
        assert_eq!(stencil.next_volume_ref(), StencilStep { reference: 2, needs_clear: true });
    }

    #[test]
    fn test_clip_volume_value_avoids_reserved_bits() {
        for id in 1..63u8 {
            let value = clip_volume_stencil_value(id) as u32;
            assert_eq!(value & (STENCIL_RESERVED_BIT | STENCIL_INSIDE_CLIP_VOLUME_BIT), 0);
        }
        assert_eq!(clip_volume_stencil_value(1), 0x3D);
    }
}
