//! Shadow Atlas Packer
//!
//! Best-fit packer over a fixed-size square atlas. The used space is tracked
//! as a run-length table of horizontal bands sorted by Y: each run stores
//! the rightmost occupied X of its band and the band height, packed into one
//! `u32` (width in the low half, height in the high half).
//!
//! A new rectangle is tried at the top of every run. Its X is the largest
//! run width among the bands it would cover; the placement wasting the least
//! area to the left of it wins, first found on ties. Every rectangle is
//! padded by a border on each side so filtering never reads a neighbour.
//!
//! Removing a block rebuilds the run table from the live blocks, which keeps
//! the table a conservative bound of the occupied space.

use serde::{Deserialize, Serialize};

/// Handle of a packed block
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Rectangle in atlas texels
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackRect {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl PackRect {
    /// Create a rectangle
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Right edge (exclusive)
    #[inline]
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive)
    #[inline]
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Area in texels
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether two rectangles share any texel
    pub fn overlaps(&self, other: &PackRect) -> bool {
        self.x < other.right() && other.x < self.right() && self.y < other.bottom() && other.y < self.bottom()
    }

    /// Grow by `border` on every side
    pub fn inflate(&self, border: u32) -> Self {
        Self::new(
            self.x.saturating_sub(border),
            self.y.saturating_sub(border),
            self.width + 2 * border,
            self.height + 2 * border,
        )
    }
}

#[inline]
fn run(width: u32, height: u32) -> u32 {
    (width & 0xFFFF) | (height << 16)
}

#[inline]
fn run_width(run: u32) -> u32 {
    run & 0xFFFF
}

#[inline]
fn run_height(run: u32) -> u32 {
    run >> 16
}

/// Best-fit packer with a bordered block table
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AtlasPacker {
    size: u32,
    border: u32,
    #[serde(skip)]
    runs: Vec<u32>,
    blocks: Vec<Option<PackRect>>,
}

impl AtlasPacker {
    /// Create an empty packer for a `size` x `size` atlas
    pub fn new(size: u32, border: u32) -> Self {
        Self {
            size: size.min(0xFFFF),
            border,
            runs: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Atlas dimension in texels
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Border added on every side of a block
    pub fn border(&self) -> u32 {
        self.border
    }

    /// Pack a `width` x `height` rectangle, returning its block and the
    /// unpadded rectangle
    pub fn add_block(&mut self, width: u32, height: u32) -> Option<(BlockId, PackRect)> {
        let padded_w = width + 2 * self.border;
        let padded_h = height + 2 * self.border;
        if width == 0 || height == 0 || padded_w > self.size || padded_h > self.size {
            return None;
        }

        let (x, y, first_run) = self.best_fit(padded_w, padded_h)?;
        self.insert_run(first_run, y, padded_h, x + padded_w);

        let padded = PackRect::new(x, y, padded_w, padded_h);
        let id = match self.blocks.iter().position(Option::is_none) {
            Some(free) => {
                self.blocks[free] = Some(padded);
                free
            }
            None => {
                self.blocks.push(Some(padded));
                self.blocks.len() - 1
            }
        };

        let inner = PackRect::new(x + self.border, y + self.border, width, height);
        Some((BlockId(id as u32), inner))
    }

    fn best_fit(&self, w: u32, h: u32) -> Option<(u32, u32, usize)> {
        let mut best: Option<(u32, u32, usize, u64)> = None;
        let mut y = 0u32;

        for i in 0..=self.runs.len() {
            if y + h > self.size {
                break;
            }

            let bottom = y + h;
            let mut x = 0;
            let mut cy = y;
            for &r in self.runs[i..].iter() {
                if cy >= bottom {
                    break;
                }
                x = x.max(run_width(r));
                cy += run_height(r);
            }

            if x + w <= self.size {
                let mut waste = 0u64;
                let mut cy = y;
                for &r in self.runs[i..].iter() {
                    if cy >= bottom {
                        break;
                    }
                    let overlap = run_height(r).min(bottom - cy);
                    waste += (x - run_width(r)) as u64 * overlap as u64;
                    cy += run_height(r);
                }
                if cy < bottom {
                    waste += (bottom - cy) as u64 * x as u64;
                }

                if best.map_or(true, |(_, _, _, best_waste)| waste < best_waste) {
                    best = Some((x, y, i, waste));
                    if waste == 0 {
                        break;
                    }
                }
            }

            if let Some(&r) = self.runs.get(i) {
                y += run_height(r);
            }
        }

        best.map(|(x, y, i, _)| (x, y, i))
    }

    fn insert_run(&mut self, first: usize, y: u32, h: u32, right: u32) {
        let bottom = y + h;
        let mut cy = y;
        let mut end = first;
        while end < self.runs.len() && cy + run_height(self.runs[end]) <= bottom {
            cy += run_height(self.runs[end]);
            end += 1;
        }
        if end < self.runs.len() && cy < bottom {
            let r = self.runs[end];
            self.runs[end] = run(run_width(r), cy + run_height(r) - bottom);
        }

        self.runs.splice(first..end, core::iter::once(run(right, h)));
        self.merge_around(first);
    }

    fn merge_around(&mut self, index: usize) {
        let mut index = index;
        if index > 0 && run_width(self.runs[index - 1]) == run_width(self.runs[index]) {
            let merged = run(
                run_width(self.runs[index]),
                run_height(self.runs[index - 1]) + run_height(self.runs[index]),
            );
            self.runs[index - 1] = merged;
            self.runs.remove(index);
            index -= 1;
        }
        if index + 1 < self.runs.len() && run_width(self.runs[index + 1]) == run_width(self.runs[index]) {
            let merged = run(
                run_width(self.runs[index]),
                run_height(self.runs[index]) + run_height(self.runs[index + 1]),
            );
            self.runs[index] = merged;
            self.runs.remove(index + 1);
        }
    }

    /// Release a block; returns false if it was not live
    pub fn remove_block(&mut self, id: BlockId) -> bool {
        match self.blocks.get_mut(id.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                while matches!(self.blocks.last(), Some(None)) {
                    self.blocks.pop();
                }
                self.rebuild_runs();
                true
            }
            _ => false,
        }
    }

    /// Recompute the run table from the live blocks
    fn rebuild_runs(&mut self) {
        let mut edges: Vec<u32> = self
            .blocks
            .iter()
            .flatten()
            .flat_map(|b| [b.y, b.bottom()])
            .collect();
        edges.push(0);
        edges.sort_unstable();
        edges.dedup();

        self.runs.clear();
        for band in edges.windows(2) {
            let (top, bottom) = (band[0], band[1]);
            let right = self
                .blocks
                .iter()
                .flatten()
                .filter(|b| b.y < bottom && top < b.bottom())
                .map(|b| b.right())
                .max()
                .unwrap_or(0);
            match self.runs.last_mut() {
                Some(last) if run_width(*last) == right => {
                    *last = run(right, run_height(*last) + bottom - top);
                }
                _ => self.runs.push(run(right, bottom - top)),
            }
        }
        while matches!(self.runs.last(), Some(&r) if run_width(r) == 0) {
            self.runs.pop();
        }
    }

    /// Unpadded rectangle of a live block
    pub fn block(&self, id: BlockId) -> Option<PackRect> {
        self.blocks
            .get(id.0 as usize)
            .copied()
            .flatten()
            .map(|padded| {
                PackRect::new(
                    padded.x + self.border,
                    padded.y + self.border,
                    padded.width - 2 * self.border,
                    padded.height - 2 * self.border,
                )
            })
    }

    /// Whether a block id is live
    pub fn contains(&self, id: BlockId) -> bool {
        self.block(id).is_some()
    }

    /// Padded rectangles of every live block
    pub fn padded_blocks(&self) -> impl Iterator<Item = (BlockId, PackRect)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.map(|b| (BlockId(i as u32), b)))
    }

    /// Number of live blocks
    pub fn block_count(&self) -> usize {
        self.blocks.iter().flatten().count()
    }

    /// Padded area in use, in texels
    pub fn used_area(&self) -> u64 {
        self.blocks.iter().flatten().map(PackRect::area).sum()
    }

    /// Number of runs in the table
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Free every block
    pub fn clear(&mut self) {
        self.runs.clear();
        self.blocks.clear();
    }

    /// Change the atlas dimension, freeing every block
    pub fn resize(&mut self, size: u32) {
        self.size = size.min(0xFFFF);
        self.clear();
    }

    /// Rebuild derived data after deserialization
    pub fn restore(&mut self) {
        self.rebuild_runs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_disjoint(packer: &AtlasPacker) {
        let blocks: Vec<_> = packer.padded_blocks().map(|(_, b)| b).collect();
        for (i, a) in blocks.iter().enumerate() {
            assert!(a.right() <= packer.size() && a.bottom() <= packer.size());
            for b in &blocks[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_first_block_at_border() {
        let mut packer = AtlasPacker::new(1024, 2);
        let (id, rect) = packer.add_block(256, 256).unwrap();
        assert_eq!(id, BlockId(0));
        assert_eq!(rect, PackRect::new(2, 2, 256, 256));
        assert_eq!(packer.block(id), Some(rect));
    }

    #[test]
    fn test_row_fill_then_wrap() {
        let mut packer = AtlasPacker::new(1024, 2);
        let rects: Vec<_> = (0..4).map(|_| packer.add_block(240, 240).unwrap().1).collect();

        // Same band, left to right
        assert_eq!(rects[0].x, 2);
        assert_eq!(rects[1].x, 246);
        assert_eq!(rects[2].x, 490);
        assert_eq!(rects[3].x, 734);
        assert!(rects.iter().all(|r| r.y == 2));

        // Next one no longer fits to the right and starts a new band
        let (_, next) = packer.add_block(240, 240).unwrap();
        assert_eq!((next.x, next.y), (2, 246));
        assert_disjoint(&packer);
    }

    #[test]
    fn test_best_fit_prefers_less_waste() {
        let mut packer = AtlasPacker::new(512, 0);
        packer.add_block(300, 32).unwrap();

        // Beside the first block the band below it would be wasted; the
        // empty space under the first run wastes nothing
        let (_, rect) = packer.add_block(200, 64).unwrap();
        assert_eq!((rect.x, rect.y), (0, 32));

        // Zero-waste ties go to the first candidate
        let (_, rect) = packer.add_block(100, 32).unwrap();
        assert_eq!((rect.x, rect.y), (300, 0));
        assert_disjoint(&packer);
    }

    #[test]
    fn test_full_atlas_fails() {
        let mut packer = AtlasPacker::new(512, 2);
        assert!(packer.add_block(508, 508).is_some());
        assert!(packer.add_block(16, 16).is_none());
        // Padding counts against the atlas dimension
        let mut packer = AtlasPacker::new(512, 2);
        assert!(packer.add_block(512, 512).is_none());
    }

    #[test]
    fn test_remove_frees_space() {
        let mut packer = AtlasPacker::new(512, 2);
        let (a, _) = packer.add_block(252, 508).unwrap();
        let (b, _) = packer.add_block(252, 508).unwrap();
        assert!(packer.add_block(252, 508).is_none());

        assert!(packer.remove_block(b));
        assert!(!packer.remove_block(b));
        let (c, rect) = packer.add_block(252, 508).unwrap();
        assert_eq!(c, b);
        assert_eq!(rect.x, 258);
        assert!(packer.contains(a));
        assert_disjoint(&packer);
    }

    #[test]
    fn test_remove_middle_block_keeps_disjoint() {
        let mut packer = AtlasPacker::new(1024, 2);
        let ids: Vec<_> = (0..8).map(|_| packer.add_block(124, 124).unwrap().0).collect();
        packer.remove_block(ids[3]);
        packer.remove_block(ids[0]);
        for _ in 0..12 {
            packer.add_block(60, 60);
        }
        assert_disjoint(&packer);
    }

    #[test]
    fn test_many_mixed_sizes_stay_disjoint() {
        let mut packer = AtlasPacker::new(2048, 2);
        let sizes = [512u32, 256, 128, 1024, 64, 256, 128, 512, 32, 256];
        let mut live = Vec::new();
        for (i, &s) in sizes.iter().cycle().take(40).enumerate() {
            if let Some((id, _)) = packer.add_block(s, s) {
                live.push(id);
            }
            if i % 3 == 2 && !live.is_empty() {
                let id = live.remove(i % live.len());
                packer.remove_block(id);
            }
            assert_disjoint(&packer);
        }
        assert!(packer.used_area() <= 2048 * 2048);
    }

    #[test]
    fn test_clear_and_resize() {
        let mut packer = AtlasPacker::new(512, 2);
        packer.add_block(100, 100).unwrap();
        packer.resize(1024);
        assert_eq!(packer.block_count(), 0);
        assert_eq!(packer.run_count(), 0);
        assert_eq!(packer.size(), 1024);
        assert!(packer.add_block(1000, 1000).is_some());
    }

    #[test]
    fn test_restore_rebuilds_runs() {
        let mut packer = AtlasPacker::new(512, 2);
        packer.add_block(100, 100).unwrap();
        let json = serde_json::to_string(&packer).unwrap();

        let mut restored: AtlasPacker = serde_json::from_str(&json).unwrap();
        restored.restore();
        let (_, rect) = restored.add_block(100, 100).unwrap();
        assert_eq!((rect.x, rect.y), (106, 2));
    }
}
