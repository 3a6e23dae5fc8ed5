// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Block and transform size tables shared by the partition walker and the
//! block decoder.

use enumn::N;

/// Size of a mode info unit, in pixels.
pub const MI_SIZE: u32 = 4;
/// Largest superblock size, in MI units.
pub const MAX_MIB_SIZE: usize = 32;
pub const MAX_MIB_MASK: usize = MAX_MIB_SIZE - 1;
/// Transform splits below a block's largest transform stop at this depth.
pub const MAX_VARTX_DEPTH: u32 = 2;
/// Depth of the transform size symbol for intra blocks.
pub const MAX_TX_DEPTH: u32 = 2;

/// Block sizes, in the order used to index the probability tables.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockSize {
    #[default]
    Block4x4 = 0,
    Block4x8 = 1,
    Block8x4 = 2,
    Block8x8 = 3,
    Block8x16 = 4,
    Block16x8 = 5,
    Block16x16 = 6,
    Block16x32 = 7,
    Block32x16 = 8,
    Block32x32 = 9,
    Block32x64 = 10,
    Block64x32 = 11,
    Block64x64 = 12,
    Block64x128 = 13,
    Block128x64 = 14,
    Block128x128 = 15,
    Block4x16 = 16,
    Block16x4 = 17,
    Block8x32 = 18,
    Block32x8 = 19,
    Block16x64 = 20,
    Block64x16 = 21,
}

const MI_WIDTH: [u32; 22] =
    [1, 1, 2, 2, 2, 4, 4, 4, 8, 8, 8, 16, 16, 16, 32, 32, 1, 4, 2, 8, 4, 16];
const MI_HEIGHT: [u32; 22] =
    [1, 2, 1, 2, 4, 2, 4, 8, 4, 8, 16, 8, 16, 32, 16, 32, 4, 1, 8, 2, 16, 4];

/// Partition context bits left by a block of each size, as (above, left).
/// A set bit at position `bsl` means the neighbor is smaller than the
/// square block of that level.
const PARTITION_CONTEXT_LOOKUP: [(u8, u8); 22] = [
    (31, 31),
    (31, 30),
    (30, 31),
    (30, 30),
    (30, 28),
    (28, 30),
    (28, 28),
    (28, 24),
    (24, 28),
    (24, 24),
    (24, 16),
    (16, 24),
    (16, 16),
    (16, 0),
    (0, 16),
    (0, 0),
    (31, 28),
    (28, 31),
    (30, 24),
    (24, 30),
    (28, 16),
    (16, 28),
];

impl BlockSize {
    /// Returns the block size with the given dimensions in pixels, if it
    /// exists.
    pub fn from_dimensions(width: u32, height: u32) -> Option<Self> {
        let bsize = match (width, height) {
            (4, 4) => Self::Block4x4,
            (4, 8) => Self::Block4x8,
            (8, 4) => Self::Block8x4,
            (8, 8) => Self::Block8x8,
            (8, 16) => Self::Block8x16,
            (16, 8) => Self::Block16x8,
            (16, 16) => Self::Block16x16,
            (16, 32) => Self::Block16x32,
            (32, 16) => Self::Block32x16,
            (32, 32) => Self::Block32x32,
            (32, 64) => Self::Block32x64,
            (64, 32) => Self::Block64x32,
            (64, 64) => Self::Block64x64,
            (64, 128) => Self::Block64x128,
            (128, 64) => Self::Block128x64,
            (128, 128) => Self::Block128x128,
            (4, 16) => Self::Block4x16,
            (16, 4) => Self::Block16x4,
            (8, 32) => Self::Block8x32,
            (32, 8) => Self::Block32x8,
            (16, 64) => Self::Block16x64,
            (64, 16) => Self::Block64x16,
            _ => return None,
        };

        Some(bsize)
    }

    /// Width in MI units.
    pub fn mi_width(self) -> u32 {
        MI_WIDTH[self as usize]
    }

    /// Height in MI units.
    pub fn mi_height(self) -> u32 {
        MI_HEIGHT[self as usize]
    }

    pub fn width(self) -> u32 {
        self.mi_width() * MI_SIZE
    }

    pub fn height(self) -> u32 {
        self.mi_height() * MI_SIZE
    }

    /// Returns the size of the children of a square block split with
    /// `partition`, or `None` if that partition cannot apply to this size.
    pub fn subsize(self, partition: Partition) -> Option<Self> {
        let (w, h) = (self.width(), self.height());
        if w != h {
            return None;
        }

        let (sub_w, sub_h) = match partition {
            Partition::None => (w, h),
            Partition::Horz | Partition::HorzA | Partition::HorzB => (w, h / 2),
            Partition::Vert | Partition::VertA | Partition::VertB => (w / 2, h),
            Partition::Split => (w / 2, h / 2),
            Partition::Horz4 => (w, h / 4),
            Partition::Vert4 => (w / 4, h),
        };

        // The extended partitions need at least a 16x16 block.
        if matches!(
            partition,
            Partition::HorzA | Partition::HorzB | Partition::VertA | Partition::VertB
        ) && w < 16
        {
            return None;
        }

        Self::from_dimensions(sub_w, sub_h)
    }

    /// Returns the size of the block covering the same area in a plane
    /// subsampled by `ss_x` and `ss_y`, or `None` if the subsampling cannot
    /// represent it.
    pub fn plane_block_size(self, ss_x: bool, ss_y: bool) -> Option<Self> {
        let (w, h) = (self.width(), self.height());
        if (ss_x && !ss_y && h > w) || (!ss_x && ss_y && w > h) {
            return None;
        }

        Self::from_dimensions((w >> ss_x as u32).max(4), (h >> ss_y as u32).max(4))
    }

    /// Grows 4 pixel dimensions to 8 along the subsampled axes, so that a
    /// chroma block covers its whole luma area.
    pub fn scale_chroma(self, ss_x: bool, ss_y: bool) -> Self {
        let w = if self.width() == 4 && ss_x { 8 } else { self.width() };
        let h = if self.height() == 4 && ss_y { 8 } else { self.height() };

        Self::from_dimensions(w, h).unwrap_or(self)
    }

    /// Largest transform fitting in the block.
    pub fn max_rect_tx_size(self) -> TxSize {
        TxSize::from_dimensions(self.width().min(64), self.height().min(64))
            .unwrap_or(TxSize::Tx4x4)
    }

    /// Whether the transform size is coded for blocks of this size.
    pub fn signals_tx_size(self) -> bool {
        self > Self::Block4x4
    }

    /// Number of transform size reductions from the largest transform down to
    /// 4x4, minus one. Selects the transform size probabilities.
    pub fn tx_size_category(self) -> usize {
        (self.max_rect_tx_size().depth_to_4x4() as usize).saturating_sub(1)
    }

    /// Number of reductions the transform size symbol can code.
    pub fn max_tx_depth(self) -> u32 {
        self.max_rect_tx_size().depth_to_4x4().min(MAX_TX_DEPTH)
    }

    /// Transform size obtained by reducing the largest transform `depth`
    /// times.
    pub fn depth_to_tx_size(self, depth: u32) -> TxSize {
        (0..depth).fold(self.max_rect_tx_size(), |tx, _| tx.sub_size())
    }

    /// Context bits written to the above and left partition contexts by a
    /// block of this size.
    pub fn partition_context(self) -> (u8, u8) {
        PARTITION_CONTEXT_LOOKUP[self as usize]
    }
}

/// Ways of splitting a square block.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Partition {
    #[default]
    None = 0,
    Horz = 1,
    Vert = 2,
    Split = 3,
    HorzA = 4,
    HorzB = 5,
    VertA = 6,
    VertB = 7,
    Horz4 = 8,
    Vert4 = 9,
}

/// Transform sizes, in the order used to index the probability tables.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxSize {
    #[default]
    Tx4x4 = 0,
    Tx8x8 = 1,
    Tx16x16 = 2,
    Tx32x32 = 3,
    Tx64x64 = 4,
    Tx4x8 = 5,
    Tx8x4 = 6,
    Tx8x16 = 7,
    Tx16x8 = 8,
    Tx16x32 = 9,
    Tx32x16 = 10,
    Tx32x64 = 11,
    Tx64x32 = 12,
    Tx4x16 = 13,
    Tx16x4 = 14,
    Tx8x32 = 15,
    Tx32x8 = 16,
    Tx16x64 = 17,
    Tx64x16 = 18,
}

const TX_WIDTH: [u32; 19] = [4, 8, 16, 32, 64, 4, 8, 8, 16, 16, 32, 32, 64, 4, 16, 8, 32, 16, 64];
const TX_HEIGHT: [u32; 19] = [4, 8, 16, 32, 64, 8, 4, 16, 8, 32, 16, 64, 32, 16, 4, 32, 8, 64, 16];

impl TxSize {
    pub fn from_dimensions(width: u32, height: u32) -> Option<Self> {
        let tx = match (width, height) {
            (4, 4) => Self::Tx4x4,
            (8, 8) => Self::Tx8x8,
            (16, 16) => Self::Tx16x16,
            (32, 32) => Self::Tx32x32,
            (64, 64) => Self::Tx64x64,
            (4, 8) => Self::Tx4x8,
            (8, 4) => Self::Tx8x4,
            (8, 16) => Self::Tx8x16,
            (16, 8) => Self::Tx16x8,
            (16, 32) => Self::Tx16x32,
            (32, 16) => Self::Tx32x16,
            (32, 64) => Self::Tx32x64,
            (64, 32) => Self::Tx64x32,
            (4, 16) => Self::Tx4x16,
            (16, 4) => Self::Tx16x4,
            (8, 32) => Self::Tx8x32,
            (32, 8) => Self::Tx32x8,
            (16, 64) => Self::Tx16x64,
            (64, 16) => Self::Tx64x16,
            _ => return None,
        };

        Some(tx)
    }

    pub fn width(self) -> u32 {
        TX_WIDTH[self as usize]
    }

    pub fn height(self) -> u32 {
        TX_HEIGHT[self as usize]
    }

    /// Width in 4x4 units.
    pub fn width_units(self) -> u32 {
        self.width() / MI_SIZE
    }

    /// Height in 4x4 units.
    pub fn height_units(self) -> u32 {
        self.height() / MI_SIZE
    }

    /// The next smaller transform used when splitting. Square sizes halve in
    /// both directions, 2:1 sizes become square and 4:1 sizes become 2:1.
    pub fn sub_size(self) -> Self {
        let (w, h) = (self.width(), self.height());
        let (sub_w, sub_h) = if w == h {
            (w / 2, h / 2)
        } else if w == 2 * h || h == 2 * w {
            (w.min(h), w.min(h))
        } else if w > h {
            (w / 2, h)
        } else {
            (w, h / 2)
        };

        Self::from_dimensions(sub_w.max(4), sub_h.max(4)).unwrap_or(Self::Tx4x4)
    }

    /// Square transform of the smaller dimension.
    pub fn sqr(self) -> Self {
        let side = self.width().min(self.height());
        Self::from_dimensions(side, side).unwrap_or(Self::Tx4x4)
    }

    /// Square transform of the larger dimension.
    pub fn sqr_up(self) -> Self {
        let side = self.width().max(self.height());
        Self::from_dimensions(side, side).unwrap_or(Self::Tx64x64)
    }

    /// Chroma transforms are limited to 32 pixels along each 64 pixel
    /// dimension.
    pub fn adjusted(self) -> Self {
        match self {
            Self::Tx64x64 | Self::Tx32x64 | Self::Tx64x32 => Self::Tx32x32,
            Self::Tx16x64 => Self::Tx16x32,
            Self::Tx64x16 => Self::Tx32x16,
            other => other,
        }
    }

    /// Number of `sub_size` steps needed to reach 4x4.
    pub fn depth_to_4x4(self) -> u32 {
        let mut tx = self;
        let mut depth = 0;
        while tx != Self::Tx4x4 {
            tx = tx.sub_size();
            depth += 1;
        }

        depth
    }
}

/// Whether a block carries the chroma information of its area. Blocks
/// narrower than a chroma sample only do so at odd positions, where they
/// cover the pair they complete.
pub fn is_chroma_reference(
    mi_row: u32,
    mi_col: u32,
    bsize: BlockSize,
    ss_x: bool,
    ss_y: bool,
) -> bool {
    let bw = bsize.mi_width();
    let bh = bsize.mi_height();

    ((mi_row & 1) != 0 || (bh & 1) == 0 || !ss_y) && ((mi_col & 1) != 0 || (bw & 1) == 0 || !ss_x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_dimensions() {
        for i in 0..22 {
            let bsize = BlockSize::n(i).unwrap();
            assert_eq!(BlockSize::from_dimensions(bsize.width(), bsize.height()), Some(bsize));
        }
        assert_eq!(BlockSize::Block64x16.mi_width(), 16);
        assert_eq!(BlockSize::Block64x16.mi_height(), 4);
        assert_eq!(BlockSize::from_dimensions(128, 32), None);
    }

    #[test]
    fn partition_subsizes() {
        use BlockSize::*;

        assert_eq!(Block64x64.subsize(Partition::Horz), Some(Block64x32));
        assert_eq!(Block64x64.subsize(Partition::VertA), Some(Block32x64));
        assert_eq!(Block64x64.subsize(Partition::Split), Some(Block32x32));
        assert_eq!(Block64x64.subsize(Partition::Horz4), Some(Block64x16));
        assert_eq!(Block32x32.subsize(Partition::Vert4), Some(Block8x32));
        assert_eq!(Block8x8.subsize(Partition::Split), Some(Block4x4));
        assert_eq!(Block8x8.subsize(Partition::HorzA), None);
        assert_eq!(Block128x128.subsize(Partition::Vert4), None);
        assert_eq!(Block8x8.subsize(Partition::Vert4), None);
        assert_eq!(Block16x8.subsize(Partition::Split), None);
    }

    #[test]
    fn plane_sizes() {
        use BlockSize::*;

        assert_eq!(Block4x4.plane_block_size(true, true), Some(Block4x4));
        assert_eq!(Block4x16.plane_block_size(true, true), Some(Block4x8));
        assert_eq!(Block16x16.plane_block_size(true, false), Some(Block8x16));
        assert_eq!(Block8x16.plane_block_size(true, false), None);
        assert_eq!(Block16x8.plane_block_size(false, true), None);
        assert_eq!(Block8x8.plane_block_size(false, true), Some(Block8x4));
        assert_eq!(Block128x128.plane_block_size(false, false), Some(Block128x128));

        assert_eq!(Block4x4.scale_chroma(true, true), Block8x8);
        assert_eq!(Block4x8.scale_chroma(true, false), Block8x8);
        assert_eq!(Block16x4.scale_chroma(true, true), Block16x8);
        assert_eq!(Block4x16.scale_chroma(false, true), Block4x16);
    }

    #[test]
    fn transform_sizes() {
        use TxSize::*;

        assert_eq!(BlockSize::Block128x64.max_rect_tx_size(), Tx64x64);
        assert_eq!(BlockSize::Block16x64.max_rect_tx_size(), Tx16x64);
        assert_eq!(Tx64x64.sub_size(), Tx32x32);
        assert_eq!(Tx16x32.sub_size(), Tx16x16);
        assert_eq!(Tx4x16.sub_size(), Tx4x8);
        assert_eq!(Tx64x16.sub_size(), Tx32x16);
        assert_eq!(Tx4x8.sub_size(), Tx4x4);
        assert_eq!(Tx4x4.sub_size(), Tx4x4);
        assert_eq!(Tx16x64.adjusted(), Tx16x32);
        assert_eq!(Tx8x32.sqr_up(), Tx32x32);
        assert_eq!(Tx8x32.sqr(), Tx8x8);

        assert_eq!(BlockSize::Block64x64.tx_size_category(), 3);
        assert_eq!(BlockSize::Block8x8.tx_size_category(), 0);
        assert_eq!(BlockSize::Block16x8.tx_size_category(), 1);
        assert_eq!(BlockSize::Block4x8.tx_size_category(), 0);
        assert_eq!(BlockSize::Block8x8.max_tx_depth(), 1);
        assert_eq!(BlockSize::Block32x32.max_tx_depth(), 2);
        assert_eq!(BlockSize::Block32x32.depth_to_tx_size(2), Tx8x8);
        assert!(!BlockSize::Block4x4.signals_tx_size());
        assert!(BlockSize::Block4x16.signals_tx_size());
    }

    #[test]
    fn chroma_reference() {
        // A 4x4 block only carries chroma at odd positions in 4:2:0.
        assert!(!is_chroma_reference(0, 0, BlockSize::Block4x4, true, true));
        assert!(!is_chroma_reference(1, 0, BlockSize::Block4x4, true, true));
        assert!(is_chroma_reference(1, 1, BlockSize::Block4x4, true, true));
        assert!(is_chroma_reference(0, 0, BlockSize::Block4x4, false, false));
        assert!(is_chroma_reference(0, 0, BlockSize::Block8x8, true, true));
    }
}
