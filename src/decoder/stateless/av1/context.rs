// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! State of the tile being decoded.

use anyhow::anyhow;

use crate::codec::av1::block::BlockSize;
use crate::codec::av1::block::MAX_MIB_MASK;
use crate::codec::av1::block::MAX_MIB_SIZE;
use crate::codec::av1::helpers::align_power_of_two;
use crate::codec::av1::parser::FrameHeaderObu;
use crate::codec::av1::parser::TileInfo;
use crate::codec::av1::parser::MAX_NUM_PLANES;
use crate::codec::av1::parser::REFS_PER_FRAME;
use crate::decoder::stateless::av1::refs::ActiveRef;
use crate::decoder::stateless::av1::restoration::RestorationUnitInfo;
use crate::decoder::stateless::av1::restoration::RestorationUnits;
use crate::decoder::stateless::av1::StatelessAV1DecoderBackend;
use crate::decoder::stateless::av1::SymbolReader;

/// Transform size context of a position with no decoded transform.
pub const TXFM_CONTEXT_RESET: u8 = 64;
/// Size of the coefficient scratch buffer, enough for a 64x64 transform.
pub const MAX_TX_SQUARE: usize = 64 * 64;

/// Position of a tile in the MI grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileBounds {
    pub mi_row_start: u32,
    pub mi_row_end: u32,
    pub mi_col_start: u32,
    pub mi_col_end: u32,
}

impl TileBounds {
    pub fn new(tile_info: &TileInfo, row: u32, col: u32) -> anyhow::Result<Self> {
        let range = |starts: &[u32], i: u32| -> Option<(u32, u32)> {
            Some((*starts.get(i as usize)?, *starts.get(i as usize + 1)?))
        };

        let (mi_row_start, mi_row_end) =
            range(&tile_info.mi_row_starts, row).ok_or(anyhow!("Invalid tile row {}", row))?;
        let (mi_col_start, mi_col_end) =
            range(&tile_info.mi_col_starts, col).ok_or(anyhow!("Invalid tile column {}", col))?;

        Ok(Self { mi_row_start, mi_row_end, mi_col_start, mi_col_end })
    }
}

/// What the transform size context needs from a neighboring block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeighborBlock {
    /// Inter or intra block copy.
    pub is_inter: bool,
    pub bsize: BlockSize,
}

/// Sets `len` entries of `v` from `start`, ignoring what falls outside.
pub(crate) fn fill<T: Copy>(v: &mut [T], start: usize, len: usize, value: T) {
    let end = start.saturating_add(len).min(v.len());
    if let Some(s) = v.get_mut(start..end) {
        s.fill(value);
    }
}

/// Contexts left by the blocks above and to the left of the block being
/// decoded. The above arrays cover the frame width, the left ones a
/// superblock height.
pub struct NeighborContext {
    pub above_partition: Vec<u8>,
    pub left_partition: [u8; MAX_MIB_SIZE],
    pub above_txfm: Vec<u8>,
    pub left_txfm: [u8; MAX_MIB_SIZE],
    /// Coefficient contexts, in 4x4 units of each plane.
    pub above_entropy: [Vec<u8>; MAX_NUM_PLANES],
    pub left_entropy: [[u8; MAX_MIB_SIZE]; MAX_NUM_PLANES],
    pub above_block: Vec<Option<NeighborBlock>>,
    pub left_block: [Option<NeighborBlock>; MAX_MIB_SIZE],
    sb_size_log2: u32,
    subsampling_x: bool,
}

/// Superblock size in MI units, log2, and the length of the above arrays.
fn context_dimensions(hdr: &FrameHeaderObu) -> (u32, usize) {
    let sb_size_log2 = if hdr.use_128x128_superblock { 5 } else { 4 };
    // One superblock of slack past the aligned width.
    let width = align_power_of_two(hdr.mi_cols, sb_size_log2) as usize + MAX_MIB_SIZE;

    (sb_size_log2, width)
}

impl NeighborContext {
    pub fn new(hdr: &FrameHeaderObu) -> Self {
        let (sb_size_log2, width) = context_dimensions(hdr);

        Self {
            above_partition: vec![0; width],
            left_partition: [0; MAX_MIB_SIZE],
            above_txfm: vec![TXFM_CONTEXT_RESET; width],
            left_txfm: [TXFM_CONTEXT_RESET; MAX_MIB_SIZE],
            above_entropy: [vec![0; width], vec![0; width], vec![0; width]],
            left_entropy: [[0; MAX_MIB_SIZE]; MAX_NUM_PLANES],
            above_block: vec![None; width],
            left_block: [None; MAX_MIB_SIZE],
            sb_size_log2,
            subsampling_x: hdr.subsampling_x,
        }
    }

    /// Whether the context fits frames with header `hdr`, so it can be kept
    /// from one frame to the next.
    pub fn matches(&self, hdr: &FrameHeaderObu) -> bool {
        let (sb_size_log2, width) = context_dimensions(hdr);
        sb_size_log2 == self.sb_size_log2
            && width == self.above_partition.len()
            && hdr.subsampling_x == self.subsampling_x
    }

    /// Resets the above contexts over the columns of a tile, rounded up to
    /// whole superblocks.
    pub fn zero_above(&mut self, bounds: &TileBounds) {
        let start = bounds.mi_col_start as usize;
        let width = align_power_of_two(
            bounds.mi_col_end.saturating_sub(bounds.mi_col_start),
            self.sb_size_log2,
        ) as usize;

        fill(&mut self.above_partition, start, width, 0);
        fill(&mut self.above_txfm, start, width, TXFM_CONTEXT_RESET);
        fill(&mut self.above_block, start, width, None);

        for (plane, ctx) in self.above_entropy.iter_mut().enumerate() {
            let ss_x = (plane > 0 && self.subsampling_x) as usize;
            fill(ctx, start >> ss_x, width >> ss_x, 0);
        }
    }

    /// Resets the left contexts at the start of a superblock row.
    pub fn zero_left(&mut self) {
        self.left_partition = [0; MAX_MIB_SIZE];
        self.left_txfm = [TXFM_CONTEXT_RESET; MAX_MIB_SIZE];
        self.left_entropy = [[0; MAX_MIB_SIZE]; MAX_NUM_PLANES];
        self.left_block = [None; MAX_MIB_SIZE];
    }

    /// Records the block at (`mi_row`, `mi_col`) as the neighbor of the
    /// blocks below and to its right.
    pub fn set_neighbor_block(&mut self, mi_row: u32, mi_col: u32, block: NeighborBlock) {
        fill(&mut self.above_block, mi_col as usize, block.bsize.mi_width() as usize, Some(block));
        fill(
            &mut self.left_block,
            mi_row as usize & MAX_MIB_MASK,
            block.bsize.mi_height() as usize,
            Some(block),
        );
    }
}

/// Decoding session of one tile. Borrows the parts of the frame state the
/// tile writes to, and owns its symbol reader and its copy of the entropy
/// context.
pub struct TileDecoder<'a, B: StatelessAV1DecoderBackend> {
    pub(super) backend: &'a mut B,
    pub(super) hdr: &'a FrameHeaderObu,
    pub(super) frame: &'a mut B::Frame,
    pub(super) refs: &'a [Option<ActiveRef<B::Frame>>; REFS_PER_FRAME],
    pub(super) restoration: &'a mut RestorationUnits,
    pub(super) neighbors: &'a mut NeighborContext,
    pub(super) reader: B::SymbolReader,
    pub(super) entropy: B::EntropyContext,
    pub(super) bounds: TileBounds,
    /// Last coefficients read per plane, the reference of the next unit.
    pub(super) lr_refs: [RestorationUnitInfo; MAX_NUM_PLANES],
    /// Dequantized coefficients of the transform block being decoded. Zeroed
    /// after each use.
    pub(super) dqcoeff: Vec<i32>,
    pub(super) corrupted: bool,
    pub(super) eob_total: u32,
}

impl<'a, B: StatelessAV1DecoderBackend> TileDecoder<'a, B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: &'a mut B,
        hdr: &'a FrameHeaderObu,
        frame: &'a mut B::Frame,
        refs: &'a [Option<ActiveRef<B::Frame>>; REFS_PER_FRAME],
        restoration: &'a mut RestorationUnits,
        neighbors: &'a mut NeighborContext,
        reader: B::SymbolReader,
        entropy: B::EntropyContext,
        bounds: TileBounds,
    ) -> Self {
        Self {
            backend,
            hdr,
            frame,
            refs,
            restoration,
            neighbors,
            reader,
            entropy,
            bounds,
            lr_refs: Default::default(),
            dqcoeff: vec![0; MAX_TX_SQUARE],
            corrupted: false,
            eob_total: 0,
        }
    }

    pub fn sb_size(&self) -> BlockSize {
        if self.hdr.use_128x128_superblock {
            BlockSize::Block128x128
        } else {
            BlockSize::Block64x64
        }
    }

    /// Decodes every superblock of the tile. Errors out at the end of the
    /// first superblock row during which the reader reported an error.
    pub fn decode_tile(&mut self) -> anyhow::Result<()> {
        self.neighbors.zero_above(&self.bounds);
        self.lr_refs = Default::default();

        let sb_size = self.sb_size();
        let step = sb_size.mi_width() as usize;
        let bounds = self.bounds;

        for mi_row in (bounds.mi_row_start..bounds.mi_row_end).step_by(step) {
            self.neighbors.zero_left();

            for mi_col in (bounds.mi_col_start..bounds.mi_col_end).step_by(step) {
                self.decode_partition(mi_row, mi_col, sb_size)?;
            }

            self.corrupted |= self.reader.has_error();
            if self.corrupted {
                return Err(anyhow!("Failed to decode tile data"));
            }
        }

        Ok(())
    }

    /// Number of coefficients decoded so far by the tile.
    pub fn eob_total(&self) -> u32 {
        self.eob_total
    }

    /// Ends the session, returning the reader and the adapted context.
    pub fn finish(self) -> (B::SymbolReader, B::EntropyContext) {
        (self.reader, self.entropy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(mi_cols: u32) -> FrameHeaderObu {
        FrameHeaderObu {
            mi_cols,
            mi_rows: 16,
            subsampling_x: true,
            subsampling_y: true,
            num_planes: 3,
            ..Default::default()
        }
    }

    #[test]
    fn tile_bounds() {
        let mut ti = TileInfo { tile_cols: 2, tile_rows: 1, ..Default::default() };
        ti.mi_col_starts[..3].copy_from_slice(&[0, 16, 20]);
        ti.mi_row_starts[..2].copy_from_slice(&[0, 16]);

        let b = TileBounds::new(&ti, 0, 1).unwrap();
        assert_eq!(
            b,
            TileBounds { mi_row_start: 0, mi_row_end: 16, mi_col_start: 16, mi_col_end: 20 }
        );
        assert!(TileBounds::new(&ti, 0, 64).is_err());
    }

    #[test]
    fn above_contexts_are_reset_over_the_tile() {
        let mut ctx = NeighborContext::new(&header(40));
        ctx.above_partition.fill(0xf);
        ctx.above_txfm.fill(8);
        ctx.above_entropy.iter_mut().for_each(|c| c.fill(3));

        // A 4 MI wide tile is reset over a whole 16 MI superblock.
        let bounds =
            TileBounds { mi_row_start: 0, mi_row_end: 16, mi_col_start: 16, mi_col_end: 20 };
        ctx.zero_above(&bounds);

        assert!(ctx.above_partition[..16].iter().all(|&c| c == 0xf));
        assert!(ctx.above_partition[16..32].iter().all(|&c| c == 0));
        assert!(ctx.above_partition[32..].iter().all(|&c| c == 0xf));
        assert!(ctx.above_txfm[16..32].iter().all(|&c| c == TXFM_CONTEXT_RESET));
        assert!(ctx.above_entropy[0][16..32].iter().all(|&c| c == 0));
        // Chroma contexts are subsampled.
        assert!(ctx.above_entropy[1][8..16].iter().all(|&c| c == 0));
        assert_eq!(ctx.above_entropy[1][16], 3);
    }

    #[test]
    fn reuse_across_frames() {
        let ctx = NeighborContext::new(&header(40));
        assert!(ctx.matches(&header(40)));
        // Same superblock aligned width.
        assert!(ctx.matches(&header(48)));
        assert!(!ctx.matches(&header(50)));
        assert!(!ctx.matches(&FrameHeaderObu { use_128x128_superblock: true, ..header(40) }));
        assert!(!ctx.matches(&FrameHeaderObu { subsampling_x: false, ..header(40) }));
    }

    #[test]
    fn neighbor_blocks() {
        let mut ctx = NeighborContext::new(&header(16));
        let block = NeighborBlock { is_inter: true, bsize: BlockSize::Block16x8 };
        ctx.set_neighbor_block(34, 4, block);

        assert_eq!(ctx.above_block[3], None);
        assert!(ctx.above_block[4..8].iter().all(|&b| b == Some(block)));
        assert_eq!(ctx.left_block[1], None);
        assert!(ctx.left_block[2..4].iter().all(|&b| b == Some(block)));

        ctx.zero_left();
        assert!(ctx.left_block.iter().all(Option::is_none));
        assert!(ctx.left_txfm.iter().all(|&c| c == TXFM_CONTEXT_RESET));
    }

    #[test]
    fn fill_is_clamped() {
        let mut v = [0u8; 4];
        fill(&mut v, 2, 10, 1);
        assert_eq!(v, [0, 0, 1, 1]);
        fill(&mut v, 6, 1, 2);
        assert_eq!(v, [0, 0, 1, 1]);
    }
}
