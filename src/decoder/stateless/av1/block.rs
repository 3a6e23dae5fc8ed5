// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coding block decoding: transform size selection and reconstruction.

use anyhow::anyhow;

use crate::codec::av1::block::is_chroma_reference;
use crate::codec::av1::block::BlockSize;
use crate::codec::av1::block::Partition;
use crate::codec::av1::block::TxSize;
use crate::codec::av1::block::MAX_MIB_MASK;
use crate::codec::av1::block::MAX_VARTX_DEPTH;
use crate::codec::av1::block::MI_SIZE;
use crate::codec::av1::helpers::round2;
use crate::codec::av1::parser::ReferenceFrameType;
use crate::codec::av1::parser::TxMode;
use crate::codec::av1::parser::WarpModelType;
use crate::codec::av1::parser::MAX_NUM_PLANES;
use crate::decoder::stateless::av1::context::fill;
use crate::decoder::stateless::av1::context::NeighborBlock;
use crate::decoder::stateless::av1::context::TileDecoder;
use crate::decoder::stateless::av1::context::TXFM_CONTEXT_RESET;
use crate::decoder::stateless::av1::refs::ScaleFactors;
use crate::decoder::stateless::av1::EntropyContext;
use crate::decoder::stateless::av1::StatelessAV1DecoderBackend;
use crate::decoder::stateless::av1::SymbolReader;
use crate::decoder::Error;

/// Largest area reconstructed in one go, in 4x4 units.
const MAX_UNIT_MI: u32 = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MotionMode {
    #[default]
    Simple,
    Obmc,
    LocalWarp,
}

/// Mode info of a coding block. The backend fills the prediction related
/// fields when reading it, the transform sizes are filled by the decoder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeInfo {
    pub mi_row: u32,
    pub mi_col: u32,
    pub bsize: BlockSize,
    pub partition: Partition,
    pub skip: bool,
    pub is_inter: bool,
    pub use_intrabc: bool,
    pub segment_id: u8,
    /// `Intra` designates the frame being decoded, for intra block copy.
    pub ref_frame: [Option<ReferenceFrameType>; 2],
    pub motion_mode: MotionMode,
    /// Palette sizes for luma and chroma. Zero if no palette is used.
    pub palette_size: [u8; 2],
    /// Chroma is predicted from luma.
    pub uv_cfl: bool,
    pub tx_size: TxSize,
    /// Transform size of each 4x4 unit of an inter block, in raster order.
    pub inter_tx_size: Vec<TxSize>,
}

impl ModeInfo {
    /// Whether the block is predicted from a frame, including intra block
    /// copy from the current one.
    pub fn is_inter_block(&self) -> bool {
        self.is_inter || self.use_intrabc
    }

    fn inter_tx_size_at(&self, blk_row: u32, blk_col: u32) -> TxSize {
        let stride = self.bsize.mi_width();
        self.inter_tx_size
            .get((blk_row * stride + blk_col) as usize)
            .copied()
            .unwrap_or(self.tx_size)
    }

    fn set_inter_tx_size(&mut self, blk_row: u32, blk_col: u32, area: TxSize, tx_size: TxSize) {
        let stride = self.bsize.mi_width();
        let rows = self.bsize.mi_height();
        for row in blk_row..(blk_row + area.height_units()).min(rows) {
            fill(
                &mut self.inter_tx_size,
                (row * stride + blk_col) as usize,
                area.width_units().min(stride.saturating_sub(blk_col)) as usize,
                tx_size,
            );
        }
    }
}

/// Where the block being decoded lies, and what surrounds it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPosition {
    pub mi_row: u32,
    pub mi_col: u32,
    pub bsize: BlockSize,
    pub partition: Partition,
    pub is_chroma_ref: bool,
    /// Block above, if within the tile.
    pub above: Option<NeighborBlock>,
    /// Block to the left, if within the tile.
    pub left: Option<NeighborBlock>,
}

/// A transform block. Positions are in 4x4 units of the plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformBlock {
    pub plane: usize,
    pub row: u32,
    pub col: u32,
    pub tx_size: TxSize,
}

/// State the coefficient reader works on.
pub struct CoeffContext<'a> {
    /// Entropy contexts above and to the left of the transform block, one
    /// per 4x4 unit it covers.
    pub above: &'a mut [u8],
    pub left: &'a mut [u8],
    /// Receives the dequantized coefficients.
    pub dqcoeff: &'a mut [i32],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Coefficients {
    /// End of block, 0 when the block has no coefficient.
    pub eob: u16,
    pub tx_type: u8,
}

/// A reference to predict from.
pub struct InterRef<'a, F> {
    pub ref_frame: ReferenceFrameType,
    /// `None` to copy from the frame being decoded.
    pub frame: Option<&'a F>,
    pub scale: ScaleFactors,
    pub gm_type: WarpModelType,
    pub gm_params: [i32; 6],
}

/// Offsets of a block's area in a plane. Sub-8x8 blocks at odd positions
/// carry the chroma of the pair they complete, so their chroma starts one
/// unit before them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PlaneOffsets {
    /// Position in 4x4 units of the plane.
    row: u32,
    col: u32,
    /// Index into the left contexts.
    left: u32,
}

impl PlaneOffsets {
    fn new(mi: &ModeInfo, ss_x: bool, ss_y: bool) -> Self {
        let row = if ss_y && mi.mi_row & 1 != 0 && mi.bsize.mi_height() == 1 {
            mi.mi_row - 1
        } else {
            mi.mi_row
        };
        let col = if ss_x && mi.mi_col & 1 != 0 && mi.bsize.mi_width() == 1 {
            mi.mi_col - 1
        } else {
            mi.mi_col
        };

        Self {
            row: row >> ss_y as u32,
            col: col >> ss_x as u32,
            left: (row & MAX_MIB_MASK as u32) >> ss_y as u32,
        }
    }
}

/// Transform size used when it is not coded.
pub fn tx_size_from_tx_mode(bsize: BlockSize, tx_mode: TxMode) -> TxSize {
    let largest = match tx_mode {
        TxMode::Only4x4 => TxSize::Tx4x4,
        TxMode::Largest | TxMode::Select => TxSize::Tx64x64,
    };
    let max_rect = bsize.max_rect_tx_size();

    if bsize == BlockSize::Block4x4 {
        TxSize::Tx4x4
    } else if max_rect.sqr() <= largest {
        max_rect
    } else {
        largest
    }
}

/// Context of the transform split flag, from the neighboring transform
/// dimensions.
pub fn txfm_partition_context(above: u8, left: u8, bsize: BlockSize, tx_size: TxSize) -> usize {
    if tx_size == TxSize::Tx4x4 {
        return 0;
    }

    let above = (above as u32) < tx_size.width();
    let left = (left as u32) < tx_size.height();

    let max_side = bsize.width().max(bsize.height()).min(64);
    let max_tx = TxSize::from_dimensions(max_side, max_side).unwrap_or(TxSize::Tx4x4);
    let category = if max_tx >= TxSize::Tx8x8 {
        (tx_size.sqr_up() != max_tx && max_tx > TxSize::Tx8x8) as usize
            + (TxSize::Tx64x64 as usize - max_tx as usize) * 2
    } else {
        0
    };

    category * 3 + above as usize + left as usize
}

impl<'a, B: StatelessAV1DecoderBackend> TileDecoder<'a, B> {
    fn num_planes(&self) -> usize {
        (self.hdr.num_planes as usize).min(MAX_NUM_PLANES)
    }

    fn plane_subsampling(&self, plane: usize) -> (bool, bool) {
        if plane > 0 {
            (self.hdr.subsampling_x, self.hdr.subsampling_y)
        } else {
            (false, false)
        }
    }

    fn is_lossless(&self, mi: &ModeInfo) -> bool {
        self.hdr.lossless_array.get(mi.segment_id as usize).copied().unwrap_or(false)
    }

    /// Size in 4x4 units of the part of `plane_bsize` inside the frame.
    fn max_blocks(
        &self,
        mi: &ModeInfo,
        plane_bsize: BlockSize,
        ss_x: bool,
        ss_y: bool,
    ) -> (u32, u32) {
        let hdr = self.hdr;
        let to_right = (hdr.mi_cols as i64 - mi.bsize.mi_width() as i64 - mi.mi_col as i64)
            * MI_SIZE as i64;
        let to_bottom = (hdr.mi_rows as i64 - mi.bsize.mi_height() as i64 - mi.mi_row as i64)
            * MI_SIZE as i64;

        let clip = |size: u32, to_edge: i64, ss: bool| {
            let mut size = size as i64;
            if to_edge < 0 {
                size += to_edge >> ss as u32;
            }
            (size.max(0) >> 2) as u32
        };

        (clip(plane_bsize.width(), to_right, ss_x), clip(plane_bsize.height(), to_bottom, ss_y))
    }

    /// Decodes the block at (`mi_row`, `mi_col`).
    pub(super) fn decode_block(
        &mut self,
        mi_row: u32,
        mi_col: u32,
        bsize: BlockSize,
        partition: Partition,
    ) -> anyhow::Result<()> {
        let hdr = self.hdr;
        let (ss_x, ss_y) = (hdr.subsampling_x, hdr.subsampling_y);

        let above = if mi_row > self.bounds.mi_row_start {
            self.neighbors.above_block.get(mi_col as usize).copied().flatten()
        } else {
            None
        };
        let left = if mi_col > self.bounds.mi_col_start {
            self.neighbors.left_block.get(mi_row as usize & MAX_MIB_MASK).copied().flatten()
        } else {
            None
        };

        let position = BlockPosition {
            mi_row,
            mi_col,
            bsize,
            partition,
            is_chroma_ref: is_chroma_reference(mi_row, mi_col, bsize, ss_x, ss_y),
            above,
            left,
        };

        let mut mi =
            self.backend.read_mode_info(&mut self.reader, &mut self.entropy, hdr, &position)?;
        mi.mi_row = mi_row;
        mi.mi_col = mi_col;
        mi.bsize = bsize;
        mi.partition = partition;
        mi.inter_tx_size = vec![TxSize::Tx4x4; (bsize.mi_width() * bsize.mi_height()) as usize];

        if bsize >= BlockSize::Block8x8
            && (ss_x || ss_y)
            && bsize.plane_block_size(ss_x, ss_y).is_none()
        {
            return Err(anyhow!("Invalid block size."));
        }

        if !mi.is_inter_block() {
            for plane in 0..self.num_planes().min(2) {
                if mi.palette_size[plane] > 0 {
                    self.backend.read_palette_tokens(
                        &mut self.reader,
                        &mut self.entropy,
                        &mi,
                        plane,
                    )?;
                }
            }
        }

        self.read_block_tx_size(&mut mi, &position);

        if mi.skip {
            self.reset_entropy_context(&mi, position.is_chroma_ref);
        }

        if mi.is_inter_block() {
            self.reconstruct_inter(&mi, position.is_chroma_ref)?;
        } else {
            self.reconstruct_intra(&mi, position.is_chroma_ref)?;
        }

        self.corrupted |= self.reader.has_error();
        self.neighbors.set_neighbor_block(
            mi_row,
            mi_col,
            NeighborBlock { is_inter: mi.is_inter_block(), bsize },
        );

        Ok(())
    }

    fn read_block_tx_size(&mut self, mi: &mut ModeInfo, position: &BlockPosition) {
        let bsize = mi.bsize;
        let inter_tx = mi.is_inter_block();

        if self.hdr.tx_mode == TxMode::Select
            && bsize.signals_tx_size()
            && !mi.skip
            && inter_tx
            && !self.is_lossless(mi)
        {
            let max_tx = bsize.max_rect_tx_size();
            for row in (0..bsize.mi_height()).step_by(max_tx.height_units() as usize) {
                for col in (0..bsize.mi_width()).step_by(max_tx.width_units() as usize) {
                    self.read_tx_size_vartx(mi, max_tx, 0, row, col);
                }
            }
        } else {
            mi.tx_size = self.read_tx_size(mi, position);
            if inter_tx {
                mi.inter_tx_size.fill(mi.tx_size);
            }
            self.set_txfm_context(mi, mi.skip && inter_tx);
        }
    }

    fn read_tx_size(&mut self, mi: &ModeInfo, position: &BlockPosition) -> TxSize {
        let bsize = mi.bsize;
        if self.is_lossless(mi) {
            return TxSize::Tx4x4;
        }

        if !bsize.signals_tx_size() {
            return bsize.max_rect_tx_size();
        }

        if (!mi.is_inter_block() || !mi.skip) && self.hdr.tx_mode == TxMode::Select {
            let ctx = self.tx_size_context(mi, position);
            let cdf = self.entropy.tx_size_cdf(bsize.tx_size_category(), ctx);
            let depth = self.reader.read_symbol(cdf, bsize.max_tx_depth() as usize + 1);
            bsize.depth_to_tx_size(depth as u32)
        } else {
            tx_size_from_tx_mode(bsize, self.hdr.tx_mode)
        }
    }

    fn tx_size_context(&self, mi: &ModeInfo, position: &BlockPosition) -> usize {
        let max_tx = mi.bsize.max_rect_tx_size();
        let (max_w, max_h) = (max_tx.width(), max_tx.height());

        let above_txfm = self.neighbors.above_txfm.get(mi.mi_col as usize);
        let left_txfm = self.neighbors.left_txfm.get(mi.mi_row as usize & MAX_MIB_MASK);
        let mut above = above_txfm.copied().unwrap_or(TXFM_CONTEXT_RESET) as u32 >= max_w;
        let mut left = left_txfm.copied().unwrap_or(TXFM_CONTEXT_RESET) as u32 >= max_h;

        let has_above = mi.mi_row > self.bounds.mi_row_start;
        let has_left = mi.mi_col > self.bounds.mi_col_start;

        if let Some(block) = position.above.filter(|b| has_above && b.is_inter) {
            above = block.bsize.width() >= max_w;
        }
        if let Some(block) = position.left.filter(|b| has_left && b.is_inter) {
            left = block.bsize.height() >= max_h;
        }

        match (has_above, has_left) {
            (true, true) => above as usize + left as usize,
            (true, false) => above as usize,
            (false, true) => left as usize,
            (false, false) => 0,
        }
    }

    fn read_tx_size_vartx(
        &mut self,
        mi: &mut ModeInfo,
        tx_size: TxSize,
        depth: u32,
        blk_row: u32,
        blk_col: u32,
    ) {
        let (max_w, max_h) = self.max_blocks(mi, mi.bsize, false, false);
        if blk_row >= max_h || blk_col >= max_w {
            return;
        }

        if depth == MAX_VARTX_DEPTH {
            mi.set_inter_tx_size(blk_row, blk_col, tx_size, tx_size);
            mi.tx_size = tx_size;
            self.update_txfm_partition(mi, blk_row, blk_col, tx_size, tx_size);
            return;
        }

        let above_idx = (mi.mi_col + blk_col) as usize;
        let left_idx = (mi.mi_row as usize & MAX_MIB_MASK) + blk_row as usize;
        let above = self.neighbors.above_txfm.get(above_idx).copied().unwrap_or(TXFM_CONTEXT_RESET);
        let left = self.neighbors.left_txfm.get(left_idx).copied().unwrap_or(TXFM_CONTEXT_RESET);
        let ctx = txfm_partition_context(above, left, mi.bsize, tx_size);

        let split = self.reader.read_symbol(self.entropy.txfm_partition_cdf(ctx), 2) != 0;
        if !split {
            mi.set_inter_tx_size(blk_row, blk_col, tx_size, tx_size);
            mi.tx_size = tx_size;
            self.update_txfm_partition(mi, blk_row, blk_col, tx_size, tx_size);
            return;
        }

        let sub = tx_size.sub_size();
        if sub == TxSize::Tx4x4 {
            mi.set_inter_tx_size(blk_row, blk_col, tx_size, sub);
            mi.tx_size = sub;
            self.update_txfm_partition(mi, blk_row, blk_col, sub, tx_size);
            return;
        }

        for row in (0..tx_size.height_units()).step_by(sub.height_units() as usize) {
            for col in (0..tx_size.width_units()).step_by(sub.width_units() as usize) {
                self.read_tx_size_vartx(mi, sub, depth + 1, blk_row + row, blk_col + col);
            }
        }
    }

    /// Records `tx_size` in the transform contexts over the area of `area`.
    fn update_txfm_partition(
        &mut self,
        mi: &ModeInfo,
        blk_row: u32,
        blk_col: u32,
        tx_size: TxSize,
        area: TxSize,
    ) {
        fill(
            &mut self.neighbors.above_txfm,
            (mi.mi_col + blk_col) as usize,
            area.width_units() as usize,
            tx_size.width() as u8,
        );
        fill(
            &mut self.neighbors.left_txfm,
            (mi.mi_row as usize & MAX_MIB_MASK) + blk_row as usize,
            area.height_units() as usize,
            tx_size.height() as u8,
        );
    }

    /// Sets the transform contexts over the whole block. Skipped inter blocks
    /// record their own dimensions.
    fn set_txfm_context(&mut self, mi: &ModeInfo, skip: bool) {
        let (width, height) = if skip {
            (mi.bsize.width(), mi.bsize.height())
        } else {
            (mi.tx_size.width(), mi.tx_size.height())
        };

        fill(
            &mut self.neighbors.above_txfm,
            mi.mi_col as usize,
            mi.bsize.mi_width() as usize,
            width as u8,
        );
        fill(
            &mut self.neighbors.left_txfm,
            mi.mi_row as usize & MAX_MIB_MASK,
            mi.bsize.mi_height() as usize,
            height as u8,
        );
    }

    fn reset_entropy_context(&mut self, mi: &ModeInfo, is_chroma_ref: bool) {
        let num_planes = if is_chroma_ref { self.num_planes() } else { 1 };

        for plane in 0..num_planes {
            let (ss_x, ss_y) = self.plane_subsampling(plane);
            let Some(plane_bsize) = mi.bsize.plane_block_size(ss_x, ss_y) else {
                continue;
            };
            let offsets = PlaneOffsets::new(mi, ss_x, ss_y);

            fill(
                &mut self.neighbors.above_entropy[plane],
                offsets.col as usize,
                plane_bsize.mi_width() as usize,
                0,
            );
            fill(
                &mut self.neighbors.left_entropy[plane],
                offsets.left as usize,
                plane_bsize.mi_height() as usize,
                0,
            );
        }
    }

    fn store_cfl_required(&self, mi: &ModeInfo, is_chroma_ref: bool) -> bool {
        if self.hdr.num_planes == 1 {
            return false;
        }

        // Luma of blocks without chroma may serve the chroma block of their
        // area.
        if !is_chroma_ref {
            return true;
        }

        !mi.is_inter_block() && mi.uv_cfl
    }

    /// Reads the coefficients of a transform block and reconstructs its
    /// residual.
    fn decode_transform_block(
        &mut self,
        mi: &ModeInfo,
        tb: &TransformBlock,
        offsets: &PlaneOffsets,
    ) -> anyhow::Result<()> {
        let coeffs = self.read_coefficients(mi, tb, offsets)?;
        self.eob_total += coeffs.eob as u32;

        if coeffs.eob > 0 {
            self.backend.inverse_transform(self.frame, self.hdr, mi, tb, &coeffs, &self.dqcoeff)?;

            let len = (tb.tx_size.width() * tb.tx_size.height()) as usize;
            fill(&mut self.dqcoeff, 0, len, 0);
        }

        Ok(())
    }

    fn read_coefficients(
        &mut self,
        mi: &ModeInfo,
        tb: &TransformBlock,
        offsets: &PlaneOffsets,
    ) -> anyhow::Result<Coefficients> {
        let plane = tb.plane;
        let above_start = tb.col as usize;
        let left_start = offsets.left as usize + (tb.row - offsets.row) as usize;
        let above_end = above_start + tb.tx_size.width_units() as usize;
        let left_end = left_start + tb.tx_size.height_units() as usize;

        let ctx = CoeffContext {
            above: self.neighbors.above_entropy[plane]
                .get_mut(above_start..above_end)
                .unwrap_or_default(),
            left: self.neighbors.left_entropy[plane]
                .get_mut(left_start..left_end)
                .unwrap_or_default(),
            dqcoeff: &mut self.dqcoeff,
        };

        Ok(self.backend.read_coefficients(
            &mut self.reader,
            &mut self.entropy,
            self.hdr,
            mi,
            tb,
            ctx,
        )?)
    }

    fn reconstruct_intra(&mut self, mi: &ModeInfo, is_chroma_ref: bool) -> anyhow::Result<()> {
        let lossless = self.is_lossless(mi);
        let store_cfl = self.store_cfl_required(mi, is_chroma_ref);
        let (max_w, max_h) = self.max_blocks(mi, mi.bsize, false, false);
        let unit_w = max_w.clamp(1, MAX_UNIT_MI);
        let unit_h = max_h.clamp(1, MAX_UNIT_MI);

        for row in (0..max_h).step_by(unit_h as usize) {
            for col in (0..max_w).step_by(unit_w as usize) {
                for plane in 0..self.num_planes() {
                    if plane > 0 && !is_chroma_ref {
                        break;
                    }

                    let (ss_x, ss_y) = self.plane_subsampling(plane);
                    let tx_size = if lossless {
                        TxSize::Tx4x4
                    } else if plane == 0 {
                        mi.tx_size
                    } else {
                        mi.bsize
                            .plane_block_size(ss_x, ss_y)
                            .map_or(TxSize::Tx4x4, |b| b.max_rect_tx_size().adjusted())
                    };
                    let offsets = PlaneOffsets::new(mi, ss_x, ss_y);
                    let end_row = round2((unit_h + row).min(max_h) as u64, ss_y as u32) as u32;
                    let end_col = round2((unit_w + col).min(max_w) as u64, ss_x as u32) as u32;

                    let row_step = tx_size.height_units() as usize;
                    let col_step = tx_size.width_units() as usize;
                    for blk_row in ((row >> ss_y as u32)..end_row).step_by(row_step) {
                        for blk_col in ((col >> ss_x as u32)..end_col).step_by(col_step) {
                            let tb = TransformBlock {
                                plane,
                                row: offsets.row + blk_row,
                                col: offsets.col + blk_col,
                                tx_size,
                            };

                            self.backend.predict_intra(self.frame, self.hdr, mi, &tb)?;
                            if !mi.skip {
                                self.decode_transform_block(mi, &tb, &offsets)?;
                            }

                            if plane == 0 && store_cfl {
                                self.backend.cfl_store_tx(self.frame, mi, &tb);
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn reconstruct_inter(&mut self, mi: &ModeInfo, is_chroma_ref: bool) -> anyhow::Result<()> {
        let hdr = self.hdr;
        let active_refs = self.refs;

        let mut refs = Vec::with_capacity(2);
        for &ref_frame in mi.ref_frame.iter().flatten() {
            let (gm_type, gm_params) = hdr.global_motion_params.model(ref_frame as usize);

            let inter_ref = if ref_frame == ReferenceFrameType::Intra {
                InterRef { ref_frame, frame: None, scale: Default::default(), gm_type, gm_params }
            } else {
                let active = active_refs
                    .get(ref_frame as usize - 1)
                    .and_then(Option::as_ref)
                    .ok_or(anyhow!("Missing reference frame {:?}", ref_frame))?;

                if !active.scale.is_valid() {
                    return Err(Error::UnsupportedBitstream(
                        "Reference frame has invalid dimensions".into(),
                    )
                    .into());
                }

                InterRef {
                    ref_frame,
                    frame: Some(&*active.frame),
                    scale: active.scale,
                    gm_type,
                    gm_params,
                }
            };

            refs.push(inter_ref);
        }

        self.backend.predict_inter(self.frame, hdr, mi, &refs)?;
        if mi.motion_mode == MotionMode::Obmc {
            self.backend.predict_obmc(self.frame, hdr, mi)?;
        }

        if !mi.skip {
            let lossless = self.is_lossless(mi);
            let (max_w, max_h) = self.max_blocks(mi, mi.bsize, false, false);
            let unit_w = max_w.clamp(1, MAX_UNIT_MI);
            let unit_h = max_h.clamp(1, MAX_UNIT_MI);

            for row in (0..max_h).step_by(unit_h as usize) {
                for col in (0..max_w).step_by(unit_w as usize) {
                    for plane in 0..self.num_planes() {
                        if plane > 0 && !is_chroma_ref {
                            break;
                        }

                        let (ss_x, ss_y) = self.plane_subsampling(plane);
                        let plane_bsize = mi
                            .bsize
                            .plane_block_size(ss_x, ss_y)
                            .ok_or(anyhow!("Invalid block size."))?;
                        let max_tx = if lossless {
                            TxSize::Tx4x4
                        } else if plane == 0 {
                            plane_bsize.max_rect_tx_size()
                        } else {
                            plane_bsize.max_rect_tx_size().adjusted()
                        };
                        let offsets = PlaneOffsets::new(mi, ss_x, ss_y);
                        let end_row = round2((unit_h + row).min(max_h) as u64, ss_y as u32) as u32;
                        let end_col = round2((unit_w + col).min(max_w) as u64, ss_x as u32) as u32;

                        let row_step = max_tx.height_units() as usize;
                        let col_step = max_tx.width_units() as usize;
                        for blk_row in ((row >> ss_y as u32)..end_row).step_by(row_step) {
                            for blk_col in ((col >> ss_x as u32)..end_col).step_by(col_step) {
                                self.decode_reconstruct_tx(
                                    mi,
                                    plane_bsize,
                                    &offsets,
                                    plane,
                                    blk_row,
                                    blk_col,
                                    max_tx,
                                )?;
                            }
                        }
                    }
                }
            }
        }

        if self.store_cfl_required(mi, is_chroma_ref) {
            self.backend.cfl_store_block(self.frame, mi);
        }

        Ok(())
    }

    /// Walks the transform tree of an inter block down to the coded
    /// transform sizes.
    #[allow(clippy::too_many_arguments)]
    fn decode_reconstruct_tx(
        &mut self,
        mi: &ModeInfo,
        plane_bsize: BlockSize,
        offsets: &PlaneOffsets,
        plane: usize,
        blk_row: u32,
        blk_col: u32,
        tx_size: TxSize,
    ) -> anyhow::Result<()> {
        let (ss_x, ss_y) = self.plane_subsampling(plane);
        let plane_tx_size = if plane > 0 {
            plane_bsize.max_rect_tx_size().adjusted()
        } else {
            mi.inter_tx_size_at(blk_row, blk_col)
        };

        let (max_w, max_h) = self.max_blocks(mi, plane_bsize, ss_x, ss_y);
        if blk_row >= max_h || blk_col >= max_w {
            return Ok(());
        }

        if tx_size == plane_tx_size || plane > 0 || tx_size == TxSize::Tx4x4 {
            let tb = TransformBlock {
                plane,
                row: offsets.row + blk_row,
                col: offsets.col + blk_col,
                tx_size,
            };
            return self.decode_transform_block(mi, &tb, offsets);
        }

        let sub = tx_size.sub_size();
        let row_end = tx_size.height_units().min(max_h - blk_row);
        let col_end = tx_size.width_units().min(max_w - blk_col);

        for row in (0..row_end).step_by(sub.height_units() as usize) {
            for col in (0..col_end).step_by(sub.width_units() as usize) {
                self.decode_reconstruct_tx(
                    mi,
                    plane_bsize,
                    offsets,
                    plane,
                    blk_row + row,
                    blk_col + col,
                    sub,
                )?;
            }
        }

        Ok(())
    }
}
