// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! Symbols are scripted: every read consumes one byte of the tile data, and
//! reads past its end return zero. Every call reaching the backend is
//! recorded so tests can check what the decoder asked for.

use std::ops::Range;
use std::rc::Rc;

use crate::codec::av1::block::BlockSize;
use crate::codec::av1::block::TxSize;
use crate::codec::av1::parser::FrameHeaderObu;
use crate::codec::av1::parser::SequenceHeaderObu;
use crate::codec::av1::parser::TxMode;
use crate::codec::av1::parser::REFS_PER_FRAME;
use crate::decoder::stateless::av1::block::BlockPosition;
use crate::decoder::stateless::av1::block::CoeffContext;
use crate::decoder::stateless::av1::block::Coefficients;
use crate::decoder::stateless::av1::block::InterRef;
use crate::decoder::stateless::av1::block::ModeInfo;
use crate::decoder::stateless::av1::block::TransformBlock;
use crate::decoder::stateless::av1::context::NeighborContext;
use crate::decoder::stateless::av1::context::TileBounds;
use crate::decoder::stateless::av1::context::TileDecoder;
use crate::decoder::stateless::av1::refs::ActiveRef;
use crate::decoder::stateless::av1::refs::ScaleFactors;
use crate::decoder::stateless::av1::restoration::RestorationUnits;
use crate::decoder::stateless::av1::Av1;
use crate::decoder::stateless::av1::EntropyContext;
use crate::decoder::stateless::av1::StatelessAV1DecoderBackend;
use crate::decoder::stateless::av1::SymbolReader;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StatelessDecoderBackend;
use crate::decoder::DecoderConfig;
use crate::Resolution;

pub struct DummyReader {
    data: Vec<u8>,
    pos: usize,
    allow_update_cdf: bool,
    corrupt: bool,
}

impl DummyReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0, allow_update_cdf: true, corrupt: false }
    }

    fn next_byte(&mut self) -> u8 {
        let byte = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos = (self.pos + 1).min(self.data.len());
        byte
    }
}

impl SymbolReader for DummyReader {
    fn read_symbol(&mut self, cdf: &mut [u16], n: usize) -> usize {
        let symbol = self.next_byte() as usize % n.max(1);

        // The first element keeps the last symbol read, the last one counts
        // the adaptations.
        if self.allow_update_cdf {
            if let [last_symbol, .., count] = cdf {
                *last_symbol = symbol as u16;
                *count = count.saturating_add(1);
            }
        }

        symbol
    }

    fn read_symbol_static(&mut self, _: &[u16], n: usize) -> usize {
        self.next_byte() as usize % n.max(1)
    }

    fn read_bool(&mut self) -> bool {
        self.next_byte() != 0
    }

    fn read_literal(&mut self, bits: u32) -> u32 {
        let mask = if bits >= 32 { u32::MAX } else { (1 << bits) - 1 };
        self.next_byte() as u32 & mask
    }

    fn has_error(&self) -> bool {
        self.corrupt
    }

    fn find_end(&self) -> usize {
        self.pos
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DummyContext {
    pub partition: [[u16; 11]; 20],
    pub txfm: [[u16; 3]; 21],
    pub tx_size: [[[u16; 4]; 3]; 4],
    pub switchable_restore: [u16; 4],
    pub wiener_restore: [u16; 3],
    pub sgrproj_restore: [u16; 3],
    /// Number of times the adaptation counters were reset.
    pub resets: u32,
}

impl DummyContext {
    fn counters(&mut self) -> impl Iterator<Item = &mut u16> {
        self.partition
            .iter_mut()
            .map(|c| &mut c[10])
            .chain(self.txfm.iter_mut().map(|c| &mut c[2]))
            .chain(self.tx_size.iter_mut().flatten().map(|c| &mut c[3]))
            .chain([
                &mut self.switchable_restore[3],
                &mut self.wiener_restore[2],
                &mut self.sgrproj_restore[2],
            ])
    }

    /// Total number of adapted symbols.
    pub fn adaptations(&mut self) -> u32 {
        self.counters().map(|c| *c as u32).sum()
    }
}

impl EntropyContext for DummyContext {
    fn partition_cdf(&mut self, ctx: usize) -> &mut [u16] {
        let len = self.partition.len();
        &mut self.partition[ctx.min(len - 1)]
    }

    fn txfm_partition_cdf(&mut self, ctx: usize) -> &mut [u16] {
        let len = self.txfm.len();
        &mut self.txfm[ctx.min(len - 1)]
    }

    fn tx_size_cdf(&mut self, category: usize, ctx: usize) -> &mut [u16] {
        &mut self.tx_size[category.min(3)][ctx.min(2)]
    }

    fn switchable_restore_cdf(&mut self) -> &mut [u16] {
        &mut self.switchable_restore
    }

    fn wiener_restore_cdf(&mut self) -> &mut [u16] {
        &mut self.wiener_restore
    }

    fn sgrproj_restore_cdf(&mut self) -> &mut [u16] {
        &mut self.sgrproj_restore
    }

    fn reset_counters(&mut self) {
        self.counters().for_each(|c| *c = 0);
        self.resets += 1;
    }
}

/// A frame with only a luma plane, which the dummy kernels write into.
#[derive(Debug)]
pub struct DummyFrame {
    pub resolution: Resolution,
    pub luma: Vec<u8>,
}

impl DummyFrame {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution, luma: vec![0; (resolution.width * resolution.height) as usize] }
    }

    /// Applies `f` to the luma pixels covered by a transform block.
    fn for_each_pixel(&mut self, tb: &TransformBlock, mut f: impl FnMut(u32, u32, &mut u8)) {
        if tb.plane != 0 {
            return;
        }

        let Resolution { width, height } = self.resolution;
        let (x0, y0) = (tb.col * 4, tb.row * 4);
        for y in y0..(y0 + tb.tx_size.height()).min(height) {
            for x in x0..(x0 + tb.tx_size.width()).min(width) {
                if let Some(p) = self.luma.get_mut((y * width + x) as usize) {
                    f(x, y, p);
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    NewSequence,
    ResizePool(Resolution),
    NewFrame(Resolution),
    NeutralGrey(Range<usize>),
    Palette(usize),
    Coefficients(TransformBlock),
    PredictIntra(usize),
    /// Number of references that are other frames.
    PredictInter(usize),
    Obmc,
    CflStoreTx,
    CflStoreBlock,
    InverseTransform(usize),
    LoopFilter(usize, [u8; 2]),
    Cdef,
    Superres,
    BoundaryLines(bool),
    LoopRestoration,
    Inspect,
}

/// Dummy backend recording the calls it receives.
pub struct DummyBackend {
    /// Mode info returned for every block.
    pub mode: ModeInfo,
    /// End of block of every transform block.
    pub eob: u16,
    /// Readers created from now on report errors.
    pub corrupt_readers: bool,
    /// Symbol reader allocations fail.
    pub fail_reader_alloc: bool,
    pub calls: Vec<BackendCall>,
    /// Position and size of the decoded blocks, in decoding order.
    pub blocks: Vec<(u32, u32, BlockSize)>,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self {
            mode: Default::default(),
            eob: 1,
            corrupt_readers: false,
            fail_reader_alloc: false,
            calls: Default::default(),
            blocks: Default::default(),
        }
    }
}

impl DummyBackend {
    /// Plane, row, column and size of the transform blocks whose
    /// coefficients were read.
    pub fn transform_blocks(&self) -> impl Iterator<Item = (usize, u32, u32, TxSize)> + '_ {
        self.calls.iter().filter_map(|c| match c {
            BackendCall::Coefficients(tb) => Some((tb.plane, tb.row, tb.col, tb.tx_size)),
            _ => None,
        })
    }

    /// Calls made after the tiles were decoded.
    pub fn frame_calls(&self) -> Vec<BackendCall> {
        self.calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    BackendCall::LoopFilter(..)
                        | BackendCall::Cdef
                        | BackendCall::Superres
                        | BackendCall::BoundaryLines(_)
                        | BackendCall::LoopRestoration
                        | BackendCall::Inspect
                )
            })
            .cloned()
            .collect()
    }

    fn reader(&self, data: Vec<u8>, allow_update_cdf: bool) -> DummyReader {
        DummyReader { allow_update_cdf, corrupt: self.corrupt_readers, ..DummyReader::new(data) }
    }
}

impl StatelessDecoderBackend for DummyBackend {
    type Frame = DummyFrame;
}

impl StatelessAV1DecoderBackend for DummyBackend {
    type EntropyContext = DummyContext;
    type SymbolReader = DummyReader;

    fn new_sequence(&mut self, _: &Rc<SequenceHeaderObu>) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::NewSequence);
        Ok(())
    }

    fn resize_pool(&mut self, resolution: Resolution) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::ResizePool(resolution));
        Ok(())
    }

    fn new_frame(&mut self, resolution: Resolution) -> StatelessBackendResult<DummyFrame> {
        self.calls.push(BackendCall::NewFrame(resolution));
        Ok(DummyFrame::new(resolution))
    }

    fn fill_neutral_grey(&mut self, frame: &mut DummyFrame, planes: Range<usize>) {
        if planes.contains(&0) {
            frame.luma.fill(0x80);
        }
        self.calls.push(BackendCall::NeutralGrey(planes));
    }

    fn default_entropy_context(&mut self, _: &FrameHeaderObu) -> DummyContext {
        Default::default()
    }

    fn new_symbol_reader(
        &mut self,
        data: &[u8],
        allow_update_cdf: bool,
    ) -> StatelessBackendResult<DummyReader> {
        if self.fail_reader_alloc {
            return Err(StatelessBackendError::OutOfResources);
        }

        Ok(self.reader(data.to_vec(), allow_update_cdf))
    }

    fn read_mode_info(
        &mut self,
        _: &mut DummyReader,
        _: &mut DummyContext,
        _: &FrameHeaderObu,
        position: &BlockPosition,
    ) -> StatelessBackendResult<ModeInfo> {
        self.blocks.push((position.mi_row, position.mi_col, position.bsize));
        Ok(self.mode.clone())
    }

    fn read_palette_tokens(
        &mut self,
        _: &mut DummyReader,
        _: &mut DummyContext,
        _: &ModeInfo,
        plane: usize,
    ) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::Palette(plane));
        Ok(())
    }

    fn read_coefficients(
        &mut self,
        _: &mut DummyReader,
        _: &mut DummyContext,
        _: &FrameHeaderObu,
        _: &ModeInfo,
        tb: &TransformBlock,
        ctx: CoeffContext,
    ) -> StatelessBackendResult<Coefficients> {
        self.calls.push(BackendCall::Coefficients(*tb));
        if let Some(dc) = ctx.dqcoeff.first_mut() {
            *dc = self.eob as i32;
        }

        Ok(Coefficients { eob: self.eob, tx_type: 0 })
    }

    fn predict_intra(
        &mut self,
        frame: &mut DummyFrame,
        _: &FrameHeaderObu,
        _: &ModeInfo,
        tb: &TransformBlock,
    ) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::PredictIntra(tb.plane));
        frame.for_each_pixel(tb, |x, y, p| *p = ((y * 7 + x * 13) & 0xff) as u8);
        Ok(())
    }

    fn inverse_transform(
        &mut self,
        frame: &mut DummyFrame,
        _: &FrameHeaderObu,
        _: &ModeInfo,
        tb: &TransformBlock,
        coeffs: &Coefficients,
        dqcoeff: &[i32],
    ) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::InverseTransform(tb.plane));
        let residual = dqcoeff.first().copied().unwrap_or(0).max(coeffs.eob as i32) as u8;
        frame.for_each_pixel(tb, |_, _, p| *p = p.wrapping_add(residual));
        Ok(())
    }

    fn predict_inter(
        &mut self,
        _: &mut DummyFrame,
        _: &FrameHeaderObu,
        _: &ModeInfo,
        refs: &[InterRef<DummyFrame>],
    ) -> StatelessBackendResult<()> {
        let available = refs.iter().filter(|r| r.frame.is_some()).count();
        self.calls.push(BackendCall::PredictInter(available));
        Ok(())
    }

    fn predict_obmc(
        &mut self,
        _: &mut DummyFrame,
        _: &FrameHeaderObu,
        _: &ModeInfo,
    ) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::Obmc);
        Ok(())
    }

    fn cfl_store_tx(&mut self, _: &DummyFrame, _: &ModeInfo, _: &TransformBlock) {
        self.calls.push(BackendCall::CflStoreTx);
    }

    fn cfl_store_block(&mut self, _: &DummyFrame, _: &ModeInfo) {
        self.calls.push(BackendCall::CflStoreBlock);
    }

    fn loop_filter(
        &mut self,
        _: &mut DummyFrame,
        _: &FrameHeaderObu,
        plane: usize,
        levels: [u8; 2],
    ) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::LoopFilter(plane, levels));
        Ok(())
    }

    fn cdef(&mut self, _: &mut DummyFrame, _: &FrameHeaderObu) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::Cdef);
        Ok(())
    }

    fn superres_upscale(
        &mut self,
        _: &mut DummyFrame,
        _: &FrameHeaderObu,
    ) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::Superres);
        Ok(())
    }

    fn save_boundary_lines(
        &mut self,
        _: &mut DummyFrame,
        _: &FrameHeaderObu,
        after_cdef: bool,
    ) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::BoundaryLines(after_cdef));
        Ok(())
    }

    fn loop_restoration(
        &mut self,
        _: &mut DummyFrame,
        _: &FrameHeaderObu,
        _: &RestorationUnits,
    ) -> StatelessBackendResult<()> {
        self.calls.push(BackendCall::LoopRestoration);
        Ok(())
    }

    fn inspect(&mut self, _: &DummyFrame, _: &FrameHeaderObu) {
        self.calls.push(BackendCall::Inspect);
    }
}

impl StatelessDecoder<Av1, DummyBackend> {
    // Creates a new instance of the decoder using the dummy backend.
    pub fn new_dummy(config: DecoderConfig) -> Self {
        Self::new(DummyBackend::default(), config)
    }
}

/// Everything a [`TileDecoder`] borrows, for a single tile frame.
pub struct TileHarness {
    pub backend: DummyBackend,
    pub hdr: FrameHeaderObu,
    pub frame: DummyFrame,
    pub refs: [Option<ActiveRef<DummyFrame>>; REFS_PER_FRAME],
    pub restoration: RestorationUnits,
    pub neighbors: NeighborContext,
}

impl TileHarness {
    /// A 4:2:0 frame of `width`x`height` pixels.
    pub fn new(width: u32, height: u32) -> Self {
        let mut hdr = FrameHeaderObu {
            frame_width: width,
            frame_height: height,
            upscaled_width: width,
            superres_denom: 8,
            mi_cols: 2 * ((width + 7) >> 3),
            mi_rows: 2 * ((height + 7) >> 3),
            subsampling_x: true,
            subsampling_y: true,
            num_planes: 3,
            tx_mode: TxMode::Largest,
            ..Default::default()
        };
        hdr.tile_info.tile_cols = 1;
        hdr.tile_info.tile_rows = 1;
        hdr.tile_info.mi_col_starts[1] = hdr.mi_cols;
        hdr.tile_info.mi_row_starts[1] = hdr.mi_rows;

        Self {
            backend: Default::default(),
            frame: DummyFrame::new(Resolution { width, height }),
            refs: Default::default(),
            restoration: RestorationUnits::new(&hdr),
            neighbors: NeighborContext::new(&hdr),
            hdr,
        }
    }

    /// Starts decoding a tile covering the whole frame, reading symbols from
    /// `data`.
    pub fn tile(&mut self, data: &[u8]) -> TileDecoder<'_, DummyBackend> {
        let reader = self.backend.reader(data.to_vec(), true);
        let bounds = TileBounds {
            mi_row_start: 0,
            mi_row_end: self.hdr.mi_rows,
            mi_col_start: 0,
            mi_col_end: self.hdr.mi_cols,
        };

        TileDecoder::new(
            &mut self.backend,
            &self.hdr,
            &mut self.frame,
            &self.refs,
            &mut self.restoration,
            &mut self.neighbors,
            reader,
            Default::default(),
            bounds,
        )
    }

    /// Makes a `width`x`height` frame the LAST reference.
    pub fn add_reference(&mut self, width: u32, height: u32) {
        let reference = Resolution { width, height };
        let this = Resolution { width: self.hdr.frame_width, height: self.hdr.frame_height };
        self.refs[0] = Some(ActiveRef {
            frame: Rc::new(DummyFrame::new(reference)),
            scale: ScaleFactors::new(reference, this),
        });
    }

    /// Recomputes the restoration units after a header change.
    pub fn reset_restoration(&mut self) {
        self.restoration = RestorationUnits::new(&self.hdr);
    }
}
