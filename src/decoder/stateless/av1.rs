// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! AV1 stateless decoder.
//!
//! The decoder parses the uncompressed headers itself, carves the tile
//! payloads and walks every superblock of every tile. The symbol decoding
//! math, the reconstruction kernels, the in-loop filters and the frame
//! buffers are provided by a [`StatelessAV1DecoderBackend`].

pub mod block;
pub mod context;
#[cfg(test)]
mod dummy;
mod partition;
pub mod refs;
pub mod restoration;
pub mod tile;

use std::ops::Range;
use std::rc::Rc;

use anyhow::anyhow;

use crate::codec::av1::parser::FrameHeaderObu;
use crate::codec::av1::parser::FrameType;
use crate::codec::av1::parser::ObuAction;
use crate::codec::av1::parser::ObuType;
use crate::codec::av1::parser::ParsedObu;
use crate::codec::av1::parser::Parser;
use crate::codec::av1::parser::RefreshFrameContext;
use crate::codec::av1::parser::SequenceHeaderObu;
use crate::codec::av1::parser::MAX_NUM_PLANES;
use crate::codec::av1::parser::NUM_REF_FRAMES;
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
use crate::decoder::stateless::av1::refs::RefSlot;
use crate::decoder::stateless::av1::refs::ReferenceFrames;
use crate::decoder::stateless::av1::restoration::RestorationUnits;
use crate::decoder::stateless::av1::tile::get_ls_tile_buffers;
use crate::decoder::stateless::av1::tile::get_tile_buffers;
use crate::decoder::stateless::av1::tile::LargestTile;
use crate::decoder::stateless::DecodingState;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::stateless::StatelessCodec;
use crate::decoder::stateless::StatelessDecoder;
use crate::decoder::stateless::StatelessDecoderBackend;
use crate::decoder::DecoderConfig;
use crate::decoder::Result;
use crate::Resolution;

/// Arithmetic decoder reading the symbols of a single tile.
pub trait SymbolReader {
    /// Reads a symbol among `n` using the inverse CDF `cdf`, which is adapted
    /// unless adaptation was disabled when the reader was created.
    fn read_symbol(&mut self, cdf: &mut [u16], n: usize) -> usize;
    /// Reads a symbol among `n` without adapting `cdf`.
    fn read_symbol_static(&mut self, cdf: &[u16], n: usize) -> usize;
    fn read_bool(&mut self) -> bool;
    fn read_literal(&mut self, bits: u32) -> u32;
    /// Whether the reader went past the end of its data.
    fn has_error(&self) -> bool;
    /// Number of bytes of the tile consumed so far.
    fn find_end(&self) -> usize;
}

/// Adaptive probability tables of a frame. Only the tables read by the
/// decoder itself are exposed, the others are handled by the backend
/// services receiving the context.
pub trait EntropyContext: Clone {
    fn partition_cdf(&mut self, ctx: usize) -> &mut [u16];
    fn txfm_partition_cdf(&mut self, ctx: usize) -> &mut [u16];
    fn tx_size_cdf(&mut self, category: usize, ctx: usize) -> &mut [u16];
    fn switchable_restore_cdf(&mut self) -> &mut [u16];
    fn wiener_restore_cdf(&mut self) -> &mut [u16];
    fn sgrproj_restore_cdf(&mut self) -> &mut [u16];
    /// Clears the adaptation counters, once the context was adopted as the
    /// context of a frame.
    fn reset_counters(&mut self);
}

/// Stateless backend methods specific to AV1.
pub trait StatelessAV1DecoderBackend: StatelessDecoderBackend {
    type EntropyContext: EntropyContext;
    type SymbolReader: SymbolReader;

    /// Called when a new Sequence Header OBU is parsed.
    fn new_sequence(&mut self, sequence: &Rc<SequenceHeaderObu>) -> StatelessBackendResult<()>;

    /// Called when the size of the frames changes. Frames allocated from now
    /// on have the new size.
    fn resize_pool(&mut self, resolution: Resolution) -> StatelessBackendResult<()>;

    /// Allocates a frame to decode into.
    fn new_frame(&mut self, resolution: Resolution) -> StatelessBackendResult<Self::Frame>;

    /// Fills `planes` of `frame` with the middle value of the bit depth.
    fn fill_neutral_grey(&mut self, frame: &mut Self::Frame, planes: Range<usize>);

    /// Returns the default probability tables for the quantizer of `hdr`.
    fn default_entropy_context(&mut self, hdr: &FrameHeaderObu) -> Self::EntropyContext;

    /// Creates the symbol reader of a tile.
    fn new_symbol_reader(
        &mut self,
        data: &[u8],
        allow_update_cdf: bool,
    ) -> StatelessBackendResult<Self::SymbolReader>;

    /// Reads the mode info of the block at `position`.
    fn read_mode_info(
        &mut self,
        reader: &mut Self::SymbolReader,
        entropy: &mut Self::EntropyContext,
        hdr: &FrameHeaderObu,
        position: &BlockPosition,
    ) -> StatelessBackendResult<ModeInfo>;

    /// Reads the color indices of a palette block for `plane`.
    fn read_palette_tokens(
        &mut self,
        reader: &mut Self::SymbolReader,
        entropy: &mut Self::EntropyContext,
        mi: &ModeInfo,
        plane: usize,
    ) -> StatelessBackendResult<()>;

    /// Reads and dequantizes the coefficients of a transform block.
    fn read_coefficients(
        &mut self,
        reader: &mut Self::SymbolReader,
        entropy: &mut Self::EntropyContext,
        hdr: &FrameHeaderObu,
        mi: &ModeInfo,
        tb: &TransformBlock,
        ctx: CoeffContext,
    ) -> StatelessBackendResult<Coefficients>;

    fn predict_intra(
        &mut self,
        frame: &mut Self::Frame,
        hdr: &FrameHeaderObu,
        mi: &ModeInfo,
        tb: &TransformBlock,
    ) -> StatelessBackendResult<()>;

    /// Adds the inverse transform of `dqcoeff` to the prediction.
    fn inverse_transform(
        &mut self,
        frame: &mut Self::Frame,
        hdr: &FrameHeaderObu,
        mi: &ModeInfo,
        tb: &TransformBlock,
        coeffs: &Coefficients,
        dqcoeff: &[i32],
    ) -> StatelessBackendResult<()>;

    /// Predicts a whole inter block from `refs`.
    fn predict_inter(
        &mut self,
        frame: &mut Self::Frame,
        hdr: &FrameHeaderObu,
        mi: &ModeInfo,
        refs: &[InterRef<Self::Frame>],
    ) -> StatelessBackendResult<()>;

    fn predict_obmc(
        &mut self,
        frame: &mut Self::Frame,
        hdr: &FrameHeaderObu,
        mi: &ModeInfo,
    ) -> StatelessBackendResult<()>;

    /// Stores the luma of a transform block for chroma from luma prediction.
    fn cfl_store_tx(&mut self, frame: &Self::Frame, mi: &ModeInfo, tb: &TransformBlock);

    /// Stores the luma of a whole block for chroma from luma prediction.
    fn cfl_store_block(&mut self, frame: &Self::Frame, mi: &ModeInfo);

    /// Deblocks `plane` with the vertical and horizontal `levels`.
    fn loop_filter(
        &mut self,
        frame: &mut Self::Frame,
        hdr: &FrameHeaderObu,
        plane: usize,
        levels: [u8; 2],
    ) -> StatelessBackendResult<()>;

    fn cdef(&mut self, frame: &mut Self::Frame, hdr: &FrameHeaderObu)
        -> StatelessBackendResult<()>;

    fn superres_upscale(
        &mut self,
        frame: &mut Self::Frame,
        hdr: &FrameHeaderObu,
    ) -> StatelessBackendResult<()>;

    /// Saves the lines at the boundaries of the restoration stripes, before
    /// or after CDEF.
    fn save_boundary_lines(
        &mut self,
        frame: &mut Self::Frame,
        hdr: &FrameHeaderObu,
        after_cdef: bool,
    ) -> StatelessBackendResult<()>;

    fn loop_restoration(
        &mut self,
        frame: &mut Self::Frame,
        hdr: &FrameHeaderObu,
        units: &RestorationUnits,
    ) -> StatelessBackendResult<()>;

    /// Called with every fully reconstructed frame, before it becomes a
    /// reference.
    fn inspect(&mut self, _frame: &Self::Frame, _hdr: &FrameHeaderObu) {}
}

/// Outcome of [`StatelessDecoder::decode_frame_headers`].
#[derive(Debug)]
pub enum FrameDecodeStatus<F> {
    /// The header showed an existing frame, which is returned. No tile
    /// follows.
    ShowExisting(Rc<F>),
    /// The header started a new frame whose tiles must be passed to
    /// [`StatelessDecoder::decode_tiles`]. `header_bytes` is the size of the
    /// header, OBU header included.
    TilesFollow { header_bytes: usize },
}

/// The frame being decoded, kept between tile groups.
struct CurrentFrame<B: StatelessAV1DecoderBackend> {
    header: FrameHeaderObu,
    frame: B::Frame,
    refs: [Option<ActiveRef<B::Frame>>; REFS_PER_FRAME],
    restoration: RestorationUnits,
    /// Context every tile starts from.
    entropy: B::EntropyContext,
    largest_tile: LargestTile,
    /// Adapted context of the largest tile, once decoded.
    largest_tile_context: Option<B::EntropyContext>,
    /// Single tile row and column to decode, if any.
    tile_row: Option<u32>,
    tile_col: Option<u32>,
    corrupted: bool,
}

pub struct AV1DecoderState<B: StatelessAV1DecoderBackend> {
    /// AV1 bitstream parser.
    parser: Parser,

    /// The reference frames in use.
    reference_frames: ReferenceFrames<B::Frame, B::EntropyContext>,

    /// The frame currently being decoded. We need to preserve it between
    /// calls to `decode` because its tiles may come in several tile groups.
    current_frame: Option<CurrentFrame<B>>,

    /// Above and left contexts, kept across frames of the same width.
    neighbors: Option<NeighborContext>,

    /// Size of the frames the backend currently allocates.
    pool_resolution: Option<Resolution>,

    /// Set after an error, until an intra frame resets the references.
    need_resync: bool,

    /// Keep track of the number of frames we've processed for logging purposes.
    frame_count: u32,

    /// For SVC streams, we only want to output the highest layer possible given
    /// the choice of operating point.
    highest_spatial_layer: Option<u32>,
}

/// [`StatelessCodec`] structure to use in order to create an AV1 stateless decoder.
///
/// # Accepted input
///
/// A decoder using this codec processes one OBU per call to [`StatelessDecoder::decode`], or a
/// whole temporal unit per call to [`StatelessDecoder::decode_temporal_unit`]. OBUs must carry
/// their size field.
pub struct Av1;

impl<B: StatelessAV1DecoderBackend> StatelessCodec<B> for Av1 {
    type DecoderState = AV1DecoderState<B>;

    fn new_decoder_state(config: &DecoderConfig) -> Self::DecoderState {
        let mut parser = Parser::default();
        parser.set_large_scale_tile(config.large_scale_tile);
        parser.set_max_decode_dimensions(config.max_decode_dimensions);

        AV1DecoderState {
            parser,
            reference_frames: Default::default(),
            current_frame: None,
            neighbors: None,
            pool_resolution: None,
            need_resync: false,
            frame_count: 0,
            highest_spatial_layer: None,
        }
    }
}

pub type Av1Decoder<B> = StatelessDecoder<Av1, B>;

impl<B> StatelessDecoder<Av1, B>
where
    B: StatelessAV1DecoderBackend,
{
    /// Drops the frame in progress and requires an intra frame before decoding resumes.
    fn handle_error<T>(&mut self, result: anyhow::Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                log::warn!("Failed to decode frame {}: {:#}", self.codec.frame_count, err);
                self.codec.current_frame = None;
                self.codec.need_resync = true;
                self.codec.parser.set_need_resync();
                self.codec.parser.reset_frame_header();
                Err(err.into())
            }
        }
    }

    /// Returns the single tile row and column to decode, if any. A frame
    /// that cannot be decoded tile by tile cancels the selection for good.
    fn tile_selection(&mut self, hdr: &FrameHeaderObu) -> (Option<u32>, Option<u32>) {
        let (row, col) = (self.config.dec_tile_row, self.config.dec_tile_col);
        if row.is_none() && col.is_none() {
            return (None, None);
        }

        if !hdr.single_tile_decoding {
            log::warn!(
                "Frame {} needs in-loop filtering, decoding all tiles from now on",
                self.codec.frame_count
            );
            self.config.dec_tile_row = None;
            self.config.dec_tile_col = None;
            return (None, None);
        }

        let ti = &hdr.tile_info;
        (
            row.map(|r| r.min(ti.tile_rows.saturating_sub(1))),
            col.map(|c| c.min(ti.tile_cols.saturating_sub(1))),
        )
    }

    fn output_frame(&mut self, hdr: &FrameHeaderObu, frame: Rc<B::Frame>) {
        match self.codec.highest_spatial_layer {
            Some(highest) if hdr.obu_header.spatial_id < highest => {
                log::debug!("Dropping frame with spatial_id {}", hdr.obu_header.spatial_id);
            }
            _ => self.ready_queue.push(frame),
        }
    }

    /// Shows the frame of an existing slot. Showing a key frame refreshes
    /// every slot with it, as if it was decoded again.
    fn show_existing_frame(&mut self, hdr: FrameHeaderObu) -> anyhow::Result<Rc<B::Frame>> {
        let mut slot = self
            .codec
            .reference_frames
            .get(hdr.frame_to_show_map_idx as usize)
            .cloned()
            .ok_or(anyhow!("Broken stream: no reference picture to display"))?;

        log::debug!(
            "Showing existing frame {} from slot {}",
            self.codec.frame_count,
            hdr.frame_to_show_map_idx
        );

        if hdr.reset_decoder_state {
            if self.codec.need_resync {
                self.codec.reference_frames.clear();
                self.codec.need_resync = false;
            }

            slot.frame_type = FrameType::KeyFrame;
            self.codec.reference_frames.update(hdr.refresh_frame_flags, &slot);
        }

        self.codec.parser.ref_frame_update(&hdr)?;
        self.output_frame(&hdr, Rc::clone(&slot.frame));
        self.codec.frame_count += 1;

        Ok(slot.frame)
    }

    /// Backs the slots the frame needs but the stream never filled with grey
    /// frames of the maximum size.
    fn fill_placeholder_refs(&mut self, hdr: &FrameHeaderObu) -> anyhow::Result<()> {
        if hdr.placeholder_refs == 0 {
            return Ok(());
        }

        let seq = self.codec.parser.sequence_header.clone().ok_or(anyhow!("No sequence header"))?;
        let resolution =
            Resolution { width: seq.max_frame_width(), height: seq.max_frame_height() };

        for i in 0..NUM_REF_FRAMES {
            if (hdr.placeholder_refs >> i) & 1 == 0 {
                continue;
            }

            log::debug!("Allocating a grey placeholder for reference slot {}", i);
            let mut frame = self.backend.new_frame(resolution)?;
            self.backend.fill_neutral_grey(&mut frame, 0..hdr.num_planes as usize);
            let slot = RefSlot {
                frame: Rc::new(frame),
                entropy_context: self.backend.default_entropy_context(hdr),
                frame_type: FrameType::InterFrame,
                resolution,
            };
            self.codec.reference_frames.update(1 << i, &slot);
        }

        Ok(())
    }

    /// Prepares the decoding of the frame of `hdr`.
    fn start_frame(&mut self, hdr: FrameHeaderObu) -> anyhow::Result<FrameDecodeStatus<B::Frame>> {
        if self.codec.current_frame.take().is_some() {
            log::warn!("Frame {} was not complete and is dropped", self.codec.frame_count);
        }

        if hdr.show_existing_frame {
            return self.show_existing_frame(hdr).map(FrameDecodeStatus::ShowExisting);
        }

        if self.codec.parser.sequence_header.is_none() {
            return Err(anyhow!("No sequence header"));
        }

        log::debug!(
            "Decoding frame {}: {:?} {}x{}, {} tiles",
            self.codec.frame_count,
            hdr.frame_type,
            hdr.upscaled_width,
            hdr.frame_height,
            hdr.tile_info.num_tiles()
        );

        if self.codec.need_resync && hdr.frame_is_intra() {
            self.codec.reference_frames.clear();
            self.codec.need_resync = false;
        }

        let (tile_row, tile_col) = self.tile_selection(&hdr);
        self.fill_placeholder_refs(&hdr)?;

        let entropy = match hdr.primary_ref_slot() {
            None => self.backend.default_entropy_context(&hdr),
            Some(slot) => self
                .codec
                .reference_frames
                .get(slot)
                .map(|s| s.entropy_context.clone())
                .ok_or(anyhow!(
                    "Reference frame containing this frame's initial frame context is unavailable."
                ))?,
        };

        let resolution = Resolution { width: hdr.upscaled_width, height: hdr.frame_height };
        if self.codec.pool_resolution != Some(resolution) {
            log::debug!("Frame size changed to {}x{}", resolution.width, resolution.height);
            self.backend.resize_pool(resolution)?;
            self.codec.pool_resolution = Some(resolution);
        }
        let frame = self.backend.new_frame(resolution)?;

        if !self.codec.neighbors.as_ref().is_some_and(|n| n.matches(&hdr)) {
            self.codec.neighbors = Some(NeighborContext::new(&hdr));
        }

        let header_bytes = hdr.header_bytes;
        self.codec.current_frame = Some(CurrentFrame {
            refs: self.codec.reference_frames.active_refs(&hdr),
            restoration: RestorationUnits::new(&hdr),
            header: hdr,
            frame,
            entropy,
            largest_tile: Default::default(),
            largest_tile_context: None,
            tile_row,
            tile_col,
            corrupted: false,
        });

        Ok(FrameDecodeStatus::TilesFollow { header_bytes })
    }

    /// Decodes tiles `start..=end` of `current`, and deblocks the frame after
    /// its last tile. Returns the end of the consumed data.
    fn decode_tiles_of(
        &mut self,
        current: &mut CurrentFrame<B>,
        data: &[u8],
        start: u32,
        end: u32,
    ) -> anyhow::Result<usize> {
        let CurrentFrame {
            header,
            frame,
            refs,
            restoration,
            entropy,
            largest_tile,
            largest_tile_context,
            tile_row,
            tile_col,
            corrupted,
        } = current;
        let hdr: &FrameHeaderObu = header;
        let ti = &hdr.tile_info;
        let num_tiles = ti.num_tiles();

        if start > end || end >= num_tiles {
            return Err(anyhow!("Invalid tile range {}..={} for {} tiles", start, end, num_tiles));
        }

        let large_scale = hdr.large_scale_tile;
        let buffers = if large_scale {
            get_ls_tile_buffers(data, ti, *tile_row, *tile_col)?
        } else {
            get_tile_buffers(data, ti, start, end, largest_tile)?
        };

        // Tile order is only reversed along the axes decoded whole.
        let inverse = self.config.inverse_tile_order;
        let (rows, inverse_rows) = match (*tile_row).filter(|_| large_scale) {
            Some(row) => (row..row + 1, false),
            None => (0..ti.tile_rows, inverse),
        };
        let (cols, inverse_cols) = match (*tile_col).filter(|_| large_scale) {
            Some(col) => (col..col + 1, false),
            None => (0..ti.tile_cols, inverse),
        };

        let mut tiles = Vec::new();
        for r in rows {
            let row = if inverse_rows { ti.tile_rows - 1 - r } else { r };
            for c in cols.clone() {
                let col = if inverse_cols { ti.tile_cols - 1 - c } else { c };
                if (start..=end).contains(&(row * ti.tile_cols + col)) {
                    tiles.push((row, col));
                }
            }
        }

        let allow_update_cdf = !large_scale && !hdr.disable_cdf_update;
        let neighbors =
            self.codec.neighbors.as_mut().ok_or(anyhow!("Tile contexts are not allocated"))?;
        let mut end_offset = 0;

        for (row, col) in tiles {
            let tile_id = row * ti.tile_cols + col;
            let buffer = *buffers.get(row, col).ok_or(anyhow!("Tile {}x{} has no data", row, col))?;
            log::debug!("Decoding tile {} ({}x{}), {} bytes", tile_id, row, col, buffer.size);

            let reader = self.backend.new_symbol_reader(buffer.data(data)?, allow_update_cdf)?;
            let mut tile = TileDecoder::new(
                &mut self.backend,
                hdr,
                frame,
                refs,
                restoration,
                neighbors,
                reader,
                entropy.clone(),
                TileBounds::new(ti, row, col)?,
            );
            let result = tile.decode_tile();
            *corrupted |= tile.corrupted;
            result?;

            let (reader, tile_entropy) = tile.finish();
            if tile_id == end {
                end_offset = buffer.start + reader.find_end();
            }
            if !large_scale && tile_id == largest_tile.id {
                *largest_tile_context = Some(tile_entropy);
            }
        }

        if large_scale && num_tiles > 1 {
            end_offset = buffers
                .get(ti.tile_rows - 1, ti.tile_cols - 1)
                .map(|b| b.raw_data_end)
                .ok_or(anyhow!("Last large scale tile has no data"))?;
        }

        if end == num_tiles - 1 && !hdr.allow_intrabc {
            let [y_vertical, y_horizontal, u, v] = hdr.loop_filter_params.loop_filter_level;
            if y_vertical != 0 || y_horizontal != 0 {
                self.backend.loop_filter(frame, hdr, 0, [y_vertical, y_horizontal])?;
                if hdr.num_planes > 1 {
                    self.backend.loop_filter(frame, hdr, 1, [u, u])?;
                    self.backend.loop_filter(frame, hdr, 2, [v, v])?;
                }
            }
        }

        if hdr.num_planes < 3 {
            self.backend.fill_neutral_grey(frame, 1..MAX_NUM_PLANES);
        }

        Ok(end_offset)
    }

    /// Runs the frame level filters once all tiles are decoded, then stores
    /// the frame in its reference slots.
    fn finish_frame(&mut self, current: CurrentFrame<B>) -> anyhow::Result<()> {
        let CurrentFrame {
            header: hdr,
            mut frame,
            restoration,
            entropy,
            largest_tile,
            largest_tile_context,
            corrupted,
            ..
        } = current;

        if corrupted {
            return Err(anyhow!("Decode failed. Frame data is corrupted."));
        }

        if !hdr.allow_intrabc {
            let restoration_active = restoration.is_active();
            if restoration_active {
                self.backend.save_boundary_lines(&mut frame, &hdr, false)?;
            }
            if !self.config.skip_loop_filter && !hdr.coded_lossless && !hdr.cdef_params.is_noop() {
                self.backend.cdef(&mut frame, &hdr)?;
            }
            if hdr.superres_scaled() {
                self.backend.superres_upscale(&mut frame, &hdr)?;
            }
            if restoration_active {
                self.backend.save_boundary_lines(&mut frame, &hdr, true)?;
                self.backend.loop_restoration(&mut frame, &hdr, &restoration)?;
            }
        }

        // Large scale tile frames never adapt, and keep the context they
        // started with.
        let entropy = match hdr.refresh_frame_context {
            RefreshFrameContext::Backward => {
                let mut context = largest_tile_context
                    .ok_or(anyhow!("Largest tile {} was not decoded", largest_tile.id))?;
                context.reset_counters();
                context
            }
            RefreshFrameContext::Disabled => entropy,
        };

        self.backend.inspect(&frame, &hdr);

        let slot = RefSlot {
            frame: Rc::new(frame),
            entropy_context: entropy,
            frame_type: hdr.frame_type,
            resolution: Resolution { width: hdr.upscaled_width, height: hdr.frame_height },
        };
        self.codec.reference_frames.update(hdr.refresh_frame_flags, &slot);
        self.codec.parser.ref_frame_update(&hdr)?;
        self.codec.parser.reset_frame_header();

        if hdr.show_frame {
            self.output_frame(&hdr, slot.frame);
        }

        log::debug!("Finished frame {}", self.codec.frame_count);
        self.codec.frame_count += 1;
        Ok(())
    }

    fn decode_tile_group(&mut self, data: &[u8], start: u32, end: u32) -> anyhow::Result<usize> {
        let mut current = self.codec.current_frame.take().ok_or(anyhow!(
            "Broken stream: cannot decode a tile group without first decoding a frame header"
        ))?;

        let end_offset = self.decode_tiles_of(&mut current, data, start, end)?;

        if end + 1 < current.header.tile_info.num_tiles() {
            self.codec.current_frame = Some(current);
        } else {
            self.finish_frame(current)?;
        }

        Ok(end_offset)
    }

    /// Parses the frame header OBU at the start of `data` and prepares the
    /// decoding of its frame.
    pub fn decode_frame_headers(&mut self, data: &[u8]) -> Result<FrameDecodeStatus<B::Frame>> {
        let result = self.parse_and_start_frame(data);
        self.handle_error(result)
    }

    fn parse_and_start_frame(
        &mut self,
        data: &[u8],
    ) -> anyhow::Result<FrameDecodeStatus<B::Frame>> {
        let obu = match self.codec.parser.read_obu(data)? {
            ObuAction::Process(obu) => obu,
            ObuAction::Drop(_) => return Err(anyhow!("OBU is not part of the operating point")),
        };

        if !matches!(
            obu.header.obu_type,
            ObuType::FrameHeader | ObuType::Frame | ObuType::RedundantFrameHeader
        ) {
            return Err(anyhow!("Expected a frame header, got {:?}", obu.header.obu_type));
        }

        let hdr = self.codec.parser.parse_frame_header_obu(&obu)?;
        self.start_frame(hdr)
    }

    /// Decodes tiles `start..=end` of the frame started by the last call to
    /// [`Self::decode_frame_headers`]. `data` holds the tile payload, without
    /// tile group header. Returns the number of bytes of `data` the tiles
    /// used. The frame is complete after its last tile.
    pub fn decode_tiles(&mut self, data: &[u8], start: u32, end: u32) -> Result<usize> {
        let result = self.decode_tile_group(data, start, end);
        self.handle_error(result)
    }

    /// Decode an AV1 stream.
    ///
    /// `bitstream` should initially be submitted as a whole temporal unit, however a call to this
    /// method will only consume a single OBU. The caller must be careful to check the return value
    /// and resubmit the remainder if the whole bitstream has not been consumed.
    pub fn decode(&mut self, bitstream: &[u8]) -> Result<usize> {
        let result = self.decode_obu(bitstream);
        self.handle_error(result)
    }

    fn decode_obu(&mut self, bitstream: &[u8]) -> anyhow::Result<usize> {
        let obu = match self.codec.parser.read_obu(bitstream)? {
            ObuAction::Process(obu) => obu,
            // This OBU should be dropped.
            ObuAction::Drop(length) => return Ok(length),
        };
        let obu_length = obu.bytes_used;

        let is_decode_op = matches!(
            obu.header.obu_type,
            ObuType::Frame
                | ObuType::FrameHeader
                | ObuType::RedundantFrameHeader
                | ObuType::TileGroup
        );

        if is_decode_op {
            match self.decoding_state {
                /* we want to be here */
                DecodingState::Decoding => (),

                /* Skip input until we get information from the stream. */
                DecodingState::AwaitingStreamInfo => return Ok(obu_length),

                DecodingState::Reset => {
                    let mut parser = self.codec.parser.clone();

                    let is_key_frame = match obu.header.obu_type {
                        ObuType::Frame | ObuType::FrameHeader => {
                            parser.parse_frame_header_obu(&obu)?.frame_type == FrameType::KeyFrame
                        }
                        _ => false,
                    };

                    /* we can only resume from key frames */
                    if !is_key_frame {
                        return Ok(obu_length);
                    }
                    self.decoding_state = DecodingState::Decoding;
                }
            }
        }

        match self.codec.parser.parse_obu(obu)? {
            ParsedObu::SequenceHeader(sequence) => {
                if self.codec.current_frame.is_some() {
                    return Err(anyhow!(
                        "Broken stream: a frame is being decoded while a new sequence header is encountered"
                    ));
                }

                log::debug!(
                    "Found new sequence, max resolution: {}x{}, profile: {:?}, bit depth: {:?}",
                    sequence.max_frame_width(),
                    sequence.max_frame_height(),
                    sequence.seq_profile,
                    sequence.bit_depth
                );

                self.codec.parser.choose_operating_point(self.config.operating_point)?;
                self.codec.highest_spatial_layer = self.codec.parser.highest_operating_point();
                self.backend.new_sequence(&sequence)?;

                if self.decoding_state == DecodingState::AwaitingStreamInfo {
                    self.decoding_state = DecodingState::Decoding;
                }
            }
            ParsedObu::TemporalDelimiter => (),
            ParsedObu::FrameHeader(hdr) => {
                if self.codec.current_frame.as_ref().is_some_and(|f| f.header == hdr) {
                    log::debug!("Skipping redundant frame header");
                } else {
                    self.start_frame(hdr)?;
                }
            }
            ParsedObu::TileGroup(tg) => {
                self.decode_tile_group(tg.tile_data, tg.tg_start, tg.tg_end)?;
            }
            ParsedObu::Frame(frame) => {
                let tg = frame.tile_group;
                self.start_frame(frame.header)?;
                self.decode_tile_group(tg.tile_data, tg.tg_start, tg.tg_end)?;
            }
        }

        Ok(obu_length)
    }

    /// Decodes every OBU of `data`, and returns the frames to display in
    /// display order.
    pub fn decode_temporal_unit(&mut self, mut data: &[u8]) -> Result<Vec<Rc<B::Frame>>> {
        while !data.is_empty() {
            let consumed = self.decode(data)?;
            data = data.get(consumed..).unwrap_or_default();
        }

        Ok((&mut self.ready_queue).collect())
    }

    /// Forgets every reference. Decoding resumes at the next key frame.
    pub fn flush(&mut self) {
        // Note: all the decoded frames are already in the ready queue.
        self.codec.reference_frames.clear();
        self.codec.current_frame = None;
        self.codec.parser.set_need_resync();
        self.codec.parser.reset_frame_header();
        if self.decoding_state == DecodingState::Decoding {
            self.decoding_state = DecodingState::Reset;
        }
    }

    /// Header of the last frame parsed.
    pub fn last_frame_header(&self) -> Option<&FrameHeaderObu> {
        self.codec.parser.last_frame_header.as_ref()
    }

    pub fn reference_frame(&self, slot: usize) -> Option<&RefSlot<B::Frame, B::EntropyContext>> {
        self.codec.reference_frames.get(slot)
    }
}
