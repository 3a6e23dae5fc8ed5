// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recursive partitioning of superblocks into coding blocks.

use anyhow::anyhow;

use crate::codec::av1::block::BlockSize;
use crate::codec::av1::block::Partition;
use crate::codec::av1::block::MAX_MIB_MASK;
use crate::decoder::stateless::av1::context::fill;
use crate::decoder::stateless::av1::context::TileDecoder;
use crate::decoder::stateless::av1::EntropyContext;
use crate::decoder::stateless::av1::StatelessAV1DecoderBackend;
use crate::decoder::stateless::av1::SymbolReader;

const CDF_PROB_TOP: i32 = 32768;

/// Probability of symbol `element` in an inverse CDF.
fn cdf_element_prob(icdf: &[u16], element: Partition) -> i32 {
    let e = element as usize;
    let prev = match e {
        0 => CDF_PROB_TOP,
        _ => icdf.get(e - 1).copied().map_or(0, i32::from),
    };
    let cur = icdf.get(e).copied().map_or(0, i32::from);

    (prev - cur).max(0)
}

/// Builds the binary inverse CDF of "split or not" out of the partitions
/// that split the block along `partitions`.
fn gather(icdf: &[u16], partitions: &[Partition]) -> [u16; 2] {
    let sum: i32 = partitions.iter().map(|&p| cdf_element_prob(icdf, p)).sum();
    [sum.clamp(0, CDF_PROB_TOP - 1) as u16, 0]
}

/// Partitions splitting the block vertically, used when only its top half
/// is inside the frame.
fn gather_vert_alike(icdf: &[u16], bsize: BlockSize) -> [u16; 2] {
    use Partition::*;

    if bsize == BlockSize::Block128x128 {
        gather(icdf, &[Vert, Split, HorzA, VertA, VertB])
    } else {
        gather(icdf, &[Vert, Split, HorzA, VertA, VertB, Vert4])
    }
}

/// Partitions splitting the block horizontally, used when only its left
/// half is inside the frame.
fn gather_horz_alike(icdf: &[u16], bsize: BlockSize) -> [u16; 2] {
    use Partition::*;

    if bsize == BlockSize::Block128x128 {
        gather(icdf, &[Horz, Split, HorzA, HorzB, VertA])
    } else {
        gather(icdf, &[Horz, Split, HorzA, HorzB, VertA, Horz4])
    }
}

/// Number of partition symbols for a block size.
fn partition_symbols(bsize: BlockSize) -> usize {
    match bsize {
        BlockSize::Block8x8 => 4,
        BlockSize::Block128x128 => 8,
        _ => 10,
    }
}

impl<'a, B: StatelessAV1DecoderBackend> TileDecoder<'a, B> {
    fn partition_context(&self, mi_row: u32, mi_col: u32, bsize: BlockSize) -> usize {
        let bsl = bsize.mi_width().trailing_zeros().saturating_sub(1);
        let above = self.neighbors.above_partition.get(mi_col as usize).copied().unwrap_or(0);
        let left = self.neighbors.left_partition[mi_row as usize & MAX_MIB_MASK];

        let above = (above >> bsl) & 1;
        let left = (left >> bsl) & 1;

        (left as usize) * 2 + above as usize + bsl as usize * 4
    }

    fn read_partition(
        &mut self,
        mi_row: u32,
        mi_col: u32,
        bsize: BlockSize,
        has_rows: bool,
        has_cols: bool,
    ) -> anyhow::Result<Partition> {
        if !has_rows && !has_cols {
            return Ok(Partition::Split);
        }

        let ctx = self.partition_context(mi_row, mi_col, bsize);
        let cdf = self.entropy.partition_cdf(ctx);

        let partition = if has_rows && has_cols {
            let symbol = self.reader.read_symbol(cdf, partition_symbols(bsize));
            Partition::n(symbol as u32).ok_or(anyhow!("Invalid partition {}", symbol))?
        } else if has_cols {
            let icdf = gather_vert_alike(cdf, bsize);
            if self.reader.read_symbol_static(&icdf, 2) != 0 {
                Partition::Split
            } else {
                Partition::Horz
            }
        } else {
            let icdf = gather_horz_alike(cdf, bsize);
            if self.reader.read_symbol_static(&icdf, 2) != 0 {
                Partition::Split
            } else {
                Partition::Vert
            }
        };

        Ok(partition)
    }

    /// Walks the partition tree of the block at (`mi_row`, `mi_col`),
    /// decoding its coding blocks.
    pub(super) fn decode_partition(
        &mut self,
        mi_row: u32,
        mi_col: u32,
        bsize: BlockSize,
    ) -> anyhow::Result<()> {
        let hdr = self.hdr;
        if mi_row >= hdr.mi_rows || mi_col >= hdr.mi_cols {
            return Ok(());
        }

        if bsize == self.sb_size() {
            self.read_lr_coefficients(mi_row, mi_col, bsize);
        }

        let hbs = bsize.mi_width() / 2;
        let has_rows = mi_row + hbs < hdr.mi_rows;
        let has_cols = mi_col + hbs < hdr.mi_cols;

        let partition = if bsize < BlockSize::Block8x8 {
            Partition::None
        } else {
            self.read_partition(mi_row, mi_col, bsize, has_rows, has_cols)?
        };

        let subsize = bsize.subsize(partition).ok_or(anyhow!(
            "Partition is invalid for block size {}x{}",
            bsize.width(),
            bsize.height()
        ))?;

        if subsize.plane_block_size(hdr.subsampling_x, hdr.subsampling_y).is_none() {
            return Err(anyhow!(
                "Block size {}x{} invalid with this subsampling mode",
                subsize.width(),
                subsize.height()
            ));
        }

        self.decode_partition_children(mi_row, mi_col, bsize, partition, subsize)?;

        if bsize >= BlockSize::Block8x8 {
            self.update_partition_context(mi_row, mi_col, bsize, partition, subsize);
        }

        Ok(())
    }

    fn decode_partition_children(
        &mut self,
        mi_row: u32,
        mi_col: u32,
        bsize: BlockSize,
        partition: Partition,
        subsize: BlockSize,
    ) -> anyhow::Result<()> {
        let hbs = bsize.mi_width() / 2;
        let quarter = bsize.mi_width() / 4;
        let has_rows = mi_row + hbs < self.hdr.mi_rows;
        let has_cols = mi_col + hbs < self.hdr.mi_cols;
        let bsize2 = bsize.subsize(Partition::Split).unwrap_or(subsize);

        match partition {
            Partition::None => self.decode_block(mi_row, mi_col, subsize, partition)?,
            Partition::Horz => {
                self.decode_block(mi_row, mi_col, subsize, partition)?;
                if has_rows {
                    self.decode_block(mi_row + hbs, mi_col, subsize, partition)?;
                }
            }
            Partition::Vert => {
                self.decode_block(mi_row, mi_col, subsize, partition)?;
                if has_cols {
                    self.decode_block(mi_row, mi_col + hbs, subsize, partition)?;
                }
            }
            Partition::Split => {
                self.decode_partition(mi_row, mi_col, subsize)?;
                self.decode_partition(mi_row, mi_col + hbs, subsize)?;
                self.decode_partition(mi_row + hbs, mi_col, subsize)?;
                self.decode_partition(mi_row + hbs, mi_col + hbs, subsize)?;
            }
            Partition::HorzA => {
                self.decode_block(mi_row, mi_col, bsize2, partition)?;
                self.decode_block(mi_row, mi_col + hbs, bsize2, partition)?;
                self.decode_block(mi_row + hbs, mi_col, subsize, partition)?;
            }
            Partition::HorzB => {
                self.decode_block(mi_row, mi_col, subsize, partition)?;
                self.decode_block(mi_row + hbs, mi_col, bsize2, partition)?;
                self.decode_block(mi_row + hbs, mi_col + hbs, bsize2, partition)?;
            }
            Partition::VertA => {
                self.decode_block(mi_row, mi_col, bsize2, partition)?;
                self.decode_block(mi_row + hbs, mi_col, bsize2, partition)?;
                self.decode_block(mi_row, mi_col + hbs, subsize, partition)?;
            }
            Partition::VertB => {
                self.decode_block(mi_row, mi_col, subsize, partition)?;
                self.decode_block(mi_row, mi_col + hbs, bsize2, partition)?;
                self.decode_block(mi_row + hbs, mi_col + hbs, bsize2, partition)?;
            }
            Partition::Horz4 => {
                for i in 0..4 {
                    let row = mi_row + i * quarter;
                    if i > 0 && row >= self.hdr.mi_rows {
                        break;
                    }
                    self.decode_block(row, mi_col, subsize, partition)?;
                }
            }
            Partition::Vert4 => {
                for i in 0..4 {
                    let col = mi_col + i * quarter;
                    if i > 0 && col >= self.hdr.mi_cols {
                        break;
                    }
                    self.decode_block(mi_row, col, subsize, partition)?;
                }
            }
        }

        Ok(())
    }

    /// Fills the partition contexts over `bsize` with the bits left by a
    /// block of size `subsize`.
    fn set_partition_context(
        &mut self,
        mi_row: u32,
        mi_col: u32,
        subsize: BlockSize,
        bsize: BlockSize,
    ) {
        let (above, left) = subsize.partition_context();
        fill(
            &mut self.neighbors.above_partition,
            mi_col as usize,
            bsize.mi_width() as usize,
            above,
        );
        fill(
            &mut self.neighbors.left_partition,
            mi_row as usize & MAX_MIB_MASK,
            bsize.mi_height() as usize,
            left,
        );
    }

    fn update_partition_context(
        &mut self,
        mi_row: u32,
        mi_col: u32,
        bsize: BlockSize,
        partition: Partition,
        subsize: BlockSize,
    ) {
        let hbs = bsize.mi_width() / 2;
        let bsize2 = bsize.subsize(Partition::Split).unwrap_or(subsize);

        match partition {
            // Split blocks update the context through their children, except
            // for 8x8 blocks whose 4x4 children do not.
            Partition::Split if bsize != BlockSize::Block8x8 => (),
            Partition::None
            | Partition::Horz
            | Partition::Vert
            | Partition::Split
            | Partition::Horz4
            | Partition::Vert4 => self.set_partition_context(mi_row, mi_col, subsize, bsize),
            Partition::HorzA => {
                self.set_partition_context(mi_row, mi_col, bsize2, subsize);
                self.set_partition_context(mi_row + hbs, mi_col, subsize, subsize);
            }
            Partition::HorzB => {
                self.set_partition_context(mi_row, mi_col, subsize, subsize);
                self.set_partition_context(mi_row + hbs, mi_col, bsize2, subsize);
            }
            Partition::VertA => {
                self.set_partition_context(mi_row, mi_col, bsize2, subsize);
                self.set_partition_context(mi_row, mi_col + hbs, subsize, subsize);
            }
            Partition::VertB => {
                self.set_partition_context(mi_row, mi_col, subsize, subsize);
                self.set_partition_context(mi_row, mi_col + hbs, bsize2, subsize);
            }
        }
    }
}
