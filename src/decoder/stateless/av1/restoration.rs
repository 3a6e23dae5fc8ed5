// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Loop restoration unit coefficients.
//!
//! The coefficients of the restoration units overlapping a superblock are
//! coded at the start of the superblock, each one relative to the last
//! coefficients read in the same plane of the tile.

use crate::codec::av1::block::BlockSize;
use crate::codec::av1::block::MI_SIZE;
use crate::codec::av1::helpers::floor_log2;
use crate::codec::av1::helpers::inverse_recenter;
use crate::codec::av1::helpers::round2;
use crate::codec::av1::parser::FrameHeaderObu;
use crate::codec::av1::parser::FrameRestorationType;
use crate::codec::av1::parser::MAX_NUM_PLANES;
use crate::codec::av1::parser::SUPERRES_NUM;
use crate::decoder::stateless::av1::context::TileDecoder;
use crate::decoder::stateless::av1::EntropyContext;
use crate::decoder::stateless::av1::StatelessAV1DecoderBackend;
use crate::decoder::stateless::av1::SymbolReader;

pub const WIENER_TAPS: usize = 7;

const WIENER_TAPS_MIN: [i32; 3] = [-5, -23, -17];
const WIENER_TAPS_MAX: [i32; 3] = [10, 8, 46];
const WIENER_TAPS_K: [u32; 3] = [1, 2, 3];
const WIENER_TAPS_MID: [i32; WIENER_TAPS] = [3, -7, 15, -22, 15, -7, 3];

const SGRPROJ_PARAMS_BITS: u32 = 4;
const SGRPROJ_PRJ_SUBEXP_K: u32 = 4;
const SGRPROJ_PRJ_BITS: i32 = 7;
const SGRPROJ_XQD_MIN: [i32; 2] = [-96, -32];
const SGRPROJ_XQD_MAX: [i32; 2] = [31, 95];
const SGRPROJ_XQD_MID: [i32; 2] = [-32, 31];

/// Radii and strengths of the self guided filter for each parameter set.
/// A zero radius disables the corresponding pass.
pub const SGR_PARAMS: [([u32; 2], [i32; 2]); 16] = [
    ([2, 1], [140, 3236]),
    ([2, 1], [112, 2158]),
    ([2, 1], [93, 1618]),
    ([2, 1], [80, 1438]),
    ([2, 1], [70, 1295]),
    ([2, 1], [58, 1177]),
    ([2, 1], [47, 1079]),
    ([2, 1], [37, 996]),
    ([2, 1], [30, 925]),
    ([2, 1], [25, 863]),
    ([0, 1], [-1, 2589]),
    ([0, 1], [-1, 1618]),
    ([0, 1], [-1, 1177]),
    ([0, 1], [-1, 925]),
    ([2, 0], [56, -1]),
    ([2, 0], [22, -1]),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WienerInfo {
    pub vfilter: [i32; WIENER_TAPS],
    pub hfilter: [i32; WIENER_TAPS],
}

impl Default for WienerInfo {
    fn default() -> Self {
        Self { vfilter: WIENER_TAPS_MID, hfilter: WIENER_TAPS_MID }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgrprojInfo {
    /// Index into [`SGR_PARAMS`].
    pub ep: u32,
    pub xqd: [i32; 2],
}

impl Default for SgrprojInfo {
    fn default() -> Self {
        Self { ep: 0, xqd: SGRPROJ_XQD_MID }
    }
}

/// Filter of a restoration unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestorationUnitInfo {
    /// Never `Switchable`.
    pub restoration_type: FrameRestorationType,
    pub wiener: WienerInfo,
    pub sgrproj: SgrprojInfo,
}

/// Restoration units of a plane, in raster order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneRestoration {
    pub frame_restoration_type: FrameRestorationType,
    /// Unit size in pixels of the plane.
    pub unit_size: u32,
    pub horz_units: u32,
    pub vert_units: u32,
    pub units: Vec<RestorationUnitInfo>,
}

/// Number of units along a dimension. The last unit absorbs a remainder
/// smaller than half a unit.
fn count_units(unit_size: u32, size: u32) -> u32 {
    ((size + (unit_size >> 1)) / unit_size).max(1)
}

impl PlaneRestoration {
    fn new(hdr: &FrameHeaderObu, plane: usize) -> Self {
        let lr = &hdr.loop_restoration_params;
        let frame_restoration_type =
            lr.frame_restoration_type.get(plane).copied().unwrap_or_default();
        if frame_restoration_type == FrameRestorationType::None {
            return Default::default();
        }

        let (ss_x, ss_y) = plane_subsampling(hdr, plane);
        let unit_size = lr.loop_restoration_size.get(plane).copied().unwrap_or_default() as u32;
        if unit_size == 0 {
            return Default::default();
        }

        let horz_units = count_units(unit_size, round2(hdr.upscaled_width as u64, ss_x) as u32);
        let vert_units = count_units(unit_size, round2(hdr.frame_height as u64, ss_y) as u32);

        Self {
            frame_restoration_type,
            unit_size,
            horz_units,
            vert_units,
            units: vec![Default::default(); (horz_units * vert_units) as usize],
        }
    }

    /// Returns the rows and columns of the units whose top left corner lies
    /// within the superblock at (`mi_row`, `mi_col`), or `None` if there are
    /// none.
    pub fn units_in_sb(
        &self,
        hdr: &FrameHeaderObu,
        plane: usize,
        mi_row: u32,
        mi_col: u32,
        sb_size: BlockSize,
    ) -> Option<(std::ops::Range<u32>, std::ops::Range<u32>)> {
        if self.frame_restoration_type == FrameRestorationType::None || self.unit_size == 0 {
            return None;
        }

        let (ss_x, ss_y) = plane_subsampling(hdr, plane);
        let size = self.unit_size;

        // Units are counted on the upscaled frame.
        let (mi_to_num_x, denom_x) = if hdr.superres_scaled() {
            ((MI_SIZE >> ss_x) * hdr.superres_denom, size * SUPERRES_NUM)
        } else {
            (MI_SIZE >> ss_x, size)
        };
        let mi_to_num_y = MI_SIZE >> ss_y;
        let denom_y = size;

        let col_end = mi_col + sb_size.mi_width();
        let row_end = mi_row + sb_size.mi_height();

        let rcol0 = (mi_col * mi_to_num_x).div_ceil(denom_x);
        let rcol1 = (col_end * mi_to_num_x).div_ceil(denom_x).min(self.horz_units);
        let rrow0 = (mi_row * mi_to_num_y).div_ceil(denom_y);
        let rrow1 = (row_end * mi_to_num_y).div_ceil(denom_y).min(self.vert_units);

        if rcol0 < rcol1 && rrow0 < rrow1 {
            Some((rrow0..rrow1, rcol0..rcol1))
        } else {
            None
        }
    }
}

/// Restoration units of the frame being decoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestorationUnits {
    pub planes: [PlaneRestoration; MAX_NUM_PLANES],
}

impl RestorationUnits {
    pub fn new(hdr: &FrameHeaderObu) -> Self {
        let mut units = Self::default();
        for (plane, p) in units.planes.iter_mut().enumerate().take(hdr.num_planes as usize) {
            *p = PlaneRestoration::new(hdr, plane);
        }

        units
    }

    /// Whether any plane is filtered.
    pub fn is_active(&self) -> bool {
        self.planes.iter().any(|p| p.frame_restoration_type != FrameRestorationType::None)
    }
}

fn plane_subsampling(hdr: &FrameHeaderObu, plane: usize) -> (u32, u32) {
    if plane > 0 {
        (hdr.subsampling_x as u32, hdr.subsampling_y as u32)
    } else {
        (0, 0)
    }
}

fn read_quniform<R: SymbolReader>(reader: &mut R, n: u32) -> u32 {
    if n <= 1 {
        return 0;
    }

    let l = floor_log2(n) + 1;
    let m = (1 << l) - n;
    let v = reader.read_literal(l - 1);
    if v < m {
        v
    } else {
        (v << 1) - m + reader.read_bool() as u32
    }
}

/// Reads a value in `0..n` with a subexponential code of parameter `k`.
fn read_subexpfin<R: SymbolReader>(reader: &mut R, n: u32, k: u32) -> u32 {
    let mut i = 0;
    let mut mk = 0;

    loop {
        let b = if i > 0 { k + i - 1 } else { k };
        let a = 1 << b;

        if n <= mk + 3 * a {
            return read_quniform(reader, n - mk) + mk;
        }

        if !reader.read_bool() {
            return reader.read_literal(b) + mk;
        }

        i += 1;
        mk += a;
    }
}

/// Reads a value in `min..=max` coded relative to `reference`.
fn read_refsubexpfin<R: SymbolReader>(
    reader: &mut R,
    min: i32,
    max: i32,
    k: u32,
    reference: i32,
) -> i32 {
    let n = max - min + 1;
    let r = (reference - min).clamp(0, n - 1);
    let v = read_subexpfin(reader, n as u32, k) as i32;

    let v = if (r << 1) <= n {
        inverse_recenter(r, v)
    } else {
        n - 1 - inverse_recenter(n - 1 - r, v)
    };

    v + min
}

fn read_wiener_filter<R: SymbolReader>(
    reader: &mut R,
    luma: bool,
    reference: &mut WienerInfo,
) -> WienerInfo {
    let read_taps = |reader: &mut R, reference: &[i32; WIENER_TAPS]| {
        let mut taps = [0; 3];
        for (i, tap) in taps.iter_mut().enumerate() {
            // Chroma filters are 5 taps wide.
            if i == 0 && !luma {
                continue;
            }

            *tap = read_refsubexpfin(
                reader,
                WIENER_TAPS_MIN[i],
                WIENER_TAPS_MAX[i],
                WIENER_TAPS_K[i],
                reference[i],
            );
        }

        let center = -2 * (taps[0] + taps[1] + taps[2]);
        [taps[0], taps[1], taps[2], center, taps[2], taps[1], taps[0]]
    };

    let vfilter = read_taps(reader, &reference.vfilter);
    let hfilter = read_taps(reader, &reference.hfilter);

    *reference = WienerInfo { vfilter, hfilter };
    *reference
}

fn read_sgrproj_filter<R: SymbolReader>(
    reader: &mut R,
    reference: &mut SgrprojInfo,
) -> SgrprojInfo {
    let ep = reader.read_literal(SGRPROJ_PARAMS_BITS);
    let (r, _) = SGR_PARAMS[ep as usize % SGR_PARAMS.len()];

    let mut read_xqd = |i: usize| {
        read_refsubexpfin(
            reader,
            SGRPROJ_XQD_MIN[i],
            SGRPROJ_XQD_MAX[i],
            SGRPROJ_PRJ_SUBEXP_K,
            reference.xqd[i],
        )
    };

    let xqd = match r {
        [0, _] => [0, read_xqd(1)],
        [_, 0] => {
            let xqd0 = read_xqd(0);
            let xqd1 =
                ((1 << SGRPROJ_PRJ_BITS) - xqd0).clamp(SGRPROJ_XQD_MIN[1], SGRPROJ_XQD_MAX[1]);
            [xqd0, xqd1]
        }
        _ => {
            let xqd0 = read_xqd(0);
            [xqd0, read_xqd(1)]
        }
    };

    *reference = SgrprojInfo { ep, xqd };
    *reference
}

impl<'a, B: StatelessAV1DecoderBackend> TileDecoder<'a, B> {
    /// Reads the coefficients of the restoration units starting in the
    /// superblock at (`mi_row`, `mi_col`).
    pub(super) fn read_lr_coefficients(&mut self, mi_row: u32, mi_col: u32, sb_size: BlockSize) {
        for plane in 0..(self.hdr.num_planes as usize).min(MAX_NUM_PLANES) {
            let Some((rows, cols)) =
                self.restoration.planes[plane].units_in_sb(self.hdr, plane, mi_row, mi_col, sb_size)
            else {
                continue;
            };

            for rrow in rows {
                for rcol in cols.clone() {
                    self.read_lr_unit(plane, rrow, rcol);
                }
            }
        }
    }

    fn read_lr_unit(&mut self, plane: usize, rrow: u32, rcol: u32) {
        let reader = &mut self.reader;
        let entropy = &mut self.entropy;
        let reference = &mut self.lr_refs[plane];
        let restoration = &mut self.restoration.planes[plane];
        let luma = plane == 0;

        let restoration_type = match restoration.frame_restoration_type {
            FrameRestorationType::None => return,
            FrameRestorationType::Switchable => {
                let symbol = reader.read_symbol(entropy.switchable_restore_cdf(), 3);
                FrameRestorationType::n(symbol as u32).unwrap_or_default()
            }
            FrameRestorationType::Wiener => {
                if reader.read_symbol(entropy.wiener_restore_cdf(), 2) != 0 {
                    FrameRestorationType::Wiener
                } else {
                    FrameRestorationType::None
                }
            }
            FrameRestorationType::Sgrproj => {
                if reader.read_symbol(entropy.sgrproj_restore_cdf(), 2) != 0 {
                    FrameRestorationType::Sgrproj
                } else {
                    FrameRestorationType::None
                }
            }
        };

        let mut info = RestorationUnitInfo { restoration_type, ..Default::default() };
        match restoration_type {
            FrameRestorationType::Wiener => {
                info.wiener = read_wiener_filter(reader, luma, &mut reference.wiener);
            }
            FrameRestorationType::Sgrproj => {
                info.sgrproj = read_sgrproj_filter(reader, &mut reference.sgrproj);
            }
            _ => (),
        }

        let idx = (rcol + rrow * restoration.horz_units) as usize;
        if let Some(unit) = restoration.units.get_mut(idx) {
            *unit = info;
        }
    }
}
