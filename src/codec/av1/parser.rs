// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parser for the uncompressed parts of an AV1 bitstream: OBU framing, the
//! sequence header, frame headers and tile group headers.
//!
//! The parser keeps the per-slot metadata it needs to resolve references
//! (`ReferenceFrameInfo`), so frames must be reported back through
//! [`Parser::ref_frame_update`] once they are decoded.

use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;

use crate::codec::av1::helpers;
use crate::codec::av1::reader::Reader;
use crate::decoder::Error;
use crate::Resolution;

pub const TOTAL_REFS_PER_FRAME: usize = 8;
pub const NUM_REF_FRAMES: usize = 8;
pub const REFS_PER_FRAME: usize = 7;
pub const MAX_SEGMENTS: usize = 8;
pub const SEG_LVL_ALT_Q: usize = 0;
pub const SEG_LVL_REF_FRAME: usize = 5;
pub const SEG_LVL_MAX: usize = 8;
pub const MAX_TILE_COLS: usize = 64;
pub const MAX_TILE_ROWS: usize = 64;
pub const CDEF_MAX: usize = 1 << 3;
pub const MAX_NUM_PLANES: usize = 3;
pub const MAX_NUM_Y_POINTS: usize = 16;
pub const MAX_NUM_CB_POINTS: usize = 16;
pub const MAX_NUM_CR_POINTS: usize = 16;
pub const MAX_NUM_POS_LUMA: usize = 25;
pub const MAX_NUM_SPATIAL_LAYERS: usize = 4;
pub const MAX_NUM_TEMPORAL_LAYERS: usize = 8;
pub const MAX_NUM_OPERATING_POINTS: usize = MAX_NUM_SPATIAL_LAYERS * MAX_NUM_TEMPORAL_LAYERS;
pub const SELECT_SCREEN_CONTENT_TOOLS: u32 = 2;
pub const SELECT_INTEGER_MV: u32 = 2;
pub const PRIMARY_REF_NONE: u32 = 7;
pub const ALL_FRAMES: u32 = (1 << NUM_REF_FRAMES) - 1;
pub const SUPERRES_DENOM_BITS: usize = 3;
pub const SUPERRES_DENOM_MIN: u32 = 9;
pub const SUPERRES_NUM: u32 = 8;
pub const MAX_TILE_WIDTH: u32 = 4096;
pub const MAX_TILE_AREA: u32 = 4096 * 2304;
pub const RESTORATION_TILESIZE_MAX: u16 = 256;
pub const WARPEDMODEL_PREC_BITS: u32 = 16;
pub const WARP_PARAM_REDUCE_BITS: u32 = 6;
pub const GM_ABS_ALPHA_BITS: u32 = 12;
pub const GM_ALPHA_PREC_BITS: u32 = 15;
pub const GM_ABS_TRANS_ONLY_BITS: u32 = 9;
pub const GM_TRANS_ONLY_PREC_BITS: u32 = 3;
pub const GM_ABS_TRANS_BITS: u32 = 12;
pub const GM_TRANS_PREC_BITS: u32 = 6;

/// Largest number of luma film grain scaling points a stream may signal.
const MAX_FILM_GRAIN_Y_POINTS: u8 = 14;
/// Largest number of chroma film grain scaling points, per plane.
const MAX_FILM_GRAIN_CHROMA_POINTS: u8 = 10;

/// Number of bits used to code each segmentation feature.
pub const FEATURE_BITS: [u8; SEG_LVL_MAX] = [8, 6, 6, 6, 6, 3, 0, 0];
/// Whether the segmentation feature is a signed value.
pub const FEATURE_SIGNED: [bool; SEG_LVL_MAX] = [true, true, true, true, true, false, false, false];
/// Magnitude limit applied to each decoded segmentation feature.
pub const FEATURE_MAX: [i32; SEG_LVL_MAX] = [255, 63, 63, 63, 63, 7, 0, 0];

/// Loop filter reference deltas used whenever no previous frame provides them.
pub const DEFAULT_LOOP_FILTER_REF_DELTAS: [i8; TOTAL_REFS_PER_FRAME] = [1, 0, 0, 0, -1, 0, -1, -1];

const LR_TYPE_REMAP: [FrameRestorationType; 4] = [
    FrameRestorationType::None,
    FrameRestorationType::Switchable,
    FrameRestorationType::Wiener,
    FrameRestorationType::Sgrproj,
];

/// Wraps an error the decoder refuses to handle even though the syntax is
/// valid.
fn unsupported(msg: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(Error::UnsupportedBitstream(msg.into()))
}

/// What to do with an OBU found by [`Parser::read_obu`].
pub enum ObuAction<'a> {
    /// The OBU is meant for us and should be passed to [`Parser::parse_obu`].
    Process(Obu<'a>),
    /// The OBU should be skipped. The value is the number of bytes to advance.
    Drop(usize),
}

/// Result of parsing a single OBU.
pub enum ParsedObu<'a> {
    SequenceHeader(Rc<SequenceHeaderObu>),
    TemporalDelimiter,
    FrameHeader(FrameHeaderObu),
    TileGroup(TileGroupObu<'a>),
    Frame(FrameObu<'a>),
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObuType {
    #[default]
    Reserved = 0,
    SequenceHeader = 1,
    TemporalDelimiter = 2,
    FrameHeader = 3,
    TileGroup = 4,
    Metadata = 5,
    Frame = 6,
    RedundantFrameHeader = 7,
    TileList = 8,
    Reserved2 = 9,
    Reserved3 = 10,
    Reserved4 = 11,
    Reserved5 = 12,
    Reserved6 = 13,
    Reserved7 = 14,
    Padding = 15,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Profile {
    #[default]
    Profile0 = 0,
    Profile1 = 1,
    Profile2 = 2,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObuHeader {
    pub obu_type: ObuType,
    /// Whether the header has the extension byte carrying the layer ids.
    pub extension_flag: bool,
    /// Whether `obu_size` follows the header.
    pub has_size_field: bool,
    /// Temporal layer of the OBU, zero without extension.
    pub temporal_id: u32,
    /// Spatial layer of the OBU, zero without extension.
    pub spatial_id: u32,
}

/// A single OBU, with its payload split from the header and size field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Obu<'a> {
    pub header: ObuHeader,
    /// The OBU payload, i.e. `obu_size` bytes following the size field.
    pub data: &'a [u8],
    /// Total number of bytes taken by the OBU in the input, header included.
    pub bytes_used: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TileGroupObu<'a> {
    /// The OBU backing this tile group.
    pub obu: Obu<'a>,
    /// Whether `tg_start` and `tg_end` were coded. If not, the tile group
    /// covers the whole frame.
    pub tile_start_and_end_present_flag: bool,
    /// Index of the first tile of the group, in raster order.
    pub tg_start: u32,
    /// Index of the last tile of the group, included.
    pub tg_end: u32,
    /// The tile payload, starting with the first tile's size field.
    pub tile_data: &'a [u8],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatingPoint {
    /// Level the sequence conforms to when this operating point is selected.
    pub seq_level_idx: u32,
    /// Tier the sequence conforms to when this operating point is selected.
    pub seq_tier: u32,
    /// Which spatial (bits 8..11) and temporal (bits 0..7) layers belong to
    /// this operating point. Zero means every layer.
    pub idc: u32,
    /// Whether a decoder model is associated with this operating point.
    pub decoder_model_present_for_this_op: bool,
    /// Delay between the arrival of the first bit in the smoothing buffer and
    /// the removal of the first frame, in units of 1/90000 seconds.
    pub decoder_buffer_delay: u32,
    /// First bit arrival time of frames in the smoothing buffer, together
    /// with `decoder_buffer_delay`, in units of 1/90000 seconds.
    pub encoder_buffer_delay: u32,
    /// Whether the smoothing buffer operates in low-delay mode, where late
    /// decode times and buffer underflow are permitted.
    pub low_delay_mode_flag: bool,
    /// Whether `initial_display_delay_minus_1` is coded for this operating
    /// point.
    pub initial_display_delay_present_for_this_op: bool,
    /// Plus 1, the number of decoded frames to hold in the buffer pool
    /// before the first presentable frame is displayed.
    pub initial_display_delay_minus_1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimingInfo {
    /// Time units of a `time_scale` Hz clock in one display clock tick.
    pub num_units_in_display_tick: u32,
    /// Number of time units in one second.
    pub time_scale: u32,
    /// Whether pictures are displayed at a fixed number of ticks apart.
    pub equal_picture_interval: bool,
    /// Plus 1, the number of ticks between two consecutive pictures in output
    /// order.
    pub num_ticks_per_picture_minus_1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderModelInfo {
    /// Plus 1, the length in bits of `decoder_buffer_delay` and
    /// `encoder_buffer_delay`.
    pub buffer_delay_length_minus_1: u32,
    /// Time units of a `time_scale` Hz clock in one decoding clock tick.
    pub num_units_in_decoding_tick: u32,
    /// Plus 1, the length in bits of `buffer_removal_time`.
    pub buffer_removal_time_length_minus_1: u32,
    /// Plus 1, the length in bits of `frame_presentation_time`.
    pub frame_presentation_time_length_minus_1: u32,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ColorPrimaries {
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Bt470M = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    GenericFilm = 8,
    Bt2020 = 9,
    Xyz = 10,
    Smpte431 = 11,
    Smpte432 = 12,
    Ebu3213 = 22,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferCharacteristics {
    Reserved0 = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Reserved3 = 3,
    Bt470m = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    Linear = 8,
    Log100 = 9,
    Log100Sqrt10 = 10,
    Iec61966 = 11,
    Bt1361 = 12,
    Srgb = 13,
    Bt202010Bit = 14,
    Bt202012Bit = 15,
    Smpte2084 = 16,
    Smpte428 = 17,
    Hlg = 18,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum BitDepth {
    #[default]
    Depth8,
    Depth10,
    Depth12,
}

impl BitDepth {
    pub fn bits(self) -> u32 {
        match self {
            BitDepth::Depth8 => 8,
            BitDepth::Depth10 => 10,
            BitDepth::Depth12 => 12,
        }
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatrixCoefficients {
    Identity = 0,
    Bt709 = 1,
    #[default]
    Unspecified = 2,
    Reserved3 = 3,
    Fcc = 4,
    Bt470bg = 5,
    Bt601 = 6,
    Smpte240 = 7,
    Ycgco = 8,
    Bt2020Ncl = 9,
    Bt2020Cl = 10,
    Smpte2085 = 11,
    ChromaDerivedNcl = 12,
    ChromaDerivedCl = 13,
    Ictcp = 14,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChromaSamplePosition {
    #[default]
    Unknown = 0,
    Vertical = 1,
    Colocated = 2,
    Reserved = 3,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorConfig {
    /// Together with `twelve_bit` and the profile, selects the bit depth.
    pub high_bitdepth: bool,
    pub twelve_bit: bool,
    /// The stream has no U and V planes.
    pub mono_chrome: bool,
    /// Whether the primaries, transfer characteristics and matrix
    /// coefficients are coded.
    pub color_description_present_flag: bool,
    /// As in ISO/IEC 23091-4/ITU-T H.273.
    pub color_primaries: ColorPrimaries,
    /// As in ISO/IEC 23091-4/ITU-T H.273.
    pub transfer_characteristics: TransferCharacteristics,
    /// As in ISO/IEC 23091-4/ITU-T H.273.
    pub matrix_coefficients: MatrixCoefficients,
    /// Full swing if set, studio swing otherwise.
    pub color_range: bool,
    /// Horizontal chroma subsampling.
    pub subsampling_x: bool,
    /// Vertical chroma subsampling.
    pub subsampling_y: bool,
    /// Sample position of subsampled chroma.
    pub chroma_sample_position: ChromaSamplePosition,
    /// Whether U and V may have separate delta quantizers.
    pub separate_uv_delta_q: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceHeaderObu {
    /// Header of the OBU carrying this sequence header.
    pub obu_header: ObuHeader,
    /// Features that can be used in the sequence.
    pub seq_profile: Profile,
    /// The sequence holds a single coded frame.
    pub still_picture: bool,
    /// Syntax elements a still picture does not need are omitted.
    pub reduced_still_picture_header: bool,
    /// Minus 1, the number of bits of the frame width fields.
    pub frame_width_bits_minus_1: u32,
    /// Minus 1, the number of bits of the frame height fields.
    pub frame_height_bits_minus_1: u32,
    pub max_frame_width_minus_1: u32,
    pub max_frame_height_minus_1: u32,
    /// Whether frames carry frame ids.
    pub frame_id_numbers_present_flag: bool,
    /// Minus 2, the number of bits of `delta_frame_id`.
    pub delta_frame_id_length_minus_2: u32,
    /// Used with `delta_frame_id_length_minus_2` to size frame ids.
    pub additional_frame_id_length_minus_1: u32,
    /// Superblocks are 128x128 luma samples instead of 64x64.
    pub use_128x128_superblock: bool,
    /// Blocks may use filter intra.
    pub enable_filter_intra: bool,
    /// Whether intra edges are filtered.
    pub enable_intra_edge_filter: bool,
    /// Inter blocks may code `interintra`.
    pub enable_interintra_compound: bool,
    /// Inter blocks may code `compound_type`.
    pub enable_masked_compound: bool,
    /// Frames may code `allow_warped_motion`.
    pub enable_warped_motion: bool,
    /// Tools based on order hints may be used.
    pub enable_order_hint: bool,
    /// Interpolation filters may differ horizontally and vertically.
    pub enable_dual_filter: bool,
    /// Distance weighted compound prediction may be used.
    pub enable_jnt_comp: bool,
    /// Frames may code `use_ref_frame_mvs`.
    pub enable_ref_frame_mvs: bool,
    /// If set, `seq_force_screen_content_tools` is not coded and selects per
    /// frame.
    pub seq_choose_screen_content_tools: bool,
    /// `SELECT_SCREEN_CONTENT_TOOLS` if frames code
    /// `allow_screen_content_tools`, its value otherwise.
    pub seq_force_screen_content_tools: u32,
    /// If set, `seq_force_integer_mv` is not coded and selects per frame.
    pub seq_choose_integer_mv: bool,
    /// `SELECT_INTEGER_MV` if frames code `force_integer_mv`, its value
    /// otherwise.
    pub seq_force_integer_mv: u32,
    /// Number of bits of `order_hint`.
    pub order_hint_bits: u32,
    /// Frames code `use_superres`.
    pub enable_superres: bool,
    /// CDEF may be enabled.
    pub enable_cdef: bool,
    /// Loop restoration may be enabled.
    pub enable_restoration: bool,
    /// Whether frames carry film grain parameters.
    pub film_grain_params_present: bool,
    /// Minus 1, the number of operating points.
    pub operating_points_cnt_minus_1: u32,
    pub operating_points: [OperatingPoint; MAX_NUM_OPERATING_POINTS],
    pub decoder_model_info_present_flag: bool,
    pub decoder_model_info: DecoderModelInfo,
    pub initial_display_delay_present_flag: bool,
    pub timing_info_present_flag: bool,
    pub timing_info: TimingInfo,
    pub color_config: ColorConfig,

    /* CamelCase variables in the specification */
    pub bit_depth: BitDepth,
    pub num_planes: u32,
}

impl SequenceHeaderObu {
    /// Returns `idLen`, the number of bits used for frame ids.
    pub fn frame_id_length(&self) -> u32 {
        self.additional_frame_id_length_minus_1 + self.delta_frame_id_length_minus_2 + 3
    }

    pub fn max_frame_width(&self) -> u32 {
        self.max_frame_width_minus_1 + 1
    }

    pub fn max_frame_height(&self) -> u32 {
        self.max_frame_height_minus_1 + 1
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterpolationFilter {
    #[default]
    EightTap = 0,
    EightTapSmooth = 1,
    EightTapSharp = 2,
    Bilinear = 3,
    Switchable = 4,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameRestorationType {
    #[default]
    None = 0,
    Wiener = 1,
    Sgrproj = 2,
    Switchable = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReferenceFrameType {
    #[default]
    Intra = 0,
    Last = 1,
    Last2 = 2,
    Last3 = 3,
    Golden = 4,
    BwdRef = 5,
    AltRef2 = 6,
    AltRef = 7,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarpModelType {
    #[default]
    Identity = 0,
    Translation = 1,
    RotZoom = 2,
    Affine = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
    IntraOnlyFrame = 2,
    SwitchFrame = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxMode {
    #[default]
    Only4x4 = 0,
    Largest = 1,
    Select = 2,
}

/// Whether the entropy context adapted while decoding this frame is kept for
/// the frames that follow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshFrameContext {
    #[default]
    Disabled,
    Backward,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameObu<'a> {
    pub header: FrameHeaderObu,
    pub tile_group: TileGroupObu<'a>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeaderObu {
    /// Header of the OBU carrying this frame header.
    pub obu_header: ObuHeader,
    /// The frame of slot `frame_to_show_map_idx` is output instead of a new
    /// frame.
    pub show_existing_frame: bool,
    /// Slot to show when `show_existing_frame` is set.
    pub frame_to_show_map_idx: u32,
    pub frame_presentation_time: u32,
    /// Frame id of the shown existing frame.
    pub display_frame_id: u32,
    pub frame_type: FrameType,
    /// The frame is output once decoded.
    pub show_frame: bool,
    /// The frame may be output later through `show_existing_frame`.
    pub showable_frame: bool,
    /// The frame does not depend on state carried over from other frames.
    pub error_resilient_mode: bool,
    /// Symbol decoding does not adapt the CDFs.
    pub disable_cdf_update: bool,
    pub allow_screen_content_tools: u32,
    pub force_integer_mv: u32,
    pub current_frame_id: u32,
    /// The frame size is coded instead of taken from the sequence.
    pub frame_size_override_flag: bool,
    pub order_hint: u32,
    /// Reference whose state this frame starts from, `PRIMARY_REF_NONE` to
    /// start from defaults.
    pub primary_ref_frame: u32,
    pub buffer_removal_time_present_flag: bool,
    pub buffer_removal_time: Vec<u32>,
    /// Bit i set means slot i is replaced by this frame.
    pub refresh_frame_flags: u32,
    /// Order hints the encoder expects in each slot, in error resilient mode.
    pub ref_order_hint: [u32; NUM_REF_FRAMES],
    /// Blocks may be predicted from the frame being decoded.
    pub allow_intrabc: bool,
    pub frame_refs_short_signaling: bool,
    pub last_frame_idx: u8,
    pub gold_frame_idx: u8,
    /// Slot used by each of LAST_FRAME..ALTREF_FRAME.
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    pub allow_high_precision_mv: bool,
    pub is_motion_mode_switchable: bool,
    pub use_ref_frame_mvs: bool,
    /// The adapted CDFs are not kept at the end of the frame.
    pub disable_frame_end_update_cdf: bool,
    pub refresh_frame_context: RefreshFrameContext,
    pub allow_warped_motion: bool,
    pub reduced_tx_set: bool,
    pub render_and_frame_size_different: bool,
    /// The frame is coded at a reduced width and upscaled after CDEF.
    pub use_superres: bool,
    pub is_filter_switchable: bool,
    pub interpolation_filter: InterpolationFilter,
    pub loop_filter_params: LoopFilterParams,
    pub quantization_params: QuantizationParams,
    pub segmentation_params: SegmentationParams,
    pub tile_info: TileInfo,
    pub cdef_params: CdefParams,
    pub loop_restoration_params: LoopRestorationParams,
    pub skip_mode_present: bool,
    /// Blocks may use compound prediction.
    pub reference_select: bool,
    pub global_motion_params: GlobalMotionParams,
    pub film_grain_params: FilmGrainParams,

    /* Values derived while parsing */
    /// Superres scale denominator, out of 8.
    pub superres_denom: u32,
    pub frame_is_intra: bool,
    pub order_hints: [u32; NUM_REF_FRAMES],
    pub ref_frame_sign_bias: [bool; NUM_REF_FRAMES],
    /// Every segment is lossless.
    pub coded_lossless: bool,
    /// Coded lossless without superres.
    pub all_lossless: bool,
    pub lossless_array: [bool; MAX_SEGMENTS],
    pub seg_qm_level: [[u32; MAX_SEGMENTS]; 3],
    /// Width after superres upscaling.
    pub upscaled_width: u32,
    /// Coded width.
    pub frame_width: u32,
    pub frame_height: u32,
    pub render_width: u32,
    pub render_height: u32,
    pub tx_mode: TxMode,
    pub skip_mode_frame: [u32; 2],
    /// Frame size in 4x4 units, rounded up to 8x8.
    pub mi_cols: u32,
    pub mi_rows: u32,

    /* Sequence level values the decoder needs for every frame */
    pub bit_depth: BitDepth,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    pub num_planes: u32,
    pub use_128x128_superblock: bool,

    /// Whether the frame was parsed in large scale tile mode.
    pub large_scale_tile: bool,
    /// Large scale tile frames that need no in-loop filtering can have a
    /// single tile decoded on its own.
    pub single_tile_decoding: bool,
    /// Slots that were empty when an error resilient frame signaled their
    /// order hints. The decoder must back them with neutral grey frames.
    pub placeholder_refs: u8,
    /// Set when a shown existing frame was a key frame, in which case the
    /// decoder state is reset as if the key frame was decoded again.
    pub reset_decoder_state: bool,
    /// Size in bytes of the uncompressed header, including the OBU header.
    pub header_bytes: usize,
}

impl FrameHeaderObu {
    pub fn frame_is_intra(&self) -> bool {
        matches!(self.frame_type, FrameType::KeyFrame | FrameType::IntraOnlyFrame)
    }

    pub fn superres_scaled(&self) -> bool {
        self.frame_width != self.upscaled_width
    }

    /// Returns the slot holding the context this frame starts from, if any.
    pub fn primary_ref_slot(&self) -> Option<usize> {
        if self.primary_ref_frame == PRIMARY_REF_NONE {
            None
        } else {
            self.ref_frame_idx.get(self.primary_ref_frame as usize).map(|&idx| idx as usize)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopFilterParams {
    /// Levels for luma vertical, luma horizontal, U and V.
    pub loop_filter_level: [u8; 4],
    pub loop_filter_sharpness: u8,
    pub loop_filter_delta_enabled: bool,
    pub loop_filter_delta_update: bool,
    pub loop_filter_ref_deltas: [i8; TOTAL_REFS_PER_FRAME],
    pub loop_filter_mode_deltas: [i8; 2],
    pub delta_lf_present: bool,
    pub delta_lf_res: u32,
    pub delta_lf_multi: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuantizationParams {
    pub base_q_idx: u32,
    pub diff_uv_delta: bool,
    pub using_qmatrix: bool,
    pub qm_y: u32,
    pub qm_u: u32,
    pub qm_v: u32,
    pub delta_q_present: bool,
    pub delta_q_res: u32,
    pub delta_q_y_dc: i32,
    pub delta_q_u_dc: i32,
    pub delta_q_u_ac: i32,
    pub delta_q_v_dc: i32,
    pub delta_q_v_ac: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentationParams {
    pub segmentation_enabled: bool,
    pub segmentation_update_map: bool,
    pub segmentation_temporal_update: bool,
    pub segmentation_update_data: bool,
    pub feature_enabled: [[bool; SEG_LVL_MAX]; MAX_SEGMENTS],
    pub feature_data: [[i16; SEG_LVL_MAX]; MAX_SEGMENTS],
    pub seg_id_pre_skip: bool,
    pub last_active_seg_id: u32,
}

impl SegmentationParams {
    pub fn feature_active(&self, segment_id: usize, feature: usize) -> bool {
        self.segmentation_enabled
            && self
                .feature_enabled
                .get(segment_id)
                .and_then(|f| f.get(feature))
                .copied()
                .unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileInfo {
    pub uniform_tile_spacing_flag: bool,
    pub context_update_tile_id: u32,
    /// Start of each tile column in MI units. Entry `tile_cols` holds
    /// `mi_cols`.
    pub mi_col_starts: [u32; MAX_TILE_COLS + 1],
    /// Start of each tile row in MI units. Entry `tile_rows` holds `mi_rows`.
    pub mi_row_starts: [u32; MAX_TILE_ROWS + 1],
    pub tile_cols_log2: u32,
    pub tile_cols: u32,
    pub tile_rows_log2: u32,
    pub tile_rows: u32,
    /// Number of bytes used for each tile size field.
    pub tile_size_bytes: u32,
    /// Number of bytes used for each tile column size field. Only used in
    /// large scale tile mode.
    pub tile_col_size_bytes: u32,
    /// Tile dimensions in MI units. Only set in large scale tile mode.
    pub tile_width_mi: u32,
    pub tile_height_mi: u32,
}

impl Default for TileInfo {
    fn default() -> Self {
        Self {
            uniform_tile_spacing_flag: Default::default(),
            context_update_tile_id: Default::default(),
            mi_col_starts: [0; MAX_TILE_COLS + 1],
            mi_row_starts: [0; MAX_TILE_ROWS + 1],
            tile_cols_log2: Default::default(),
            tile_cols: Default::default(),
            tile_rows_log2: Default::default(),
            tile_rows: Default::default(),
            tile_size_bytes: Default::default(),
            tile_col_size_bytes: Default::default(),
            tile_width_mi: Default::default(),
            tile_height_mi: Default::default(),
        }
    }
}

impl TileInfo {
    pub fn num_tiles(&self) -> u32 {
        self.tile_cols * self.tile_rows
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CdefParams {
    pub cdef_damping: u32,
    pub cdef_bits: u32,
    pub cdef_y_pri_strength: [u32; CDEF_MAX],
    pub cdef_y_sec_strength: [u32; CDEF_MAX],
    pub cdef_uv_pri_strength: [u32; CDEF_MAX],
    pub cdef_uv_sec_strength: [u32; CDEF_MAX],
}

impl CdefParams {
    /// Whether CDEF would leave every pixel untouched.
    pub fn is_noop(&self) -> bool {
        self.cdef_bits == 0
            && self.cdef_y_pri_strength[0] == 0
            && self.cdef_y_sec_strength[0] == 0
            && self.cdef_uv_pri_strength[0] == 0
            && self.cdef_uv_sec_strength[0] == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopRestorationParams {
    pub lr_unit_shift: u8,
    pub lr_uv_shift: u8,
    pub frame_restoration_type: [FrameRestorationType; MAX_NUM_PLANES],
    pub loop_restoration_size: [u16; MAX_NUM_PLANES],
    pub uses_lr: bool,
    pub uses_chroma_lr: bool,
}

impl Default for LoopRestorationParams {
    fn default() -> Self {
        Self {
            lr_unit_shift: 0,
            lr_uv_shift: 0,
            frame_restoration_type: [FrameRestorationType::None; MAX_NUM_PLANES],
            loop_restoration_size: [RESTORATION_TILESIZE_MAX; MAX_NUM_PLANES],
            uses_lr: false,
            uses_chroma_lr: false,
        }
    }
}

/// Global motion models, indexed by reference frame (`LAST_FRAME` is 1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalMotionParams {
    pub is_global: [bool; NUM_REF_FRAMES],
    pub is_rot_zoom: [bool; NUM_REF_FRAMES],
    pub is_translation: [bool; NUM_REF_FRAMES],
    /// The decoded parameters. They are kept as decoded even when the model
    /// failed the shear check, as following frames code their parameters
    /// relative to them.
    pub gm_params: [[i32; 6]; NUM_REF_FRAMES],
    pub warp_valid: [bool; NUM_REF_FRAMES],
    pub gm_type: [WarpModelType; NUM_REF_FRAMES],
}

const IDENTITY_WARP_PARAMS: [i32; 6] =
    [0, 0, 1 << WARPEDMODEL_PREC_BITS, 0, 0, 1 << WARPEDMODEL_PREC_BITS];

impl Default for GlobalMotionParams {
    fn default() -> Self {
        Self {
            is_global: Default::default(),
            is_rot_zoom: Default::default(),
            is_translation: Default::default(),
            gm_params: [IDENTITY_WARP_PARAMS; NUM_REF_FRAMES],
            warp_valid: [true; NUM_REF_FRAMES],
            gm_type: Default::default(),
        }
    }
}

impl GlobalMotionParams {
    /// Returns the model to use when predicting from `ref_frame`. Models that
    /// failed the shear check are replaced by the identity model.
    pub fn model(&self, ref_frame: usize) -> (WarpModelType, [i32; 6]) {
        match (self.gm_type.get(ref_frame), self.gm_params.get(ref_frame)) {
            (Some(&gm_type), Some(&params)) if self.warp_valid[ref_frame] => (gm_type, params),
            _ => (WarpModelType::Identity, IDENTITY_WARP_PARAMS),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilmGrainParams {
    pub apply_grain: bool,
    pub grain_seed: u16,
    pub update_grain: bool,
    pub film_grain_params_ref_idx: u8,
    pub num_y_points: u8,
    pub point_y_value: [u8; MAX_NUM_Y_POINTS],
    pub point_y_scaling: [u8; MAX_NUM_Y_POINTS],
    pub chroma_scaling_from_luma: bool,
    pub num_cb_points: u8,
    pub point_cb_value: [u8; MAX_NUM_CB_POINTS],
    pub point_cb_scaling: [u8; MAX_NUM_CB_POINTS],
    pub num_cr_points: u8,
    pub point_cr_value: [u8; MAX_NUM_CR_POINTS],
    pub point_cr_scaling: [u8; MAX_NUM_CR_POINTS],
    pub grain_scaling_minus_8: u8,
    pub ar_coeff_lag: u32,
    pub ar_coeffs_y_plus_128: [u8; MAX_NUM_POS_LUMA],
    pub ar_coeffs_cb_plus_128: [u8; MAX_NUM_POS_LUMA],
    pub ar_coeffs_cr_plus_128: [u8; MAX_NUM_POS_LUMA],
    pub ar_coeff_shift_minus_6: u8,
    pub grain_scale_shift: u8,
    pub cb_mult: u8,
    pub cb_luma_mult: u8,
    pub cb_offset: u16,
    pub cr_mult: u8,
    pub cr_luma_mult: u8,
    pub cr_offset: u16,
    pub overlap_flag: bool,
    pub clip_to_restricted_range: bool,
}

/// What the parser remembers about each reference slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceFrameInfo {
    /// The slot holds a frame (possibly a grey placeholder).
    pub ref_valid: bool,
    /// The slot's frame id is inside the window of ids that may be referenced.
    pub valid_for_referencing: bool,
    pub ref_frame_id: u32,
    pub ref_upscaled_width: u32,
    pub ref_frame_width: u32,
    pub ref_frame_height: u32,
    pub ref_render_width: u32,
    pub ref_render_height: u32,
    pub ref_mi_cols: u32,
    pub ref_mi_rows: u32,
    pub ref_frame_type: FrameType,
    pub ref_subsampling_x: bool,
    pub ref_subsampling_y: bool,
    pub ref_bit_depth: BitDepth,
    pub ref_order_hint: u32,
    pub ref_showable_frame: bool,
    pub film_grain_params_present: bool,
    pub segmentation_params: SegmentationParams,
    pub global_motion_params: GlobalMotionParams,
    pub loop_filter_params: LoopFilterParams,
    pub film_grain_params: FilmGrainParams,
}

#[derive(Debug)]
pub struct Parser {
    operating_point: u32,
    operating_point_idc: u32,
    large_scale_tile: bool,
    max_decode_dimensions: Option<Resolution>,
    seen_frame_header: bool,
    /// Set after a decoding error. Only a key or intra-only frame can bring
    /// the parser back to a known state.
    need_resync: bool,
    ref_info: [ReferenceFrameInfo; NUM_REF_FRAMES],
    current_frame_id: u32,

    pub last_frame_header: Option<FrameHeaderObu>,
    pub sequence_header: Option<Rc<SequenceHeaderObu>>,
}

impl Parser {
    /// Enables large scale tile mode for the frames parsed from now on.
    pub fn set_large_scale_tile(&mut self, large_scale_tile: bool) {
        self.large_scale_tile = large_scale_tile;
    }

    /// Frames larger than `max` are rejected as corrupted.
    pub fn set_max_decode_dimensions(&mut self, max: Option<Resolution>) {
        self.max_decode_dimensions = max;
    }

    /// Requires the next frame to be a key or intra-only frame, and forgets
    /// every reference when it arrives.
    pub fn set_need_resync(&mut self) {
        self.need_resync = true;
    }

    pub fn ref_info(&self, slot: usize) -> Option<&ReferenceFrameInfo> {
        self.ref_info.get(slot)
    }

    fn sequence(&self) -> anyhow::Result<&SequenceHeaderObu> {
        self.sequence_header.as_deref().ok_or(anyhow!("No sequence header"))
    }

    fn sequence_rc(&self) -> anyhow::Result<Rc<SequenceHeaderObu>> {
        self.sequence_header.clone().ok_or(anyhow!("No sequence header"))
    }

    fn parse_obu_header(r: &mut Reader) -> anyhow::Result<ObuHeader> {
        if r.read_bit()? {
            return Err(anyhow!("obu_forbidden_bit is set"));
        }

        let obu_type = r.read_bits(4)?;
        let mut header = ObuHeader {
            obu_type: ObuType::n(obu_type).ok_or(anyhow!("Invalid OBU type {}", obu_type))?,
            extension_flag: r.read_bit()?,
            has_size_field: r.read_bit()?,
            temporal_id: 0,
            spatial_id: 0,
        };

        // obu_reserved_1bit. Decoders must ignore its value.
        r.skip(1)?;

        if header.extension_flag {
            header.temporal_id = r.read_bits(3)?;
            header.spatial_id = r.read_bits(2)?;
            r.skip(3)?;
        }

        Ok(header)
    }

    /// Reads the OBU at the start of `data`, which must be in the low-overhead
    /// bitstream format.
    pub fn read_obu<'a>(&self, data: &'a [u8]) -> anyhow::Result<ObuAction<'a>> {
        if data.is_empty() {
            return Err(anyhow!("Empty data"));
        }

        let mut r = Reader::new(data);
        let header = Self::parse_obu_header(&mut r)?;
        if !header.has_size_field {
            return Err(unsupported("OBUs without obu_size are not supported"));
        }

        let obu_size = r.read_leb128()? as usize;
        let start = (r.position() / 8) as usize;
        let end = start.checked_add(obu_size).filter(|&end| end <= data.len()).ok_or(anyhow!(
            "Truncated OBU: {} bytes declared, {} available",
            obu_size,
            data.len() - start
        ))?;

        log::debug!("Identified OBU type {:?}, obu_size: {}", header.obu_type, obu_size);

        match header.obu_type {
            ObuType::Metadata | ObuType::Padding | ObuType::TileList => {
                log::debug!("Dropping OBU of type {:?}", header.obu_type);
                return Ok(ObuAction::Drop(end));
            }
            ObuType::Reserved
            | ObuType::Reserved2
            | ObuType::Reserved3
            | ObuType::Reserved4
            | ObuType::Reserved5
            | ObuType::Reserved6
            | ObuType::Reserved7 => {
                log::warn!("Dropping reserved OBU type {:?}", header.obu_type);
                return Ok(ObuAction::Drop(end));
            }
            _ => (),
        }

        if header.obu_type != ObuType::SequenceHeader
            && header.obu_type != ObuType::TemporalDelimiter
            && self.operating_point_idc != 0
            && header.extension_flag
        {
            let in_temporal_layer = ((self.operating_point_idc >> header.temporal_id) & 1) != 0;
            let in_spatial_layer = ((self.operating_point_idc >> (header.spatial_id + 8)) & 1) != 0;
            if !in_temporal_layer || !in_spatial_layer {
                log::debug!(
                    "Dropping OBU from layer t{} s{} outside of operating point {}",
                    header.temporal_id,
                    header.spatial_id,
                    self.operating_point
                );
                return Ok(ObuAction::Drop(end));
            }
        }

        Ok(ObuAction::Process(Obu { header, data: &data[start..end], bytes_used: end }))
    }

    /// Parses an OBU previously returned by [`Parser::read_obu`].
    pub fn parse_obu<'a>(&mut self, obu: Obu<'a>) -> anyhow::Result<ParsedObu<'a>> {
        match obu.header.obu_type {
            ObuType::SequenceHeader => {
                self.parse_sequence_header_obu(&obu).map(ParsedObu::SequenceHeader)
            }
            ObuType::TemporalDelimiter => {
                self.parse_temporal_delimiter_obu(&obu)?;
                Ok(ParsedObu::TemporalDelimiter)
            }
            ObuType::FrameHeader | ObuType::RedundantFrameHeader => {
                self.parse_frame_header_obu(&obu).map(ParsedObu::FrameHeader)
            }
            ObuType::TileGroup => self.parse_tile_group_obu(obu).map(ParsedObu::TileGroup),
            ObuType::Frame => self.parse_frame_obu(obu).map(ParsedObu::Frame),
            other => Err(anyhow!("OBU type {:?} cannot be parsed", other)),
        }
    }

    fn skip_and_check_trailing_bits(r: &mut Reader, obu: &Obu) -> anyhow::Result<()> {
        if obu.data.is_empty() {
            return Ok(());
        }

        let num_trailing = (obu.data.len() as u64 * 8)
            .checked_sub(r.position())
            .ok_or(anyhow!("OBU payload overran its size"))?;
        r.read_trailing_bits(num_trailing)
    }

    /// Selects an operating point. Only call this after the sequence header
    /// the operating point applies to has been parsed.
    pub fn choose_operating_point(&mut self, operating_point: u32) -> anyhow::Result<()> {
        let seq = self.sequence()?;
        if operating_point > seq.operating_points_cnt_minus_1 {
            return Err(anyhow!(
                "Invalid operating point {} (max {})",
                operating_point,
                seq.operating_points_cnt_minus_1
            ));
        }

        self.operating_point_idc = seq.operating_points[operating_point as usize].idc;
        self.operating_point = operating_point;
        Ok(())
    }

    /// Returns the highest spatial layer of the selected operating point, if
    /// the stream is scalable.
    pub fn highest_operating_point(&self) -> Option<u32> {
        if self.operating_point_idc == 0 {
            None
        } else {
            Some(helpers::floor_log2(self.operating_point_idc >> 8))
        }
    }

    pub fn parse_temporal_delimiter_obu(&mut self, obu: &Obu) -> anyhow::Result<()> {
        if obu.header.obu_type != ObuType::TemporalDelimiter {
            return Err(anyhow!("Expected a temporal delimiter, got {:?}", obu.header.obu_type));
        }

        self.seen_frame_header = false;
        Ok(())
    }

    fn parse_color_config(s: &mut SequenceHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        let cc = &mut s.color_config;

        cc.high_bitdepth = r.read_bit()?;
        s.bit_depth = if s.seq_profile == Profile::Profile2 && cc.high_bitdepth {
            cc.twelve_bit = r.read_bit()?;
            if cc.twelve_bit {
                BitDepth::Depth12
            } else {
                BitDepth::Depth10
            }
        } else if cc.high_bitdepth {
            BitDepth::Depth10
        } else {
            BitDepth::Depth8
        };

        cc.mono_chrome = if s.seq_profile == Profile::Profile1 { false } else { r.read_bit()? };
        s.num_planes = if cc.mono_chrome { 1 } else { 3 };

        cc.color_description_present_flag = r.read_bit()?;
        if cc.color_description_present_flag {
            let cp = r.read_bits(8)?;
            cc.color_primaries =
                ColorPrimaries::n(cp).ok_or(anyhow!("Invalid color_primaries {}", cp))?;
            let tc = r.read_bits(8)?;
            cc.transfer_characteristics = TransferCharacteristics::n(tc)
                .ok_or(anyhow!("Invalid transfer_characteristics {}", tc))?;
            let mc = r.read_bits(8)?;
            cc.matrix_coefficients =
                MatrixCoefficients::n(mc).ok_or(anyhow!("Invalid matrix_coefficients {}", mc))?;
        } else {
            cc.color_primaries = ColorPrimaries::Unspecified;
            cc.transfer_characteristics = TransferCharacteristics::Unspecified;
            cc.matrix_coefficients = MatrixCoefficients::Unspecified;
        }

        if cc.mono_chrome {
            cc.color_range = r.read_bit()?;
            cc.subsampling_x = true;
            cc.subsampling_y = true;
            cc.chroma_sample_position = ChromaSamplePosition::Unknown;
            cc.separate_uv_delta_q = false;
            return Ok(());
        }

        if cc.color_primaries == ColorPrimaries::Bt709
            && cc.transfer_characteristics == TransferCharacteristics::Srgb
            && cc.matrix_coefficients == MatrixCoefficients::Identity
        {
            cc.color_range = true;
            cc.subsampling_x = false;
            cc.subsampling_y = false;
            if !(s.seq_profile == Profile::Profile1
                || (s.seq_profile == Profile::Profile2 && s.bit_depth == BitDepth::Depth12))
            {
                return Err(unsupported("sRGB colorspace not compatible with profile"));
            }
        } else {
            cc.color_range = r.read_bit()?;
            match s.seq_profile {
                Profile::Profile0 => {
                    cc.subsampling_x = true;
                    cc.subsampling_y = true;
                }
                Profile::Profile1 => {
                    cc.subsampling_x = false;
                    cc.subsampling_y = false;
                }
                Profile::Profile2 if s.bit_depth == BitDepth::Depth12 => {
                    cc.subsampling_x = r.read_bit()?;
                    cc.subsampling_y = if cc.subsampling_x { r.read_bit()? } else { false };
                }
                Profile::Profile2 => {
                    cc.subsampling_x = true;
                    cc.subsampling_y = false;
                }
            }

            if cc.subsampling_x && cc.subsampling_y {
                let csp = r.read_bits(2)?;
                cc.chroma_sample_position = ChromaSamplePosition::n(csp)
                    .ok_or(anyhow!("Invalid chroma_sample_position {}", csp))?;
            }
        }

        cc.separate_uv_delta_q = r.read_bit()?;
        Ok(())
    }

    fn parse_timing_info(ti: &mut TimingInfo, r: &mut Reader) -> anyhow::Result<()> {
        ti.num_units_in_display_tick = r.read_bits(32)?;
        ti.time_scale = r.read_bits(32)?;
        ti.equal_picture_interval = r.read_bit()?;
        if ti.equal_picture_interval {
            ti.num_ticks_per_picture_minus_1 = r.read_uvlc()?;
        }
        Ok(())
    }

    fn parse_decoder_model_info(dmi: &mut DecoderModelInfo, r: &mut Reader) -> anyhow::Result<()> {
        dmi.buffer_delay_length_minus_1 = r.read_bits(5)?;
        dmi.num_units_in_decoding_tick = r.read_bits(32)?;
        dmi.buffer_removal_time_length_minus_1 = r.read_bits(5)?;
        dmi.frame_presentation_time_length_minus_1 = r.read_bits(5)?;
        Ok(())
    }

    pub fn parse_sequence_header_obu(
        &mut self,
        obu: &Obu,
    ) -> anyhow::Result<Rc<SequenceHeaderObu>> {
        if obu.header.obu_type != ObuType::SequenceHeader {
            return Err(anyhow!("Expected a sequence header, got {:?}", obu.header.obu_type));
        }

        let mut s = SequenceHeaderObu { obu_header: obu.header.clone(), ..Default::default() };
        let mut r = Reader::new(obu.data);

        let profile = r.read_bits(3)?;
        s.seq_profile = Profile::n(profile)
            .ok_or_else(|| unsupported(format!("Unsupported profile {}", profile)))?;
        s.still_picture = r.read_bit()?;
        s.reduced_still_picture_header = r.read_bit()?;

        if s.reduced_still_picture_header {
            s.operating_points[0].seq_level_idx = r.read_bits(5)?;
        } else {
            s.timing_info_present_flag = r.read_bit()?;
            if s.timing_info_present_flag {
                Self::parse_timing_info(&mut s.timing_info, &mut r)?;
                s.decoder_model_info_present_flag = r.read_bit()?;
                if s.decoder_model_info_present_flag {
                    Self::parse_decoder_model_info(&mut s.decoder_model_info, &mut r)?;
                }
            }

            s.initial_display_delay_present_flag = r.read_bit()?;
            s.operating_points_cnt_minus_1 = r.read_bits(5)?;
            let buffer_delay_length = s.decoder_model_info.buffer_delay_length_minus_1 as usize + 1;
            let num_operating_points = s.operating_points_cnt_minus_1 as usize + 1;

            for op in s.operating_points.iter_mut().take(num_operating_points) {
                op.idc = r.read_bits(12)?;
                op.seq_level_idx = r.read_bits(5)?;
                if op.seq_level_idx > 7 {
                    op.seq_tier = u32::from(r.read_bit()?);
                }

                if s.decoder_model_info_present_flag {
                    op.decoder_model_present_for_this_op = r.read_bit()?;
                    if op.decoder_model_present_for_this_op {
                        op.decoder_buffer_delay = r.read_bits(buffer_delay_length)?;
                        op.encoder_buffer_delay = r.read_bits(buffer_delay_length)?;
                        op.low_delay_mode_flag = r.read_bit()?;
                    }
                }

                if s.initial_display_delay_present_flag {
                    op.initial_display_delay_present_for_this_op = r.read_bit()?;
                    if op.initial_display_delay_present_for_this_op {
                        op.initial_display_delay_minus_1 = r.read_bits(4)?;
                    }
                }
            }
        }

        s.frame_width_bits_minus_1 = r.read_bits(4)?;
        s.frame_height_bits_minus_1 = r.read_bits(4)?;
        s.max_frame_width_minus_1 = r.read_bits(s.frame_width_bits_minus_1 as usize + 1)?;
        s.max_frame_height_minus_1 = r.read_bits(s.frame_height_bits_minus_1 as usize + 1)?;

        s.frame_id_numbers_present_flag =
            if s.reduced_still_picture_header { false } else { r.read_bit()? };
        if s.frame_id_numbers_present_flag {
            s.delta_frame_id_length_minus_2 = r.read_bits(4)?;
            s.additional_frame_id_length_minus_1 = r.read_bits(3)?;
            if s.frame_id_length() > 16 {
                return Err(anyhow!("Invalid frame_id_length"));
            }
        }

        s.use_128x128_superblock = r.read_bit()?;
        s.enable_filter_intra = r.read_bit()?;
        s.enable_intra_edge_filter = r.read_bit()?;

        if s.reduced_still_picture_header {
            s.seq_force_screen_content_tools = SELECT_SCREEN_CONTENT_TOOLS;
            s.seq_force_integer_mv = SELECT_INTEGER_MV;
        } else {
            s.enable_interintra_compound = r.read_bit()?;
            s.enable_masked_compound = r.read_bit()?;
            s.enable_warped_motion = r.read_bit()?;
            s.enable_dual_filter = r.read_bit()?;
            s.enable_order_hint = r.read_bit()?;
            if s.enable_order_hint {
                s.enable_jnt_comp = r.read_bit()?;
                s.enable_ref_frame_mvs = r.read_bit()?;
            }

            s.seq_choose_screen_content_tools = r.read_bit()?;
            s.seq_force_screen_content_tools = if s.seq_choose_screen_content_tools {
                SELECT_SCREEN_CONTENT_TOOLS
            } else {
                r.read_bits(1)?
            };

            s.seq_force_integer_mv = if s.seq_force_screen_content_tools > 0 {
                s.seq_choose_integer_mv = r.read_bit()?;
                if s.seq_choose_integer_mv {
                    SELECT_INTEGER_MV
                } else {
                    r.read_bits(1)?
                }
            } else {
                SELECT_INTEGER_MV
            };

            if s.enable_order_hint {
                s.order_hint_bits = r.read_bits(3)? + 1;
            }
        }

        s.enable_superres = r.read_bit()?;
        s.enable_cdef = r.read_bit()?;
        s.enable_restoration = r.read_bit()?;

        Self::parse_color_config(&mut s, &mut r)?;

        s.film_grain_params_present = r.read_bit()?;

        Self::skip_and_check_trailing_bits(&mut r, obu)?;

        log::debug!(
            "Sequence header: profile {:?}, {}x{} max, {:?}, 128x128 superblocks: {}",
            s.seq_profile,
            s.max_frame_width(),
            s.max_frame_height(),
            s.bit_depth,
            s.use_128x128_superblock
        );

        let rc = Rc::new(s);
        self.sequence_header = Some(rc.clone());

        let operating_point = if self.operating_point > rc.operating_points_cnt_minus_1 {
            log::warn!(
                "Operating point {} not present in the sequence, using 0",
                self.operating_point
            );
            0
        } else {
            self.operating_point
        };
        self.choose_operating_point(operating_point)?;

        Ok(rc)
    }

    fn compute_image_size(fh: &mut FrameHeaderObu) {
        fh.mi_cols = 2 * ((fh.frame_width + 7) >> 3);
        fh.mi_rows = 2 * ((fh.frame_height + 7) >> 3);
    }

    fn parse_superres_params(
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
        seq: &SequenceHeaderObu,
    ) -> anyhow::Result<()> {
        fh.use_superres = if seq.enable_superres { r.read_bit()? } else { false };
        fh.superres_denom = if fh.use_superres {
            r.read_bits(SUPERRES_DENOM_BITS)? + SUPERRES_DENOM_MIN
        } else {
            SUPERRES_NUM
        };

        fh.upscaled_width = fh.frame_width;
        fh.frame_width =
            (fh.upscaled_width * SUPERRES_NUM + (fh.superres_denom / 2)) / fh.superres_denom;

        Ok(())
    }

    fn parse_frame_size(&self, fh: &mut FrameHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        let seq = self.sequence()?;
        if fh.frame_size_override_flag {
            fh.frame_width = r.read_bits(seq.frame_width_bits_minus_1 as usize + 1)? + 1;
            fh.frame_height = r.read_bits(seq.frame_height_bits_minus_1 as usize + 1)? + 1;
            if fh.frame_width > seq.max_frame_width() || fh.frame_height > seq.max_frame_height() {
                return Err(anyhow!("Frame dimensions are larger than the maximum values"));
            }
        } else {
            fh.frame_width = seq.max_frame_width();
            fh.frame_height = seq.max_frame_height();
        }

        Self::parse_superres_params(fh, r, seq)?;
        Self::compute_image_size(fh);

        Ok(())
    }

    fn parse_render_size(fh: &mut FrameHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        fh.render_and_frame_size_different = r.read_bit()?;
        if fh.render_and_frame_size_different {
            fh.render_width = r.read_bits(16)? + 1;
            fh.render_height = r.read_bits(16)? + 1;
        } else {
            fh.render_width = fh.upscaled_width;
            fh.render_height = fh.frame_height;
        }
        Ok(())
    }

    fn frame_size_with_refs(&self, fh: &mut FrameHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        let mut found_ref = false;

        for i in 0..REFS_PER_FRAME {
            found_ref = r.read_bit()?;
            if found_ref {
                let rf = self
                    .ref_info
                    .get(fh.ref_frame_idx[i] as usize)
                    .filter(|rf| rf.ref_valid)
                    .ok_or(anyhow!("Invalid condition: invalid reference buffer"))?;

                fh.upscaled_width = rf.ref_upscaled_width;
                fh.frame_width = fh.upscaled_width;
                fh.frame_height = rf.ref_frame_height;
                fh.render_width = rf.ref_render_width;
                fh.render_height = rf.ref_render_height;
                break;
            }
        }

        if found_ref {
            let seq = self.sequence()?;
            Self::parse_superres_params(fh, r, seq)?;
            Self::compute_image_size(fh);
        } else {
            self.parse_frame_size(fh, r)?;
            Self::parse_render_size(fh, r)?;
        }

        Ok(())
    }

    /// Checks that the frame can be predicted from each of its references.
    fn validate_references(&self, fh: &FrameHeaderObu) -> anyhow::Result<()> {
        let mut has_valid_ref = false;

        for &idx in &fh.ref_frame_idx {
            let rf = &self.ref_info[idx as usize];
            if 2 * fh.frame_width >= rf.ref_upscaled_width
                && 2 * fh.frame_height >= rf.ref_frame_height
                && fh.frame_width <= 16 * rf.ref_upscaled_width
                && fh.frame_height <= 16 * rf.ref_frame_height
            {
                has_valid_ref = true;
            }
        }

        if !has_valid_ref {
            return Err(anyhow!("Referenced frame has invalid size"));
        }

        for &idx in &fh.ref_frame_idx {
            let rf = &self.ref_info[idx as usize];
            if rf.ref_bit_depth != fh.bit_depth
                || rf.ref_subsampling_x != fh.subsampling_x
                || rf.ref_subsampling_y != fh.subsampling_y
            {
                return Err(anyhow!("Referenced frame has incompatible color format"));
            }
        }

        Ok(())
    }

    fn check_frame_dimensions(&self, fh: &FrameHeaderObu) -> anyhow::Result<()> {
        if fh.frame_width == 0 || fh.frame_height == 0 {
            return Err(anyhow!("Invalid frame size"));
        }

        if let Some(max) = self.max_decode_dimensions {
            if fh.frame_width > max.width || fh.frame_height > max.height {
                return Err(anyhow!(
                    "Dimensions of {}x{} beyond allowed size of {}x{}.",
                    fh.frame_width,
                    fh.frame_height,
                    max.width,
                    max.height
                ));
            }
        }

        Ok(())
    }

    /// Implements set_frame_refs(): derives all the references from
    /// `last_frame_idx` and `gold_frame_idx`.
    fn set_frame_refs(&self, fh: &mut FrameHeaderObu) -> anyhow::Result<()> {
        let seq = self.sequence()?;
        let order_hint_bits = seq.order_hint_bits as i32;
        let last = ReferenceFrameType::Last as usize;

        let mut ref_frame_idx: [Option<usize>; REFS_PER_FRAME] = [None; REFS_PER_FRAME];
        ref_frame_idx[0] = Some(fh.last_frame_idx as usize);
        ref_frame_idx[ReferenceFrameType::Golden as usize - last] =
            Some(fh.gold_frame_idx as usize);

        let mut used_frame = [false; NUM_REF_FRAMES];
        used_frame[fh.last_frame_idx as usize] = true;
        used_frame[fh.gold_frame_idx as usize] = true;

        let cur_frame_hint = 1 << (order_hint_bits - 1);
        let mut shifted_order_hints = [0; NUM_REF_FRAMES];
        for (i, hint) in shifted_order_hints.iter_mut().enumerate() {
            *hint = cur_frame_hint
                + helpers::get_relative_dist(
                    seq.enable_order_hint,
                    order_hint_bits,
                    self.ref_info[i].ref_order_hint as i32,
                    fh.order_hint as i32,
                );
        }

        let mut latest_order_hint = shifted_order_hints[fh.last_frame_idx as usize];
        if latest_order_hint >= cur_frame_hint {
            return Err(anyhow!("LAST_FRAME does not precede the current frame"));
        }

        let mut earliest_order_hint = shifted_order_hints[fh.gold_frame_idx as usize];
        if earliest_order_hint >= cur_frame_hint {
            return Err(anyhow!("GOLDEN_FRAME does not precede the current frame"));
        }

        if let Some(r) = helpers::find_latest_backward(
            &shifted_order_hints,
            &used_frame,
            cur_frame_hint,
            &mut latest_order_hint,
        ) {
            ref_frame_idx[ReferenceFrameType::AltRef as usize - last] = Some(r);
            used_frame[r] = true;
        }

        for ref_frame in [ReferenceFrameType::BwdRef, ReferenceFrameType::AltRef2] {
            if let Some(r) = helpers::find_earliest_backward(
                &shifted_order_hints,
                &used_frame,
                cur_frame_hint,
                &mut earliest_order_hint,
            ) {
                ref_frame_idx[ref_frame as usize - last] = Some(r);
                used_frame[r] = true;
            }
        }

        for ref_frame in [
            ReferenceFrameType::Last2,
            ReferenceFrameType::Last3,
            ReferenceFrameType::BwdRef,
            ReferenceFrameType::AltRef2,
            ReferenceFrameType::AltRef,
        ] {
            if ref_frame_idx[ref_frame as usize - last].is_none() {
                if let Some(r) = helpers::find_latest_forward(
                    &shifted_order_hints,
                    &used_frame,
                    cur_frame_hint,
                    &mut latest_order_hint,
                ) {
                    ref_frame_idx[ref_frame as usize - last] = Some(r);
                    used_frame[r] = true;
                }
            }
        }

        // Whatever is left takes the reference with the earliest hint.
        let mut earliest = 0;
        earliest_order_hint = shifted_order_hints[0];
        for (i, &hint) in shifted_order_hints.iter().enumerate().skip(1) {
            if hint < earliest_order_hint {
                earliest = i;
                earliest_order_hint = hint;
            }
        }

        for (dest, src) in fh.ref_frame_idx.iter_mut().zip(ref_frame_idx) {
            *dest = src.unwrap_or(earliest) as u8;
        }

        Ok(())
    }

    /// Invalidates the slots whose frame id is too far from the current one.
    fn mark_ref_frames(&mut self, id_len: u32, delta_frame_id_length: u32) {
        let diff_len = delta_frame_id_length;
        let current = self.current_frame_id;

        for rf in self.ref_info.iter_mut() {
            let id = rf.ref_frame_id;
            let outside_window = if current > (1 << diff_len) {
                id > current || id < current - (1 << diff_len)
            } else {
                id > current && id < (1 << id_len) + current - (1 << diff_len)
            };

            if outside_window {
                rf.valid_for_referencing = false;
            }
        }
    }

    /// Starts from a clean state: no segmentation, default loop filter
    /// deltas and identity global motion to predict from.
    fn setup_past_independence(fh: &mut FrameHeaderObu) -> GlobalMotionParams {
        fh.segmentation_params.feature_enabled = Default::default();
        fh.segmentation_params.feature_data = Default::default();
        fh.loop_filter_params.loop_filter_ref_deltas = DEFAULT_LOOP_FILTER_REF_DELTAS;
        fh.loop_filter_params.loop_filter_mode_deltas = Default::default();
        GlobalMotionParams::default()
    }

    /// Inherits the state saved with the primary reference frame.
    fn load_previous(&self, fh: &mut FrameHeaderObu, slot: usize) -> GlobalMotionParams {
        let rf = &self.ref_info[slot];
        fh.segmentation_params.feature_enabled = rf.segmentation_params.feature_enabled;
        fh.segmentation_params.feature_data = rf.segmentation_params.feature_data;
        fh.loop_filter_params.loop_filter_ref_deltas =
            rf.loop_filter_params.loop_filter_ref_deltas;
        fh.loop_filter_params.loop_filter_mode_deltas =
            rf.loop_filter_params.loop_filter_mode_deltas;
        rf.global_motion_params.clone()
    }

    fn parse_tile_info(&self, fh: &mut FrameHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        let seq = self.sequence()?;
        if self.large_scale_tile {
            return Self::parse_large_scale_tile_info(fh, seq, r);
        }

        let ti = &mut fh.tile_info;
        let (sb_cols, sb_rows, sb_shift) = if seq.use_128x128_superblock {
            ((fh.mi_cols + 31) >> 5, (fh.mi_rows + 31) >> 5, 5)
        } else {
            ((fh.mi_cols + 15) >> 4, (fh.mi_rows + 15) >> 4, 4)
        };
        let sb_size = sb_shift + 2;

        let max_tile_width_sb = MAX_TILE_WIDTH >> sb_size;
        let mut max_tile_area_sb = MAX_TILE_AREA >> (2 * sb_size);
        let min_log2_tile_cols = helpers::tile_log2(max_tile_width_sb, sb_cols);
        let max_log2_tile_cols =
            helpers::tile_log2(1, std::cmp::min(sb_cols, MAX_TILE_COLS as u32));
        let max_log2_tile_rows =
            helpers::tile_log2(1, std::cmp::min(sb_rows, MAX_TILE_ROWS as u32));
        let min_log2_tiles = std::cmp::max(
            min_log2_tile_cols,
            helpers::tile_log2(max_tile_area_sb, sb_rows * sb_cols),
        );

        ti.uniform_tile_spacing_flag = r.read_bit()?;
        if ti.uniform_tile_spacing_flag {
            ti.tile_cols_log2 = min_log2_tile_cols;
            while ti.tile_cols_log2 < max_log2_tile_cols {
                if !r.read_bit()? {
                    break;
                }
                ti.tile_cols_log2 += 1;
            }

            let tile_width_sb = (sb_cols + (1 << ti.tile_cols_log2) - 1) >> ti.tile_cols_log2;
            let mut i = 0;
            let mut start_sb = 0;
            while start_sb < sb_cols {
                *ti.mi_col_starts.get_mut(i).ok_or(anyhow!("Too many tile columns"))? =
                    start_sb << sb_shift;
                i += 1;
                start_sb += tile_width_sb;
            }
            *ti.mi_col_starts.get_mut(i).ok_or(anyhow!("Too many tile columns"))? = fh.mi_cols;
            ti.tile_cols = i as u32;

            let min_log2_tile_rows = min_log2_tiles.saturating_sub(ti.tile_cols_log2);
            ti.tile_rows_log2 = min_log2_tile_rows;
            while ti.tile_rows_log2 < max_log2_tile_rows {
                if !r.read_bit()? {
                    break;
                }
                ti.tile_rows_log2 += 1;
            }

            let tile_height_sb = (sb_rows + (1 << ti.tile_rows_log2) - 1) >> ti.tile_rows_log2;
            let mut i = 0;
            let mut start_sb = 0;
            while start_sb < sb_rows {
                *ti.mi_row_starts.get_mut(i).ok_or(anyhow!("Too many tile rows"))? =
                    start_sb << sb_shift;
                i += 1;
                start_sb += tile_height_sb;
            }
            *ti.mi_row_starts.get_mut(i).ok_or(anyhow!("Too many tile rows"))? = fh.mi_rows;
            ti.tile_rows = i as u32;
        } else {
            let mut widest_tile_sb = 0;
            let mut start_sb = 0;
            let mut i = 0;
            while start_sb < sb_cols {
                *ti.mi_col_starts.get_mut(i).ok_or(anyhow!("Too many tile columns"))? =
                    start_sb << sb_shift;
                let max_width = std::cmp::min(sb_cols - start_sb, max_tile_width_sb);
                let size_sb = r.read_ns(max_width)? + 1;
                widest_tile_sb = std::cmp::max(size_sb, widest_tile_sb);
                start_sb += size_sb;
                i += 1;
            }
            *ti.mi_col_starts.get_mut(i).ok_or(anyhow!("Too many tile columns"))? = fh.mi_cols;
            ti.tile_cols = i as u32;
            ti.tile_cols_log2 = helpers::tile_log2(1, ti.tile_cols);

            max_tile_area_sb = if min_log2_tiles > 0 {
                (sb_rows * sb_cols) >> (min_log2_tiles + 1)
            } else {
                sb_rows * sb_cols
            };
            let max_tile_height_sb = std::cmp::max(max_tile_area_sb / widest_tile_sb.max(1), 1);

            let mut start_sb = 0;
            let mut i = 0;
            while start_sb < sb_rows {
                *ti.mi_row_starts.get_mut(i).ok_or(anyhow!("Too many tile rows"))? =
                    start_sb << sb_shift;
                let max_height = std::cmp::min(sb_rows - start_sb, max_tile_height_sb);
                start_sb += r.read_ns(max_height)? + 1;
                i += 1;
            }
            *ti.mi_row_starts.get_mut(i).ok_or(anyhow!("Too many tile rows"))? = fh.mi_rows;
            ti.tile_rows = i as u32;
            ti.tile_rows_log2 = helpers::tile_log2(1, ti.tile_rows);
        }

        if ti.tile_cols_log2 > 0 || ti.tile_rows_log2 > 0 {
            ti.context_update_tile_id =
                r.read_bits((ti.tile_rows_log2 + ti.tile_cols_log2) as usize)?;
            if ti.context_update_tile_id >= ti.num_tiles() {
                return Err(anyhow!(
                    "Invalid context_update_tile_id {} for {} tiles",
                    ti.context_update_tile_id,
                    ti.num_tiles()
                ));
            }
            ti.tile_size_bytes = r.read_bits(2)? + 1;
        } else {
            ti.context_update_tile_id = 0;
        }

        Ok(())
    }

    /// Tile info in large scale tile mode: all tiles share the same size,
    /// coded in superblocks.
    fn parse_large_scale_tile_info(
        fh: &mut FrameHeaderObu,
        seq: &SequenceHeaderObu,
        r: &mut Reader,
    ) -> anyhow::Result<()> {
        let ti = &mut fh.tile_info;
        let (bits, mib_size_log2) = if seq.use_128x128_superblock { (5, 5) } else { (6, 4) };

        let tile_width_sb = r.read_bits(bits)? + 1;
        let tile_height_sb = r.read_bits(bits)? + 1;
        ti.tile_width_mi = std::cmp::min(tile_width_sb << mib_size_log2, fh.mi_cols);
        ti.tile_height_mi = std::cmp::min(tile_height_sb << mib_size_log2, fh.mi_rows);
        if ti.tile_width_mi == 0 || ti.tile_height_mi == 0 {
            return Err(anyhow!("Invalid frame size"));
        }

        ti.uniform_tile_spacing_flag = true;
        ti.tile_cols = fh.mi_cols.div_ceil(ti.tile_width_mi);
        ti.tile_rows = fh.mi_rows.div_ceil(ti.tile_height_mi);
        if ti.tile_cols as usize > MAX_TILE_COLS || ti.tile_rows as usize > MAX_TILE_ROWS {
            return Err(anyhow!("Too many tiles: {}x{}", ti.tile_cols, ti.tile_rows));
        }
        ti.tile_cols_log2 = helpers::tile_log2(1, ti.tile_cols);
        ti.tile_rows_log2 = helpers::tile_log2(1, ti.tile_rows);

        for i in 0..=ti.tile_cols {
            ti.mi_col_starts[i as usize] = std::cmp::min(i * ti.tile_width_mi, fh.mi_cols);
        }
        for i in 0..=ti.tile_rows {
            ti.mi_row_starts[i as usize] = std::cmp::min(i * ti.tile_height_mi, fh.mi_rows);
        }

        if ti.num_tiles() > 1 {
            ti.tile_col_size_bytes = r.read_bits(2)? + 1;
            ti.tile_size_bytes = r.read_bits(2)? + 1;
        }

        Ok(())
    }

    fn parse_quantization_params(
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
        seq: &SequenceHeaderObu,
    ) -> anyhow::Result<()> {
        let q = &mut fh.quantization_params;
        let separate_uv_delta_q = seq.color_config.separate_uv_delta_q;

        q.base_q_idx = r.read_bits(8)?;
        q.delta_q_y_dc = r.read_delta_q()?;

        if seq.num_planes > 1 {
            q.diff_uv_delta = if separate_uv_delta_q { r.read_bit()? } else { false };
            q.delta_q_u_dc = r.read_delta_q()?;
            q.delta_q_u_ac = r.read_delta_q()?;
            if q.diff_uv_delta {
                q.delta_q_v_dc = r.read_delta_q()?;
                q.delta_q_v_ac = r.read_delta_q()?;
            } else {
                q.delta_q_v_dc = q.delta_q_u_dc;
                q.delta_q_v_ac = q.delta_q_u_ac;
            }
        } else {
            q.delta_q_u_dc = 0;
            q.delta_q_u_ac = 0;
            q.delta_q_v_dc = 0;
            q.delta_q_v_ac = 0;
        }

        q.using_qmatrix = r.read_bit()?;
        if q.using_qmatrix {
            q.qm_y = r.read_bits(4)?;
            q.qm_u = r.read_bits(4)?;
            q.qm_v = if separate_uv_delta_q { r.read_bits(4)? } else { q.qm_u };
        }

        Ok(())
    }

    fn parse_segmentation_params(fh: &mut FrameHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        let primary_ref_none = fh.primary_ref_frame == PRIMARY_REF_NONE;
        let seg = &mut fh.segmentation_params;

        seg.segmentation_update_map = false;
        seg.segmentation_temporal_update = false;
        seg.segmentation_update_data = false;

        seg.segmentation_enabled = r.read_bit()?;
        if seg.segmentation_enabled {
            if primary_ref_none {
                seg.segmentation_update_map = true;
                seg.segmentation_temporal_update = false;
                seg.segmentation_update_data = true;
            } else {
                seg.segmentation_update_map = r.read_bit()?;
                if seg.segmentation_update_map {
                    seg.segmentation_temporal_update = r.read_bit()?;
                }
                seg.segmentation_update_data = r.read_bit()?;
            }

            if seg.segmentation_update_data {
                seg.feature_enabled = Default::default();
                seg.feature_data = Default::default();

                for i in 0..MAX_SEGMENTS {
                    for j in 0..SEG_LVL_MAX {
                        let enabled = r.read_bit()?;
                        seg.feature_enabled[i][j] = enabled;
                        if !enabled {
                            continue;
                        }

                        let bits = FEATURE_BITS[j] as usize;
                        let limit = FEATURE_MAX[j];
                        let clipped = if FEATURE_SIGNED[j] {
                            helpers::clip3(-limit, limit, r.read_su(1 + bits)?)
                        } else {
                            helpers::clip3(0, limit, r.read_bits(bits)? as i32)
                        };

                        seg.feature_data[i][j] = clipped as i16;
                    }
                }
            }
        } else {
            seg.feature_enabled = Default::default();
            seg.feature_data = Default::default();
        }

        seg.seg_id_pre_skip = false;
        seg.last_active_seg_id = 0;
        for i in 0..MAX_SEGMENTS {
            for j in 0..SEG_LVL_MAX {
                if seg.feature_enabled[i][j] {
                    seg.last_active_seg_id = i as u32;
                    if j >= SEG_LVL_REF_FRAME {
                        seg.seg_id_pre_skip = true;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_delta_q_params(fh: &mut FrameHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        let q = &mut fh.quantization_params;
        q.delta_q_res = 0;
        q.delta_q_present = false;
        if q.base_q_idx > 0 {
            q.delta_q_present = r.read_bit()?;
        }
        if q.delta_q_present {
            q.delta_q_res = r.read_bits(2)?;
        }
        Ok(())
    }

    fn parse_delta_lf_params(fh: &mut FrameHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        let lf = &mut fh.loop_filter_params;
        lf.delta_lf_present = false;
        lf.delta_lf_res = 0;
        lf.delta_lf_multi = false;

        if fh.quantization_params.delta_q_present {
            if !fh.allow_intrabc {
                lf.delta_lf_present = r.read_bit()?;
            }
            if lf.delta_lf_present {
                lf.delta_lf_res = r.read_bits(2)?;
                lf.delta_lf_multi = r.read_bit()?;
            }
        }
        Ok(())
    }

    /// Returns the quantizer index of `segment_id`, ignoring block level
    /// deltas.
    pub fn get_qindex(fh: &FrameHeaderObu, segment_id: usize) -> u32 {
        let base_q_idx = fh.quantization_params.base_q_idx as i32;
        if fh.segmentation_params.feature_active(segment_id, SEG_LVL_ALT_Q) {
            let data = i32::from(fh.segmentation_params.feature_data[segment_id][SEG_LVL_ALT_Q]);
            helpers::clip3(0, 255, base_q_idx + data) as u32
        } else {
            base_q_idx as u32
        }
    }

    fn compute_lossless(fh: &mut FrameHeaderObu) {
        let q = &fh.quantization_params;
        let no_deltas = q.delta_q_y_dc == 0
            && q.delta_q_u_ac == 0
            && q.delta_q_u_dc == 0
            && q.delta_q_v_ac == 0
            && q.delta_q_v_dc == 0;
        let (using_qmatrix, qm_y, qm_u, qm_v) = (q.using_qmatrix, q.qm_y, q.qm_u, q.qm_v);

        fh.coded_lossless = true;
        for segment_id in 0..MAX_SEGMENTS {
            let qindex = Self::get_qindex(fh, segment_id);
            let lossless = qindex == 0 && no_deltas;
            fh.lossless_array[segment_id] = lossless;
            if !lossless {
                fh.coded_lossless = false;
            }

            if using_qmatrix {
                let levels = if lossless { [15, 15, 15] } else { [qm_y, qm_u, qm_v] };
                for (plane, level) in levels.into_iter().enumerate() {
                    fh.seg_qm_level[plane][segment_id] = level;
                }
            }
        }

        fh.all_lossless = fh.coded_lossless && fh.frame_width == fh.upscaled_width;
    }

    fn parse_loop_filter_parameters(
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
        num_planes: u32,
    ) -> anyhow::Result<()> {
        let lf = &mut fh.loop_filter_params;

        if fh.coded_lossless || fh.allow_intrabc {
            lf.loop_filter_level[0] = 0;
            lf.loop_filter_level[1] = 0;
            lf.loop_filter_ref_deltas = DEFAULT_LOOP_FILTER_REF_DELTAS;
            lf.loop_filter_mode_deltas = Default::default();
            return Ok(());
        }

        lf.loop_filter_level[0] = r.read_bits(6)? as u8;
        lf.loop_filter_level[1] = r.read_bits(6)? as u8;
        if num_planes > 1 && (lf.loop_filter_level[0] != 0 || lf.loop_filter_level[1] != 0) {
            lf.loop_filter_level[2] = r.read_bits(6)? as u8;
            lf.loop_filter_level[3] = r.read_bits(6)? as u8;
        }

        lf.loop_filter_sharpness = r.read_bits(3)? as u8;
        lf.loop_filter_delta_enabled = r.read_bit()?;
        if lf.loop_filter_delta_enabled {
            lf.loop_filter_delta_update = r.read_bit()?;
            if lf.loop_filter_delta_update {
                for delta in lf.loop_filter_ref_deltas.iter_mut() {
                    if r.read_bit()? {
                        *delta = r.read_su(7)? as i8;
                    }
                }
                for delta in lf.loop_filter_mode_deltas.iter_mut() {
                    if r.read_bit()? {
                        *delta = r.read_su(7)? as i8;
                    }
                }
            }
        }

        Ok(())
    }

    fn parse_cdef_params(
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
        seq: &SequenceHeaderObu,
    ) -> anyhow::Result<()> {
        let cdef = &mut fh.cdef_params;

        if fh.coded_lossless || fh.allow_intrabc || !seq.enable_cdef {
            *cdef = CdefParams { cdef_damping: 3, ..Default::default() };
            return Ok(());
        }

        cdef.cdef_damping = r.read_bits(2)? + 3;
        cdef.cdef_bits = r.read_bits(2)?;
        for i in 0..(1 << cdef.cdef_bits) {
            cdef.cdef_y_pri_strength[i] = r.read_bits(4)?;
            cdef.cdef_y_sec_strength[i] = r.read_bits(2)?;
            if cdef.cdef_y_sec_strength[i] == 3 {
                cdef.cdef_y_sec_strength[i] += 1;
            }

            if seq.num_planes > 1 {
                cdef.cdef_uv_pri_strength[i] = r.read_bits(4)?;
                cdef.cdef_uv_sec_strength[i] = r.read_bits(2)?;
                if cdef.cdef_uv_sec_strength[i] == 3 {
                    cdef.cdef_uv_sec_strength[i] += 1;
                }
            }
        }

        Ok(())
    }

    fn parse_loop_restoration_params(
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
        seq: &SequenceHeaderObu,
    ) -> anyhow::Result<()> {
        let lr = &mut fh.loop_restoration_params;
        *lr = LoopRestorationParams::default();

        if fh.all_lossless || fh.allow_intrabc || !seq.enable_restoration {
            return Ok(());
        }

        for plane in 0..seq.num_planes as usize {
            let lr_type = r.read_bits(2)?;
            lr.frame_restoration_type[plane] = LR_TYPE_REMAP[lr_type as usize];
            if lr.frame_restoration_type[plane] != FrameRestorationType::None {
                lr.uses_lr = true;
                if plane > 0 {
                    lr.uses_chroma_lr = true;
                }
            }
        }

        if lr.uses_lr {
            if seq.use_128x128_superblock {
                lr.lr_unit_shift = r.read_bits(1)? as u8 + 1;
            } else {
                lr.lr_unit_shift = r.read_bits(1)? as u8;
                if lr.lr_unit_shift != 0 {
                    lr.lr_unit_shift += r.read_bits(1)? as u8;
                }
            }

            lr.loop_restoration_size[0] = RESTORATION_TILESIZE_MAX >> (2 - lr.lr_unit_shift);
            let cc = &seq.color_config;
            lr.lr_uv_shift = if cc.subsampling_x && cc.subsampling_y && lr.uses_chroma_lr {
                r.read_bits(1)? as u8
            } else {
                0
            };

            lr.loop_restoration_size[1] = lr.loop_restoration_size[0] >> lr.lr_uv_shift;
            lr.loop_restoration_size[2] = lr.loop_restoration_size[0] >> lr.lr_uv_shift;
        }

        Ok(())
    }

    fn read_tx_mode(fh: &mut FrameHeaderObu, r: &mut Reader) -> anyhow::Result<()> {
        fh.tx_mode = if fh.coded_lossless {
            TxMode::Only4x4
        } else if r.read_bit()? {
            TxMode::Select
        } else {
            TxMode::Largest
        };
        Ok(())
    }

    fn parse_skip_mode_params(
        &self,
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
    ) -> anyhow::Result<()> {
        let seq = self.sequence()?;
        let bits = seq.order_hint_bits as i32;
        let dist = |a: u32, b: u32| {
            helpers::get_relative_dist(seq.enable_order_hint, bits, a as i32, b as i32)
        };

        let mut skip_mode_allowed = false;
        if !fh.frame_is_intra && fh.reference_select && seq.enable_order_hint {
            let mut forward: Option<(usize, u32)> = None;
            let mut backward: Option<(usize, u32)> = None;

            for i in 0..REFS_PER_FRAME {
                let ref_hint = self.ref_info[fh.ref_frame_idx[i] as usize].ref_order_hint;
                if dist(ref_hint, fh.order_hint) < 0 {
                    if forward.map_or(true, |(_, hint)| dist(ref_hint, hint) > 0) {
                        forward = Some((i, ref_hint));
                    }
                } else if dist(ref_hint, fh.order_hint) > 0
                    && backward.map_or(true, |(_, hint)| dist(ref_hint, hint) < 0)
                {
                    backward = Some((i, ref_hint));
                }
            }

            let pair = match (forward, backward) {
                (None, _) => None,
                (Some((fwd, _)), Some((bwd, _))) => Some((fwd, bwd)),
                (Some((fwd, forward_hint)), None) => {
                    let mut second_forward: Option<(usize, u32)> = None;
                    for i in 0..REFS_PER_FRAME {
                        let ref_hint = self.ref_info[fh.ref_frame_idx[i] as usize].ref_order_hint;
                        if dist(ref_hint, forward_hint) < 0
                            && second_forward.map_or(true, |(_, hint)| dist(ref_hint, hint) > 0)
                        {
                            second_forward = Some((i, ref_hint));
                        }
                    }
                    second_forward.map(|(second, _)| (fwd, second))
                }
            };

            if let Some((a, b)) = pair {
                skip_mode_allowed = true;
                let last = ReferenceFrameType::Last as u32;
                fh.skip_mode_frame =
                    [last + std::cmp::min(a, b) as u32, last + std::cmp::max(a, b) as u32];
            }
        }

        fh.skip_mode_present = if skip_mode_allowed { r.read_bit()? } else { false };
        Ok(())
    }

    /// Implements the shear validity check of the warp model.
    fn setup_shear(warp_params: &[i32; 6]) -> bool {
        if warp_params[2] <= 0 {
            return false;
        }

        let clip_i16 = |v: i64| helpers::clip3(i64::from(i16::MIN), i64::from(i16::MAX), v);
        let reduce = |v: i64| {
            helpers::round2signed(v, WARP_PARAM_REDUCE_BITS) * (1 << WARP_PARAM_REDUCE_BITS)
        };

        let p: [i64; 6] = warp_params.map(i64::from);
        let alpha0 = clip_i16(p[2] - (1 << WARPEDMODEL_PREC_BITS));
        let beta0 = clip_i16(p[3]);

        let (div_shift, div_factor) = helpers::resolve_divisor(p[2]);
        let v = p[4] << WARPEDMODEL_PREC_BITS;
        let gamma0 = clip_i16(helpers::round2signed(v * div_factor, div_shift));
        let w = p[3] * p[4];
        let delta0 = clip_i16(
            p[5] - helpers::round2signed(w * div_factor, div_shift) - (1 << WARPEDMODEL_PREC_BITS),
        );

        let alpha = reduce(alpha0);
        let beta = reduce(beta0);
        let gamma = reduce(gamma0);
        let delta = reduce(delta0);

        4 * alpha.abs() + 7 * beta.abs() < (1 << WARPEDMODEL_PREC_BITS)
            && 4 * gamma.abs() + 4 * delta.abs() < (1 << WARPEDMODEL_PREC_BITS)
    }

    fn read_global_param(
        r: &mut Reader,
        gm: &mut GlobalMotionParams,
        prev: &GlobalMotionParams,
        allow_high_precision_mv: bool,
        ref_frame: usize,
        idx: usize,
    ) -> anyhow::Result<()> {
        let gm_type = gm.gm_type[ref_frame];
        let mut abs_bits = GM_ABS_ALPHA_BITS;
        let mut prec_bits = GM_ALPHA_PREC_BITS;
        if idx < 2 {
            if gm_type == WarpModelType::Translation {
                let hp = u32::from(!allow_high_precision_mv);
                abs_bits = GM_ABS_TRANS_ONLY_BITS - hp;
                prec_bits = GM_TRANS_ONLY_PREC_BITS - hp;
            } else {
                abs_bits = GM_ABS_TRANS_BITS;
                prec_bits = GM_TRANS_PREC_BITS;
            }
        }

        let prec_diff = WARPEDMODEL_PREC_BITS - prec_bits;
        let (round, sub) =
            if idx % 3 == 2 { (1 << WARPEDMODEL_PREC_BITS, 1 << prec_bits) } else { (0, 0) };

        let mx = 1 << abs_bits;
        let reference = (prev.gm_params[ref_frame][idx] >> prec_diff) - sub;
        let value = r.decode_signed_subexp_with_ref(-mx, mx + 1, reference)?;
        gm.gm_params[ref_frame][idx] = (value << prec_diff) + round;

        Ok(())
    }

    fn parse_global_motion_params(
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
        prev: &GlobalMotionParams,
    ) -> anyhow::Result<()> {
        let hp = fh.allow_high_precision_mv;
        let gm = &mut fh.global_motion_params;
        *gm = GlobalMotionParams::default();

        if fh.frame_is_intra {
            return Ok(());
        }

        for ref_frame in ReferenceFrameType::Last as usize..=ReferenceFrameType::AltRef as usize {
            gm.is_global[ref_frame] = r.read_bit()?;
            gm.gm_type[ref_frame] = if gm.is_global[ref_frame] {
                gm.is_rot_zoom[ref_frame] = r.read_bit()?;
                if gm.is_rot_zoom[ref_frame] {
                    WarpModelType::RotZoom
                } else {
                    gm.is_translation[ref_frame] = r.read_bit()?;
                    if gm.is_translation[ref_frame] {
                        WarpModelType::Translation
                    } else {
                        WarpModelType::Affine
                    }
                }
            } else {
                WarpModelType::Identity
            };
            let gm_type = gm.gm_type[ref_frame];

            if gm_type >= WarpModelType::RotZoom {
                Self::read_global_param(r, gm, prev, hp, ref_frame, 2)?;
                Self::read_global_param(r, gm, prev, hp, ref_frame, 3)?;
                if gm_type == WarpModelType::Affine {
                    Self::read_global_param(r, gm, prev, hp, ref_frame, 4)?;
                    Self::read_global_param(r, gm, prev, hp, ref_frame, 5)?;
                } else {
                    gm.gm_params[ref_frame][4] = -gm.gm_params[ref_frame][3];
                    gm.gm_params[ref_frame][5] = gm.gm_params[ref_frame][2];
                }
            }

            if gm_type >= WarpModelType::Translation {
                Self::read_global_param(r, gm, prev, hp, ref_frame, 0)?;
                Self::read_global_param(r, gm, prev, hp, ref_frame, 1)?;
            }

            gm.warp_valid[ref_frame] = Self::setup_shear(&gm.gm_params[ref_frame]);
            if !gm.warp_valid[ref_frame] {
                log::debug!("Global motion model for reference {} is invalid", ref_frame);
            }
        }

        Ok(())
    }

    fn read_scaling_points(
        r: &mut Reader,
        num_points: u8,
        values: &mut [u8],
        scalings: &mut [u8],
    ) -> anyhow::Result<()> {
        for i in 0..num_points as usize {
            values[i] = r.read_bits(8)? as u8;
            if i > 0 && values[i - 1] >= values[i] {
                return Err(unsupported(
                    "First coordinate of the scaling function points shall be increasing.",
                ));
            }
            scalings[i] = r.read_bits(8)? as u8;
        }
        Ok(())
    }

    fn parse_film_grain_parameters(
        &self,
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
    ) -> anyhow::Result<()> {
        let seq = self.sequence()?;
        let fg = &mut fh.film_grain_params;

        if !seq.film_grain_params_present || (!fh.show_frame && !fh.showable_frame) {
            *fg = Default::default();
            return Ok(());
        }

        fg.apply_grain = r.read_bit()?;
        if !fg.apply_grain {
            *fg = Default::default();
            return Ok(());
        }

        fg.grain_seed = r.read_bits(16)? as u16;
        fg.update_grain =
            if fh.frame_type == FrameType::InterFrame { r.read_bit()? } else { true };

        if !fg.update_grain {
            let ref_idx = r.read_bits(3)? as u8;
            let rf = &self.ref_info[ref_idx as usize];
            if !fh.ref_frame_idx.contains(&ref_idx) || !rf.film_grain_params_present {
                return Err(unsupported("Film grain reference parameters not available"));
            }

            let grain_seed = fg.grain_seed;
            *fg = rf.film_grain_params.clone();
            fg.grain_seed = grain_seed;
            fg.film_grain_params_ref_idx = ref_idx;
            fg.update_grain = false;
            return Ok(());
        }

        fg.num_y_points = r.read_bits(4)? as u8;
        if fg.num_y_points > MAX_FILM_GRAIN_Y_POINTS {
            return Err(unsupported(
                "Number of points for film grain luma scaling function exceeds the maximum value.",
            ));
        }
        Self::read_scaling_points(
            r,
            fg.num_y_points,
            &mut fg.point_y_value,
            &mut fg.point_y_scaling,
        )?;

        let cc = &seq.color_config;
        fg.chroma_scaling_from_luma = if cc.mono_chrome { false } else { r.read_bit()? };

        if cc.mono_chrome
            || fg.chroma_scaling_from_luma
            || (cc.subsampling_x && cc.subsampling_y && fg.num_y_points == 0)
        {
            fg.num_cb_points = 0;
            fg.num_cr_points = 0;
        } else {
            fg.num_cb_points = r.read_bits(4)? as u8;
            if fg.num_cb_points > MAX_FILM_GRAIN_CHROMA_POINTS {
                return Err(unsupported(
                    "Number of points for film grain cb scaling function exceeds the maximum value.",
                ));
            }
            Self::read_scaling_points(
                r,
                fg.num_cb_points,
                &mut fg.point_cb_value,
                &mut fg.point_cb_scaling,
            )?;

            fg.num_cr_points = r.read_bits(4)? as u8;
            if fg.num_cr_points > MAX_FILM_GRAIN_CHROMA_POINTS {
                return Err(unsupported(
                    "Number of points for film grain cr scaling function exceeds the maximum value.",
                ));
            }
            Self::read_scaling_points(
                r,
                fg.num_cr_points,
                &mut fg.point_cr_value,
                &mut fg.point_cr_scaling,
            )?;

            if cc.subsampling_x
                && cc.subsampling_y
                && ((fg.num_cb_points == 0) != (fg.num_cr_points == 0))
            {
                return Err(unsupported(
                    "In YCbCr 4:2:0, film grain shall be applied to both chroma components or neither.",
                ));
            }
        }

        fg.grain_scaling_minus_8 = r.read_bits(2)? as u8;
        fg.ar_coeff_lag = r.read_bits(2)?;

        let num_pos_luma = 2 * fg.ar_coeff_lag * (fg.ar_coeff_lag + 1);
        let num_pos_chroma = if fg.num_y_points > 0 {
            for i in 0..num_pos_luma as usize {
                fg.ar_coeffs_y_plus_128[i] = r.read_bits(8)? as u8;
            }
            num_pos_luma + 1
        } else {
            num_pos_luma
        };

        if fg.chroma_scaling_from_luma || fg.num_cb_points > 0 {
            for i in 0..num_pos_chroma as usize {
                fg.ar_coeffs_cb_plus_128[i] = r.read_bits(8)? as u8;
            }
        }

        if fg.chroma_scaling_from_luma || fg.num_cr_points > 0 {
            for i in 0..num_pos_chroma as usize {
                fg.ar_coeffs_cr_plus_128[i] = r.read_bits(8)? as u8;
            }
        }

        fg.ar_coeff_shift_minus_6 = r.read_bits(2)? as u8;
        fg.grain_scale_shift = r.read_bits(2)? as u8;

        if fg.num_cb_points > 0 {
            fg.cb_mult = r.read_bits(8)? as u8;
            fg.cb_luma_mult = r.read_bits(8)? as u8;
            fg.cb_offset = r.read_bits(9)? as u16;
        }

        if fg.num_cr_points > 0 {
            fg.cr_mult = r.read_bits(8)? as u8;
            fg.cr_luma_mult = r.read_bits(8)? as u8;
            fg.cr_offset = r.read_bits(9)? as u16;
        }

        fg.overlap_flag = r.read_bit()?;
        fg.clip_to_restricted_range = r.read_bit()?;

        Ok(())
    }

    /// Large scale tile frames without in-loop filtering can have their tiles
    /// decoded individually.
    fn set_single_tile_decoding(fh: &mut FrameHeaderObu) {
        fh.single_tile_decoding = false;
        if fh.large_scale_tile {
            let lf = &fh.loop_filter_params.loop_filter_level;
            let no_loop_filter = lf[0] == 0 && lf[1] == 0;
            let no_restoration = fh
                .loop_restoration_params
                .frame_restoration_type
                .iter()
                .all(|t| *t == FrameRestorationType::None);
            fh.single_tile_decoding = no_loop_filter && fh.cdef_params.is_noop() && no_restoration;
        }
    }

    fn parse_show_existing_frame(
        &mut self,
        fh: &mut FrameHeaderObu,
        r: &mut Reader,
    ) -> anyhow::Result<()> {
        let seq = self.sequence_rc()?;

        fh.frame_to_show_map_idx = r.read_bits(3)?;
        let idx = fh.frame_to_show_map_idx as usize;

        if seq.decoder_model_info_present_flag && !seq.timing_info.equal_picture_interval {
            let n = seq.decoder_model_info.frame_presentation_time_length_minus_1 as usize + 1;
            fh.frame_presentation_time = r.read_bits(n)?;
        }

        if seq.frame_id_numbers_present_flag {
            fh.display_frame_id = r.read_bits(seq.frame_id_length() as usize)?;
            let rf = &self.ref_info[idx];
            if fh.display_frame_id != rf.ref_frame_id || !rf.valid_for_referencing {
                return Err(anyhow!("Reference buffer frame ID mismatch"));
            }
        }

        let rf = &mut self.ref_info[idx];
        if !rf.ref_valid {
            return Err(unsupported(format!("Buffer {} does not contain a decoded frame", idx)));
        }
        if !rf.ref_showable_frame {
            return Err(anyhow!("Buffer does not contain a showable frame"));
        }
        rf.ref_showable_frame = false;

        fh.frame_type = rf.ref_frame_type;
        fh.show_frame = true;
        fh.showable_frame = false;
        fh.upscaled_width = rf.ref_upscaled_width;
        fh.frame_width = rf.ref_frame_width;
        fh.frame_height = rf.ref_frame_height;
        fh.render_width = rf.ref_render_width;
        fh.render_height = rf.ref_render_height;
        fh.mi_cols = rf.ref_mi_cols;
        fh.mi_rows = rf.ref_mi_rows;
        fh.order_hint = rf.ref_order_hint;
        fh.current_frame_id = rf.ref_frame_id;
        fh.segmentation_params = rf.segmentation_params.clone();
        fh.loop_filter_params = LoopFilterParams {
            loop_filter_level: [0; 4],
            ..rf.loop_filter_params.clone()
        };
        if seq.film_grain_params_present {
            fh.film_grain_params = rf.film_grain_params.clone();
        }

        fh.reset_decoder_state = fh.frame_type == FrameType::KeyFrame;
        if fh.reset_decoder_state {
            fh.frame_is_intra = true;
            fh.refresh_frame_flags = ALL_FRAMES;
            fh.refresh_frame_context = RefreshFrameContext::Disabled;

            if self.need_resync {
                self.ref_info = Default::default();
                self.need_resync = false;
            }
        } else {
            fh.refresh_frame_flags = 0;
        }

        Ok(())
    }

    fn parse_uncompressed_frame_header(&mut self, obu: &Obu) -> anyhow::Result<FrameHeaderObu> {
        let seq = self.sequence_rc()?;
        let mut r = Reader::new(obu.data);
        let obu_header_bytes = obu.bytes_used - obu.data.len();

        let mut fh = FrameHeaderObu {
            obu_header: obu.header.clone(),
            bit_depth: seq.bit_depth,
            subsampling_x: seq.color_config.subsampling_x,
            subsampling_y: seq.color_config.subsampling_y,
            num_planes: seq.num_planes,
            use_128x128_superblock: seq.use_128x128_superblock,
            large_scale_tile: self.large_scale_tile,
            ..Default::default()
        };

        let id_len = if seq.frame_id_numbers_present_flag { seq.frame_id_length() } else { 0 };

        if seq.reduced_still_picture_header {
            fh.show_existing_frame = false;
            fh.frame_type = FrameType::KeyFrame;
            fh.frame_is_intra = true;
            fh.show_frame = true;
            fh.showable_frame = false;
            fh.error_resilient_mode = true;
        } else {
            fh.show_existing_frame = r.read_bit()?;
            if fh.show_existing_frame {
                self.parse_show_existing_frame(&mut fh, &mut r)?;
                fh.header_bytes = obu_header_bytes + (r.position() as usize).div_ceil(8);
                Self::skip_and_check_trailing_bits(&mut r, obu)?;
                return Ok(fh);
            }

            fh.frame_type = FrameType::n(r.read_bits(2)?).ok_or(anyhow!("Invalid frame type"))?;
            fh.frame_is_intra = fh.frame_is_intra();
            fh.show_frame = r.read_bit()?;

            if fh.show_frame
                && seq.decoder_model_info_present_flag
                && !seq.timing_info.equal_picture_interval
            {
                let n = seq.decoder_model_info.frame_presentation_time_length_minus_1 as usize + 1;
                fh.frame_presentation_time = r.read_bits(n)?;
            }

            fh.showable_frame = if fh.show_frame {
                fh.frame_type != FrameType::KeyFrame
            } else {
                r.read_bit()?
            };

            fh.error_resilient_mode = if fh.frame_type == FrameType::SwitchFrame
                || (fh.frame_type == FrameType::KeyFrame && fh.show_frame)
            {
                true
            } else {
                r.read_bit()?
            };
        }

        if fh.frame_is_intra {
            if self.need_resync {
                self.ref_info = Default::default();
                self.need_resync = false;
            }
        } else if self.need_resync {
            return Err(anyhow!("Keyframe / intra-only frame required to reset decoder state"));
        }

        if fh.frame_type == FrameType::KeyFrame && fh.show_frame {
            for rf in self.ref_info.iter_mut() {
                rf.valid_for_referencing = false;
                rf.ref_order_hint = 0;
            }
            fh.order_hints = Default::default();
        }

        fh.disable_cdf_update = r.read_bit()?;
        fh.allow_screen_content_tools =
            if seq.seq_force_screen_content_tools == SELECT_SCREEN_CONTENT_TOOLS {
                r.read_bits(1)?
            } else {
                seq.seq_force_screen_content_tools
            };

        fh.force_integer_mv = if fh.allow_screen_content_tools > 0 {
            if seq.seq_force_integer_mv == SELECT_INTEGER_MV {
                r.read_bits(1)?
            } else {
                seq.seq_force_integer_mv
            }
        } else {
            0
        };
        if fh.frame_is_intra {
            fh.force_integer_mv = 1;
        }

        if seq.frame_id_numbers_present_flag {
            let prev_frame_id = self.current_frame_id;
            fh.current_frame_id = r.read_bits(id_len as usize)?;
            self.current_frame_id = fh.current_frame_id;

            if !(fh.frame_type == FrameType::KeyFrame && fh.show_frame) {
                let diff_frame_id = if fh.current_frame_id > prev_frame_id {
                    fh.current_frame_id - prev_frame_id
                } else {
                    (1 << id_len) + fh.current_frame_id - prev_frame_id
                };
                if prev_frame_id == fh.current_frame_id || diff_frame_id >= (1 << (id_len - 1)) {
                    return Err(anyhow!("Invalid value of current_frame_id"));
                }
            }

            self.mark_ref_frames(id_len, seq.delta_frame_id_length_minus_2 + 2);
        } else {
            fh.current_frame_id = 0;
        }

        fh.frame_size_override_flag = if fh.frame_type == FrameType::SwitchFrame {
            true
        } else if seq.reduced_still_picture_header {
            false
        } else {
            r.read_bit()?
        };

        fh.order_hint = r.read_bits(seq.order_hint_bits as usize)?;

        fh.primary_ref_frame = if fh.frame_is_intra || fh.error_resilient_mode {
            PRIMARY_REF_NONE
        } else {
            r.read_bits(3)?
        };

        if seq.decoder_model_info_present_flag {
            fh.buffer_removal_time_present_flag = r.read_bit()?;
            if fh.buffer_removal_time_present_flag {
                let n = seq.decoder_model_info.buffer_removal_time_length_minus_1 as usize + 1;
                let num_operating_points = seq.operating_points_cnt_minus_1 as usize + 1;
                for op in seq.operating_points.iter().take(num_operating_points) {
                    if op.decoder_model_present_for_this_op {
                        let in_temporal_layer = (op.idc >> obu.header.temporal_id) & 1 != 0;
                        let in_spatial_layer = (op.idc >> (obu.header.spatial_id + 8)) & 1 != 0;
                        if op.idc == 0 || (in_temporal_layer && in_spatial_layer) {
                            fh.buffer_removal_time.push(r.read_bits(n)?);
                        }
                    }
                }
            }
        }

        fh.allow_high_precision_mv = false;
        fh.use_ref_frame_mvs = false;
        fh.allow_intrabc = false;

        fh.refresh_frame_flags = if fh.frame_type == FrameType::SwitchFrame
            || (fh.frame_type == FrameType::KeyFrame && fh.show_frame)
        {
            ALL_FRAMES
        } else {
            r.read_bits(8)?
        };

        if fh.frame_type == FrameType::IntraOnlyFrame && fh.refresh_frame_flags == ALL_FRAMES {
            return Err(anyhow!("Intra only frames cannot have refresh flags 0xFF"));
        }

        if (!fh.frame_is_intra || fh.refresh_frame_flags != ALL_FRAMES)
            && fh.error_resilient_mode
            && seq.enable_order_hint
        {
            for i in 0..NUM_REF_FRAMES {
                fh.ref_order_hint[i] = r.read_bits(seq.order_hint_bits as usize)?;
                let rf = &mut self.ref_info[i];
                if !rf.ref_valid || rf.ref_order_hint != fh.ref_order_hint[i] {
                    // Stand in for the missing reference with a grey frame of
                    // the largest size the sequence allows.
                    *rf = ReferenceFrameInfo {
                        ref_valid: true,
                        valid_for_referencing: rf.valid_for_referencing,
                        ref_frame_id: rf.ref_frame_id,
                        ref_upscaled_width: seq.max_frame_width(),
                        ref_frame_width: seq.max_frame_width(),
                        ref_frame_height: seq.max_frame_height(),
                        ref_render_width: seq.max_frame_width(),
                        ref_render_height: seq.max_frame_height(),
                        ref_mi_cols: 2 * ((seq.max_frame_width() + 7) >> 3),
                        ref_mi_rows: 2 * ((seq.max_frame_height() + 7) >> 3),
                        ref_frame_type: FrameType::InterFrame,
                        ref_subsampling_x: seq.color_config.subsampling_x,
                        ref_subsampling_y: seq.color_config.subsampling_y,
                        ref_bit_depth: seq.bit_depth,
                        ref_order_hint: fh.ref_order_hint[i],
                        loop_filter_params: LoopFilterParams {
                            loop_filter_ref_deltas: DEFAULT_LOOP_FILTER_REF_DELTAS,
                            ..Default::default()
                        },
                        ..Default::default()
                    };
                    fh.placeholder_refs |= 1 << i;
                }
            }
        }

        if fh.frame_is_intra {
            self.parse_frame_size(&mut fh, &mut r)?;
            Self::parse_render_size(&mut fh, &mut r)?;
            if fh.allow_screen_content_tools > 0 && fh.upscaled_width == fh.frame_width {
                fh.allow_intrabc = r.read_bit()?;
            }
        } else {
            fh.frame_refs_short_signaling =
                if seq.enable_order_hint { r.read_bit()? } else { false };

            if fh.frame_refs_short_signaling {
                fh.last_frame_idx = r.read_bits(3)? as u8;
                fh.gold_frame_idx = r.read_bits(3)? as u8;
                for idx in [fh.last_frame_idx, fh.gold_frame_idx] {
                    if !self.ref_info[idx as usize].ref_valid {
                        return Err(anyhow!("Inter frame requests nonexistent reference"));
                    }
                }
                self.set_frame_refs(&mut fh)?;
            }

            for i in 0..REFS_PER_FRAME {
                if !fh.frame_refs_short_signaling {
                    fh.ref_frame_idx[i] = r.read_bits(3)? as u8;
                }

                let idx = fh.ref_frame_idx[i] as usize;
                if !self.ref_info[idx].ref_valid {
                    return Err(anyhow!("Inter frame requests nonexistent reference"));
                }

                if seq.frame_id_numbers_present_flag {
                    let n = seq.delta_frame_id_length_minus_2 as usize + 2;
                    let delta_frame_id = r.read_bits(n)? + 1;
                    let expected_frame_id =
                        (fh.current_frame_id + (1 << id_len) - delta_frame_id) % (1 << id_len);
                    let rf = &self.ref_info[idx];
                    if rf.ref_frame_id != expected_frame_id || !rf.valid_for_referencing {
                        return Err(anyhow!("Reference buffer frame ID mismatch"));
                    }
                }
            }

            if let Some(slot) = fh.primary_ref_slot() {
                if !self.ref_info[slot].ref_valid {
                    return Err(anyhow!(
                        "Reference frame containing this frame's initial frame context is unavailable."
                    ));
                }
            }

            if fh.frame_size_override_flag && !fh.error_resilient_mode {
                self.frame_size_with_refs(&mut fh, &mut r)?;
            } else {
                self.parse_frame_size(&mut fh, &mut r)?;
                Self::parse_render_size(&mut fh, &mut r)?;
            }

            self.check_frame_dimensions(&fh)?;
            self.validate_references(&fh)?;

            fh.allow_high_precision_mv =
                if fh.force_integer_mv > 0 { false } else { r.read_bit()? };

            fh.is_filter_switchable = r.read_bit()?;
            fh.interpolation_filter = if fh.is_filter_switchable {
                InterpolationFilter::Switchable
            } else {
                let f = r.read_bits(2)?;
                InterpolationFilter::n(f).ok_or(anyhow!("Invalid interpolation filter {}", f))?
            };

            fh.is_motion_mode_switchable = r.read_bit()?;
            fh.use_ref_frame_mvs = if fh.error_resilient_mode || !seq.enable_ref_frame_mvs {
                false
            } else {
                r.read_bit()?
            };

            for i in 0..REFS_PER_FRAME {
                let ref_frame = ReferenceFrameType::Last as usize + i;
                let hint = self.ref_info[fh.ref_frame_idx[i] as usize].ref_order_hint;
                fh.order_hints[ref_frame] = hint;
                fh.ref_frame_sign_bias[ref_frame] = seq.enable_order_hint
                    && helpers::get_relative_dist(
                        true,
                        seq.order_hint_bits as i32,
                        hint as i32,
                        fh.order_hint as i32,
                    ) > 0;
            }
        }

        self.check_frame_dimensions(&fh)?;

        fh.disable_frame_end_update_cdf =
            if seq.reduced_still_picture_header || fh.disable_cdf_update {
                true
            } else {
                r.read_bit()?
            };

        // Large scale tile frames never adapt their CDFs at the frame end.
        fh.refresh_frame_context = if !fh.disable_frame_end_update_cdf && !self.large_scale_tile {
            RefreshFrameContext::Backward
        } else {
            RefreshFrameContext::Disabled
        };

        let prev_gm_params = match fh.primary_ref_slot() {
            None => Self::setup_past_independence(&mut fh),
            Some(slot) => self.load_previous(&mut fh, slot),
        };

        self.parse_tile_info(&mut fh, &mut r)?;
        Self::parse_quantization_params(&mut fh, &mut r, &seq)?;
        Self::parse_segmentation_params(&mut fh, &mut r)?;
        Self::parse_delta_q_params(&mut fh, &mut r)?;
        Self::parse_delta_lf_params(&mut fh, &mut r)?;
        Self::compute_lossless(&mut fh);
        Self::parse_loop_filter_parameters(&mut fh, &mut r, seq.num_planes)?;
        Self::parse_cdef_params(&mut fh, &mut r, &seq)?;
        Self::parse_loop_restoration_params(&mut fh, &mut r, &seq)?;
        Self::read_tx_mode(&mut fh, &mut r)?;

        fh.reference_select = if fh.frame_is_intra { false } else { r.read_bit()? };
        self.parse_skip_mode_params(&mut fh, &mut r)?;

        fh.allow_warped_motion =
            if fh.frame_is_intra || fh.error_resilient_mode || !seq.enable_warped_motion {
                false
            } else {
                r.read_bit()?
            };

        fh.reduced_tx_set = r.read_bit()?;

        let might_use_ref_frame_mvs = !fh.error_resilient_mode
            && seq.enable_ref_frame_mvs
            && seq.enable_order_hint
            && !fh.frame_is_intra;
        if fh.use_ref_frame_mvs && !might_use_ref_frame_mvs {
            return Err(anyhow!("Frame wrongly requests reference frame MVs"));
        }

        Self::parse_global_motion_params(&mut fh, &mut r, &prev_gm_params)?;
        self.parse_film_grain_parameters(&mut fh, &mut r)?;
        Self::set_single_tile_decoding(&mut fh);

        fh.header_bytes = obu_header_bytes + (r.position() as usize).div_ceil(8);

        if obu.header.obu_type != ObuType::Frame {
            Self::skip_and_check_trailing_bits(&mut r, obu)?;
        }

        Ok(fh)
    }

    /// Parses a frame header OBU. Repeated copies of the header of the frame
    /// being decoded return the header parsed first.
    pub fn parse_frame_header_obu(&mut self, obu: &Obu) -> anyhow::Result<FrameHeaderObu> {
        if !matches!(
            obu.header.obu_type,
            ObuType::FrameHeader | ObuType::RedundantFrameHeader | ObuType::Frame
        ) {
            return Err(anyhow!("Expected a frame header, got {:?}", obu.header.obu_type));
        }

        if self.seen_frame_header {
            return self
                .last_frame_header
                .clone()
                .ok_or(anyhow!("Broken stream: no previous frame header to copy"));
        }

        let fh = self.parse_uncompressed_frame_header(obu)?;
        self.seen_frame_header = !fh.show_existing_frame;
        self.last_frame_header = Some(fh.clone());

        log::debug!(
            "Frame header: {:?} {}x{}, show {}, show existing {}, refresh {:#04x}",
            fh.frame_type,
            fh.frame_width,
            fh.frame_height,
            fh.show_frame,
            fh.show_existing_frame,
            fh.refresh_frame_flags
        );

        Ok(fh)
    }

    /// Parses the tile group header at the start of `data`, using the tile
    /// layout of the current frame.
    fn parse_tile_group_header<'a>(
        &mut self,
        obu: Obu<'a>,
        data: &'a [u8],
    ) -> anyhow::Result<TileGroupObu<'a>> {
        let tile_info = &self
            .last_frame_header
            .as_ref()
            .ok_or(anyhow!("Broken stream: tile group without a frame header"))?
            .tile_info;
        let num_tiles = tile_info.num_tiles();
        let tile_bits = (tile_info.tile_cols_log2 + tile_info.tile_rows_log2) as usize;

        let mut r = Reader::new(data);
        let mut tg = TileGroupObu { obu, ..Default::default() };

        if num_tiles > 1 {
            tg.tile_start_and_end_present_flag = r.read_bit()?;
        }

        if num_tiles == 1 || !tg.tile_start_and_end_present_flag {
            tg.tg_start = 0;
            tg.tg_end = num_tiles.saturating_sub(1);
        } else {
            tg.tg_start = r.read_bits(tile_bits)?;
            tg.tg_end = r.read_bits(tile_bits)?;
        }

        if tg.tg_end < tg.tg_start || tg.tg_end >= num_tiles {
            return Err(anyhow!(
                "Invalid tile group range {}..={} for {} tiles",
                tg.tg_start,
                tg.tg_end,
                num_tiles
            ));
        }

        r.byte_alignment()?;
        let header_bytes = (r.position() / 8) as usize;
        tg.tile_data = data.get(header_bytes..).ok_or(anyhow!("Truncated tile group"))?;

        if tg.tg_end == num_tiles - 1 {
            self.seen_frame_header = false;
        }

        Ok(tg)
    }

    /// Forgets the header of the frame being decoded, once it is complete or
    /// failed. Frame headers parsed from now on start a new frame.
    pub fn reset_frame_header(&mut self) {
        self.seen_frame_header = false;
    }

    pub fn parse_tile_group_obu<'a>(&mut self, obu: Obu<'a>) -> anyhow::Result<TileGroupObu<'a>> {
        if obu.header.obu_type != ObuType::TileGroup {
            return Err(anyhow!("Expected a tile group, got {:?}", obu.header.obu_type));
        }

        let data = obu.data;
        self.parse_tile_group_header(obu, data)
    }

    pub fn parse_frame_obu<'a>(&mut self, obu: Obu<'a>) -> anyhow::Result<FrameObu<'a>> {
        if obu.header.obu_type != ObuType::Frame {
            return Err(anyhow!("Expected a frame OBU, got {:?}", obu.header.obu_type));
        }

        let header = self.parse_frame_header_obu(&obu)?;
        if header.show_existing_frame {
            return Err(anyhow!("Frame OBUs cannot carry show_existing_frame"));
        }

        // The frame header is followed by byte_alignment() within the OBU.
        let payload: &'a [u8] = obu.data;
        let offset = header.header_bytes - (obu.bytes_used - payload.len());
        let data = payload.get(offset..).ok_or(anyhow!("Truncated frame OBU"))?;
        let tile_group = self
            .parse_tile_group_header(obu, data)
            .context("while parsing the tile group of a frame OBU")?;

        Ok(FrameObu { header, tile_group })
    }

    /// Stores the state of a decoded frame into the slots it refreshes.
    pub fn ref_frame_update(&mut self, fh: &FrameHeaderObu) -> anyhow::Result<()> {
        let film_grain_params_present = self.sequence()?.film_grain_params_present;

        if fh.show_existing_frame && !fh.reset_decoder_state {
            return Ok(());
        }

        let info = ReferenceFrameInfo {
            ref_valid: true,
            valid_for_referencing: true,
            ref_frame_id: fh.current_frame_id,
            ref_upscaled_width: fh.upscaled_width,
            ref_frame_width: fh.frame_width,
            ref_frame_height: fh.frame_height,
            ref_render_width: fh.render_width,
            ref_render_height: fh.render_height,
            ref_mi_cols: fh.mi_cols,
            ref_mi_rows: fh.mi_rows,
            ref_frame_type: fh.frame_type,
            ref_subsampling_x: fh.subsampling_x,
            ref_subsampling_y: fh.subsampling_y,
            ref_bit_depth: fh.bit_depth,
            ref_order_hint: fh.order_hint,
            ref_showable_frame: fh.showable_frame,
            film_grain_params_present,
            segmentation_params: fh.segmentation_params.clone(),
            global_motion_params: fh.global_motion_params.clone(),
            loop_filter_params: fh.loop_filter_params.clone(),
            film_grain_params: if film_grain_params_present {
                fh.film_grain_params.clone()
            } else {
                Default::default()
            },
        };

        for (i, rf) in self.ref_info.iter_mut().enumerate() {
            if (fh.refresh_frame_flags >> i) & 1 != 0 {
                *rf = info.clone();
            }
        }

        Ok(())
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            operating_point: 0,
            operating_point_idc: 0,
            large_scale_tile: false,
            max_decode_dimensions: None,
            seen_frame_header: false,
            need_resync: false,
            ref_info: Default::default(),
            current_frame_id: 0,
            last_frame_header: None,
            sequence_header: None,
        }
    }
}

impl Clone for Parser {
    fn clone(&self) -> Self {
        Self {
            operating_point: self.operating_point,
            operating_point_idc: self.operating_point_idc,
            large_scale_tile: self.large_scale_tile,
            max_decode_dimensions: self.max_decode_dimensions,
            seen_frame_header: self.seen_frame_header,
            need_resync: self.need_resync,
            ref_info: self.ref_info.clone(),
            current_frame_id: self.current_frame_id,
            last_frame_header: self.last_frame_header.clone(),
            sequence_header: self.sequence_header.as_ref().map(|s| Rc::new((**s).clone())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bitstream_utils::BitWriter;

    /// Knobs for the synthesized sequence headers.
    #[derive(Clone, Copy)]
    pub(crate) struct SeqOpts {
        pub width: u32,
        pub height: u32,
        pub enable_superres: bool,
    }

    impl Default for SeqOpts {
        fn default() -> Self {
            Self { width: 64, height: 64, enable_superres: false }
        }
    }

    /// Wraps `payload` into a low-overhead OBU of type `obu_type`.
    pub(crate) fn obu(obu_type: ObuType, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut w = BitWriter::new(&mut out);
            w.write_f(8, ((obu_type as u32) << 3) | 0b010).unwrap();
            w.write_leb128(payload.len() as u32).unwrap();
        }
        out.extend_from_slice(payload);
        out
    }

    /// Appends trailing bits. The writer flushes when dropped.
    pub(crate) fn finish(mut w: BitWriter<&mut Vec<u8>>) {
        w.write_bit(true).unwrap();
        while w.has_data_pending() {
            w.write_bit(false).unwrap();
        }
    }

    /// A profile 0, 8 bit 4:2:0 sequence with 64x64 superblocks, 7 bit order
    /// hints, CDEF and loop restoration enabled. Superres is optional.
    pub(crate) fn sequence_header(opts: SeqOpts) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut w = BitWriter::new(&mut payload);
        w.write_f(3, 0u32).unwrap(); // seq_profile
        w.write_bit(false).unwrap(); // still_picture
        w.write_bit(false).unwrap(); // reduced_still_picture_header
        w.write_bit(false).unwrap(); // timing_info_present_flag
        w.write_bit(false).unwrap(); // initial_display_delay_present_flag
        w.write_f(5, 0u32).unwrap(); // operating_points_cnt_minus_1
        w.write_f(12, 0u32).unwrap(); // operating_point_idc[0]
        w.write_f(5, 0u32).unwrap(); // seq_level_idx[0]
        w.write_f(4, 15u32).unwrap(); // frame_width_bits_minus_1
        w.write_f(4, 15u32).unwrap(); // frame_height_bits_minus_1
        w.write_f(16, opts.width - 1).unwrap();
        w.write_f(16, opts.height - 1).unwrap();
        w.write_bit(false).unwrap(); // frame_id_numbers_present_flag
        w.write_bit(false).unwrap(); // use_128x128_superblock
        w.write_bit(false).unwrap(); // enable_filter_intra
        w.write_bit(false).unwrap(); // enable_intra_edge_filter
        w.write_bit(false).unwrap(); // enable_interintra_compound
        w.write_bit(false).unwrap(); // enable_masked_compound
        w.write_bit(false).unwrap(); // enable_warped_motion
        w.write_bit(false).unwrap(); // enable_dual_filter
        w.write_bit(true).unwrap(); // enable_order_hint
        w.write_bit(false).unwrap(); // enable_jnt_comp
        w.write_bit(false).unwrap(); // enable_ref_frame_mvs
        w.write_bit(false).unwrap(); // seq_choose_screen_content_tools
        w.write_bit(false).unwrap(); // seq_force_screen_content_tools
        w.write_f(3, 6u32).unwrap(); // order_hint_bits_minus_1
        w.write_bit(opts.enable_superres).unwrap();
        w.write_bit(true).unwrap(); // enable_cdef
        w.write_bit(true).unwrap(); // enable_restoration
        w.write_bit(false).unwrap(); // high_bitdepth
        w.write_bit(false).unwrap(); // mono_chrome
        w.write_bit(false).unwrap(); // color_description_present_flag
        w.write_bit(false).unwrap(); // color_range
        w.write_f(2, 0u32).unwrap(); // chroma_sample_position
        w.write_bit(false).unwrap(); // separate_uv_delta_q
        w.write_bit(false).unwrap(); // film_grain_params_present
        finish(w);

        obu(ObuType::SequenceHeader, &payload)
    }

    /// Knobs for the synthesized key frame headers.
    #[derive(Clone, Copy)]
    pub(crate) struct KeyOpts {
        pub show_frame: bool,
        pub refresh_frame_flags: u8,
        pub base_q_idx: u8,
        pub lf_level: u8,
        pub tx_mode_select: bool,
        pub disable_cdf_update: bool,
        /// Luma primary strength of the only CDEF strength.
        pub cdef_y_strength: u8,
        /// Coded loop restoration type of luma, 0 for none.
        pub lr_type: u8,
        /// Split a 128x128 frame into 2x2 tiles of one superblock.
        pub tile_split: bool,
        /// Large scale tile info with one superblock tiles. The parser must be
        /// in large scale tile mode.
        pub large_scale: bool,
        /// Superres denominator, only for sequences enabling superres.
        pub superres_denom: Option<u32>,
    }

    impl Default for KeyOpts {
        fn default() -> Self {
            Self {
                show_frame: true,
                refresh_frame_flags: 0xff,
                base_q_idx: 100,
                lf_level: 0,
                tx_mode_select: true,
                disable_cdf_update: false,
                cdef_y_strength: 0,
                lr_type: 0,
                tile_split: false,
                large_scale: false,
                superres_denom: None,
            }
        }
    }

    /// Writes the part of a key frame header following the frame size, for a
    /// single tile frame without segmentation.
    fn write_key_frame_tail(w: &mut BitWriter<&mut Vec<u8>>, opts: KeyOpts) {
        if opts.large_scale {
            w.write_f(6, 0u32).unwrap(); // tile width: one superblock
            w.write_f(6, 0u32).unwrap(); // tile height: one superblock
            w.write_f(2, 0u32).unwrap(); // tile_col_size_bytes_minus_1
            w.write_f(2, 0u32).unwrap(); // tile_size_bytes_minus_1
        } else {
            w.write_bit(true).unwrap(); // uniform_tile_spacing_flag
            if opts.tile_split {
                w.write_bit(true).unwrap(); // increment_tile_cols_log2
                w.write_bit(true).unwrap(); // increment_tile_rows_log2
                w.write_f(2, 0u32).unwrap(); // context_update_tile_id
                w.write_f(2, 0u32).unwrap(); // tile_size_bytes_minus_1
            }
        }
        w.write_f(8, opts.base_q_idx).unwrap();
        w.write_bit(false).unwrap(); // DeltaQYDc
        w.write_bit(false).unwrap(); // DeltaQUDc
        w.write_bit(false).unwrap(); // DeltaQUAc
        w.write_bit(false).unwrap(); // using_qmatrix
        w.write_bit(false).unwrap(); // segmentation_enabled
        if opts.base_q_idx > 0 {
            w.write_bit(false).unwrap(); // delta_q_present
            w.write_f(6, opts.lf_level).unwrap();
            w.write_f(6, opts.lf_level).unwrap();
            if opts.lf_level > 0 {
                w.write_f(6, opts.lf_level).unwrap();
                w.write_f(6, opts.lf_level).unwrap();
            }
            w.write_f(3, 0u32).unwrap(); // loop_filter_sharpness
            w.write_bit(false).unwrap(); // loop_filter_delta_enabled
            w.write_f(2, 0u32).unwrap(); // cdef_damping_minus_3
            w.write_f(2, 0u32).unwrap(); // cdef_bits
            w.write_f(4, opts.cdef_y_strength).unwrap();
            w.write_f(2, 0u32).unwrap();
            w.write_f(4, 0u32).unwrap();
            w.write_f(2, 0u32).unwrap();
            w.write_f(2, opts.lr_type).unwrap(); // lr_type[0]
            w.write_f(2, 0u32).unwrap(); // lr_type[1]
            w.write_f(2, 0u32).unwrap(); // lr_type[2]
            if opts.lr_type > 0 {
                w.write_bit(false).unwrap(); // lr_unit_shift
            }
            w.write_bit(opts.tx_mode_select).unwrap();
        }
        w.write_bit(false).unwrap(); // reduced_tx_set
    }

    fn write_key_frame_header(w: &mut BitWriter<&mut Vec<u8>>, opts: KeyOpts) {
        w.write_bit(false).unwrap(); // show_existing_frame
        w.write_f(2, 0u32).unwrap(); // frame_type
        w.write_bit(opts.show_frame).unwrap();
        if !opts.show_frame {
            w.write_bit(true).unwrap(); // showable_frame
            w.write_bit(false).unwrap(); // error_resilient_mode
        }
        w.write_bit(opts.disable_cdf_update).unwrap();
        w.write_bit(false).unwrap(); // frame_size_override_flag
        w.write_f(7, 0u32).unwrap(); // order_hint
        if !opts.show_frame {
            w.write_f(8, opts.refresh_frame_flags).unwrap();
        }
        if let Some(denom) = opts.superres_denom {
            w.write_bit(true).unwrap(); // use_superres
            w.write_f(SUPERRES_DENOM_BITS, denom - SUPERRES_DENOM_MIN).unwrap();
        }
        w.write_bit(false).unwrap(); // render_and_frame_size_different
        if !opts.disable_cdf_update {
            w.write_bit(false).unwrap(); // disable_frame_end_update_cdf
        }
        write_key_frame_tail(w, opts);
    }

    pub(crate) fn key_frame_payload(opts: KeyOpts) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut w = BitWriter::new(&mut payload);
        write_key_frame_header(&mut w, opts);
        finish(w);

        payload
    }

    pub(crate) fn key_frame(opts: KeyOpts) -> Vec<u8> {
        obu(ObuType::FrameHeader, &key_frame_payload(opts))
    }

    /// A frame OBU made of a key frame header and `tile_group`, the tile
    /// group header included.
    pub(crate) fn key_frame_obu(opts: KeyOpts, tile_group: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        {
            let mut w = BitWriter::new(&mut payload);
            write_key_frame_header(&mut w, opts);
            // byte_alignment()
            while w.has_data_pending() {
                w.write_bit(false).unwrap();
            }
        }
        payload.extend_from_slice(tile_group);

        obu(ObuType::Frame, &payload)
    }

    /// A shown key frame in large scale tile mode, which never updates CDFs.
    pub(crate) fn large_scale_key_frame(opts: KeyOpts) -> Vec<u8> {
        key_frame(KeyOpts { large_scale: true, disable_cdf_update: true, show_frame: true, ..opts })
    }

    pub(crate) fn temporal_delimiter() -> Vec<u8> {
        obu(ObuType::TemporalDelimiter, &[])
    }

    pub(crate) fn parser_with_sequence(opts: SeqOpts) -> Parser {
        let mut parser = Parser::default();
        let data = sequence_header(opts);
        let ObuAction::Process(obu) = parser.read_obu(&data).unwrap() else {
            panic!("sequence header dropped");
        };
        parser.parse_obu(obu).unwrap();
        parser
    }

    /// Parses a frame header at the start of a new temporal unit.
    pub(crate) fn parse_header(parser: &mut Parser, data: &[u8]) -> anyhow::Result<FrameHeaderObu> {
        let td = temporal_delimiter();
        let ObuAction::Process(td) = parser.read_obu(&td)? else {
            panic!("temporal delimiter dropped");
        };
        parser.parse_obu(td)?;

        let ObuAction::Process(obu) = parser.read_obu(data)? else {
            panic!("frame header dropped");
        };
        match parser.parse_obu(obu)? {
            ParsedObu::FrameHeader(fh) => Ok(fh),
            _ => panic!("not a frame header"),
        }
    }

    #[test]
    fn sequence_header_fields() {
        let seq = SeqOpts { width: 320, height: 240, ..Default::default() };
        let parser = parser_with_sequence(seq);
        let seq = parser.sequence_header.as_ref().unwrap();

        assert_eq!(seq.seq_profile, Profile::Profile0);
        assert_eq!(seq.max_frame_width(), 320);
        assert_eq!(seq.max_frame_height(), 240);
        assert_eq!(seq.order_hint_bits, 7);
        assert_eq!(seq.bit_depth, BitDepth::Depth8);
        assert_eq!(seq.num_planes, 3);
        assert!(seq.color_config.subsampling_x && seq.color_config.subsampling_y);
        assert!(seq.enable_cdef && seq.enable_restoration);
        assert_eq!(seq.seq_force_integer_mv, SELECT_INTEGER_MV);
        assert_eq!(parser.highest_operating_point(), None);
    }

    #[test]
    fn frame_header_requires_sequence() {
        let mut parser = Parser::default();
        let err = parse_header(&mut parser, &key_frame(Default::default())).unwrap_err();
        assert_eq!(err.to_string(), "No sequence header");
    }

    #[test]
    fn truncated_obu() {
        let parser = Parser::default();
        let mut data = sequence_header(Default::default());
        data.truncate(data.len() - 2);
        assert!(parser.read_obu(&data).is_err());
    }

    #[test]
    fn forbidden_bit() {
        let parser = Parser::default();
        let mut data = temporal_delimiter();
        data[0] |= 0x80;
        assert!(parser.read_obu(&data).is_err());
    }

    #[test]
    fn padding_is_dropped() {
        let parser = Parser::default();
        let data = obu(ObuType::Padding, &[0, 0, 0]);
        assert!(matches!(parser.read_obu(&data).unwrap(), ObuAction::Drop(5)));
    }

    #[test]
    fn key_frame_defaults() {
        let mut parser = parser_with_sequence(Default::default());
        let fh = parse_header(&mut parser, &key_frame(Default::default())).unwrap();

        assert_eq!(fh.frame_type, FrameType::KeyFrame);
        assert!(fh.show_frame && !fh.showable_frame);
        assert_eq!(fh.refresh_frame_flags, ALL_FRAMES);
        assert_eq!((fh.frame_width, fh.frame_height), (64, 64));
        assert_eq!((fh.mi_cols, fh.mi_rows), (16, 16));
        assert_eq!(fh.tile_info.num_tiles(), 1);
        assert_eq!(fh.tile_info.mi_col_starts[1], 16);
        assert_eq!(fh.tx_mode, TxMode::Select);
        assert!(!fh.coded_lossless);
        assert_eq!(fh.refresh_frame_context, RefreshFrameContext::Backward);
        assert_eq!(fh.primary_ref_frame, PRIMARY_REF_NONE);
        assert_eq!(fh.loop_filter_params.loop_filter_ref_deltas, DEFAULT_LOOP_FILTER_REF_DELTAS);
        assert!(!fh.single_tile_decoding);
    }

    #[test]
    fn lossless_key_frame_disables_filters() {
        let mut parser = parser_with_sequence(Default::default());
        let opts = KeyOpts { base_q_idx: 0, ..Default::default() };
        let fh = parse_header(&mut parser, &key_frame(opts)).unwrap();

        assert!(fh.coded_lossless);
        assert!(fh.all_lossless);
        assert!(fh.lossless_array.iter().all(|l| *l));
        assert_eq!(fh.tx_mode, TxMode::Only4x4);
        assert_eq!(fh.loop_filter_params.loop_filter_level, [0; 4]);
        assert!(fh.cdef_params.is_noop());
        assert!(!fh.loop_restoration_params.uses_lr);
        assert!(fh
            .loop_restoration_params
            .frame_restoration_type
            .iter()
            .all(|t| *t == FrameRestorationType::None));
    }

    #[test]
    fn header_parsing_is_idempotent() {
        let parser = parser_with_sequence(Default::default());
        let data = key_frame(KeyOpts { lf_level: 12, ..Default::default() });

        let first = parse_header(&mut parser.clone(), &data).unwrap();
        let second = parse_header(&mut parser.clone(), &data).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.loop_filter_params.loop_filter_level, [12; 4]);
    }

    #[test]
    fn repeated_frame_header_is_not_parsed_again() {
        let mut parser = parser_with_sequence(Default::default());
        let first = parse_header(&mut parser, &key_frame(Default::default())).unwrap();

        let data = key_frame(KeyOpts { lf_level: 30, ..Default::default() });
        let ObuAction::Process(obu) = parser.read_obu(&data).unwrap() else {
            panic!("dropped");
        };
        let repeated = parser.parse_frame_header_obu(&obu).unwrap();
        assert_eq!(first, repeated);
    }

    #[test]
    fn segmentation_data_is_clamped() {
        let mut parser = parser_with_sequence(Default::default());

        let mut payload = Vec::new();
        let mut w = BitWriter::new(&mut payload);
        w.write_bit(false).unwrap(); // show_existing_frame
        w.write_f(2, 0u32).unwrap(); // KEY_FRAME
        w.write_bit(true).unwrap(); // show_frame
        w.write_bit(false).unwrap(); // disable_cdf_update
        w.write_bit(false).unwrap(); // frame_size_override_flag
        w.write_f(7, 0u32).unwrap(); // order_hint
        w.write_bit(false).unwrap(); // render_and_frame_size_different
        w.write_bit(false).unwrap(); // disable_frame_end_update_cdf
        w.write_bit(true).unwrap(); // uniform_tile_spacing_flag
        w.write_f(8, 100u32).unwrap(); // base_q_idx
        w.write_f(4, 0u32).unwrap(); // delta q flags and using_qmatrix
        w.write_bit(true).unwrap(); // segmentation_enabled
        for segment in 0..MAX_SEGMENTS {
            for feature in 0..SEG_LVL_MAX {
                let enabled = segment == 0 && feature < 2;
                w.write_bit(enabled).unwrap();
                if enabled && feature == SEG_LVL_ALT_Q {
                    w.write_su(9, -256).unwrap();
                } else if enabled {
                    w.write_su(7, -64).unwrap();
                }
            }
        }
        w.write_bit(false).unwrap(); // delta_q_present
        w.write_f(6, 0u32).unwrap();
        w.write_f(6, 0u32).unwrap();
        w.write_f(3, 0u32).unwrap();
        w.write_bit(false).unwrap(); // loop_filter_delta_enabled
        w.write_f(16, 0u32).unwrap(); // cdef
        w.write_f(6, 0u32).unwrap(); // lr_type
        w.write_bit(true).unwrap(); // tx_mode_select
        w.write_bit(false).unwrap(); // reduced_tx_set
        finish(w);

        let fh = parse_header(&mut parser, &obu(ObuType::FrameHeader, &payload)).unwrap();
        let seg = &fh.segmentation_params;
        assert!(seg.segmentation_update_map && seg.segmentation_update_data);
        assert_eq!(seg.feature_data[0][SEG_LVL_ALT_Q], -255);
        assert_eq!(seg.feature_data[0][1], -63);
        assert_eq!(seg.last_active_seg_id, 0);

        // Segment 0 ends up with a zero qindex, the others do not.
        assert_eq!(Parser::get_qindex(&fh, 0), 0);
        assert!(fh.lossless_array[0]);
        assert!(!fh.lossless_array[1]);
        assert!(!fh.coded_lossless);
    }

    pub(crate) fn show_existing(idx: u8) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut w = BitWriter::new(&mut payload);
        w.write_bit(true).unwrap();
        w.write_f(3, idx).unwrap();
        finish(w);
        obu(ObuType::FrameHeader, &payload)
    }

    #[test]
    fn show_existing_key_frame_resets_state() {
        let mut parser = parser_with_sequence(Default::default());
        let opts =
            KeyOpts { show_frame: false, refresh_frame_flags: 0b0000_0100, ..Default::default() };
        let key = parse_header(&mut parser, &key_frame(opts)).unwrap();
        assert!(key.showable_frame);
        assert_eq!(key.refresh_frame_context, RefreshFrameContext::Backward);
        parser.ref_frame_update(&key).unwrap();

        let fh = parse_header(&mut parser, &show_existing(2)).unwrap();
        assert!(fh.show_existing_frame);
        assert!(fh.reset_decoder_state);
        assert_eq!(fh.frame_type, FrameType::KeyFrame);
        assert_eq!(fh.refresh_frame_flags, ALL_FRAMES);
        assert_eq!(fh.refresh_frame_context, RefreshFrameContext::Disabled);
        parser.ref_frame_update(&fh).unwrap();

        for slot in 0..NUM_REF_FRAMES {
            let rf = parser.ref_info(slot).unwrap();
            assert!(rf.ref_valid);
            assert!(!rf.ref_showable_frame);
            assert_eq!(rf.ref_frame_type, FrameType::KeyFrame);
        }

        // The frame can only be shown once.
        let err = parse_header(&mut parser, &show_existing(2)).unwrap_err();
        assert_eq!(
            Error::from(err),
            Error::CorruptBitstream("Buffer does not contain a showable frame".into())
        );
    }

    #[test]
    fn show_existing_empty_slot() {
        let mut parser = parser_with_sequence(Default::default());
        let err = parse_header(&mut parser, &show_existing(5)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::UnsupportedBitstream("Buffer 5 does not contain a decoded frame".into()))
        );
    }

    /// Knobs for the synthesized inter frame headers. The frames are shown,
    /// never update CDFs and have order hint 1.
    #[derive(Clone, Copy)]
    pub(crate) struct InterOpts {
        /// Slot used by every reference.
        pub ref_slot: u8,
        pub primary_ref_frame: u32,
        pub refresh_frame_flags: u8,
        /// Error resilient mode, with the order hint signaled for each slot.
        pub error_resilient: Option<[u8; NUM_REF_FRAMES]>,
    }

    impl Default for InterOpts {
        fn default() -> Self {
            Self {
                ref_slot: 0,
                primary_ref_frame: PRIMARY_REF_NONE,
                refresh_frame_flags: 0,
                error_resilient: None,
            }
        }
    }

    /// Writes an inter frame header of a single tile frame up to its global
    /// motion parameters.
    fn write_inter_frame_header(w: &mut BitWriter<&mut Vec<u8>>, opts: InterOpts) {
        w.write_bit(false).unwrap(); // show_existing_frame
        w.write_f(2, 1u32).unwrap(); // INTER_FRAME
        w.write_bit(true).unwrap(); // show_frame
        w.write_bit(opts.error_resilient.is_some()).unwrap();
        w.write_bit(true).unwrap(); // disable_cdf_update
        w.write_bit(false).unwrap(); // frame_size_override_flag
        w.write_f(7, 1u32).unwrap(); // order_hint
        if opts.error_resilient.is_none() {
            w.write_f(3, opts.primary_ref_frame).unwrap();
        }
        w.write_f(8, opts.refresh_frame_flags).unwrap();
        if let Some(order_hints) = opts.error_resilient {
            for hint in order_hints {
                w.write_f(7, hint).unwrap();
            }
        }
        w.write_bit(false).unwrap(); // frame_refs_short_signaling
        for _ in 0..REFS_PER_FRAME {
            w.write_f(3, opts.ref_slot).unwrap();
        }
        w.write_bit(false).unwrap(); // render_and_frame_size_different
        w.write_bit(false).unwrap(); // allow_high_precision_mv
        w.write_bit(true).unwrap(); // is_filter_switchable
        w.write_bit(false).unwrap(); // is_motion_mode_switchable
        w.write_bit(true).unwrap(); // uniform_tile_spacing_flag
        w.write_f(8, 100u32).unwrap(); // base_q_idx
        w.write_f(4, 0u32).unwrap(); // delta q flags and using_qmatrix
        w.write_bit(false).unwrap(); // segmentation_enabled
        w.write_bit(false).unwrap(); // delta_q_present
        w.write_f(15, 0u32).unwrap(); // loop filter levels and sharpness
        w.write_bit(false).unwrap(); // loop_filter_delta_enabled
        w.write_f(16, 0u32).unwrap(); // cdef
        w.write_f(6, 0u32).unwrap(); // lr_type
        w.write_bit(true).unwrap(); // tx_mode_select
        w.write_bit(false).unwrap(); // reference_select
        w.write_bit(false).unwrap(); // reduced_tx_set
    }

    /// A frame OBU made of an inter frame header without global motion and
    /// `tile_group`.
    pub(crate) fn inter_frame_obu(opts: InterOpts, tile_group: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        {
            let mut w = BitWriter::new(&mut payload);
            write_inter_frame_header(&mut w, opts);
            for _ in 0..REFS_PER_FRAME {
                w.write_bit(false).unwrap(); // is_global
            }
            while w.has_data_pending() {
                w.write_bit(false).unwrap();
            }
        }
        payload.extend_from_slice(tile_group);

        obu(ObuType::Frame, &payload)
    }

    /// An inter frame referencing slot 0 for every reference, whose LAST_FRAME
    /// global motion model is a rotation/zoom with extreme parameters.
    pub(crate) fn inter_frame_with_bad_global_motion() -> Vec<u8> {
        let mut payload = Vec::new();
        let mut w = BitWriter::new(&mut payload);
        write_inter_frame_header(&mut w, Default::default());

        // LAST_FRAME: is_global, is_rot_zoom.
        w.write_bit(true).unwrap();
        w.write_bit(true).unwrap();
        // gm_params[2] and [3]: the largest positive delta, 4096.
        for _ in 0..2 {
            for _ in 0..23 {
                w.write_bit(true).unwrap();
            }
        }
        // gm_params[0] and [1]: zero translation.
        for _ in 0..2 {
            w.write_f(4, 0u32).unwrap();
        }
        // Every other reference has no global motion.
        for _ in 0..6 {
            w.write_bit(false).unwrap();
        }
        finish(w);

        obu(ObuType::FrameHeader, &payload)
    }

    #[test]
    fn invalid_global_motion_falls_back_to_identity() {
        let mut parser = parser_with_sequence(Default::default());
        let key = parse_header(&mut parser, &key_frame(Default::default())).unwrap();
        parser.ref_frame_update(&key).unwrap();

        let fh = parse_header(&mut parser, &inter_frame_with_bad_global_motion()).unwrap();
        let gm = &fh.global_motion_params;
        let last = ReferenceFrameType::Last as usize;

        assert_eq!(gm.gm_type[last], WarpModelType::RotZoom);
        assert_eq!(gm.gm_params[last][2], (1 << 16) + 8192);
        assert_eq!(gm.gm_params[last][3], 8192);
        assert_eq!(gm.gm_params[last][4], -8192);
        assert!(!gm.warp_valid[last]);
        assert_eq!(gm.model(last), (WarpModelType::Identity, IDENTITY_WARP_PARAMS));

        let golden = ReferenceFrameType::Golden as usize;
        assert!(gm.warp_valid[golden]);
        assert_eq!(gm.model(golden).0, WarpModelType::Identity);
    }

    #[test]
    fn shear_check() {
        assert!(Parser::setup_shear(&IDENTITY_WARP_PARAMS));
        assert!(!Parser::setup_shear(&[0, 0, 0, 0, 0, 1 << 16]));
        assert!(!Parser::setup_shear(&[0, 0, -(1 << 16), 0, 0, 1 << 16]));
        // Mild zoom with a small rotation.
        assert!(Parser::setup_shear(&[0, 0, (1 << 16) + 1024, 512, -512, (1 << 16) + 1024]));
    }

    #[test]
    fn inter_frame_needs_populated_references() {
        let mut parser = parser_with_sequence(Default::default());
        let err = parse_header(&mut parser, &inter_frame_with_bad_global_motion()).unwrap_err();
        assert_eq!(err.to_string(), "Inter frame requests nonexistent reference");
    }

    #[test]
    fn resync_requires_intra_frame() {
        let mut parser = parser_with_sequence(Default::default());
        let key = parse_header(&mut parser, &key_frame(Default::default())).unwrap();
        parser.ref_frame_update(&key).unwrap();
        parser.set_need_resync();

        let err = parse_header(&mut parser, &inter_frame_with_bad_global_motion()).unwrap_err();
        assert_eq!(err.to_string(), "Keyframe / intra-only frame required to reset decoder state");

        parse_header(&mut parser, &key_frame(Default::default())).unwrap();
        assert!(!parser.ref_info(0).unwrap().ref_valid);
    }

    #[test]
    fn decode_limit() {
        let mut parser = parser_with_sequence(Default::default());
        parser.set_max_decode_dimensions(Some(Resolution { width: 32, height: 32 }));
        let err = parse_header(&mut parser, &key_frame(Default::default())).unwrap_err();
        assert_eq!(err.to_string(), "Dimensions of 64x64 beyond allowed size of 32x32.");
    }

    #[test]
    fn large_scale_tile_info() {
        let seq = SeqOpts { width: 256, height: 128, ..Default::default() };
        let mut parser = parser_with_sequence(seq);
        parser.set_large_scale_tile(true);

        let mut payload = Vec::new();
        let mut w = BitWriter::new(&mut payload);
        w.write_bit(false).unwrap(); // show_existing_frame
        w.write_f(2, 0u32).unwrap(); // KEY_FRAME
        w.write_bit(true).unwrap(); // show_frame
        w.write_bit(true).unwrap(); // disable_cdf_update
        w.write_bit(false).unwrap(); // frame_size_override_flag
        w.write_f(7, 0u32).unwrap(); // order_hint
        w.write_bit(false).unwrap(); // render_and_frame_size_different
        w.write_f(6, 0u32).unwrap(); // tile width: one superblock
        w.write_f(6, 0u32).unwrap(); // tile height: one superblock
        w.write_f(2, 1u32).unwrap(); // tile_col_size_bytes_minus_1
        w.write_f(2, 3u32).unwrap(); // tile_size_bytes_minus_1
        w.write_f(8, 0u32).unwrap(); // base_q_idx
        w.write_f(4, 0u32).unwrap(); // delta q flags and using_qmatrix
        w.write_bit(false).unwrap(); // segmentation_enabled
        w.write_bit(false).unwrap(); // reduced_tx_set
        finish(w);

        let fh = parse_header(&mut parser, &obu(ObuType::FrameHeader, &payload)).unwrap();
        let ti = &fh.tile_info;
        assert_eq!((ti.tile_cols, ti.tile_rows), (4, 2));
        assert_eq!((ti.tile_width_mi, ti.tile_height_mi), (16, 16));
        assert_eq!(ti.tile_col_size_bytes, 2);
        assert_eq!(ti.tile_size_bytes, 4);
        assert_eq!(&ti.mi_col_starts[..5], &[0, 16, 32, 48, 64]);
        assert!(fh.large_scale_tile);
        assert!(fh.single_tile_decoding);
        assert_eq!(fh.refresh_frame_context, RefreshFrameContext::Disabled);
    }

    #[test]
    fn frame_obu_carries_tile_group() {
        let mut parser = parser_with_sequence(Default::default());

        // The trailing bits of the header payload double as the byte
        // alignment of a frame OBU.
        let mut payload = key_frame_payload(Default::default());
        payload.extend_from_slice(&[0xaa, 0xbb]);
        let data = obu(ObuType::Frame, &payload);

        let ObuAction::Process(obu) = parser.read_obu(&data).unwrap() else {
            panic!("dropped");
        };
        let ParsedObu::Frame(frame) = parser.parse_obu(obu).unwrap() else {
            panic!("not a frame");
        };

        assert_eq!(frame.tile_group.tg_start, 0);
        assert_eq!(frame.tile_group.tg_end, 0);
        assert_eq!(frame.tile_group.tile_data, &[0xaa, 0xbb]);
        assert_eq!(frame.header.header_bytes, data.len() - 2);
    }
}
