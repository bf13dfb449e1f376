// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Can't reasonably expect client code to consume everything that has been parsed.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::rc::Rc;

use enumn::N;
use log::debug;
use thiserror::Error;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluError;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu_reader::NaluReader;
use crate::codec::h264::nalu_reader::ReadBitsError;
use crate::Resolution;

pub(crate) const DEFAULT_4X4_INTRA: [u8; 16] = [
    6, 13, 13, 20, 20, 20, 28, 28, 28, 28, 32, 32, 32, 37, 37, 42,
];

pub(crate) const DEFAULT_4X4_INTER: [u8; 16] = [
    10, 14, 14, 20, 20, 20, 24, 24, 24, 24, 27, 27, 27, 30, 30, 34,
];

pub(crate) const DEFAULT_8X8_INTRA: [u8; 64] = [
    6, 10, 10, 13, 11, 13, 16, 16, 16, 16, 18, 18, 18, 18, 18, 23, 23, 23, 23, 23, 23, 25, 25, 25,
    25, 25, 25, 25, 27, 27, 27, 27, 27, 27, 27, 27, 29, 29, 29, 29, 29, 29, 29, 31, 31, 31, 31, 31,
    31, 33, 33, 33, 33, 33, 36, 36, 36, 36, 38, 38, 38, 40, 40, 42,
];

pub(crate) const DEFAULT_8X8_INTER: [u8; 64] = [
    9, 13, 13, 15, 13, 15, 17, 17, 17, 17, 19, 19, 19, 19, 19, 21, 21, 21, 21, 21, 21, 22, 22, 22,
    22, 22, 22, 22, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 27, 27, 27, 27, 27,
    27, 28, 28, 28, 28, 28, 30, 30, 30, 30, 32, 32, 32, 33, 33, 35,
];

const MAX_PPS_COUNT: u16 = 256;
const MAX_SPS_COUNT: u8 = 32;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

/// profile_idc values whose SPS carries chroma format, bit depth and scaling
/// matrix syntax. See 7.3.2.1.1.
const HIGH_PROFILE_IDCS: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed bitstream: {0}")]
    MalformedBitstream(#[from] ReadBitsError),
    #[error("invalid NAL unit: {0}")]
    Nalu(#[from] NaluError),
    #[error("invalid NAL unit type, expected {expected}, got {got:?}")]
    UnexpectedNaluType {
        expected: &'static str,
        got: NaluType,
    },
    #[error("unsupported profile: {0}")]
    UnsupportedProfile(String),
    #[error("unsupported pic_order_cnt_type {0}, only type 0 is supported")]
    UnsupportedPocType(u8),
    #[error("broken stream: PPS {0} has not been successfully parsed")]
    MissingPps(u8),
    #[error("broken stream: SPS {0} has not been successfully parsed")]
    MissingSps(u8),
    #[error("invalid {0}")]
    InvalidValue(&'static str),
    #[error("too many parameter sets of type {0:?}")]
    TooManyParameterSets(NaluType),
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect<T> {
    pub min: Point<T>,
    pub max: Point<T>,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-6 of ITU-T H.264.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }

    pub fn is_sp(&self) -> bool {
        matches!(self, SliceType::Sp)
    }

    pub fn is_si(&self) -> bool {
        matches!(self, SliceType::Si)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// A H264 Sequence Parameter Set, restricted to the syntax a hardware
/// decoder needs to be programmed with.
#[derive(Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,
    pub level_idc: Level,

    /// Always 1 (4:2:0) for streams this parser accepts.
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    pub seq_scaling_matrix_present_flag: bool,
    /// 4x4 scaling lists in zig-zag order, as read with 7.3.2.1.1.1.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    /// 8x8 scaling lists in zig-zag order, as read with 7.3.2.1.1.1.
    pub scaling_lists_8x8: [[u8; 64]; 6],

    /// MaxFrameNum = 2 ^ (log2_max_frame_num_minus4 + 4)
    pub log2_max_frame_num_minus4: u8,

    pub pic_order_cnt_type: u8,
    /// MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4)
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: Vec<i32>,
    /// ExpectedDeltaPerPicOrderCntCycle, see 7-12.
    pub expected_delta_per_pic_order_cnt_cycle: i32,

    /// Size of the sliding window of reference frames, and with it the number
    /// of DPB slots the decoder must provide.
    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    /// Always set for streams this parser accepts.
    pub frame_mbs_only_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: 0,
            profile_idc: 0,
            constraint_set0_flag: false,
            constraint_set1_flag: false,
            constraint_set2_flag: false,
            constraint_set3_flag: false,
            constraint_set4_flag: false,
            constraint_set5_flag: false,
            level_idc: Level::default(),
            chroma_format_idc: 1,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            qpprime_y_zero_transform_bypass_flag: false,
            seq_scaling_matrix_present_flag: false,
            scaling_lists_4x4: [[16; 16]; 6],
            scaling_lists_8x8: [[16; 64]; 6],
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 0,
            offset_for_ref_frame: Vec::new(),
            expected_delta_per_pic_order_cnt_cycle: 0,
            max_num_ref_frames: 0,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: true,
            direct_8x8_inference_flag: false,
            frame_cropping_flag: false,
            frame_crop_left_offset: 0,
            frame_crop_right_offset: 0,
            frame_crop_top_offset: 0,
            frame_crop_bottom_offset: 0,
            vui_parameters_present_flag: false,
            vui_parameters: VuiParams::default(),
        }
    }
}

impl Sps {
    /// Returns the coded width of the stream.
    ///
    /// See 7-13 through 7-17 of ITU-T H.264.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Returns the coded height of the stream.
    ///
    /// See 7-13 through 7-17 of ITU-T H.264.
    pub const fn height(&self) -> u32 {
        (self.pic_height_in_map_units_minus1 as u32 + 1)
            * 16
            * (2 - self.frame_mbs_only_flag as u32)
    }

    /// Returns `CropUnitX` and `CropUnitY` for 4:2:0 content.
    ///
    /// See 7-19 through 7-22 of ITU-T H.264.
    fn crop_unit_x_y(&self) -> (u32, u32) {
        (2, 2 * (2 - u32::from(self.frame_mbs_only_flag)))
    }

    /// Same as MaxFrameNum. See 7-10 of ITU-T H.264.
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Same as MaxPicOrderCntLsb. See 7-11 of ITU-T H.264.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn visible_rectangle(&self) -> Rect<u32> {
        if !self.frame_cropping_flag {
            return Rect {
                min: Point { x: 0, y: 0 },
                max: Point {
                    x: self.width(),
                    y: self.height(),
                },
            };
        }

        let (crop_unit_x, crop_unit_y) = self.crop_unit_x_y();

        let crop_left = crop_unit_x * self.frame_crop_left_offset;
        let crop_right = crop_unit_x * self.frame_crop_right_offset;
        let crop_top = crop_unit_y * self.frame_crop_top_offset;
        let crop_bottom = crop_unit_y * self.frame_crop_bottom_offset;

        Rect {
            min: Point {
                x: crop_left,
                y: crop_top,
            },
            max: Point {
                x: self.width() - crop_left - crop_right,
                y: self.height() - crop_top - crop_bottom,
            },
        }
    }

    /// The picture size once the crop window is removed.
    pub fn display_resolution(&self) -> Resolution {
        let rect = self.visible_rectangle();
        Resolution {
            width: rect.max.x,
            height: rect.max.y,
        }
    }

    /// The macroblock-aligned size decode surfaces must have.
    pub fn padded_resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }

    /// Number of DPB slots needed to decode this sequence: every reference
    /// frame plus the picture being reconstructed.
    pub fn num_dpb_slots(&self) -> usize {
        usize::from(self.max_num_ref_frames) + 1
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub cpb_cnt_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

/// Video usability information, see Annex E.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    /// Inferred to be 5 (unspecified) when absent.
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters: HrdParams,
    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            fixed_frame_rate_flag: false,
            nal_hrd_parameters_present_flag: false,
            nal_hrd_parameters: HrdParams::default(),
            vcl_hrd_parameters_present_flag: false,
            vcl_hrd_parameters: HrdParams::default(),
            low_delay_hrd_flag: false,
            pic_struct_present_flag: false,
            bitstream_restriction_flag: false,
            motion_vectors_over_pic_boundaries_flag: true,
            max_bytes_per_pic_denom: 0,
            max_bits_per_mb_denom: 0,
            log2_max_mv_length_horizontal: 0,
            log2_max_mv_length_vertical: 0,
            max_num_reorder_frames: 0,
            max_dec_frame_buffering: 0,
        }
    }
}

/// A H264 Picture Parameter Set.
#[derive(Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    /// CABAC if set, CAVLC otherwise.
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    /// Always 0 for streams this parser accepts.
    pub num_slice_groups_minus1: u32,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,

    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    pub transform_8x8_mode_flag: bool,

    /// If not set, the scaling lists are inherited from the SPS.
    pub pic_scaling_matrix_present_flag: bool,
    /// 4x4 scaling lists in zig-zag order.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    /// 8x8 scaling lists in zig-zag order.
    pub scaling_lists_8x8: [[u8; 64]; 6],

    /// Inferred to be equal to `chroma_qp_index_offset` when absent.
    pub second_chroma_qp_index_offset: i8,

    /// The SPS referenced by this PPS.
    pub sps: Rc<Sps>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefPicListModification {
    /// modification_of_pic_nums_idc == 0
    SubtractPicNum { abs_diff_pic_num_minus1: u32 },
    /// modification_of_pic_nums_idc == 1
    AddPicNum { abs_diff_pic_num_minus1: u32 },
    /// modification_of_pic_nums_idc == 2
    LongTermPicNum { long_term_pic_num: u32 },
}

/// Memory management control operations, see table 7-9.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryManagementOp {
    UnmarkShortTerm {
        difference_of_pic_nums_minus1: u32,
    },
    UnmarkLongTerm {
        long_term_pic_num: u32,
    },
    ShortTermToLongTerm {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    SetMaxLongTermFrameIdx {
        max_long_term_frame_idx_plus1: u32,
    },
    UnmarkAll,
    CurrentToLongTerm {
        long_term_frame_idx: u32,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// IDR only.
    pub no_output_of_prior_pics_flag: bool,
    /// IDR only.
    pub long_term_reference_flag: bool,
    /// Non-IDR only.
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub operations: Vec<MemoryManagementOp>,
}

/// A H264 slice header.
///
/// Only the fields up to `pic_order_cnt_lsb` drive decoding. The rest of the
/// header is consumed so `header_bit_size` is exact and kept for logging; the
/// reference list is managed by the DPB tracker's sliding window instead.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    /// IDR only.
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub redundant_pic_cnt: u8,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,
    pub dec_ref_pic_marking: RefPicMarking,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    /// Size of the header in bits, NAL header byte included and
    /// emulation-prevention bytes excluded.
    pub header_bit_size: usize,
    pub n_emulation_prevention_bytes: usize,
}

fn default_scaling_list_4x4(i: usize) -> [u8; 16] {
    // Table 7-2: lists 0..2 are intra, 3..5 inter.
    if i < 3 {
        DEFAULT_4X4_INTRA
    } else {
        DEFAULT_4X4_INTER
    }
}

fn default_scaling_list_8x8(i: usize) -> [u8; 64] {
    if i % 2 == 0 {
        DEFAULT_8X8_INTRA
    } else {
        DEFAULT_8X8_INTER
    }
}

/// Applies table 7-2 fall-back rules for an absent 4x4 list. `intra` and
/// `inter` are the defaults (rule A) or the SPS lists (rule B).
fn fallback_scaling_list_4x4(
    lists: &mut [[u8; 16]; 6],
    i: usize,
    intra: &[u8; 16],
    inter: &[u8; 16],
) {
    lists[i] = match i {
        0 => *intra,
        3 => *inter,
        _ => lists[i - 1],
    }
}

fn fallback_scaling_list_8x8(
    lists: &mut [[u8; 64]; 6],
    i: usize,
    intra: &[u8; 64],
    inter: &[u8; 64],
) {
    lists[i] = match i {
        0 => *intra,
        1 => *inter,
        _ => lists[i - 2],
    }
}

/// Reads one scaling_list() as in 7.3.2.1.1.1. Returns `true` if the default
/// list should be used instead.
fn parse_scaling_list(r: &mut NaluReader, scaling_list: &mut [u8]) -> ParseResult<bool> {
    let mut last_scale = 8u8;
    let mut next_scale = 8u8;

    for j in 0..scaling_list.len() {
        if next_scale != 0 {
            let delta_scale = r.read_se_bounded::<i32>(-128, 127)?;
            next_scale = ((i32::from(last_scale) + delta_scale + 256) % 256) as u8;
            if j == 0 && next_scale == 0 {
                return Ok(true);
            }
        }

        scaling_list[j] = if next_scale == 0 {
            last_scale
        } else {
            next_scale
        };

        last_scale = scaling_list[j];
    }

    Ok(false)
}

fn parse_sps_scaling_lists(r: &mut NaluReader, sps: &mut Sps) -> ParseResult<()> {
    for i in 0..6 {
        if r.read_bit()? {
            if parse_scaling_list(r, &mut sps.scaling_lists_4x4[i])? {
                sps.scaling_lists_4x4[i] = default_scaling_list_4x4(i);
            }
        } else {
            fallback_scaling_list_4x4(
                &mut sps.scaling_lists_4x4,
                i,
                &DEFAULT_4X4_INTRA,
                &DEFAULT_4X4_INTER,
            );
        }
    }

    // 4:2:0 only carries the two luma 8x8 lists.
    for i in 0..2 {
        if r.read_bit()? {
            if parse_scaling_list(r, &mut sps.scaling_lists_8x8[i])? {
                sps.scaling_lists_8x8[i] = default_scaling_list_8x8(i);
            }
        } else {
            fallback_scaling_list_8x8(
                &mut sps.scaling_lists_8x8,
                i,
                &DEFAULT_8X8_INTRA,
                &DEFAULT_8X8_INTER,
            );
        }
    }

    Ok(())
}

fn parse_pps_scaling_lists(r: &mut NaluReader, pps: &mut Pps, sps: &Sps) -> ParseResult<()> {
    // Fall-back rule A uses the default tables, rule B the SPS lists.
    let (intra_4x4, inter_4x4, intra_8x8, inter_8x8) = if sps.seq_scaling_matrix_present_flag {
        (
            sps.scaling_lists_4x4[0],
            sps.scaling_lists_4x4[3],
            sps.scaling_lists_8x8[0],
            sps.scaling_lists_8x8[1],
        )
    } else {
        (
            DEFAULT_4X4_INTRA,
            DEFAULT_4X4_INTER,
            DEFAULT_8X8_INTRA,
            DEFAULT_8X8_INTER,
        )
    };

    for i in 0..6 {
        if r.read_bit()? {
            if parse_scaling_list(r, &mut pps.scaling_lists_4x4[i])? {
                pps.scaling_lists_4x4[i] = default_scaling_list_4x4(i);
            }
        } else {
            fallback_scaling_list_4x4(&mut pps.scaling_lists_4x4, i, &intra_4x4, &inter_4x4);
        }
    }

    if pps.transform_8x8_mode_flag {
        for i in 0..2 {
            if r.read_bit()? {
                if parse_scaling_list(r, &mut pps.scaling_lists_8x8[i])? {
                    pps.scaling_lists_8x8[i] = default_scaling_list_8x8(i);
                }
            } else {
                fallback_scaling_list_8x8(&mut pps.scaling_lists_8x8, i, &intra_8x8, &inter_8x8);
            }
        }
    } else {
        pps.scaling_lists_8x8 = sps.scaling_lists_8x8;
    }

    Ok(())
}

fn parse_hrd(r: &mut NaluReader, hrd: &mut HrdParams) -> ParseResult<()> {
    hrd.cpb_cnt_minus1 = r.read_ue_max(31)?;
    hrd.bit_rate_scale = r.read_bits(4)?;
    hrd.cpb_size_scale = r.read_bits(4)?;

    for sched_sel_idx in 0..=usize::from(hrd.cpb_cnt_minus1) {
        hrd.bit_rate_value_minus1[sched_sel_idx] = r.read_ue()?;
        hrd.cpb_size_value_minus1[sched_sel_idx] = r.read_ue()?;
        hrd.cbr_flag[sched_sel_idx] = r.read_bit()?;
    }

    hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
    hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
    hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
    hrd.time_offset_length = r.read_bits(5)?;
    Ok(())
}

fn read_u32(r: &mut NaluReader) -> ParseResult<u32> {
    let high = r.read_bits::<u32>(16)?;
    let low = r.read_bits::<u32>(16)?;
    Ok((high << 16) | low)
}

fn parse_vui(r: &mut NaluReader, vui: &mut VuiParams) -> ParseResult<()> {
    vui.aspect_ratio_info_present_flag = r.read_bit()?;
    if vui.aspect_ratio_info_present_flag {
        vui.aspect_ratio_idc = r.read_bits(8)?;
        // Extended_SAR
        if vui.aspect_ratio_idc == 255 {
            vui.sar_width = r.read_bits(16)?;
            vui.sar_height = r.read_bits(16)?;
        }
    }

    vui.overscan_info_present_flag = r.read_bit()?;
    if vui.overscan_info_present_flag {
        vui.overscan_appropriate_flag = r.read_bit()?;
    }

    vui.video_signal_type_present_flag = r.read_bit()?;
    if vui.video_signal_type_present_flag {
        vui.video_format = r.read_bits(3)?;
        vui.video_full_range_flag = r.read_bit()?;
        vui.colour_description_present_flag = r.read_bit()?;
        if vui.colour_description_present_flag {
            vui.colour_primaries = r.read_bits(8)?;
            vui.transfer_characteristics = r.read_bits(8)?;
            vui.matrix_coefficients = r.read_bits(8)?;
        }
    }

    vui.chroma_loc_info_present_flag = r.read_bit()?;
    if vui.chroma_loc_info_present_flag {
        vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
        vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
    }

    vui.timing_info_present_flag = r.read_bit()?;
    if vui.timing_info_present_flag {
        vui.num_units_in_tick = read_u32(r)?;
        if vui.num_units_in_tick == 0 {
            return Err(ParseError::InvalidValue("num_units_in_tick"));
        }

        vui.time_scale = read_u32(r)?;
        if vui.time_scale == 0 {
            return Err(ParseError::InvalidValue("time_scale"));
        }

        vui.fixed_frame_rate_flag = r.read_bit()?;
    }

    vui.nal_hrd_parameters_present_flag = r.read_bit()?;
    if vui.nal_hrd_parameters_present_flag {
        parse_hrd(r, &mut vui.nal_hrd_parameters)?;
    }

    vui.vcl_hrd_parameters_present_flag = r.read_bit()?;
    if vui.vcl_hrd_parameters_present_flag {
        parse_hrd(r, &mut vui.vcl_hrd_parameters)?;
    }

    if vui.nal_hrd_parameters_present_flag || vui.vcl_hrd_parameters_present_flag {
        vui.low_delay_hrd_flag = r.read_bit()?;
    }

    vui.pic_struct_present_flag = r.read_bit()?;
    vui.bitstream_restriction_flag = r.read_bit()?;

    if vui.bitstream_restriction_flag {
        vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
        vui.max_bytes_per_pic_denom = r.read_ue()?;
        vui.max_bits_per_mb_denom = r.read_ue_max(16)?;
        vui.log2_max_mv_length_horizontal = r.read_ue_max(16)?;
        vui.log2_max_mv_length_vertical = r.read_ue_max(16)?;
        vui.max_num_reorder_frames = r.read_ue()?;
        vui.max_dec_frame_buffering = r.read_ue()?;
    }

    Ok(())
}

fn parse_ref_pic_list_modification(
    r: &mut NaluReader,
    mods: &mut Vec<RefPicListModification>,
) -> ParseResult<()> {
    loop {
        let modification = match r.read_ue_max::<u8>(3)? {
            0 => RefPicListModification::SubtractPicNum {
                abs_diff_pic_num_minus1: r.read_ue()?,
            },
            1 => RefPicListModification::AddPicNum {
                abs_diff_pic_num_minus1: r.read_ue()?,
            },
            2 => RefPicListModification::LongTermPicNum {
                long_term_pic_num: r.read_ue()?,
            },
            _ => break,
        };

        // At most num_ref_idx_active_minus1 + 1 modifications plus the end marker.
        if mods.len() > 32 {
            return Err(ParseError::InvalidValue("ref_pic_list_modification"));
        }
        mods.push(modification);
    }

    Ok(())
}

/// Consumes pred_weight_table(). Explicit weights are programmed by the
/// hardware from the slice data itself, so the values are not kept.
fn skip_pred_weight_table(r: &mut NaluReader, header: &SliceHeader) -> ParseResult<()> {
    // luma_log2_weight_denom, chroma_log2_weight_denom
    r.read_ue_max::<u32>(7)?;
    r.read_ue_max::<u32>(7)?;

    let mut lists = vec![header.num_ref_idx_l0_active_minus1];
    if header.slice_type.is_b() {
        lists.push(header.num_ref_idx_l1_active_minus1);
    }

    for num_ref_idx_active_minus1 in lists {
        for _ in 0..=num_ref_idx_active_minus1 {
            // luma_weight_lX_flag
            if r.read_bit()? {
                r.read_se_bounded::<i32>(-128, 127)?;
                r.read_se_bounded::<i32>(-128, 127)?;
            }

            // chroma_weight_lX_flag
            if r.read_bit()? {
                for _ in 0..2 {
                    r.read_se_bounded::<i32>(-128, 127)?;
                    r.read_se_bounded::<i32>(-128, 127)?;
                }
            }
        }
    }

    Ok(())
}

fn parse_dec_ref_pic_marking(
    r: &mut NaluReader,
    idr_pic_flag: bool,
    marking: &mut RefPicMarking,
) -> ParseResult<()> {
    if idr_pic_flag {
        marking.no_output_of_prior_pics_flag = r.read_bit()?;
        marking.long_term_reference_flag = r.read_bit()?;
        return Ok(());
    }

    marking.adaptive_ref_pic_marking_mode_flag = r.read_bit()?;
    if !marking.adaptive_ref_pic_marking_mode_flag {
        return Ok(());
    }

    loop {
        let op = match r.read_ue_max::<u8>(6)? {
            0 => break,
            1 => MemoryManagementOp::UnmarkShortTerm {
                difference_of_pic_nums_minus1: r.read_ue()?,
            },
            2 => MemoryManagementOp::UnmarkLongTerm {
                long_term_pic_num: r.read_ue()?,
            },
            3 => MemoryManagementOp::ShortTermToLongTerm {
                difference_of_pic_nums_minus1: r.read_ue()?,
                long_term_frame_idx: r.read_ue()?,
            },
            4 => MemoryManagementOp::SetMaxLongTermFrameIdx {
                max_long_term_frame_idx_plus1: r.read_ue()?,
            },
            5 => MemoryManagementOp::UnmarkAll,
            _ => MemoryManagementOp::CurrentToLongTerm {
                long_term_frame_idx: r.read_ue()?,
            },
        };

        if marking.operations.len() >= 66 {
            return Err(ParseError::InvalidValue("dec_ref_pic_marking"));
        }
        marking.operations.push(op);
    }

    Ok(())
}

/// Keeps the parameter sets seen so far and decodes slice headers against
/// them.
#[derive(Debug, Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
}

impl Parser {
    /// Parse a SPS and add it to the list of active SPSes.
    ///
    /// Returns a reference to the new SPS.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> ParseResult<&Rc<Sps>> {
        if !matches!(nalu.header.type_, NaluType::Sps) {
            return Err(ParseError::UnexpectedNaluType {
                expected: "SPS",
                got: nalu.header.type_,
            });
        }

        let mut r = NaluReader::new(nalu.payload());
        let mut sps = Sps {
            profile_idc: r.read_bits(8)?,
            constraint_set0_flag: r.read_bit()?,
            constraint_set1_flag: r.read_bit()?,
            constraint_set2_flag: r.read_bit()?,
            constraint_set3_flag: r.read_bit()?,
            constraint_set4_flag: r.read_bit()?,
            constraint_set5_flag: r.read_bit()?,
            ..Default::default()
        };

        // skip reserved_zero_2bits
        r.skip_bits(2)?;

        let level: u8 = r.read_bits(8)?;
        sps.level_idc = Level::n(level).ok_or(ParseError::InvalidValue("level_idc"))?;
        sps.seq_parameter_set_id = r.read_ue_max(u32::from(MAX_SPS_COUNT) - 1)?;

        if HIGH_PROFILE_IDCS.contains(&sps.profile_idc) {
            sps.chroma_format_idc = r.read_ue_max(3)?;
            if sps.chroma_format_idc != 1 {
                return Err(ParseError::UnsupportedProfile(format!(
                    "chroma_format_idc {} is not 4:2:0",
                    sps.chroma_format_idc
                )));
            }

            sps.bit_depth_luma_minus8 = r.read_ue_max(6)?;
            sps.bit_depth_chroma_minus8 = r.read_ue_max(6)?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            sps.seq_scaling_matrix_present_flag = r.read_bit()?;

            if sps.seq_scaling_matrix_present_flag {
                parse_sps_scaling_lists(&mut r, &mut sps)?;
            }
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_max(12)?;

        sps.pic_order_cnt_type = r.read_ue_max(2)?;

        if sps.pic_order_cnt_type == 0 {
            sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        } else if sps.pic_order_cnt_type == 1 {
            sps.delta_pic_order_always_zero_flag = r.read_bit()?;
            sps.offset_for_non_ref_pic = r.read_se()?;
            sps.offset_for_top_to_bottom_field = r.read_se()?;
            sps.num_ref_frames_in_pic_order_cnt_cycle = r.read_ue_max(254)?;

            for _ in 0..sps.num_ref_frames_in_pic_order_cnt_cycle {
                sps.offset_for_ref_frame.push(r.read_se()?);
            }

            // (7-12) of ITU-T H.264.
            sps.expected_delta_per_pic_order_cnt_cycle = sps
                .offset_for_ref_frame
                .iter()
                .fold(0i32, |acc, offset| acc.wrapping_add(*offset));
        }

        sps.max_num_ref_frames = r.read_ue_max(DPB_MAX_SIZE as u32)?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_bit()?;

        if !sps.frame_mbs_only_flag {
            return Err(ParseError::UnsupportedProfile(
                "interlaced (field or MBAFF) coding".into(),
            ));
        }

        sps.direct_8x8_inference_flag = r.read_bit()?;
        sps.frame_cropping_flag = r.read_bit()?;

        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;

            // The crop window must leave a non-empty picture.
            let (crop_unit_x, crop_unit_y) = sps.crop_unit_x_y();

            sps.frame_crop_left_offset
                .checked_add(sps.frame_crop_right_offset)
                .and_then(|v| v.checked_mul(crop_unit_x))
                .and_then(|v| sps.width().checked_sub(v))
                .filter(|w| *w > 0)
                .ok_or(ParseError::InvalidValue("frame crop width"))?;

            sps.frame_crop_top_offset
                .checked_add(sps.frame_crop_bottom_offset)
                .and_then(|v| v.checked_mul(crop_unit_y))
                .and_then(|v| sps.height().checked_sub(v))
                .filter(|h| *h > 0)
                .ok_or(ParseError::InvalidValue("frame crop height"))?;
        }

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            parse_vui(&mut r, &mut sps.vui_parameters)?;
        }

        let key = sps.seq_parameter_set_id;

        if !self.active_spses.contains_key(&key)
            && self.active_spses.len() >= usize::from(MAX_SPS_COUNT)
        {
            return Err(ParseError::TooManyParameterSets(NaluType::Sps));
        }

        debug!(
            "SPS {}: profile {} level {:?}, {}x{} macroblocks, {} reference frames",
            key,
            sps.profile_idc,
            sps.level_idc,
            sps.pic_width_in_mbs_minus1 + 1,
            sps.pic_height_in_map_units_minus1 + 1,
            sps.max_num_ref_frames
        );

        self.active_spses.insert(key, Rc::new(sps));
        self.active_spses
            .get(&key)
            .ok_or(ParseError::MissingSps(key))
    }

    pub fn parse_pps(&mut self, nalu: &Nalu) -> ParseResult<&Rc<Pps>> {
        if !matches!(nalu.header.type_, NaluType::Pps) {
            return Err(ParseError::UnexpectedNaluType {
                expected: "PPS",
                got: nalu.header.type_,
            });
        }

        let mut r = NaluReader::new(nalu.payload());
        let pic_parameter_set_id = r.read_ue_max(u32::from(MAX_PPS_COUNT) - 1)?;
        let seq_parameter_set_id = r.read_ue_max(u32::from(MAX_SPS_COUNT) - 1)?;
        let sps = Rc::clone(
            self.get_sps(seq_parameter_set_id)
                .ok_or(ParseError::MissingSps(seq_parameter_set_id))?,
        );

        let mut pps = Pps {
            pic_parameter_set_id,
            seq_parameter_set_id,
            entropy_coding_mode_flag: r.read_bit()?,
            bottom_field_pic_order_in_frame_present_flag: r.read_bit()?,
            num_slice_groups_minus1: r.read_ue_max(7)?,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            scaling_lists_4x4: sps.scaling_lists_4x4,
            scaling_lists_8x8: sps.scaling_lists_8x8,
            second_chroma_qp_index_offset: 0,
            sps: Rc::clone(&sps),
        };

        if pps.num_slice_groups_minus1 > 0 {
            return Err(ParseError::UnsupportedProfile(format!(
                "{} slice groups",
                pps.num_slice_groups_minus1 + 1
            )));
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(31)?;

        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;

        let qp_bd_offset_y = i32::from(6 * sps.bit_depth_luma_minus8);
        pps.pic_init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.pic_init_qs_minus26 = r.read_se_bounded(-26, 25)?;

        pps.chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        pps.second_chroma_qp_index_offset = pps.chroma_qp_index_offset;

        pps.deblocking_filter_control_present_flag = r.read_bit()?;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.redundant_pic_cnt_present_flag = r.read_bit()?;

        if r.has_more_rsbp_data() {
            pps.transform_8x8_mode_flag = r.read_bit()?;
            pps.pic_scaling_matrix_present_flag = r.read_bit()?;

            if pps.pic_scaling_matrix_present_flag {
                parse_pps_scaling_lists(&mut r, &mut pps, &sps)?;
            }

            pps.second_chroma_qp_index_offset = r.read_se_bounded(-12, 12)?;
        }

        let key = pps.pic_parameter_set_id;

        if !self.active_ppses.contains_key(&key)
            && self.active_ppses.len() >= usize::from(MAX_PPS_COUNT)
        {
            return Err(ParseError::TooManyParameterSets(NaluType::Pps));
        }

        debug!(
            "PPS {} -> SPS {}: {}, transform_8x8 {}",
            key,
            seq_parameter_set_id,
            if pps.entropy_coding_mode_flag {
                "CABAC"
            } else {
                "CAVLC"
            },
            pps.transform_8x8_mode_flag
        );

        self.active_ppses.insert(key, Rc::new(pps));
        self.active_ppses
            .get(&key)
            .ok_or(ParseError::MissingPps(key))
    }

    pub fn parse_slice_header(&self, nalu: &Nalu) -> ParseResult<SliceHeader> {
        if !nalu.header.is_slice() {
            return Err(ParseError::UnexpectedNaluType {
                expected: "coded slice",
                got: nalu.header.type_,
            });
        }

        let mut r = NaluReader::new(nalu.payload());

        let mut header = SliceHeader {
            first_mb_in_slice: r.read_ue()?,
            ..Default::default()
        };

        let slice_type = r.read_ue_max::<u8>(9)? % 5;
        header.slice_type =
            SliceType::n(slice_type).ok_or(ParseError::InvalidValue("slice_type"))?;

        header.pic_parameter_set_id = r.read_ue_max(u32::from(MAX_PPS_COUNT) - 1)?;

        let pps = self
            .get_pps(header.pic_parameter_set_id)
            .ok_or(ParseError::MissingPps(header.pic_parameter_set_id))?;
        let sps = &pps.sps;

        header.frame_num = r.read_bits(usize::from(sps.log2_max_frame_num_minus4) + 4)?;

        if !sps.frame_mbs_only_flag {
            header.field_pic_flag = r.read_bit()?;
            if header.field_pic_flag {
                header.bottom_field_flag = r.read_bit()?;
            }
        }

        if nalu.header.idr_pic_flag {
            header.idr_pic_id = r.read_ue_max(0xffff)?;
        }

        if sps.pic_order_cnt_type != 0 {
            return Err(ParseError::UnsupportedPocType(sps.pic_order_cnt_type));
        }

        header.pic_order_cnt_lsb =
            r.read_bits(usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4)?;

        if pps.bottom_field_pic_order_in_frame_present_flag && !header.field_pic_flag {
            header.delta_pic_order_cnt_bottom = r.read_se()?;
        }

        if pps.redundant_pic_cnt_present_flag {
            header.redundant_pic_cnt = r.read_ue_max(127)?;
        }

        if header.slice_type.is_b() {
            header.direct_spatial_mv_pred_flag = r.read_bit()?;
        }

        if header.slice_type.is_p() || header.slice_type.is_sp() || header.slice_type.is_b() {
            header.num_ref_idx_active_override_flag = r.read_bit()?;
            if header.num_ref_idx_active_override_flag {
                header.num_ref_idx_l0_active_minus1 = r.read_ue_max(15)?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue_max(15)?;
                }
            } else {
                header.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
                }
            }
        }

        if header.num_ref_idx_l0_active_minus1 > 15 || header.num_ref_idx_l1_active_minus1 > 15 {
            return Err(ParseError::InvalidValue("num_ref_idx_active_minus1"));
        }

        if !header.slice_type.is_i() && !header.slice_type.is_si() && r.read_bit()? {
            parse_ref_pic_list_modification(&mut r, &mut header.ref_pic_list_modification_l0)?;
        }

        if header.slice_type.is_b() && r.read_bit()? {
            parse_ref_pic_list_modification(&mut r, &mut header.ref_pic_list_modification_l1)?;
        }

        if (pps.weighted_pred_flag && (header.slice_type.is_p() || header.slice_type.is_sp()))
            || (pps.weighted_bipred_idc == 1 && header.slice_type.is_b())
        {
            skip_pred_weight_table(&mut r, &header)?;
        }

        if nalu.header.ref_idc != 0 {
            parse_dec_ref_pic_marking(
                &mut r,
                nalu.header.idr_pic_flag,
                &mut header.dec_ref_pic_marking,
            )?;
        }

        if pps.entropy_coding_mode_flag && !header.slice_type.is_i() && !header.slice_type.is_si() {
            header.cabac_init_idc = r.read_ue_max(2)?;
        }

        header.slice_qp_delta = r.read_se_bounded(-87, 77)?;

        if header.slice_type.is_sp() || header.slice_type.is_si() {
            if header.slice_type.is_sp() {
                header.sp_for_switch_flag = r.read_bit()?;
            }

            header.slice_qs_delta = r.read_se_bounded(-51, 51)?;
        }

        if pps.deblocking_filter_control_present_flag {
            header.disable_deblocking_filter_idc = r.read_ue_max(2)?;

            if header.disable_deblocking_filter_idc != 1 {
                header.slice_alpha_c0_offset_div2 = r.read_se_bounded(-6, 6)?;
                header.slice_beta_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        let epb = r.num_epb();
        header.header_bit_size = (nalu.size - epb) * 8 - r.num_bits_left();
        header.n_emulation_prevention_bytes = epb;

        Ok(header)
    }

    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.active_spses.get(&sps_id)
    }

    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.active_ppses.get(&pps_id)
    }

    /// All SPSes parsed so far, by ascending id.
    pub fn spses(&self) -> impl Iterator<Item = &Rc<Sps>> {
        self.active_spses.values()
    }

    /// All PPSes parsed so far, by ascending id.
    pub fn ppses(&self) -> impl Iterator<Item = &Rc<Pps>> {
        self.active_ppses.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu_writer::synthesize_pps;
    use crate::codec::h264::nalu_writer::synthesize_slice;
    use crate::codec::h264::nalu_writer::synthesize_sps;
    use crate::codec::h264::nalu_writer::PpsParams;
    use crate::codec::h264::nalu_writer::SliceParams;
    use crate::codec::h264::nalu_writer::SpsParams;

    fn nalu(bytes: &[u8]) -> Nalu {
        // Strip the start code the writer emits.
        Nalu::from_bytes(&bytes[4..]).unwrap()
    }

    fn parser_with(sps: &SpsParams, pps: &PpsParams) -> Parser {
        let mut parser = Parser::default();
        parser.parse_sps(&nalu(&synthesize_sps(sps))).unwrap();
        parser.parse_pps(&nalu(&synthesize_pps(pps))).unwrap();
        parser
    }

    #[test]
    fn parse_baseline_sps() {
        let params = SpsParams {
            width_in_mbs: 80,
            height_in_mbs: 45,
            max_num_ref_frames: 4,
            crop: Some((0, 0, 0, 0)),
            ..Default::default()
        };

        let mut parser = Parser::default();
        let sps = parser.parse_sps(&nalu(&synthesize_sps(&params))).unwrap();

        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.level_idc, Level::L4);
        assert_eq!(sps.chroma_format_idc, 1);
        assert_eq!(sps.pic_width_in_mbs_minus1, 79);
        assert_eq!(sps.pic_height_in_map_units_minus1, 44);
        assert_eq!(sps.num_dpb_slots(), 5);
        assert_eq!(sps.max_frame_num(), 16);
        assert_eq!(sps.max_pic_order_cnt_lsb(), 256);
        assert_eq!(
            sps.display_resolution(),
            Resolution {
                width: 1280,
                height: 720
            }
        );
        assert_eq!(sps.scaling_lists_4x4, [[16; 16]; 6]);
    }

    #[test]
    fn parse_cropped_sps_with_vui() {
        // 1920x1080 coded as 120x68 macroblocks with 8 lines cropped.
        let params = SpsParams {
            profile_idc: 100,
            level_idc: 41,
            width_in_mbs: 120,
            height_in_mbs: 68,
            crop: Some((0, 0, 0, 4)),
            timing: Some((1001, 60000)),
            max_num_reorder_frames: Some(2),
            ..Default::default()
        };

        let mut parser = Parser::default();
        let sps = parser.parse_sps(&nalu(&synthesize_sps(&params))).unwrap();

        assert_eq!(
            sps.display_resolution(),
            Resolution {
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(
            sps.padded_resolution(),
            Resolution {
                width: 1920,
                height: 1088
            }
        );
        assert!(sps.vui_parameters_present_flag);
        assert!(sps.vui_parameters.timing_info_present_flag);
        assert_eq!(sps.vui_parameters.num_units_in_tick, 1001);
        assert_eq!(sps.vui_parameters.time_scale, 60000);
        assert_eq!(sps.vui_parameters.max_num_reorder_frames, 2);
    }

    #[test]
    fn sps_scaling_lists_fall_back() {
        let mut lists = vec![None; 8];
        // List 0 explicit, list 3 requests the default table, the rest
        // follow fall-back rule A.
        lists[0] = Some(vec![4; 16]);
        lists[3] = Some(vec![]);

        let params = SpsParams {
            profile_idc: 100,
            scaling_lists: Some(lists),
            ..Default::default()
        };

        let mut parser = Parser::default();
        let sps = parser.parse_sps(&nalu(&synthesize_sps(&params))).unwrap();

        assert!(sps.seq_scaling_matrix_present_flag);
        assert_eq!(sps.scaling_lists_4x4[0], [4; 16]);
        assert_eq!(sps.scaling_lists_4x4[1], [4; 16]);
        assert_eq!(sps.scaling_lists_4x4[2], [4; 16]);
        assert_eq!(sps.scaling_lists_4x4[3], DEFAULT_4X4_INTER);
        assert_eq!(sps.scaling_lists_4x4[5], DEFAULT_4X4_INTER);
        assert_eq!(sps.scaling_lists_8x8[0], DEFAULT_8X8_INTRA);
        assert_eq!(sps.scaling_lists_8x8[1], DEFAULT_8X8_INTER);
    }

    #[test]
    fn pps_inherits_and_overrides_scaling_lists() {
        let sps = SpsParams {
            profile_idc: 100,
            ..Default::default()
        };

        let mut lists = vec![None; 8];
        lists[4] = Some((1..=16).collect());
        let pps = PpsParams {
            transform_8x8_mode: true,
            scaling_lists: Some(lists),
            ..Default::default()
        };

        let parser = parser_with(&sps, &pps);
        let pps = parser.get_pps(0).unwrap();

        assert!(pps.transform_8x8_mode_flag);
        // Rule A: no SPS matrix, so absent lists use the default tables.
        assert_eq!(pps.scaling_lists_4x4[0], DEFAULT_4X4_INTRA);
        assert_eq!(pps.scaling_lists_4x4[3], DEFAULT_4X4_INTER);
        let expected: Vec<u8> = (1..=16).collect();
        assert_eq!(pps.scaling_lists_4x4[4].as_slice(), expected.as_slice());
        assert_eq!(pps.scaling_lists_4x4[5].as_slice(), expected.as_slice());
        assert_eq!(pps.scaling_lists_8x8[0], DEFAULT_8X8_INTRA);
    }

    #[test]
    fn rejects_unsupported_chroma_format() {
        let params = SpsParams {
            profile_idc: 100,
            chroma_format_idc: 2,
            ..Default::default()
        };

        let mut parser = Parser::default();
        let err = parser.parse_sps(&nalu(&synthesize_sps(&params))).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedProfile(_)));
    }

    #[test]
    fn rejects_interlaced_streams() {
        let params = SpsParams {
            frame_mbs_only: false,
            ..Default::default()
        };

        let mut parser = Parser::default();
        let err = parser.parse_sps(&nalu(&synthesize_sps(&params))).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedProfile(_)));
    }

    #[test]
    fn rejects_slice_groups() {
        let mut parser = Parser::default();
        parser
            .parse_sps(&nalu(&synthesize_sps(&Default::default())))
            .unwrap();

        let pps = PpsParams {
            num_slice_groups_minus1: 1,
            ..Default::default()
        };
        let err = parser.parse_pps(&nalu(&synthesize_pps(&pps))).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedProfile(_)));
    }

    #[test]
    fn pps_requires_sps() {
        let mut parser = Parser::default();
        let pps = PpsParams {
            sps_id: 3,
            ..Default::default()
        };
        let err = parser.parse_pps(&nalu(&synthesize_pps(&pps))).unwrap_err();
        assert!(matches!(err, ParseError::MissingSps(3)));
    }

    #[test]
    fn invalid_sps_crop_width() {
        // 16x16 picture with a 20 pixel wide crop window.
        let params = SpsParams {
            width_in_mbs: 1,
            height_in_mbs: 1,
            crop: Some((5, 5, 0, 0)),
            ..Default::default()
        };

        let mut parser = Parser::default();
        let err = parser.parse_sps(&nalu(&synthesize_sps(&params))).unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue(_)));
    }

    #[test]
    fn truncated_sps_is_malformed() {
        let bytes = synthesize_sps(&Default::default());
        let mut parser = Parser::default();
        let err = parser.parse_sps(&nalu(&bytes[..7])).unwrap_err();
        assert!(matches!(err, ParseError::MalformedBitstream(_)));
    }

    #[test]
    fn parse_idr_slice_header() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let parser = parser_with(&sps, &pps);

        let slice = SliceParams {
            idr: true,
            ref_idc: 3,
            slice_type: SliceType::I,
            frame_num: 0,
            idr_pic_id: 7,
            pic_order_cnt_lsb: 0,
            slice_qp_delta: -3,
            ..Default::default()
        };
        let bytes = synthesize_slice(&slice, &sps, &pps);
        let header = parser.parse_slice_header(&nalu(&bytes)).unwrap();

        assert_eq!(header.first_mb_in_slice, 0);
        assert_eq!(header.slice_type, SliceType::I);
        assert_eq!(header.pic_parameter_set_id, 0);
        assert_eq!(header.idr_pic_id, 7);
        assert_eq!(header.pic_order_cnt_lsb, 0);
        assert!(!header.field_pic_flag);
        assert_eq!(header.dec_ref_pic_marking, RefPicMarking::default());
        assert_eq!(header.slice_qp_delta, -3);
    }

    #[test]
    fn parse_b_slice_header_with_cabac() {
        let sps = SpsParams {
            profile_idc: 77,
            max_num_ref_frames: 2,
            ..Default::default()
        };
        let pps = PpsParams {
            entropy_coding_mode: true,
            num_ref_idx_l0_default_active_minus1: 1,
            ..Default::default()
        };
        let parser = parser_with(&sps, &pps);

        let slice = SliceParams {
            ref_idc: 0,
            slice_type: SliceType::B,
            frame_num: 2,
            pic_order_cnt_lsb: 6,
            cabac_init_idc: 2,
            slice_qp_delta: -3,
            ..Default::default()
        };
        let bytes = synthesize_slice(&slice, &sps, &pps);
        let header = parser.parse_slice_header(&nalu(&bytes)).unwrap();

        assert_eq!(header.slice_type, SliceType::B);
        assert_eq!(header.frame_num, 2);
        assert_eq!(header.pic_order_cnt_lsb, 6);
        assert_eq!(header.num_ref_idx_l0_active_minus1, 1);
        assert_eq!(header.num_ref_idx_l1_active_minus1, 0);
        assert!(header.direct_spatial_mv_pred_flag);
        assert_eq!(header.cabac_init_idc, 2);
        assert_eq!(header.slice_qp_delta, -3);
    }

    #[test]
    fn slice_with_poc_type_2_is_rejected() {
        let sps = SpsParams {
            pic_order_cnt_type: 2,
            ..Default::default()
        };
        let pps = PpsParams::default();
        let parser = parser_with(&sps, &pps);

        let bytes = synthesize_slice(&SliceParams::default(), &sps, &pps);
        let err = parser.parse_slice_header(&nalu(&bytes)).unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedPocType(2)));
    }

    #[test]
    fn slice_requires_pps() {
        let sps = SpsParams::default();
        let pps = PpsParams::default();
        let parser = parser_with(&sps, &pps);

        let slice = SliceParams {
            pps_id: 9,
            ..Default::default()
        };
        let bytes = synthesize_slice(&slice, &sps, &pps);
        let err = parser.parse_slice_header(&nalu(&bytes)).unwrap_err();
        assert!(matches!(err, ParseError::MissingPps(9)));
    }

    #[test]
    fn slice_header_rejects_other_units() {
        let parser = Parser::default();
        let bytes = synthesize_sps(&Default::default());
        let err = parser.parse_slice_header(&nalu(&bytes)).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedNaluType { .. }));
    }
}
