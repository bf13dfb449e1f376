// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synthesizes small Annex B H.264 streams for unit tests.

use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::nalu::START_CODE;
use crate::codec::h264::parser::SliceType;

/// Bit writer producing an RBSP, escaped with emulation-prevention bytes by
/// [`NaluWriter::finish`].
#[derive(Default)]
pub struct NaluWriter {
    rbsp: Vec<u8>,
    curr_byte: u8,
    bits_in_curr_byte: usize,
}

impl NaluWriter {
    /// Writes `bits` bits of `value`, most significant first. Corresponds to
    /// `f(n)` and `u(n)`.
    pub fn write_f(&mut self, bits: usize, value: u32) {
        for i in (0..bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.curr_byte = (self.curr_byte << 1) | u8::from(bit);
        self.bits_in_curr_byte += 1;
        if self.bits_in_curr_byte == 8 {
            self.rbsp.push(self.curr_byte);
            self.curr_byte = 0;
            self.bits_in_curr_byte = 0;
        }
    }

    pub fn write_ue(&mut self, value: u32) {
        let value = u64::from(value) + 1;
        let bits = 64 - value.leading_zeros() as usize;
        for _ in 0..bits - 1 {
            self.write_bit(false);
        }
        for i in (0..bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    pub fn write_se(&mut self, value: i32) {
        let value = i64::from(value);
        let mapped = if value > 0 {
            2 * value - 1
        } else {
            -2 * value
        };
        self.write_ue(mapped as u32);
    }

    /// Appends rbsp_trailing_bits().
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(true);
        while self.bits_in_curr_byte != 0 {
            self.write_bit(false);
        }
    }

    /// Returns the unit with its start code and header, with the payload
    /// escaped.
    pub fn finish(self, ref_idc: u8, type_: NaluType) -> Vec<u8> {
        let mut out = START_CODE.to_vec();
        out.push(((ref_idc & 0b11) << 5) | (type_ as u8 & 0x1f));

        let mut zeros = 0;
        for byte in self.rbsp {
            if zeros == 2 && byte <= 0x03 {
                out.push(0x03);
                zeros = 0;
            }
            out.push(byte);
            zeros = if byte == 0x00 { zeros + 1 } else { 0 };
        }

        out
    }
}

/// Writes a scaling_list() producing `values`. An empty list requests the
/// default table.
fn write_scaling_list(w: &mut NaluWriter, values: &[u8]) {
    if values.is_empty() {
        w.write_se(-8);
        return;
    }

    let mut last = 8i32;
    for &value in values {
        let mut delta = i32::from(value) - last;
        if delta > 127 {
            delta -= 256;
        } else if delta < -128 {
            delta += 256;
        }
        w.write_se(delta);
        last = i32::from(value);
    }
}

/// Writes scaling list presence flags and lists. `None` entries are absent
/// and rely on the fall-back rules.
fn write_scaling_lists(w: &mut NaluWriter, lists: &[Option<Vec<u8>>]) {
    for list in lists {
        match list {
            Some(values) => {
                w.write_bit(true);
                write_scaling_list(w, values);
            }
            None => w.write_bit(false),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpsParams {
    pub sps_id: u32,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    /// Six 4x4 lists then two 8x8 lists.
    pub scaling_lists: Option<Vec<Option<Vec<u8>>>>,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub max_num_ref_frames: u32,
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
    pub frame_mbs_only: bool,
    /// Left, right, top and bottom crop offsets.
    pub crop: Option<(u32, u32, u32, u32)>,
    /// num_units_in_tick and time_scale.
    pub timing: Option<(u32, u32)>,
    pub max_num_reorder_frames: Option<u32>,
}

impl Default for SpsParams {
    fn default() -> Self {
        Self {
            sps_id: 0,
            profile_idc: 66,
            level_idc: 40,
            chroma_format_idc: 1,
            scaling_lists: None,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 4,
            max_num_ref_frames: 1,
            width_in_mbs: 20,
            height_in_mbs: 15,
            frame_mbs_only: true,
            crop: None,
            timing: None,
            max_num_reorder_frames: None,
        }
    }
}

pub fn synthesize_sps(params: &SpsParams) -> Vec<u8> {
    let mut w = NaluWriter::default();

    w.write_f(8, u32::from(params.profile_idc));
    // constraint_set flags and reserved_zero_2bits
    w.write_f(8, 0);
    w.write_f(8, u32::from(params.level_idc));
    w.write_ue(params.sps_id);

    if params.profile_idc >= 100 {
        w.write_ue(params.chroma_format_idc);
        if params.chroma_format_idc == 3 {
            w.write_bit(false);
        }
        // bit depths and qpprime_y_zero_transform_bypass_flag
        w.write_ue(0);
        w.write_ue(0);
        w.write_bit(false);

        w.write_bit(params.scaling_lists.is_some());
        if let Some(lists) = &params.scaling_lists {
            write_scaling_lists(&mut w, lists);
        }
    }

    w.write_ue(params.log2_max_frame_num_minus4);
    w.write_ue(params.pic_order_cnt_type);
    match params.pic_order_cnt_type {
        0 => w.write_ue(params.log2_max_pic_order_cnt_lsb_minus4),
        1 => {
            w.write_bit(false);
            w.write_se(0);
            w.write_se(0);
            w.write_ue(0);
        }
        _ => (),
    }

    w.write_ue(params.max_num_ref_frames);
    w.write_bit(false);
    w.write_ue(params.width_in_mbs - 1);
    w.write_ue(params.height_in_mbs - 1);
    w.write_bit(params.frame_mbs_only);
    if !params.frame_mbs_only {
        w.write_bit(false);
    }
    // direct_8x8_inference_flag
    w.write_bit(true);

    w.write_bit(params.crop.is_some());
    if let Some((left, right, top, bottom)) = params.crop {
        w.write_ue(left);
        w.write_ue(right);
        w.write_ue(top);
        w.write_ue(bottom);
    }

    let vui = params.timing.is_some() || params.max_num_reorder_frames.is_some();
    w.write_bit(vui);
    if vui {
        // aspect ratio, overscan, video signal type, chroma location
        w.write_f(4, 0);

        w.write_bit(params.timing.is_some());
        if let Some((num_units_in_tick, time_scale)) = params.timing {
            w.write_f(16, num_units_in_tick >> 16);
            w.write_f(16, num_units_in_tick & 0xffff);
            w.write_f(16, time_scale >> 16);
            w.write_f(16, time_scale & 0xffff);
            w.write_bit(true);
        }

        // nal/vcl hrd, pic_struct_present_flag
        w.write_f(3, 0);

        w.write_bit(params.max_num_reorder_frames.is_some());
        if let Some(reorder) = params.max_num_reorder_frames {
            w.write_bit(true);
            w.write_ue(2);
            w.write_ue(1);
            w.write_ue(16);
            w.write_ue(16);
            w.write_ue(reorder);
            w.write_ue(params.max_num_ref_frames);
        }
    }

    w.write_trailing_bits();
    w.finish(3, NaluType::Sps)
}

#[derive(Clone, Debug, Default)]
pub struct PpsParams {
    pub pps_id: u32,
    pub sps_id: u32,
    pub entropy_coding_mode: bool,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub deblocking_filter_control_present: bool,
    pub transform_8x8_mode: bool,
    /// Six 4x4 lists then, with `transform_8x8_mode`, two 8x8 lists.
    pub scaling_lists: Option<Vec<Option<Vec<u8>>>>,
}

pub fn synthesize_pps(params: &PpsParams) -> Vec<u8> {
    let mut w = NaluWriter::default();

    w.write_ue(params.pps_id);
    w.write_ue(params.sps_id);
    w.write_bit(params.entropy_coding_mode);
    w.write_bit(false);
    w.write_ue(params.num_slice_groups_minus1);
    if params.num_slice_groups_minus1 > 0 {
        // slice_group_map_type 0 with a run length per group.
        w.write_ue(0);
        for _ in 0..=params.num_slice_groups_minus1 {
            w.write_ue(0);
        }
    }

    w.write_ue(params.num_ref_idx_l0_default_active_minus1);
    w.write_ue(0);
    // weighted_pred_flag, weighted_bipred_idc
    w.write_bit(false);
    w.write_f(2, 0);
    // pic_init_qp_minus26, pic_init_qs_minus26, chroma_qp_index_offset
    w.write_se(0);
    w.write_se(0);
    w.write_se(0);
    w.write_bit(params.deblocking_filter_control_present);
    // constrained_intra_pred_flag, redundant_pic_cnt_present_flag
    w.write_bit(false);
    w.write_bit(false);

    if params.transform_8x8_mode || params.scaling_lists.is_some() {
        w.write_bit(params.transform_8x8_mode);
        w.write_bit(params.scaling_lists.is_some());
        if let Some(lists) = &params.scaling_lists {
            let count = if params.transform_8x8_mode { 8 } else { 6 };
            write_scaling_lists(&mut w, &lists[..count]);
        }
        w.write_se(0);
    }

    w.write_trailing_bits();
    w.finish(3, NaluType::Pps)
}

#[derive(Clone, Debug, Default)]
pub struct SliceParams {
    pub idr: bool,
    pub ref_idc: u8,
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pps_id: u32,
    pub frame_num: u32,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub cabac_init_idc: u32,
    pub slice_qp_delta: i32,
}

/// Writes a slice header followed by a few bytes standing in for the
/// macroblock layer.
pub fn synthesize_slice(params: &SliceParams, sps: &SpsParams, pps: &PpsParams) -> Vec<u8> {
    let mut w = NaluWriter::default();

    w.write_ue(params.first_mb_in_slice);
    w.write_ue(params.slice_type as u32);
    w.write_ue(params.pps_id);
    w.write_f(
        sps.log2_max_frame_num_minus4 as usize + 4,
        params.frame_num,
    );

    if params.idr {
        w.write_ue(params.idr_pic_id);
    }

    if sps.pic_order_cnt_type == 0 {
        w.write_f(
            sps.log2_max_pic_order_cnt_lsb_minus4 as usize + 4,
            params.pic_order_cnt_lsb,
        );
    }

    if params.slice_type == SliceType::B {
        // direct_spatial_mv_pred_flag
        w.write_bit(true);
    }

    if matches!(params.slice_type, SliceType::P | SliceType::B) {
        // num_ref_idx_active_override_flag, ref_pic_list_modification_flag_l0
        w.write_bit(false);
        w.write_bit(false);
        if params.slice_type == SliceType::B {
            w.write_bit(false);
        }
    }

    if params.ref_idc != 0 {
        if params.idr {
            w.write_f(2, 0);
        } else {
            w.write_bit(false);
        }
    }

    if pps.entropy_coding_mode && params.slice_type != SliceType::I {
        w.write_ue(params.cabac_init_idc);
    }

    w.write_se(params.slice_qp_delta);

    if pps.deblocking_filter_control_present {
        w.write_ue(0);
        w.write_se(0);
        w.write_se(0);
    }

    // Stand-in slice data, with a run of zeros to exercise escaping.
    w.write_f(8, 0x9a);
    w.write_f(24, 0);
    w.write_f(8, 0x01);
    w.write_trailing_bits();

    let type_ = if params.idr {
        NaluType::SliceIdr
    } else {
        NaluType::Slice
    };
    w.finish(params.ref_idc, type_)
}

/// A stream of IDR/P/B pictures in a single GOP.
pub struct StreamParams {
    pub sps: SpsParams,
    pub pps: PpsParams,
    /// Slice type, nal_ref_idc and pic_order_cnt_lsb of each picture, in
    /// decode order. The first picture is coded as IDR.
    pub pictures: Vec<(SliceType, u8, u32)>,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            sps: SpsParams::default(),
            pps: PpsParams::default(),
            // I0 P6 B2 B4 P12 B8 B10, a classic IPBB pattern.
            pictures: vec![
                (SliceType::I, 3, 0),
                (SliceType::P, 2, 6),
                (SliceType::B, 0, 2),
                (SliceType::B, 0, 4),
                (SliceType::P, 2, 12),
                (SliceType::B, 0, 8),
                (SliceType::B, 0, 10),
            ],
        }
    }
}

/// One access unit of a synthesized stream.
pub struct SynthesizedPicture {
    /// Parameter sets, present on the first picture only.
    pub parameter_sets: Vec<u8>,
    pub slice: Vec<u8>,
}

pub fn synthesize_stream(params: &StreamParams) -> Vec<SynthesizedPicture> {
    let max_frame_num = 1 << (params.sps.log2_max_frame_num_minus4 + 4);
    let mut frame_num = 0;

    params
        .pictures
        .iter()
        .enumerate()
        .map(|(i, &(slice_type, ref_idc, pic_order_cnt_lsb))| {
            let slice = SliceParams {
                idr: i == 0,
                ref_idc,
                slice_type,
                frame_num,
                pic_order_cnt_lsb,
                ..Default::default()
            };

            if ref_idc != 0 {
                frame_num = (frame_num + 1) % max_frame_num;
            }

            let parameter_sets = if i == 0 {
                let mut sets = synthesize_sps(&params.sps);
                sets.extend(synthesize_pps(&params.pps));
                sets
            } else {
                Vec::new()
            };

            SynthesizedPicture {
                parameter_sets,
                slice: synthesize_slice(&slice, &params.sps, &params.pps),
            }
        })
        .collect()
}

/// Concatenates the pictures into a single Annex B buffer.
pub fn synthesize_annex_b(params: &StreamParams) -> Vec<u8> {
    synthesize_stream(params)
        .into_iter()
        .flat_map(|picture| picture.parameter_sets.into_iter().chain(picture.slice))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::nalu_reader::NaluReader;

    #[test]
    fn escapes_start_code_emulation() {
        let mut w = NaluWriter::default();
        w.write_f(24, 0x000001);
        w.write_f(16, 0x0000);
        w.write_f(8, 0x02);
        let out = w.finish(0, NaluType::Sei);

        assert_eq!(
            &out[5..],
            &[0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x02]
        );
    }

    #[test]
    fn exp_golomb_reads_back() {
        let mut w = NaluWriter::default();
        for value in [0, 1, 2, 7, 255, 65535] {
            w.write_ue(value);
        }
        for value in [0, 1, -1, 2, -2, 127, -128] {
            w.write_se(value);
        }
        w.write_trailing_bits();
        let out = w.finish(0, NaluType::Sei);

        let mut r = NaluReader::new(&out[5..]);
        for value in [0u32, 1, 2, 7, 255, 65535] {
            assert_eq!(r.read_ue::<u32>().unwrap(), value);
        }
        for value in [0i32, 1, -1, 2, -2, 127, -128] {
            assert_eq!(r.read_se::<i32>().unwrap(), value);
        }
    }
}
