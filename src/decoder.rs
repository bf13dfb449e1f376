// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode orchestration.
//!
//! A [`StatelessDecoder`] walks an [`ElementaryStream`] in decode order. For
//! every frame it assigns a DPB slot, hands a [`DecodeStep`] to its backend,
//! and queues the decoded picture for display. Display is driven separately
//! by [`StatelessDecoder::tick`], so the two can be interleaved by a playback
//! loop running on a real-time clock.

pub mod reorder;

use anyhow::anyhow;
use log::debug;
use thiserror::Error;

use crate::codec::h264::dpb::DecodeTarget;
use crate::codec::h264::dpb::DpbError;
use crate::codec::h264::dpb::SlotTracker;
use crate::codec::h264::parser::ParseError;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;
use crate::stream::ElementaryStream;
use crate::stream::FrameInfo;
use crate::Resolution;
use reorder::PresentPolicy;
use reorder::ReorderQueue;
use reorder::ReorderedPicture;

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("no decode device available")]
    NoDevice,
    #[error("the decode device has no decode queue")]
    NoDecodeQueue,
    #[error("unsupported profile: {0}")]
    UnsupportedProfile(String),
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = std::result::Result<T, StatelessBackendError>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] StatelessBackendError),
    #[error(transparent)]
    Dpb(#[from] DpbError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where the backend left a decoded picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeSource {
    /// The picture is in the DPB slot it was decoded into.
    DpbSlot(u8),
    /// The picture is in the output surface, which holds only the most
    /// recent decode.
    DedicatedOutput,
}

fn get_raster_from_zigzag_8x8(src: &[u8; 64], dst: &mut [u8; 64]) {
    const ZIGZAG_8X8: [usize; 64] = [
        0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
        20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51,
        58, 59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
    ];

    for (i, value) in src.iter().enumerate() {
        dst[ZIGZAG_8X8[i]] = *value;
    }
}

fn get_raster_from_zigzag_4x4(src: &[u8; 16], dst: &mut [u8; 16]) {
    const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

    for (i, value) in src.iter().enumerate() {
        dst[ZIGZAG_4X4[i]] = *value;
    }
}

/// Picture-level parameters of a decode, as hardware decode APIs take them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PictureParams {
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub frame_num: u16,
    pub idr_pic_id: u16,
    pub pic_order_cnt: i32,
    pub is_intra: bool,
    pub is_reference: bool,
    pub idr_pic_flag: bool,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_mbs: u32,
    /// Scaling matrices of the PPS, in raster order.
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],
}

impl PictureParams {
    pub fn new(frame: &FrameInfo, header: &SliceHeader, pps: &Pps) -> Self {
        let sps: &Sps = &pps.sps;

        let mut scaling_lists_4x4 = [[0; 16]; 6];
        for (src, dst) in pps.scaling_lists_4x4.iter().zip(&mut scaling_lists_4x4) {
            get_raster_from_zigzag_4x4(src, dst);
        }

        let mut scaling_lists_8x8 = [[0; 64]; 6];
        for (src, dst) in pps.scaling_lists_8x8.iter().zip(&mut scaling_lists_8x8) {
            get_raster_from_zigzag_8x8(src, dst);
        }

        Self {
            seq_parameter_set_id: sps.seq_parameter_set_id,
            pic_parameter_set_id: pps.pic_parameter_set_id,
            frame_num: header.frame_num,
            idr_pic_id: header.idr_pic_id,
            pic_order_cnt: frame.poc,
            is_intra: frame.is_intra,
            is_reference: frame.is_reference(),
            idr_pic_flag: frame.is_intra && frame.is_reference(),
            field_pic_flag: header.field_pic_flag,
            bottom_field_flag: header.bottom_field_flag,
            pic_width_in_mbs: u32::from(sps.pic_width_in_mbs_minus1) + 1,
            pic_height_in_mbs: u32::from(sps.pic_height_in_map_units_minus1) + 1,
            scaling_lists_4x4,
            scaling_lists_8x8,
        }
    }
}

/// Everything a backend needs to decode one frame.
#[derive(Debug)]
pub struct DecodeStep<'a> {
    /// Index of the frame in decode order.
    pub frame_index: usize,
    /// Offset of the frame in the stream buffer, aligned to the backend's
    /// bitstream alignment.
    pub offset: usize,
    pub size: usize,
    /// Slice NAL units of the frame, with start codes.
    pub data: &'a [u8],
    pub params: PictureParams,
    pub target: &'a DecodeTarget,
}

/// Hardware-specific part of H.264 decoding.
pub trait StatelessH264DecoderBackend {
    /// Storage a decoded picture is copied to for display.
    type Picture;

    /// Called once before the first decode, with the active SPS.
    fn new_sequence(&mut self, sps: &Sps, num_dpb_slots: usize) -> StatelessBackendResult<()>;

    /// Required alignment of the offset and size of each frame in the
    /// stream buffer. 0 or 1 means none.
    fn bitstream_alignment(&self) -> usize;

    /// Returns the callback used to allocate display pictures.
    fn picture_allocator(&mut self, resolution: Resolution) -> Box<dyn FnMut() -> Self::Picture>;

    /// Decodes a frame and returns where its picture can be copied from.
    fn decode(&mut self, step: &DecodeStep) -> StatelessBackendResult<DecodeSource>;

    /// Copies a decoded picture from `source` into `picture`.
    fn copy_output(
        &mut self,
        source: DecodeSource,
        picture: &mut Self::Picture,
    ) -> StatelessBackendResult<()>;
}

pub struct StatelessDecoder<B: StatelessH264DecoderBackend> {
    stream: ElementaryStream,
    backend: B,
    slots: SlotTracker,
    queue: ReorderQueue<B::Picture>,
    next_frame: usize,
}

impl<B: StatelessH264DecoderBackend> StatelessDecoder<B> {
    pub fn new(mut stream: ElementaryStream, mut backend: B, policy: PresentPolicy) -> Result<Self> {
        let sps = stream
            .sps(0)
            .ok_or_else(|| anyhow!("the stream has no active SPS"))?;
        backend.new_sequence(sps, stream.num_dpb_slots)?;

        stream.relocate(backend.bitstream_alignment());

        let slots = SlotTracker::new(stream.num_dpb_slots)?;
        let queue = ReorderQueue::new(
            backend.picture_allocator(stream.padded_resolution),
            policy,
        );

        Ok(Self {
            stream,
            backend,
            slots,
            queue,
            next_frame: 0,
        })
    }

    /// Whether the reorder queue has room for another decoded picture.
    pub fn must_decode(&self) -> bool {
        self.queue.working_len() < self.stream.num_dpb_slots
    }

    /// Decodes the next frame in decode order and queues its picture. After
    /// the last frame, decoding starts over from the first one.
    ///
    /// A frame the backend fails to decode is retried by the next call. Once
    /// decoded, a frame is never decoded again in the same pass, even if
    /// copying its picture fails.
    pub fn decode_next(&mut self) -> Result<()> {
        let index = self.next_frame;
        if index == 0 {
            self.slots.reset();
            self.queue.reset();
        }

        let frame = self
            .stream
            .frames
            .get(index)
            .ok_or_else(|| anyhow!("frame {} is out of range", index))?;
        let header = self
            .stream
            .slice_headers
            .get(index)
            .ok_or_else(|| anyhow!("frame {} has no slice header", index))?;
        let pps = self
            .stream
            .pps(index)
            .ok_or(ParseError::MissingPps(header.pic_parameter_set_id))?;
        let data = self
            .stream
            .frame_data(index)
            .ok_or_else(|| anyhow!("frame {} is outside the stream buffer", index))?;

        let params = PictureParams::new(frame, header, pps);
        let target = self
            .slots
            .begin(frame.is_intra, frame.poc, header.frame_num)?;

        debug!(
            "decoding frame {} (poc {}, display {}) into slot {} with references {:?}",
            index,
            frame.poc,
            frame.display_order,
            target.slot.index(),
            target
                .references
                .iter()
                .map(|r| r.slot.index())
                .collect::<Vec<_>>()
        );

        let step = DecodeStep {
            frame_index: index,
            offset: frame.offset,
            size: frame.size,
            data,
            params,
            target: &target,
        };
        let source = self.backend.decode(&step)?;

        // The frame is in the DPB now. A failed copy below only loses its
        // picture for display.
        self.next_frame = (index + 1) % self.stream.frames.len();
        self.slots.finish(target.slot, frame.is_reference())?;

        let backend = &mut self.backend;
        self.queue
            .on_decoded(frame.display_order, index, frame.duration, |picture| {
                backend.copy_output(source, picture)
            })?;

        Ok(())
    }

    /// Advances presentation by `elapsed` seconds. Returns the new displayed
    /// picture if it changed.
    pub fn tick(&mut self, elapsed: f64) -> Option<&ReorderedPicture<B::Picture>> {
        self.queue.tick(elapsed)
    }

    /// One iteration of the playback loop: decode a frame if the queue has
    /// room, then advance presentation.
    pub fn step(&mut self, elapsed: f64) -> Result<Option<&ReorderedPicture<B::Picture>>> {
        if self.must_decode() {
            self.decode_next()?;
        }

        Ok(self.queue.tick(elapsed))
    }

    pub fn stream(&self) -> &ElementaryStream {
        &self.stream
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn slots(&self) -> &SlotTracker {
        &self.slots
    }

    pub fn queue(&self) -> &ReorderQueue<B::Picture> {
        &self.queue
    }

    pub fn displayed(&self) -> Option<&ReorderedPicture<B::Picture>> {
        self.queue.displayed()
    }

    /// Index of the next frame to decode.
    pub fn next_frame(&self) -> usize {
        self.next_frame
    }
}
