// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Extraction of an H.264 elementary stream into a single Annex B buffer
//! with per-frame metadata.

pub mod container;
pub mod mp4;
pub mod raw;

use std::rc::Rc;

use log::info;
use thiserror::Error;

use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::START_CODE;
use crate::codec::h264::parser::ParseError;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::Pps;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;
use crate::codec::h264::poc::PictureOrder;
use crate::codec::h264::poc::PocResolver;
use crate::utils::align;
use crate::Resolution;

pub use container::Demuxer;
pub use container::Sample;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("SPS {sps_id} describes a {sps:?} picture but the container declares {declared:?}")]
    ResolutionMismatch {
        sps_id: u8,
        sps: Resolution,
        declared: Resolution,
    },
    #[error("sample {0} is truncated")]
    TruncatedSample(usize),
    #[error("sample {0} is missing")]
    MissingSample(usize),
    #[error("invalid track timescale {0}")]
    InvalidTimescale(u32),
    #[error("invalid frame rate {0}")]
    InvalidFramerate(f32),
    #[error("the stream has no SPS or no PPS")]
    MissingParameterSets,
    #[error("the stream has no frames")]
    NoFrames,
}

pub type ExtractResult<T> = std::result::Result<T, ExtractError>;

/// A coded frame of the elementary stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameInfo {
    /// Offset of the first start code of the frame in the stream buffer.
    pub offset: usize,
    /// Size of all the NAL units of the frame, start codes included.
    pub size: usize,
    /// Presentation time, in seconds.
    pub timestamp: f64,
    /// Duration, in seconds.
    pub duration: f64,
    /// `nal_ref_idc` of the first slice. Zero for non-reference frames.
    pub reference_priority: u8,
    pub is_intra: bool,
    pub poc: i32,
    pub gop: i32,
    /// Position of the frame in presentation order.
    pub display_order: usize,
}

impl FrameInfo {
    pub fn is_reference(&self) -> bool {
        self.reference_priority > 0
    }
}

/// Extraction options for raw Annex B input, which carries no timing.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Frames per second.
    pub framerate: f32,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { framerate: 60.0 }
    }
}

/// Where an elementary stream comes from.
pub enum ExtractStream<'a> {
    /// Length-prefixed samples of an AVC track.
    Container(&'a dyn Demuxer),
    /// An Annex B byte stream.
    Raw {
        data: &'a [u8],
        options: ExtractOptions,
    },
}

impl<'a> ExtractStream<'a> {
    pub fn extract(&self) -> ExtractResult<ElementaryStream> {
        match self {
            ExtractStream::Container(demuxer) => container::extract(*demuxer),
            ExtractStream::Raw { data, options } => raw::extract(data, options),
        }
    }
}

/// The frames of a stream, in decode order, ready to be handed to a
/// hardware decoder.
#[derive(Debug)]
pub struct ElementaryStream {
    /// Slice NAL units of every frame, each prefixed with [`START_CODE`].
    pub data: Vec<u8>,
    pub frames: Vec<FrameInfo>,
    /// Header of the first slice of each frame.
    pub slice_headers: Vec<SliceHeader>,
    /// Holds every parameter set of the stream.
    pub parser: Parser,
    pub display_resolution: Resolution,
    pub padded_resolution: Resolution,
    pub num_dpb_slots: usize,
    /// Total duration, in seconds.
    pub duration: f64,
}

impl ElementaryStream {
    /// Returns the NAL units of frame `index`.
    pub fn frame_data(&self, index: usize) -> Option<&[u8]> {
        let frame = self.frames.get(index)?;
        self.data.get(frame.offset..frame.offset + frame.size)
    }

    /// Returns the PPS the slices of frame `index` refer to.
    pub fn pps(&self, index: usize) -> Option<&Rc<Pps>> {
        let header = self.slice_headers.get(index)?;
        self.parser.get_pps(header.pic_parameter_set_id)
    }

    pub fn sps(&self, index: usize) -> Option<&Rc<Sps>> {
        self.pps(index).map(|pps| &pps.sps)
    }

    /// Lays the frames out again so that each one starts at, and spans, a
    /// multiple of `alignment` bytes. The padding is zero-filled.
    pub fn relocate(&mut self, alignment: usize) {
        if alignment <= 1 {
            return;
        }

        let total: usize = self
            .frames
            .iter()
            .map(|frame| align(frame.size, alignment))
            .sum();
        let mut data = Vec::with_capacity(total);

        for frame in self.frames.iter_mut() {
            let offset = data.len();
            data.extend_from_slice(&self.data[frame.offset..frame.offset + frame.size]);
            let size = align(frame.size, alignment);
            data.resize(offset + size, 0);

            frame.offset = offset;
            frame.size = size;
        }

        self.data = data;
    }
}

/// Accumulates frames as slices are found, shared by both extraction
/// variants.
#[derive(Default)]
pub(crate) struct StreamBuilder {
    data: Vec<u8>,
    frames: Vec<FrameInfo>,
    slice_headers: Vec<SliceHeader>,
    num_dpb_slots: usize,
}

impl StreamBuilder {
    /// Takes the DPB requirements of `sps` into account.
    pub(crate) fn add_sps(&mut self, sps: &Sps) {
        self.num_dpb_slots = self.num_dpb_slots.max(sps.num_dpb_slots());
    }

    /// Appends a slice, given without start code. If `new_frame` is false
    /// and a frame is in progress, the slice is added to it.
    pub(crate) fn push_slice(
        &mut self,
        nal: &[u8],
        nal_header: &NaluHeader,
        header: SliceHeader,
        new_frame: bool,
        timestamp: f64,
        duration: f64,
    ) {
        let offset = self.data.len();
        self.data.extend_from_slice(&START_CODE);
        self.data.extend_from_slice(nal);
        let size = self.data.len() - offset;

        match self.frames.last_mut() {
            Some(frame) if !new_frame => frame.size += size,
            _ => {
                self.frames.push(FrameInfo {
                    offset,
                    size,
                    timestamp,
                    duration,
                    reference_priority: nal_header.ref_idc,
                    is_intra: nal_header.idr_pic_flag,
                    ..Default::default()
                });
                self.slice_headers.push(header);
            }
        }
    }

    pub(crate) fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Resolves the presentation order of the frames and builds the stream.
    pub(crate) fn finish(self, parser: Parser) -> ExtractResult<ElementaryStream> {
        let sps = parser
            .spses()
            .next()
            .ok_or(ExtractError::MissingParameterSets)?;
        if parser.ppses().next().is_none() {
            return Err(ExtractError::MissingParameterSets);
        }

        if self.frames.is_empty() {
            return Err(ExtractError::NoFrames);
        }

        let display_resolution = sps.display_resolution();
        let padded_resolution = sps.padded_resolution();

        let mut resolver = PocResolver::new();
        let mut orders = Vec::with_capacity(self.frames.len());
        for header in &self.slice_headers {
            let pps = parser
                .get_pps(header.pic_parameter_set_id)
                .ok_or(ParseError::MissingPps(header.pic_parameter_set_id))?;
            let log2_max_lsb = pps.sps.log2_max_pic_order_cnt_lsb_minus4 + 4;
            orders.push(resolver.next(header.pic_order_cnt_lsb, log2_max_lsb));
        }

        let display = PocResolver::display_order(&orders);

        let mut frames = self.frames;
        for ((frame, order), display_order) in frames.iter_mut().zip(orders).zip(display) {
            let PictureOrder { gop, poc } = order;
            frame.gop = gop;
            frame.poc = poc;
            frame.display_order = display_order;
        }

        let duration: f64 = frames.iter().map(|frame| frame.duration).sum();

        info!(
            "{} frames, {:.3}s, display {}x{}, coded {}x{}, {} DPB slots",
            frames.len(),
            duration,
            display_resolution.width,
            display_resolution.height,
            padded_resolution.width,
            padded_resolution.height,
            self.num_dpb_slots
        );

        Ok(ElementaryStream {
            data: self.data,
            frames,
            slice_headers: self.slice_headers,
            parser,
            display_resolution,
            padded_resolution,
            num_dpb_slots: self.num_dpb_slots,
            duration,
        })
    }
}
