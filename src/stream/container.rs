// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Extraction from the length-prefixed samples of a demuxed AVC track.

use bytes::Buf;
use log::debug;
use log::warn;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluHeader;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::parser::ParseError;
use crate::codec::h264::parser::Parser;
use crate::stream::ElementaryStream;
use crate::stream::ExtractError;
use crate::stream::ExtractResult;
use crate::stream::StreamBuilder;
use crate::Resolution;

/// Size of the big-endian length prefix of each NAL unit in a sample.
pub const NAL_LENGTH_SIZE: usize = 4;

/// A sample of the video track.
#[derive(Clone, Debug)]
pub struct Sample<'a> {
    /// Offset of the sample in the container file.
    pub offset: u64,
    /// Presentation time, in track timescale units.
    pub timestamp: i64,
    /// Duration, in track timescale units.
    pub duration: u64,
    /// Length-prefixed NAL units.
    pub data: &'a [u8],
}

/// Access to an AVC video track of a container.
pub trait Demuxer {
    /// Units per second of sample timestamps and durations.
    fn timescale(&self) -> u32;

    fn sample_count(&self) -> usize;

    fn sample(&self, index: usize) -> Option<Sample<'_>>;

    /// SPS NAL units from the decoder configuration, header byte included.
    fn sps(&self) -> &[Vec<u8>];

    /// PPS NAL units from the decoder configuration, header byte included.
    fn pps(&self) -> &[Vec<u8>];

    /// Picture size declared by the container.
    fn resolution(&self) -> Resolution;
}

fn parse_parameter_set<'a>(data: &'a [u8], expected: NaluType) -> ExtractResult<Nalu<'a>> {
    let nalu = Nalu::from_bytes(data).map_err(ParseError::from)?;
    if nalu.header.type_ != expected {
        return Err(ParseError::UnexpectedNaluType {
            expected: if expected == NaluType::Sps { "SPS" } else { "PPS" },
            got: nalu.header.type_,
        }
        .into());
    }

    Ok(nalu)
}

pub(crate) fn extract(demuxer: &dyn Demuxer) -> ExtractResult<ElementaryStream> {
    let mut parser = Parser::default();
    let mut builder = StreamBuilder::default();
    let declared = demuxer.resolution();

    for data in demuxer.sps() {
        let nalu = parse_parameter_set(data, NaluType::Sps)?;
        let sps = parser.parse_sps(&nalu)?;

        let resolution = sps.display_resolution();
        if resolution != declared {
            return Err(ExtractError::ResolutionMismatch {
                sps_id: sps.seq_parameter_set_id,
                sps: resolution,
                declared,
            });
        }

        builder.add_sps(sps);
    }

    for data in demuxer.pps() {
        let nalu = parse_parameter_set(data, NaluType::Pps)?;
        parser.parse_pps(&nalu)?;
    }

    let timescale = demuxer.timescale();
    if timescale == 0 {
        return Err(ExtractError::InvalidTimescale(timescale));
    }
    let timescale = f64::from(timescale);

    for index in 0..demuxer.sample_count() {
        let sample = demuxer
            .sample(index)
            .ok_or(ExtractError::MissingSample(index))?;
        let timestamp = sample.timestamp as f64 / timescale;
        let duration = sample.duration as f64 / timescale;

        let frames_before = builder.num_frames();
        let mut cursor = sample.data;

        while cursor.has_remaining() {
            if cursor.remaining() < NAL_LENGTH_SIZE {
                return Err(ExtractError::TruncatedSample(index));
            }

            let len = cursor.get_u32() as usize;
            if len > cursor.remaining() {
                return Err(ExtractError::TruncatedSample(index));
            }

            let (nal, rest) = cursor.split_at(len);
            cursor = rest;

            let Some(&first) = nal.first() else {
                continue;
            };

            let nal_header = NaluHeader::parse(first).map_err(ParseError::from)?;
            if !nal_header.is_slice() {
                debug!("sample {}: skipping {:?} NAL unit", index, nal_header.type_);
                continue;
            }

            let nalu = Nalu::from_bytes(nal).map_err(ParseError::from)?;
            let header = parser.parse_slice_header(&nalu)?;
            let new_frame = builder.num_frames() == frames_before;

            builder.push_slice(nal, &nal_header, header, new_frame, timestamp, duration);
        }

        if builder.num_frames() == frames_before {
            warn!("sample {} at offset {} has no slice data", index, sample.offset);
        }
    }

    builder.finish(parser)
}
