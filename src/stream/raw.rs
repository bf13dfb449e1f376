// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Extraction from an Annex B byte stream.

use log::debug;

use crate::codec::h264::nalu::NalIterator;
use crate::codec::h264::nalu::NaluType;
use crate::codec::h264::parser::ParseError;
use crate::codec::h264::parser::Parser;
use crate::stream::ElementaryStream;
use crate::stream::ExtractError;
use crate::stream::ExtractOptions;
use crate::stream::ExtractResult;
use crate::stream::StreamBuilder;

pub(crate) fn extract(data: &[u8], options: &ExtractOptions) -> ExtractResult<ElementaryStream> {
    if !(options.framerate.is_finite() && options.framerate > 0.0) {
        return Err(ExtractError::InvalidFramerate(options.framerate));
    }

    let mut parser = Parser::default();
    let mut builder = StreamBuilder::default();
    let mut have_sps = false;
    let mut have_pps = false;

    let duration = 1.0 / f64::from(options.framerate);

    for nalu in NalIterator::new(data) {
        let nalu = nalu.map_err(ParseError::from)?;

        match nalu.header.type_ {
            NaluType::Sps if !have_sps => {
                let sps = parser.parse_sps(&nalu)?;
                builder.add_sps(sps);
                have_sps = true;
            }
            NaluType::Pps if !have_pps => {
                parser.parse_pps(&nalu)?;
                have_pps = true;
            }
            NaluType::Sps | NaluType::Pps => {
                debug!("ignoring repeated {:?} at {}", nalu.header.type_, nalu.sc_offset);
            }
            NaluType::Slice | NaluType::SliceIdr => {
                let header = parser.parse_slice_header(&nalu)?;
                let new_frame = header.first_mb_in_slice == 0;
                let timestamp = builder.num_frames() as f64 * duration;

                builder.push_slice(
                    nalu.as_ref(),
                    &nalu.header,
                    header,
                    new_frame,
                    timestamp,
                    duration,
                );
            }
            other => debug!("skipping {:?} NAL unit", other),
        }
    }

    builder.finish(parser)
}
