// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use crate::decoder::reorder::ReorderedPicture;
use crate::decoder::StatelessDecoder;
use crate::decoder::StatelessH264DecoderBackend;
use crate::stream::ElementaryStream;

/// Rounds `value` up to a multiple of `alignment`. An alignment of 0 leaves the value unchanged.
pub fn align(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }

    value.div_ceil(alignment) * alignment
}

/// Returns the CRC32 of the NAL units of frame `index`, start codes included.
pub fn frame_crc32(stream: &ElementaryStream, index: usize) -> Option<u32> {
    stream.frame_data(index).map(crc32fast::hash)
}

/// Simple decode and display loop driven by a fixed clock of `elapsed` seconds per iteration.
///
/// `on_display` is called each time the displayed picture changes. The loop stops once every
/// frame of the stream has been displayed at least once, or after `max_iterations`. Returns the
/// number of iterations run.
pub fn simple_playback_loop<B>(
    decoder: &mut StatelessDecoder<B>,
    elapsed: f64,
    max_iterations: usize,
    on_display: &mut dyn FnMut(&ReorderedPicture<B::Picture>),
) -> anyhow::Result<usize>
where
    B: StatelessH264DecoderBackend,
{
    let mut shown = vec![false; decoder.stream().frames.len()];
    let mut num_shown = 0;

    for iteration in 0..max_iterations {
        if num_shown == shown.len() {
            return Ok(iteration);
        }

        if let Some(picture) = decoder.step(elapsed)? {
            on_display(picture);

            if let Some(seen) = shown.get_mut(picture.frame_index) {
                if !*seen {
                    *seen = true;
                    num_shown += 1;
                }
            }
        }
    }

    Ok(max_iterations)
}
