// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Front end for hardware H.264 decoding.
//!
//! An MP4 track or Annex B byte stream is first extracted into an [`stream::ElementaryStream`]:
//! a single buffer of slice NAL units plus per-frame metadata, including the display order
//! resolved from picture order counts. A [`decoder::StatelessDecoder`] then feeds the frames to
//! a backend in decode order, assigning DPB slots and reference lists, and reorders the decoded
//! pictures for display.

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod stream;
pub mod utils;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}
