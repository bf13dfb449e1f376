// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count resolution for `pic_order_cnt_type == 0` streams.
//!
//! The full POC is rebuilt from the `pic_order_cnt_lsb` of each frame as in
//! 8.2.1.1. A GOP counter is bumped every time the LSB wraps back to zero so
//! that pictures of successive GOPs never interleave when sorted.

use log::trace;

/// The position of a frame in presentation order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PictureOrder {
    /// Zero-based index of the GOP the frame belongs to. Compared first.
    pub gop: i32,
    /// PicOrderCnt of the frame, `PicOrderCntMsb + pic_order_cnt_lsb`.
    pub poc: i32,
}

/// Tracks `prevPicOrderCntMsb` and `prevPicOrderCntLsb` across the frames of
/// a stream, in decode order.
#[derive(Debug, Default)]
pub struct PocResolver {
    prev_lsb: i32,
    prev_msb: i32,
    gop_counter: i32,
}

impl PocResolver {
    pub fn new() -> Self {
        Default::default()
    }

    /// Resolves the order of the next frame in decode order.
    ///
    /// `log2_max_lsb` is `log2_max_pic_order_cnt_lsb_minus4 + 4` of the
    /// active SPS.
    pub fn next(&mut self, lsb: u16, log2_max_lsb: u8) -> PictureOrder {
        let lsb = i32::from(lsb);
        let max_lsb = 1i32 << log2_max_lsb;

        if lsb == 0 {
            self.gop_counter += 1;
        }

        // 8-3
        let msb = if lsb < self.prev_lsb && self.prev_lsb - lsb >= max_lsb / 2 {
            self.prev_msb + max_lsb
        } else if lsb > self.prev_lsb && lsb - self.prev_lsb > max_lsb / 2 {
            self.prev_msb - max_lsb
        } else {
            self.prev_msb
        };

        self.prev_lsb = lsb;
        self.prev_msb = msb;

        let order = PictureOrder {
            gop: self.gop_counter - 1,
            poc: msb + lsb,
        };

        trace!("lsb {} -> {:?}", lsb, order);

        order
    }

    /// Returns the display index of each frame, given the frames' orders
    /// in decode order. Ties keep decode order.
    pub fn display_order(orders: &[PictureOrder]) -> Vec<usize> {
        let mut ranked: Vec<usize> = (0..orders.len()).collect();
        ranked.sort_by_key(|&i| (orders[i], i));

        let mut display = vec![0; orders.len()];
        for (rank, index) in ranked.into_iter().enumerate() {
            display[index] = rank;
        }

        display
    }
}
