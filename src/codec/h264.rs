// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod dpb;
pub mod nalu;
pub mod nalu_reader;
#[cfg(test)]
pub(crate) mod nalu_writer;
pub mod parser;
pub mod poc;
