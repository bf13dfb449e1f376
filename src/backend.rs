// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implementations of [`StatelessH264DecoderBackend`].
//!
//! A backend is a provider of H.264 decoding, most likely hardware-accelerated. Only the dummy
//! backend, which records the decode requests it receives, is provided here.
//!
//! [`StatelessH264DecoderBackend`]: crate::decoder::StatelessH264DecoderBackend

pub mod dummy;
