// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame-level AV1 decoding core.
//!
//! The crate parses the uncompressed parts of an AV1 bitstream, carves the
//! tile payloads, walks the partition trees and drives the per-block decode
//! pipeline. Entropy decoding, prediction, inverse transforms, in-loop
//! filters and frame buffers are provided by a backend implementing
//! [`decoder::stateless::av1::StatelessAV1DecoderBackend`].

pub mod bitstream_utils;
pub mod codec;
pub mod decoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}
