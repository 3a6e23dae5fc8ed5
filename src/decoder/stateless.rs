// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the backend API targeted by these decoders. The decoders themselves do
//! hold the decoding state so the backend doesn't need to.
//!
//! The [`StatelessDecoder`] struct is the basis of all stateless decoders. It is created by
//! combining a codec to a backend, after which bitstream units can be submitted through the
//! codec-specific `decode` method.

pub mod av1;

use std::rc::Rc;

use thiserror::Error;

use crate::decoder::DecoderConfig;
use crate::decoder::ReadyFramesQueue;

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;

/// Decoder implementations can use this struct to represent their decoding state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum DecodingState {
    /// Decoder will ignore all input until format and resolution information passes by.
    #[default]
    AwaitingStreamInfo,
    /// Decoder is currently decoding input.
    Decoding,
    /// Decoder has been reset after a flush, and can resume with the current parameters after
    /// seeing a key frame.
    Reset,
}

/// Common trait shared by all stateless video decoder backends, providing codec-independent
/// methods.
pub trait StatelessDecoderBackend {
    /// The frame buffers the backend decodes into. Frames are shared between the reference
    /// slots and the output queue, and go back to the backend's pool when the last reference
    /// to them is dropped.
    type Frame;
}

/// A codec the [`StatelessDecoder`] can be specialized for.
pub trait StatelessCodec<B: StatelessDecoderBackend> {
    /// State that needs to be kept during a decoding operation, typed by backend.
    type DecoderState;

    /// Creates the initial state of a decoder using `config`.
    fn new_decoder_state(config: &DecoderConfig) -> Self::DecoderState;
}

/// A struct that serves as a basis to implement a stateless decoder.
///
/// A stateless decoder is defined by two generic parameters:
///
/// * A codec, represented by a type that implements [`StatelessCodec`]. This type defines the
/// codec-specific decoder state and other codec properties.
/// * A backend, i.e. the provider of the entropy decoder, the reconstruction kernels and the
/// frame buffers.
///
/// So for instance, an AV1 decoder using a backend named `SoftBackend` will have the following
/// type:
///
/// ```text
/// let decoder: StatelessDecoder<Av1, SoftBackend>;
/// ```
///
/// This struct just manages the high-level decoder state as well as the queue of decoded frames.
/// All the rest is left to codec-specific code.
pub struct StatelessDecoder<C, B>
where
    C: StatelessCodec<B>,
    B: StatelessDecoderBackend,
{
    config: DecoderConfig,

    ready_queue: ReadyFramesQueue<Rc<B::Frame>>,

    decoding_state: DecodingState,

    /// The backend doing the actual decoding work.
    backend: B,

    /// Codec-specific state.
    codec: C::DecoderState,
}

impl<C, B> StatelessDecoder<C, B>
where
    C: StatelessCodec<B>,
    B: StatelessDecoderBackend,
{
    pub fn new(backend: B, config: DecoderConfig) -> Self {
        Self {
            codec: C::new_decoder_state(&config),
            config,
            backend,
            decoding_state: Default::default(),
            ready_queue: Default::default(),
        }
    }

    /// Returns the next frame to display, if any.
    pub fn next_frame(&mut self) -> Option<Rc<B::Frame>> {
        (&mut self.ready_queue).next()
    }

    /// Number of frames waiting to be retrieved through [`Self::next_frame`].
    pub fn num_ready_frames(&self) -> usize {
        self.ready_queue.len()
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
