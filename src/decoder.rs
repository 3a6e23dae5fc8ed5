// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod stateless;

use std::collections::VecDeque;

use thiserror::Error;

use crate::decoder::stateless::StatelessBackendError;
use crate::Resolution;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the decoder. Every failure falls in one of these three
/// classes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bitstream violates the syntax or its semantic constraints.
    #[error("corrupt bitstream: {0}")]
    CorruptBitstream(String),
    /// The bitstream is valid but uses a feature the decoder does not handle.
    #[error("unsupported bitstream: {0}")]
    UnsupportedBitstream(String),
    #[error("memory allocation failure: {0}")]
    MemoryAllocationFailure(String),
}

impl From<StatelessBackendError> for Error {
    fn from(err: StatelessBackendError) -> Self {
        match err {
            StatelessBackendError::OutOfResources => {
                Error::MemoryAllocationFailure(StatelessBackendError::OutOfResources.to_string())
            }
            StatelessBackendError::Other(e) => e.into(),
        }
    }
}

/// Errors raised internally are `anyhow` errors. The ones carrying a
/// classified [`Error`] or a backend error keep their class, everything else
/// is a syntax problem.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<Error>() {
            Ok(e) => return e,
            Err(err) => err,
        };

        match err.downcast::<StatelessBackendError>() {
            Ok(e) => e.into(),
            Err(err) => Error::CorruptBitstream(format!("{:#}", err)),
        }
    }
}

/// Decoder settings for a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Only decode this tile row. Honored in large scale tile mode when the
    /// frame allows decoding single tiles. The first frame that does not
    /// clears the selection.
    pub dec_tile_row: Option<u32>,
    /// Only decode this tile column, with the same restrictions as
    /// `dec_tile_row`.
    pub dec_tile_col: Option<u32>,
    /// Decode tiles in reverse order.
    pub inverse_tile_order: bool,
    /// The stream uses large scale tile coding.
    pub large_scale_tile: bool,
    /// Skip the in-loop filters that are optional for conformance (CDEF).
    pub skip_loop_filter: bool,
    /// Frames larger than this are rejected.
    pub max_decode_dimensions: Option<Resolution>,
    /// The operating point to decode, for scalable streams.
    pub operating_point: u32,
}

/// A queue where decoded frames wait until the client retrieves them.
pub(crate) struct ReadyFramesQueue<T> {
    /// Queue of all the frames waiting to be sent to the client.
    queue: VecDeque<T>,
}

impl<T> Default for ReadyFramesQueue<T> {
    fn default() -> Self {
        Self { queue: Default::default() }
    }
}

impl<T> ReadyFramesQueue<T> {
    /// Push `handle` to the back of the queue.
    pub fn push(&mut self, handle: T) {
        self.queue.push_back(handle)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl<T> Extend<T> for ReadyFramesQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.queue.extend(iter)
    }
}

/// Allows us to manipulate the frames list like an iterator without consuming it.
impl<'a, T> Iterator for &'a mut ReadyFramesQueue<T> {
    type Item = T;

    /// Returns the next frame (if any) waiting to be dequeued.
    fn next(&mut self) -> Option<T> {
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use anyhow::Context;

    use super::*;

    #[test]
    fn error_classification() {
        let err: Error = anyhow!("Truncated OBU").into();
        assert_eq!(err, Error::CorruptBitstream("Truncated OBU".into()));

        let unsupported = anyhow::Error::new(Error::UnsupportedBitstream("12 bit".into()))
            .context("while parsing the sequence header");
        assert_eq!(Error::from(unsupported), Error::UnsupportedBitstream("12 bit".into()));

        let oom = anyhow::Error::new(StatelessBackendError::OutOfResources);
        assert!(matches!(Error::from(oom), Error::MemoryAllocationFailure(_)));

        let backend: Error = StatelessBackendError::Other(anyhow!("bad tile")).into();
        assert_eq!(backend, Error::CorruptBitstream("bad tile".into()));

        let with_context: Error =
            Err::<(), _>(anyhow!("inner")).context("outer").unwrap_err().into();
        assert_eq!(with_context, Error::CorruptBitstream("outer: inner".into()));
    }

    #[test]
    fn ready_queue_order() {
        let mut queue = ReadyFramesQueue::default();
        queue.push(1);
        queue.extend([2, 3]);
        assert_eq!(queue.len(), 3);
        assert_eq!((&mut queue).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(queue.len(), 0);
    }
}
