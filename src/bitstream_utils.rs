// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;

use bytes::Buf;
use thiserror::Error;

/// A MSB-first bit reader for the uncompressed parts of an AV1 bitstream.
///
/// Unlike the H.26x readers there are no emulation prevention bytes to take
/// care of, so this reads straight from the backing slice.
#[derive(Clone, Debug)]
pub(crate) struct BitReader<'a> {
    /// The bytes that have not been loaded into `curr_byte` yet.
    data: &'a [u8],
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_byte.
    curr_byte: u8,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// How many bits have been read so far.
    position: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ReadBitsError {
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("attempted unaligned read of {0} bytes")]
    Unaligned(usize),
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            curr_byte: 0,
            num_remaining_bits_in_curr_byte: 0,
            position: 0,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    /// Read up to 32 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut out = 0u64;
        let mut bits_left = num_bits;

        while bits_left > 0 {
            if self.num_remaining_bits_in_curr_byte == 0 {
                self.move_to_next_byte()?;
            }

            let take = std::cmp::min(bits_left, self.num_remaining_bits_in_curr_byte);
            let shift = self.num_remaining_bits_in_curr_byte - take;
            let chunk = (u64::from(self.curr_byte) >> shift) & ((1u64 << take) - 1);

            out = (out << take) | chunk;
            self.num_remaining_bits_in_curr_byte -= take;
            bits_left -= take;
        }

        self.position += num_bits as u64;

        let out = u32::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)?;
        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Reads a two's complement signed integer of length |num_bits|.
    pub fn read_bits_signed(&mut self, num_bits: usize) -> Result<i32, ReadBitsError> {
        if num_bits == 0 {
            return Ok(0);
        }
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let value = i64::from(self.read_bits::<u32>(num_bits)?);
        let sign_mask = 1i64 << (num_bits - 1);

        let value = if value & sign_mask != 0 { value - 2 * sign_mask } else { value };
        i32::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Reads a `num_bytes` little-endian unsigned integer. The reader must be
    /// byte aligned.
    pub fn read_le(&mut self, num_bytes: usize) -> Result<u32, ReadBitsError> {
        if self.num_remaining_bits_in_curr_byte % 8 != 0 {
            return Err(ReadBitsError::Unaligned(num_bytes));
        }
        if num_bytes > 4 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bytes * 8));
        }

        let mut t = 0u32;
        for i in 0..num_bytes {
            let byte = self.read_bits::<u32>(8)?;
            t |= byte << (i * 8);
        }

        Ok(t)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the position of the reader in bits.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn move_to_next_byte(&mut self) -> Result<(), ReadBitsError> {
        if !self.data.has_remaining() {
            return Err(ReadBitsError::OutOfBits);
        }

        self.curr_byte = self.data.get_u8();
        self.num_remaining_bits_in_curr_byte = 8;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// Writes MSB-first bit fields. Used to synthesize uncompressed headers.
pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mut written = 0;
        for bit in (0..bits).rev() {
            let bit = 1u64 << bit;

            self.write_bit((u64::from(value) & bit) == bit)?;
            written += 1;
        }

        Ok(written)
    }

    /// Writes the `bits` low bits of `value` as a two's complement number.
    pub fn write_su(&mut self, bits: usize, value: i32) -> BitWriterResult<usize> {
        if bits == 0 || bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
        self.write_f(bits, (value as u32) & mask)
    }

    /// Writes `value` as a leb128() number.
    pub fn write_leb128(&mut self, mut value: u32) -> BitWriterResult<usize> {
        let mut written = 0;
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }

            written += self.write_f(8, byte)?;
            if value == 0 {
                return Ok(written);
            }
        }
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}
