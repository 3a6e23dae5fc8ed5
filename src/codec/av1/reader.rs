// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::anyhow;

use crate::bitstream_utils::BitReader;
use crate::codec::av1::helpers;

/// Reader for the descriptors used by the uncompressed AV1 syntax (4.10).
#[derive(Clone, Debug)]
pub(crate) struct Reader<'a>(pub BitReader<'a>);

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self(BitReader::new(data))
    }

    /// Implements f(1).
    pub fn read_bit(&mut self) -> anyhow::Result<bool> {
        Ok(self.0.read_bit()?)
    }

    /// Implements f(n).
    pub fn read_bits(&mut self, num_bits: usize) -> anyhow::Result<u32> {
        Ok(self.0.read_bits::<u32>(num_bits)?)
    }

    /// Implements uvlc(): Variable length unsigned n-bit number appearing
    /// directly in the bitstream. See 4.10.3
    pub fn read_uvlc(&mut self) -> anyhow::Result<u32> {
        let mut leading_zeroes = 0;
        while !self.read_bit()? {
            leading_zeroes += 1;
        }

        if leading_zeroes >= 32 {
            return Ok(u32::MAX);
        }

        let value = self.read_bits(leading_zeroes)?;
        Ok(value + ((1u64 << leading_zeroes) - 1) as u32)
    }

    /// Implements le(n): Unsigned little-endian n-byte number. See 4.10.4
    pub fn read_le(&mut self, num_bytes: usize) -> anyhow::Result<u32> {
        Ok(self.0.read_le(num_bytes)?)
    }

    /// Implements leb128(): Unsigned integer represented by a variable number
    /// of little-endian bytes. See 4.10.5
    pub fn read_leb128(&mut self) -> anyhow::Result<u32> {
        let mut value = 0u64;

        for i in 0..8 {
            let byte = u64::from(self.read_bits(8)?);
            value |= (byte & 0x7f) << (i * 7);

            if byte & 0x80 == 0 {
                break;
            }
        }

        u32::try_from(value).map_err(|_| anyhow!("leb128 value {} does not fit in 32 bits", value))
    }

    /// Implements su(n): Signed integer converted from an n bits unsigned
    /// integer in the bitstream. See 4.10.6
    pub fn read_su(&mut self, num_bits: usize) -> anyhow::Result<i32> {
        Ok(self.0.read_bits_signed(num_bits)?)
    }

    /// Implements ns(n): Unsigned encoded integer with maximum number of values
    /// n (i.e. output in range 0..n-1). See 4.10.7
    pub fn read_ns(&mut self, n: u32) -> anyhow::Result<u32> {
        if n <= 1 {
            return Ok(0);
        }

        let w = helpers::floor_log2(n) + 1;
        let m = (1u32 << w) - n;
        let v = self.read_bits(w as usize - 1)?;

        if v < m {
            return Ok(v);
        }

        let extra_bit = u32::from(self.read_bit()?);
        Ok((v << 1) - m + extra_bit)
    }

    /// Implements 5.9.13: Delta quantizer syntax.
    pub fn read_delta_q(&mut self) -> anyhow::Result<i32> {
        if self.read_bit()? {
            self.read_su(7)
        } else {
            Ok(0)
        }
    }

    pub fn position(&self) -> u64 {
        self.0.position()
    }

    pub fn skip(&mut self, num_bits: usize) -> anyhow::Result<()> {
        Ok(self.0.skip_bits(num_bits)?)
    }

    /// Implements 5.3.4.
    pub fn read_trailing_bits(&mut self, mut num_bits: u64) -> anyhow::Result<()> {
        if num_bits == 0 {
            return Err(anyhow!("bad padding: no room for trailing_one_bit"));
        }

        if !self.read_bit()? {
            return Err(anyhow!("bad padding: trailing_one_bit is not set"));
        }
        num_bits -= 1;

        while num_bits > 0 {
            if self.read_bit()? {
                return Err(anyhow!("bad padding: trailing_zero_bit is set"));
            }
            num_bits -= 1;
        }

        Ok(())
    }

    fn decode_subexp(&mut self, num_syms: i32) -> anyhow::Result<i32> {
        let mut i = 0;
        let mut mk = 0;
        let k = 3;

        loop {
            let b2 = if i != 0 { k + i - 1 } else { k };
            let a = 1 << b2;
            if num_syms <= mk + 3 * a {
                let subexp_final_bits = self.read_ns((num_syms - mk) as u32)?;
                return Ok(subexp_final_bits as i32 + mk);
            } else if self.read_bit()? {
                i += 1;
                mk += a;
            } else {
                let subexp_bits = self.read_bits(b2 as usize)?;
                return Ok(subexp_bits as i32 + mk);
            }
        }
    }

    /// Implements 5.9.27.
    pub fn decode_unsigned_subexp_with_ref(&mut self, mx: i32, r: i32) -> anyhow::Result<i32> {
        let v = self.decode_subexp(mx)?;
        if (r << 1) <= mx {
            Ok(helpers::inverse_recenter(r, v))
        } else {
            Ok(mx - 1 - helpers::inverse_recenter(mx - 1 - r, v))
        }
    }

    /// Implements 5.9.26.
    pub fn decode_signed_subexp_with_ref(
        &mut self,
        low: i32,
        high: i32,
        r: i32,
    ) -> anyhow::Result<i32> {
        let x = self.decode_unsigned_subexp_with_ref(high - low, r - low)?;
        Ok(x + low)
    }

    /// Implements 5.3.5 Byte alignment syntax
    pub fn byte_alignment(&mut self) -> anyhow::Result<()> {
        while (self.position() & 7) != 0 {
            self.read_bit()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::BitWriter;

    #[test]
    fn uvlc_and_leb128() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            // uvlc(4): 2 leading zeroes, marker, then 01.
            w.write_f(5, 0b00101u8).unwrap();
            w.write_f(3, 0u8).unwrap();
            w.write_leb128(1000).unwrap();
        }

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_uvlc().unwrap(), 4);
        r.byte_alignment().unwrap();
        assert_eq!(r.read_leb128().unwrap(), 1000);
    }

    #[test]
    fn ns_values() {
        // n = 5: w = 3, m = 3. Values below m use 2 bits.
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_f(2, 2u8).unwrap();
            w.write_f(2, 3u8).unwrap();
            w.write_f(1, 1u8).unwrap();
        }

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_ns(5).unwrap(), 2);
        assert_eq!(r.read_ns(5).unwrap(), 4);
        assert_eq!(r.read_ns(1).unwrap(), 0);
    }

    #[test]
    fn delta_q() {
        let mut buf = Vec::new();
        {
            let mut w = BitWriter::new(&mut buf);
            w.write_bit(false).unwrap();
            w.write_bit(true).unwrap();
            w.write_su(7, -12).unwrap();
        }

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_delta_q().unwrap(), 0);
        assert_eq!(r.read_delta_q().unwrap(), -12);
    }

    #[test]
    fn trailing_bits() {
        let data = [0b1000_0000u8];
        let mut r = Reader::new(&data);
        assert!(r.read_trailing_bits(8).is_ok());

        let data = [0b1000_0100u8];
        let mut r = Reader::new(&data);
        assert!(r.read_trailing_bits(8).is_err());
    }

    #[test]
    fn truncated_read_is_an_error() {
        let data = [0xffu8];
        let mut r = Reader::new(&data);
        assert!(r.read_bits(8).is_ok());
        assert!(r.read_bit().is_err());
    }
}
