// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::av1::parser::NUM_REF_FRAMES;

const DIV_LUT: [i32; 257] = [
    16384, 16320, 16257, 16194, 16132, 16070, 16009, 15948, 15888, 15828, 15768, 15709, 15650,
    15592, 15534, 15477, 15420, 15364, 15308, 15252, 15197, 15142, 15087, 15033, 14980, 14926,
    14873, 14821, 14769, 14717, 14665, 14614, 14564, 14513, 14463, 14413, 14364, 14315, 14266,
    14218, 14170, 14122, 14075, 14028, 13981, 13935, 13888, 13843, 13797, 13752, 13707, 13662,
    13618, 13574, 13530, 13487, 13443, 13400, 13358, 13315, 13273, 13231, 13190, 13148, 13107,
    13066, 13026, 12985, 12945, 12906, 12866, 12827, 12788, 12749, 12710, 12672, 12633, 12596,
    12558, 12520, 12483, 12446, 12409, 12373, 12336, 12300, 12264, 12228, 12193, 12157, 12122,
    12087, 12053, 12018, 11984, 11950, 11916, 11882, 11848, 11815, 11782, 11749, 11716, 11683,
    11651, 11619, 11586, 11555, 11523, 11491, 11460, 11429, 11398, 11367, 11336, 11305, 11275,
    11245, 11215, 11185, 11155, 11125, 11096, 11067, 11038, 11009, 10980, 10951, 10923, 10894,
    10866, 10838, 10810, 10782, 10755, 10727, 10700, 10673, 10645, 10618, 10592, 10565, 10538,
    10512, 10486, 10460, 10434, 10408, 10382, 10356, 10331, 10305, 10280, 10255, 10230, 10205,
    10180, 10156, 10131, 10107, 10082, 10058, 10034, 10010, 9986, 9963, 9939, 9916, 9892, 9869,
    9846, 9823, 9800, 9777, 9754, 9732, 9709, 9687, 9664, 9642, 9620, 9598, 9576, 9554, 9533, 9511,
    9489, 9468, 9447, 9425, 9404, 9383, 9362, 9341, 9321, 9300, 9279, 9259, 9239, 9218, 9198, 9178,
    9158, 9138, 9118, 9098, 9079, 9059, 9039, 9020, 9001, 8981, 8962, 8943, 8924, 8905, 8886, 8867,
    8849, 8830, 8812, 8793, 8775, 8756, 8738, 8720, 8702, 8684, 8666, 8648, 8630, 8613, 8595, 8577,
    8560, 8542, 8525, 8508, 8490, 8473, 8456, 8439, 8422, 8405, 8389, 8372, 8355, 8339, 8322, 8306,
    8289, 8273, 8257, 8240, 8224, 8208, 8192,
];

const DIV_LUT_BITS: u32 = 8;
const DIV_LUT_PREC_BITS: u32 = 14;

/// Implements FloorLog2(x), the location of the most significant bit in x.
/// Returns 0 for an input of 0.
pub fn floor_log2(x: u32) -> u32 {
    if x == 0 {
        0
    } else {
        31 - x.leading_zeros()
    }
}

/// Number of bits needed to represent values up to `num_values`, i.e.
/// `FloorLog2(num_values) + 1`, or 0 when there is nothing to code.
pub fn get_unsigned_bits(num_values: u32) -> u32 {
    if num_values > 0 {
        floor_log2(num_values) + 1
    } else {
        0
    }
}

/// Implements 5.9.3. Get relative distance function
pub fn get_relative_dist(enable_order_hint: bool, order_hint_bits: i32, a: i32, b: i32) -> i32 {
    if !enable_order_hint || order_hint_bits <= 0 {
        0
    } else {
        let diff = a - b;
        let m = 1 << (order_hint_bits - 1);
        (diff & (m - 1)) - (diff & m)
    }
}

/// Implements find_latest_backward from section 7.8.
pub fn find_latest_backward(
    shifted_order_hints: &[i32; NUM_REF_FRAMES],
    used_frame: &[bool; NUM_REF_FRAMES],
    cur_frame_hint: i32,
    latest_order_hint: &mut i32,
) -> Option<usize> {
    let mut found = None;

    for i in 0..NUM_REF_FRAMES {
        let hint = shifted_order_hints[i];
        if !used_frame[i]
            && hint >= cur_frame_hint
            && (found.is_none() || hint >= *latest_order_hint)
        {
            found = Some(i);
            *latest_order_hint = hint;
        }
    }

    found
}

/// Implements find_earliest_backward from section 7.8.
pub fn find_earliest_backward(
    shifted_order_hints: &[i32; NUM_REF_FRAMES],
    used_frame: &[bool; NUM_REF_FRAMES],
    cur_frame_hint: i32,
    earliest_order_hint: &mut i32,
) -> Option<usize> {
    let mut found = None;

    for i in 0..NUM_REF_FRAMES {
        let hint = shifted_order_hints[i];
        if !used_frame[i]
            && hint >= cur_frame_hint
            && (found.is_none() || hint < *earliest_order_hint)
        {
            found = Some(i);
            *earliest_order_hint = hint;
        }
    }

    found
}

/// Implements find_latest_forward from section 7.8.
pub fn find_latest_forward(
    shifted_order_hints: &[i32; NUM_REF_FRAMES],
    used_frame: &[bool; NUM_REF_FRAMES],
    cur_frame_hint: i32,
    latest_order_hint: &mut i32,
) -> Option<usize> {
    let mut found = None;

    for i in 0..NUM_REF_FRAMES {
        let hint = shifted_order_hints[i];
        if !used_frame[i]
            && hint < cur_frame_hint
            && (found.is_none() || hint >= *latest_order_hint)
        {
            found = Some(i);
            *latest_order_hint = hint;
        }
    }

    found
}

pub fn tile_log2(blk_size: u32, target: u32) -> u32 {
    let mut k = 0;

    while (u64::from(blk_size) << k) < u64::from(target) {
        k += 1;
    }

    k
}

pub fn clip3<T: PartialOrd>(x: T, y: T, z: T) -> T {
    if z < x {
        x
    } else if z > y {
        y
    } else {
        z
    }
}

/// 5.9.29
pub fn inverse_recenter(r: i32, v: i32) -> i32 {
    if v > 2 * r {
        v
    } else if v & 1 != 0 {
        r - ((v + 1) >> 1)
    } else {
        r + (v >> 1)
    }
}

/// Implements Round2. See 4.7: mathematical functions.
pub fn round2(x: u64, n: u32) -> u64 {
    if n == 0 {
        x
    } else {
        (x + (1 << (n - 1))) >> n
    }
}

/// Implements Round2Signed. See 4.7: mathematical functions.
pub fn round2signed(x: i64, n: u32) -> i64 {
    let magnitude = round2(x.unsigned_abs(), n) as i64;
    if x >= 0 {
        magnitude
    } else {
        -magnitude
    }
}

/// Rounds `value` up to the next multiple of `1 << n`.
pub fn align_power_of_two(value: u32, n: u32) -> u32 {
    (value + (1 << n) - 1) & !((1 << n) - 1)
}

/// Implements 7.11.3.7. Resolve divisor process. Returns the shift and the
/// signed factor approximating `1 / d`.
pub fn resolve_divisor(d: i64) -> (u32, i64) {
    let abs_d = d.unsigned_abs();
    let n = 63 - abs_d.max(1).leading_zeros();
    let e = abs_d - (1 << n);

    let f = if n > DIV_LUT_BITS {
        round2(e, n - DIV_LUT_BITS)
    } else {
        e << (DIV_LUT_BITS - n)
    };

    let div_shift = n + DIV_LUT_PREC_BITS;
    let factor = i64::from(DIV_LUT[f as usize]);
    let div_factor = if d < 0 { -factor } else { factor };

    (div_shift, div_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log2_helpers() {
        assert_eq!(floor_log2(1), 0);
        assert_eq!(floor_log2(255), 7);
        assert_eq!(floor_log2(256), 8);
        assert_eq!(floor_log2(0), 0);
        assert_eq!(get_unsigned_bits(0), 0);
        assert_eq!(get_unsigned_bits(7), 3);
        assert_eq!(get_unsigned_bits(63), 6);
        assert_eq!(get_unsigned_bits(255), 8);
        assert_eq!(tile_log2(1, 4), 2);
        assert_eq!(tile_log2(64, 63), 0);
    }

    #[test]
    fn relative_distance_wraps() {
        assert_eq!(get_relative_dist(true, 7, 2, 126), 4);
        assert_eq!(get_relative_dist(true, 7, 126, 2), -4);
        assert_eq!(get_relative_dist(false, 7, 126, 2), 0);
    }

    #[test]
    fn rounding() {
        assert_eq!(round2(5, 1), 3);
        assert_eq!(round2(4, 0), 4);
        assert_eq!(round2signed(-5, 1), -3);
        assert_eq!(round2signed(5, 1), 3);
        assert_eq!(align_power_of_two(13, 3), 16);
        assert_eq!(align_power_of_two(16, 3), 16);
    }

    #[test]
    fn recenter() {
        assert_eq!(inverse_recenter(3, 10), 10);
        assert_eq!(inverse_recenter(3, 1), 2);
        assert_eq!(inverse_recenter(3, 2), 4);
    }

    #[test]
    fn divisor_of_power_of_two() {
        // 1 / 65536 == 16384 >> 30
        assert_eq!(resolve_divisor(1 << 16), (30, 16384));
        assert_eq!(resolve_divisor(-(1 << 16)), (30, -16384));
    }
}
