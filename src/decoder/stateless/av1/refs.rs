// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference slots and the scale factors used to predict from them.

use std::rc::Rc;

use crate::codec::av1::parser::FrameHeaderObu;
use crate::codec::av1::parser::FrameType;
use crate::codec::av1::parser::NUM_REF_FRAMES;
use crate::codec::av1::parser::REFS_PER_FRAME;
use crate::Resolution;

pub const REF_SCALE_SHIFT: u32 = 14;
pub const REF_NO_SCALE: i32 = 1 << REF_SCALE_SHIFT;
pub const REF_INVALID_SCALE: i32 = -1;

/// A decoded frame stored in a reference slot.
pub struct RefSlot<F, C> {
    pub frame: Rc<F>,
    /// Entropy context the frame was saved with.
    pub entropy_context: C,
    pub frame_type: FrameType,
    /// Upscaled width and height of the frame.
    pub resolution: Resolution,
}

impl<F, C: Clone> Clone for RefSlot<F, C> {
    fn clone(&self) -> Self {
        Self {
            frame: Rc::clone(&self.frame),
            entropy_context: self.entropy_context.clone(),
            frame_type: self.frame_type,
            resolution: self.resolution,
        }
    }
}

/// The reference slot table. Frames are shared between slots, and released
/// once no slot nor output queue entry holds them anymore.
pub struct ReferenceFrames<F, C> {
    slots: [Option<RefSlot<F, C>>; NUM_REF_FRAMES],
}

impl<F, C> Default for ReferenceFrames<F, C> {
    fn default() -> Self {
        Self { slots: Default::default() }
    }
}

impl<F, C: Clone> ReferenceFrames<F, C> {
    pub fn get(&self, slot: usize) -> Option<&RefSlot<F, C>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Stores `slot` in every slot whose bit is set in `refresh_frame_flags`.
    pub fn update(&mut self, refresh_frame_flags: u32, slot: &RefSlot<F, C>) {
        for (i, s) in self.slots.iter_mut().enumerate() {
            if (refresh_frame_flags >> i) & 1 != 0 {
                log::debug!("Replacing reference frame {}", i);
                *s = Some(slot.clone());
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots = Default::default();
    }

    /// Resolves the references of an inter frame, with the scale factors
    /// mapping the frame onto each of them. Intra frames have no reference.
    pub fn active_refs(&self, hdr: &FrameHeaderObu) -> [Option<ActiveRef<F>>; REFS_PER_FRAME] {
        let mut refs: [Option<ActiveRef<F>>; REFS_PER_FRAME] = Default::default();
        if hdr.frame_is_intra() {
            return refs;
        }

        let this = Resolution { width: hdr.frame_width, height: hdr.frame_height };
        for (active, &idx) in refs.iter_mut().zip(hdr.ref_frame_idx.iter()) {
            *active = self.get(idx as usize).map(|slot| ActiveRef {
                frame: Rc::clone(&slot.frame),
                scale: ScaleFactors::new(slot.resolution, this),
            });
        }

        refs
    }
}

/// A reference of the frame being decoded.
pub struct ActiveRef<F> {
    pub frame: Rc<F>,
    pub scale: ScaleFactors,
}

/// Fixed point factors scaling positions of the current frame into a
/// reference frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScaleFactors {
    pub x_scale_fp: i32,
    pub y_scale_fp: i32,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self { x_scale_fp: REF_NO_SCALE, y_scale_fp: REF_NO_SCALE }
    }
}

fn fixed_point_scale_factor(other: u32, this: u32) -> i32 {
    let other = other as i64;
    let this = this as i64;

    (((other << REF_SCALE_SHIFT) + this / 2) / this) as i32
}

/// Whether a frame of size `this` may predict from a reference of size
/// `reference`: at most twice smaller and 16 times larger.
fn valid_ref_frame_size(reference: Resolution, this: Resolution) -> bool {
    2 * this.width >= reference.width
        && 2 * this.height >= reference.height
        && this.width <= 16 * reference.width
        && this.height <= 16 * reference.height
}

impl ScaleFactors {
    pub fn new(reference: Resolution, this: Resolution) -> Self {
        if this.width == 0 || this.height == 0 || !valid_ref_frame_size(reference, this) {
            return Self { x_scale_fp: REF_INVALID_SCALE, y_scale_fp: REF_INVALID_SCALE };
        }

        Self {
            x_scale_fp: fixed_point_scale_factor(reference.width, this.width),
            y_scale_fp: fixed_point_scale_factor(reference.height, this.height),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.x_scale_fp != REF_INVALID_SCALE && self.y_scale_fp != REF_INVALID_SCALE
    }

    pub fn is_scaled(&self) -> bool {
        self.is_valid() && (self.x_scale_fp != REF_NO_SCALE || self.y_scale_fp != REF_NO_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(width: u32, height: u32) -> Resolution {
        Resolution { width, height }
    }

    #[test]
    fn scale_factors() {
        let same = ScaleFactors::new(res(320, 240), res(320, 240));
        assert!(same.is_valid());
        assert!(!same.is_scaled());

        // The reference is twice as large.
        let half = ScaleFactors::new(res(640, 480), res(320, 240));
        assert_eq!(half.x_scale_fp, 2 << REF_SCALE_SHIFT);
        assert_eq!(half.y_scale_fp, 2 << REF_SCALE_SHIFT);
        assert!(half.is_scaled());

        // Rounded to the nearest.
        let third = ScaleFactors::new(res(100, 100), res(150, 150));
        assert_eq!(third.x_scale_fp, ((100 << REF_SCALE_SHIFT) + 75) / 150);

        assert!(!ScaleFactors::new(res(641, 480), res(320, 240)).is_valid());
        assert!(!ScaleFactors::new(res(320, 240), res(320, 240 * 16 + 1)).is_valid());
        assert!(ScaleFactors::new(res(20, 15), res(320, 240)).is_valid());
    }

    #[test]
    fn refresh_shares_frames() {
        let mut refs = ReferenceFrames::<u32, u8>::default();
        let slot = RefSlot {
            frame: Rc::new(7),
            entropy_context: 1,
            frame_type: FrameType::KeyFrame,
            resolution: res(64, 64),
        };

        refs.update(0b1000_0101, &slot);
        assert!(refs.get(0).is_some());
        assert!(refs.get(1).is_none());
        assert!(refs.get(2).is_some());
        assert!(refs.get(7).is_some());
        assert!(refs.get(8).is_none());
        assert_eq!(Rc::strong_count(&slot.frame), 4);

        refs.clear();
        assert_eq!(Rc::strong_count(&slot.frame), 1);
    }

    #[test]
    fn intra_frames_have_no_references() {
        let mut refs = ReferenceFrames::<u32, u8>::default();
        let slot = RefSlot {
            frame: Rc::new(7),
            entropy_context: 1,
            frame_type: FrameType::KeyFrame,
            resolution: res(64, 64),
        };
        refs.update(0xff, &slot);

        let key = FrameHeaderObu { frame_width: 64, frame_height: 64, ..Default::default() };
        assert!(refs.active_refs(&key).iter().all(Option::is_none));

        let inter = FrameHeaderObu { frame_type: FrameType::InterFrame, ..key };
        let active = refs.active_refs(&inter);
        assert!(active.iter().all(|r| r.as_ref().is_some_and(|r| !r.scale.is_scaled())));
    }
}
