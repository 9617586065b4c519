use std::time::Duration;

use crate::model::constants::FRAME_PERIOD_MS;

/// Per-source volume state machine.  `current` ramps linearly toward
/// `target` over the configured transition window, one step per
/// outbound frame; it converges exactly and never jumps.
pub(crate) struct Ducker {
    base_volume: f32,
    ducking_level: f32,
    is_ducked: bool,
    target_volume: f32,
    current_volume: f32,
    transition_frames: u32,
    remaining_frames: u32,
}

impl Ducker {
    pub fn new(base_volume: f32, ducking_level: f32, transition: Duration) -> Self {
        let frame = Duration::from_millis(FRAME_PERIOD_MS as u64);
        let transition_frames = (transition.as_millis() / frame.as_millis()).max(1) as u32;
        Self {
            base_volume,
            ducking_level,
            is_ducked: false,
            target_volume: base_volume,
            current_volume: base_volume,
            transition_frames,
            remaining_frames: 0,
        }
    }

    /// Sets the operator-configured gain.  Takes effect on the normal
    /// (unducked) target immediately; a ducked source keeps ramping
    /// toward `base * level` recomputed from the new base.
    pub fn set_volume(&mut self, volume: f32) {
        self.base_volume = volume.clamp(0.0, 2.0);
        self.retarget();
    }

    pub fn set_ducking_level(&mut self, level: f32) {
        self.ducking_level = level;
        self.retarget();
    }

    /// No-op if already ducked.
    pub fn duck(&mut self) {
        if self.is_ducked {
            return;
        }
        self.is_ducked = true;
        self.retarget();
    }

    /// No-op if not ducked.
    pub fn unduck(&mut self) {
        if !self.is_ducked {
            return;
        }
        self.is_ducked = false;
        self.retarget();
    }

    pub fn is_ducked(&self) -> bool {
        self.is_ducked
    }

    pub fn target_volume(&self) -> f32 {
        self.target_volume
    }

    pub fn current_volume(&self) -> f32 {
        self.current_volume
    }

    fn retarget(&mut self) {
        let target = if self.is_ducked {
            self.base_volume * self.ducking_level
        } else {
            self.base_volume
        };
        if (target - self.target_volume).abs() > f32::EPSILON {
            self.target_volume = target;
            self.remaining_frames = self.transition_frames;
        }
    }

    /// Advances the ramp by one frame and returns the gain to apply
    /// to that frame's samples.
    pub fn next_gain(&mut self) -> f32 {
        if self.remaining_frames > 0 {
            let step = (self.target_volume - self.current_volume) / self.remaining_frames as f32;
            self.current_volume += step;
            self.remaining_frames -= 1;
            if self.remaining_frames == 0 {
                // kill any accumulated float error
                self.current_volume = self.target_volume;
            }
        } else {
            self.current_volume = self.target_volume;
        }
        self.current_volume
    }
}

/// Multiplies a frame of interleaved i16 samples by `gain`, clamping
/// back into i16 range.  Gain of exactly 1.0 skips the multiply.
/// Clipping distortion at gain > 1.0 is accepted behavior.
pub(crate) fn apply_gain(samples: &mut [i16], gain: f32) {
    if gain == 1.0 {
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = (*sample as f32 * gain).round();
        *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ducker() -> Ducker {
        // 300ms transition at 20ms frames = 15 frames
        Ducker::new(1.0, 0.5, Duration::from_millis(300))
    }

    #[test]
    fn test_duck_descends_monotonically_and_converges() {
        let mut d = ducker();
        d.duck();
        assert_eq!(0.5, d.target_volume());

        let mut last = d.current_volume();
        for _ in 0..15 {
            let gain = d.next_gain();
            assert!(gain <= last, "gain rose during a duck: {} > {}", gain, last);
            last = gain;
        }
        assert_eq!(0.5, d.current_volume());

        // holds at the target afterwards
        assert_eq!(0.5, d.next_gain());
    }

    #[test]
    fn test_unduck_ascends_monotonically_and_converges() {
        let mut d = ducker();
        d.duck();
        for _ in 0..15 {
            d.next_gain();
        }
        d.unduck();
        assert_eq!(1.0, d.target_volume());

        let mut last = d.current_volume();
        for _ in 0..15 {
            let gain = d.next_gain();
            assert!(gain >= last);
            last = gain;
        }
        assert_eq!(1.0, d.current_volume());
    }

    #[test]
    fn test_duck_is_idempotent() {
        let mut d = ducker();
        d.duck();
        let target_once = d.target_volume();
        d.next_gain();
        d.duck();
        assert_eq!(target_once, d.target_volume());

        // the second duck() must not restart the ramp
        let mid = d.current_volume();
        d.duck();
        assert_eq!(mid, d.current_volume());
    }

    #[test]
    fn test_set_volume_while_ducked_keeps_ducked_target() {
        let mut d = ducker();
        d.duck();
        d.set_volume(2.0);
        assert_eq!(1.0, d.target_volume());
        d.unduck();
        assert_eq!(2.0, d.target_volume());
    }

    #[test]
    fn test_set_volume_clamps_range() {
        let mut d = ducker();
        d.set_volume(5.0);
        assert_eq!(2.0, d.target_volume());
        d.set_volume(-1.0);
        assert_eq!(0.0, d.target_volume());
    }

    #[test]
    fn test_apply_gain_unity_is_untouched() {
        let mut frame = vec![100i16, -100, i16::MAX, i16::MIN];
        let original = frame.clone();
        apply_gain(&mut frame, 1.0);
        assert_eq!(original, frame);
    }

    #[test]
    fn test_apply_gain_halves_and_clamps() {
        let mut frame = vec![100i16, -100, i16::MAX, i16::MIN];
        apply_gain(&mut frame, 0.5);
        assert_eq!(50, frame[0]);
        assert_eq!(-50, frame[1]);

        let mut loud = vec![i16::MAX, i16::MIN];
        apply_gain(&mut loud, 2.0);
        assert_eq!(i16::MAX, loud[0]);
        assert_eq!(i16::MIN, loud[1]);
    }

    #[test]
    fn test_single_frame_transition() {
        let mut d = Ducker::new(1.0, 0.5, Duration::from_millis(1));
        d.duck();
        assert_eq!(0.5, d.next_gain());
    }
}
