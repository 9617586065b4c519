use crate::model::constants::{DISCORD_AUDIO_CHANNELS, DISCORD_AUDIO_MAX_VALUE_TWO_SAMPLES};
use crate::model::types::AudioSample;

/// RMS energy of interleaved stereo PCM, folded to mono and
/// normalized to [0, 1].
pub(crate) fn rms_over_stereo(samples: &[AudioSample]) -> f32 {
    if samples.len() < DISCORD_AUDIO_CHANNELS {
        return 0.0;
    }
    let mut sum_squares = 0.0f32;
    let mut count = 0usize;
    for frame in samples.chunks_exact(DISCORD_AUDIO_CHANNELS) {
        let mono = frame.iter().map(|&s| s as f32).sum::<f32>()
            / DISCORD_AUDIO_MAX_VALUE_TWO_SAMPLES;
        sum_squares += mono * mono;
        count += 1;
    }
    (sum_squares / count as f32).sqrt()
}

/// The gate itself: does this drained chunk contain speech worth
/// sending to the recognizer?
pub(crate) fn is_speech(samples: &[AudioSample], rms_threshold: f32) -> bool {
    rms_over_stereo(samples) >= rms_threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_gated_out() {
        let silence = vec![0i16; 48000 * 2 * 2]; // 2 seconds of stereo silence
        assert!(!is_speech(&silence, 0.01));
        assert_eq!(0.0, rms_over_stereo(&silence));
    }

    #[test]
    fn test_loud_tone_passes_the_gate() {
        let tone: Vec<i16> = (0..48000 * 2)
            .map(|i| (((i / 2) as f32 * 0.05).sin() * 12000.0) as i16)
            .collect();
        assert!(is_speech(&tone, 0.01));
    }

    #[test]
    fn test_quiet_hiss_stays_below_threshold() {
        // low-level noise well under 1% of full scale
        let hiss: Vec<i16> = (0..48000 * 2)
            .map(|i| if i % 2 == 0 { 40 } else { -40 })
            .collect();
        assert!(!is_speech(&hiss, 0.01));
    }

    #[test]
    fn test_empty_buffer_is_not_speech() {
        assert!(!is_speech(&[], 0.01));
    }
}
