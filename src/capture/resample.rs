// The transport's 48kHz stereo and the recognizers' 16kHz mono have a
// whole-number rate ratio, so downsampling is a fold-and-decimate over
// sample groups rather than real interpolation.

use crate::model::constants::{
    BITRATE_CONVERSION_RATIO, DISCORD_AUDIO_CHANNELS, DISCORD_AUDIO_MAX_VALUE_TWO_SAMPLES,
};
use crate::model::types::{AudioSample, SttSample};

const GROUP_SIZE: usize = BITRATE_CONVERSION_RATIO * DISCORD_AUDIO_CHANNELS;

/// 48kHz interleaved stereo i16 → 16kHz mono f32 in [-1, 1], the
/// batch recognizer's input format.
pub(crate) fn to_stt_f32(stereo: &[AudioSample]) -> Vec<SttSample> {
    stereo
        .chunks_exact(GROUP_SIZE)
        .map(|group| {
            // average both channels of the first frame in the group
            group[..DISCORD_AUDIO_CHANNELS]
                .iter()
                .map(|&s| s as SttSample)
                .sum::<SttSample>()
                / DISCORD_AUDIO_MAX_VALUE_TWO_SAMPLES
        })
        .collect()
}

/// 48kHz interleaved stereo i16 → 16kHz mono i16, the streaming
/// recognizer's input format.
pub(crate) fn to_stt_i16(stereo: &[AudioSample]) -> Vec<AudioSample> {
    stereo
        .chunks_exact(GROUP_SIZE)
        .map(|group| {
            let sum: i32 = group[..DISCORD_AUDIO_CHANNELS]
                .iter()
                .map(|&s| s as i32)
                .sum();
            (sum / DISCORD_AUDIO_CHANNELS as i32) as AudioSample
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::constants::{DISCORD_SAMPLES_PER_SECOND, STT_SAMPLES_PER_SECOND};

    #[test]
    fn test_one_second_downsamples_to_recognizer_rate() {
        let one_second = vec![0i16; DISCORD_SAMPLES_PER_SECOND * DISCORD_AUDIO_CHANNELS];
        assert_eq!(STT_SAMPLES_PER_SECOND, to_stt_f32(&one_second).len());
        assert_eq!(STT_SAMPLES_PER_SECOND, to_stt_i16(&one_second).len());
    }

    #[test]
    fn test_channels_are_averaged() {
        // one group: L=1000, R=3000 then filler frames
        let mut group = vec![1000i16, 3000];
        group.resize(GROUP_SIZE, 0);
        assert_eq!(vec![2000i16], to_stt_i16(&group));

        let f32_out = to_stt_f32(&group);
        assert_eq!(1, f32_out.len());
        let expected = (1000.0 + 3000.0) / DISCORD_AUDIO_MAX_VALUE_TWO_SAMPLES;
        assert!((f32_out[0] - expected).abs() < f32::EPSILON);
    }

    #[test]
    fn test_full_scale_maps_inside_unit_range() {
        let mut group = vec![i16::MAX, i16::MAX];
        group.resize(GROUP_SIZE, 0);
        let out = to_stt_f32(&group);
        assert!(out[0] <= 1.0 && out[0] > 0.99);
    }
}
