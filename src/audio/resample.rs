//! Resamples synthesized speech up to the transport's sample rate.
//! espeak-ng generates audio at 22050hz and the voice transport wants
//! 48000hz; the ratio isn't a whole number, so this path uses a
//! windowed-sinc resampler rather than the capture pipeline's simple
//! decimation.

use rubato::{
    calculate_cutoff, Resampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

use crate::model::constants::MONO_FRAME_SIZE;

fn init_resampler(resample_ratio: f64) -> SincFixedIn<f64> {
    let sinc_len = 128;
    let window = WindowFunction::Blackman2;

    SincFixedIn::<f64>::new(
        resample_ratio,
        1.0,
        SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        },
        MONO_FRAME_SIZE,
        1,
    )
    .unwrap()
}

/// Rate-converts mono PCM.  The output is zero-padded up to a whole
/// number of 20ms frames so a playback source built from it never ends
/// mid-frame.
pub(crate) fn resample(from_sample_rate: usize, to_sample_rate: usize, data: &[i16]) -> Vec<i16> {
    let resample_ratio = to_sample_rate as f64 / from_sample_rate as f64;
    let mut resampler = init_resampler(resample_ratio);

    let mut out: Vec<i16> = Vec::with_capacity((data.len() as f64 * resample_ratio) as usize);
    for chunk in data.chunks(MONO_FRAME_SIZE) {
        let mut frame: Vec<f64> = chunk.iter().map(|s| *s as f64 / i16::MAX as f64).collect();
        // the resampler only eats full chunks; pad the tail
        frame.resize(MONO_FRAME_SIZE, 0.0);

        let produced = resampler.process(&[frame], None).unwrap();
        out.extend(produced[0].iter().map(|s| (s * i16::MAX as f64) as i16));
    }

    let remainder = out.len() % MONO_FRAME_SIZE;
    if remainder != 0 {
        out.resize(out.len() + MONO_FRAME_SIZE - remainder, 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::constants::{DISCORD_SAMPLES_PER_SECOND, ESPEAK_SAMPLES_PER_SECOND};

    #[test]
    fn test_output_is_whole_frames_at_target_rate() {
        let input = vec![0i16; ESPEAK_SAMPLES_PER_SECOND]; // one second
        let output = resample(
            ESPEAK_SAMPLES_PER_SECOND,
            DISCORD_SAMPLES_PER_SECOND,
            &input,
        );
        assert_eq!(0, output.len() % MONO_FRAME_SIZE);
        // roughly one second out; input tail padding and frame
        // rounding may add a little trailing silence
        assert!(output.len() >= DISCORD_SAMPLES_PER_SECOND);
        assert!(output.len() <= DISCORD_SAMPLES_PER_SECOND + 3 * MONO_FRAME_SIZE);
    }
}
