use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::errors::AudioError;
use crate::model::constants::{DISCORD_AUDIO_CHANNELS, DISCORD_SAMPLES_PER_SECOND};
use crate::model::types::AudioSample;

const TRANSCODER: &str = "ffmpeg";

/// Decodes `path` into the transport's format: 48kHz, stereo,
/// interleaved 16-bit signed PCM.  Returns the samples and the clip
/// duration in milliseconds.
///
/// WAV files are decoded natively; everything else goes through an
/// ffmpeg subprocess with raw s16le piped over stdout.  No network or
/// persistent I/O happens here.
pub(crate) fn convert(path: &Path) -> Result<(Vec<AudioSample>, u64), AudioError> {
    let pcm = match decode_wav(path) {
        Ok(pcm) => pcm,
        Err(wav_err) => {
            debug!(
                "native decode of {} failed ({}), falling back to {}",
                path.display(),
                wav_err,
                TRANSCODER
            );
            transcode(path)?
        }
    };

    let duration_ms =
        pcm.len() as u64 * 1000 / (DISCORD_SAMPLES_PER_SECOND * DISCORD_AUDIO_CHANNELS) as u64;
    Ok((pcm, duration_ms))
}

/// Fast path: a valid uncompressed WAV of any rate/channel count.
fn decode_wav(path: &Path) -> Result<Vec<AudioSample>, AudioError> {
    let mut reader =
        hound::WavReader::open(path).map_err(|e| AudioError::decode(path, e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<AudioSample> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| rescale_int(v, bits)))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::decode(path, e.to_string()))?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as AudioSample))
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::decode(path, e.to_string()))?,
    };

    let stereo = fold_channels(&samples, spec.channels as usize);
    Ok(resample_linear(
        &stereo,
        spec.sample_rate as usize,
        DISCORD_SAMPLES_PER_SECOND,
    ))
}

/// Fallback path: ask ffmpeg for raw s16le at the target rate and
/// channel count, reading its stdout fully.
fn transcode(path: &Path) -> Result<Vec<AudioSample>, AudioError> {
    let output = Command::new(TRANSCODER)
        .arg("-i")
        .arg(path)
        .args([
            "-f",
            "s16le",
            "-ac",
            "2",
            "-ar",
            "48000",
            "-loglevel",
            "quiet",
            "pipe:1",
        ])
        .output()
        .map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                AudioError::MissingTool { tool: TRANSCODER }
            } else {
                AudioError::decode(path, e.to_string())
            }
        })?;

    if !output.status.success() {
        return Err(AudioError::decode(
            path,
            format!("{} exited with {}", TRANSCODER, output.status),
        ));
    }
    if output.stdout.is_empty() {
        return Err(AudioError::decode(
            path,
            format!("{} produced no audio", TRANSCODER),
        ));
    }

    Ok(output
        .stdout
        .chunks_exact(2)
        .map(|b| AudioSample::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Maps an integer sample of `bits` significant bits onto the full
/// 16-bit range: wide sources shift down, narrow sources shift up.
fn rescale_int(sample: i32, bits: u16) -> AudioSample {
    if bits > 16 {
        (sample >> (bits - 16)) as AudioSample
    } else if bits < 16 {
        (sample << (16 - bits)) as AudioSample
    } else {
        sample as AudioSample
    }
}

/// Mono is duplicated into both channels; sources with more than two
/// channels keep only the first two.
fn fold_channels(samples: &[AudioSample], channels: usize) -> Vec<AudioSample> {
    match channels {
        0 => Vec::new(),
        1 => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &s in samples {
                out.push(s);
                out.push(s);
            }
            out
        }
        2 => samples.to_vec(),
        n => {
            let mut out = Vec::with_capacity(samples.len() / n * 2);
            for frame in samples.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
            out
        }
    }
}

/// Linear-interpolation rate conversion over interleaved stereo.
fn resample_linear(stereo: &[AudioSample], from_rate: usize, to_rate: usize) -> Vec<AudioSample> {
    if from_rate == to_rate || stereo.is_empty() {
        return stereo.to_vec();
    }

    let in_frames = stereo.len() / DISCORD_AUDIO_CHANNELS;
    let out_frames = in_frames * to_rate / from_rate;
    let mut out = Vec::with_capacity(out_frames * DISCORD_AUDIO_CHANNELS);

    let step = from_rate as f64 / to_rate as f64;
    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let next = (idx + 1).min(in_frames - 1);
        for ch in 0..DISCORD_AUDIO_CHANNELS {
            let a = stereo[idx * DISCORD_AUDIO_CHANNELS + ch] as f64;
            let b = stereo[next * DISCORD_AUDIO_CHANNELS + ch] as f64;
            out.push((a + (b - a) * frac).round() as AudioSample);
        }
    }
    out
}
