// Discord audio is 16-bit stereo PCM at 48kHz, delivered and
// consumed in 20ms frames.

use std::time::Duration;

use crate::model::types::SttSample;

pub(crate) const DISCORD_SAMPLES_PER_SECOND: usize = 48000;
pub(crate) const DISCORD_AUDIO_CHANNELS: usize = 2;

pub(crate) const FRAME_PERIOD_MS: usize = 20;

/// samples per 20ms frame, single channel
pub(crate) const MONO_FRAME_SIZE: usize = DISCORD_SAMPLES_PER_SECOND * FRAME_PERIOD_MS / 1000;

/// samples per 20ms frame, both channels interleaved
pub(crate) const STEREO_FRAME_SIZE: usize = MONO_FRAME_SIZE * DISCORD_AUDIO_CHANNELS;

pub(crate) const STT_SAMPLES_PER_SECOND: usize = 16000;

// 48000 / 16000 must divide evenly; the capture resampler
// relies on the ratio being a whole number.
pub(crate) const BITRATE_CONVERSION_RATIO: usize =
    DISCORD_SAMPLES_PER_SECOND / STT_SAMPLES_PER_SECOND;

pub(crate) const DISCORD_AUDIO_MAX_VALUE: SttSample = i16::MAX as SttSample;
pub(crate) const DISCORD_AUDIO_MAX_VALUE_TWO_SAMPLES: SttSample =
    DISCORD_AUDIO_MAX_VALUE * DISCORD_AUDIO_CHANNELS as SttSample;

pub(crate) const ESPEAK_SAMPLES_PER_SECOND: usize = 22050;

pub(crate) const DEFAULT_PLAYBACK_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const DEFAULT_DUCKING_LEVEL: f32 = 0.5;
pub(crate) const DEFAULT_DUCKING_TRANSITION: Duration = Duration::from_millis(300);

pub(crate) const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_CHUNK_DURATION: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_CHUNK_OVERLAP: Duration = Duration::from_millis(500);

/// RMS over mono-folded samples, normalized to [-1, 1].  Chunks
/// quieter than this never reach the recognizer.
pub(crate) const DEFAULT_VAD_RMS_THRESHOLD: f32 = 0.01;

pub(crate) const DEFAULT_WORKER_POOL_SIZE: usize = 2;

/// how many entries the per-guild decode cache may hold before
/// it is cleared wholesale
pub(crate) const DECODE_CACHE_MAX_ENTRIES: usize = 64;

/// keep this many tokens from previous transcriptions, and
/// use them to seed the next transcription.  This is per-user.
pub(crate) const TOKENS_TO_KEEP: usize = 1024;

/// if we have this many tokens in a single segment, we'll assume the
/// AI is hallucinating and ignore it
pub(crate) const OUTRAGEOUSLY_MANY_TOKENS: usize = 100;

/// log only every Nth malformed inbound packet
pub(crate) const CORRUPTION_LOG_EVERY: u64 = 50;

/// reset the malformed-packet counter once it passes this
pub(crate) const CORRUPTION_COUNTER_CEILING: u64 = 10_000;
