use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

pub type ChannelId = crate::model::types::ChannelId;
pub type GuildId = crate::model::types::GuildId;
pub type UserId = crate::model::types::UserId;

/// A single request to play a sound into a guild's voice channel.
/// Requests are queued FIFO per guild and never reordered; they are
/// only dropped by an explicit queue-clear or a playback timeout.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaybackRequest {
    /// path of the sound file on disk
    pub path: PathBuf,

    /// per-request gain, multiplied with the guild volume
    pub volume: f32,

    /// identifier for external stat attribution, if the caller has one
    pub sound_name: Option<String>,

    /// the word that triggered this sound, if any
    pub trigger: Option<String>,

    /// Discord user who asked for the sound
    pub requested_by: UserId,

    /// voice channel the sound is played into
    pub channel_id: ChannelId,

    /// when the request entered the queue
    pub enqueued_at: SystemTime,
}

impl PlaybackRequest {
    pub fn new(path: impl Into<PathBuf>, requested_by: UserId, channel_id: ChannelId) -> Self {
        Self {
            path: path.into(),
            volume: 1.0,
            sound_name: None,
            trigger: None,
            requested_by,
            channel_id,
            enqueued_at: SystemTime::now(),
        }
    }
}

/// One recognized utterance from one participant.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    /// Discord user id of the speaker
    pub user_id: UserId,

    /// display name, when the transport gave us one
    pub display_name: Option<String>,

    /// the recognized text
    pub text: String,

    /// recognizer confidence in [0, 1]; 1.0 when the backend
    /// reports none
    pub confidence: f32,

    /// when the audio behind this transcript started
    pub timestamp: SystemTime,
}

/// Events delivered to the host through the engine's callback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VoiceChannelEvent {
    /// a queued sound finished playing naturally
    PlaybackFinished {
        guild_id: GuildId,
        request: PlaybackRequest,
    },
    /// a chunk of speech was recognized
    Transcript(TranscriptEvent),
    /// true when the last speaker goes quiet, false when anyone
    /// starts talking into a silent channel
    ChannelSilent(bool),
}

/// Which recognizer backs a connection.  Selected once at connection
/// start; nothing else in the crate knows which variant is active.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SpeechEngineKind {
    /// persistent incremental recognizer (Vosk); does its own phrase
    /// endpointing, so no chunking or VAD gating is applied
    Streaming { model_path: PathBuf },
    /// chunk-buffered batch recognizer (Whisper); capture buffers are
    /// drained, gated, resampled and transcribed on the worker pool
    Buffered {
        model_path: PathBuf,
        device: SttDevice,
        compute_type: SttComputeType,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SttDevice {
    Cpu,
    /// requires whisper-rs built with an accelerator feature
    Accelerator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SttComputeType {
    Float32,
    Float16,
}

/// Tunables consumed (not owned) by the audio core.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// wall-clock ceiling on a single playback
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub playback_timeout: Duration,

    /// whether speakers duck playback at all
    pub ducking_enabled: bool,

    /// ducked volume as a fraction of the normal volume
    pub ducking_level: f32,

    /// how long a duck/unduck ramp takes
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub ducking_transition: Duration,

    /// how often the drain task inspects capture buffers
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub drain_interval: Duration,

    /// how much audio a buffer must hold before it is drained
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub chunk_duration: Duration,

    /// tail kept between chunks so words aren't cut at boundaries
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub chunk_overlap: Duration,

    /// RMS floor below which a drained chunk is discarded
    pub vad_rms_threshold: f32,

    /// concurrent transcriptions allowed across all guilds
    pub worker_pool_size: usize,

    pub speech_engine: SpeechEngineKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        use crate::model::constants::*;
        Self {
            playback_timeout: DEFAULT_PLAYBACK_TIMEOUT,
            ducking_enabled: true,
            ducking_level: DEFAULT_DUCKING_LEVEL,
            ducking_transition: DEFAULT_DUCKING_TRANSITION,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            chunk_duration: DEFAULT_CHUNK_DURATION,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            vad_rms_threshold: DEFAULT_VAD_RMS_THRESHOLD,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            speech_engine: SpeechEngineKind::Buffered {
                model_path: PathBuf::from("models/ggml-base.en.bin"),
                device: SttDevice::Cpu,
                compute_type: SttComputeType::Float32,
            },
        }
    }
}
