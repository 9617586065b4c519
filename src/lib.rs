//! Soundboard-style audio playback and speech capture for Discord
//! voice channels, built on a standalone songbird driver.  The host
//! application keeps ownership of the main gateway connection and
//! hands this crate the voice credentials; everything from decoding a
//! sound file to ducking it under a speaking user to transcribing that
//! user happens here.

pub mod api {
    pub mod api_methods;
    pub mod api_types;
}
mod audio {
    pub(crate) mod espeakng;
    pub(crate) mod resample;
    pub(crate) mod speaker;
}
mod capture {
    pub(crate) mod arena;
    pub(crate) mod engine;
    pub(crate) mod resample;
    pub(crate) mod streaming;
    pub(crate) mod vad;
    pub(crate) mod whisper;
}
pub mod errors;
mod model {
    pub(crate) mod constants;
    pub(crate) mod speaking;
    pub(crate) mod types;
}
mod packet_handler;
mod playback {
    pub(crate) mod converter;
    pub(crate) mod ducking;
    pub(crate) mod queue;
    pub(crate) mod source;
}
mod voice;

pub use api::api_methods::AudioEngine;
pub use api::api_types::{
    EngineConfig, PlaybackRequest, SpeechEngineKind, SttComputeType, SttDevice, TranscriptEvent,
    VoiceChannelEvent,
};
pub use errors::AudioError;
