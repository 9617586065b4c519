use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong between a playback request and the
/// speaker, or between the microphone and a transcript.  None of these
/// are allowed to take down a guild's consumer or drain loop; each is
/// caught at the smallest scope and converted into skip-and-continue.
#[derive(Debug, Error)]
pub enum AudioError {
    /// bad or unsupported audio input; the request is skipped
    #[error("could not decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// the external transcoder is not installed
    #[error("transcoder `{tool}` is not installed")]
    MissingTool { tool: &'static str },

    /// the transport never reported completion within the ceiling
    #[error("playback timed out after {0:?}")]
    PlaybackTimeout(std::time::Duration),

    /// the guild's voice connection dropped mid-playback, or was
    /// never established
    #[error("voice transport disconnected")]
    TransportDisconnected,

    /// joining the voice channel failed outright
    #[error("could not join voice channel: {0}")]
    Connect(#[from] songbird::error::ConnectionError),

    /// engine-specific failure on a single chunk
    #[error("recognition failed: {0}")]
    Recognition(String),

    /// malformed inbound packet
    #[error("corrupt inbound packet: {0}")]
    BufferCorruption(String),
}

impl AudioError {
    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
