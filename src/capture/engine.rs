use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::api::api_types::{EngineConfig, SpeechEngineKind, VoiceChannelEvent};
use crate::capture::streaming::StreamingEngine;
use crate::capture::whisper::BufferedEngine;
use crate::errors::AudioError;
use crate::model::types::{AudioSample, UserId};

/// Bounded pool of transcription workers, shared across all guilds so
/// one guild's load cannot starve another's.  Permits bound the number
/// of concurrent blocking recognition calls.
pub(crate) type WorkerPool = Arc<Semaphore>;

/// The recognition capability behind one interface.  Exactly one
/// implementation is selected per connection by [`create_engine`];
/// nothing outside the factory knows which variant is active.
///
/// Implementations must never run recognition on the execution context
/// that delivers inbound packets — `on_packet` only hands audio off.
#[async_trait]
pub(crate) trait SpeechEngine: Send + Sync {
    /// Begin listening; spawns whatever background tasks the variant
    /// needs.
    async fn start(&self) -> Result<(), AudioError>;

    /// Stop listening and tear down background work.  In-flight
    /// transcriptions that cannot be cancelled are discarded when
    /// their results arrive late.
    async fn stop(&self);

    fn is_listening(&self) -> bool;

    /// A decoded inbound packet for one participant.  Called on the
    /// transport's packet context; must return in O(lock contention).
    fn on_packet(&self, user_id: UserId, pcm: &[AudioSample]);

    /// Speaking-state edge from the transport.  Variants may use the
    /// falling edge to finalize an utterance; the default ignores it.
    fn on_speaking(&self, _user_id: UserId, _speaking: bool) {}

    /// The participant left the channel; drop their state.
    fn on_user_gone(&self, _user_id: UserId) {}
}

/// Builds the configured engine variant.  This is the single point of
/// variant selection, made once at connection start.
pub(crate) fn create_engine(
    config: &EngineConfig,
    tx_api: UnboundedSender<VoiceChannelEvent>,
    pool: WorkerPool,
    shutdown_token: CancellationToken,
) -> Result<Arc<dyn SpeechEngine>, AudioError> {
    match &config.speech_engine {
        SpeechEngineKind::Streaming { model_path } => Ok(Arc::new(StreamingEngine::new(
            model_path,
            tx_api,
            shutdown_token,
        )?)),
        SpeechEngineKind::Buffered {
            model_path,
            device,
            compute_type,
        } => Ok(Arc::new(BufferedEngine::new(
            model_path,
            *device,
            *compute_type,
            config,
            tx_api,
            pool,
            shutdown_token,
        )?)),
    }
}
