use std::sync::{Arc, Mutex};

use songbird::driver::DecodeMode;
use songbird::ConnectionInfo;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::api_types::{EngineConfig, PlaybackRequest, VoiceChannelEvent};
use crate::audio::speaker::{Speaker, SpeechRequest};
use crate::capture::engine::{self, SpeechEngine, WorkerPool};
use crate::errors::AudioError;
use crate::model::speaking::{SharedTracker, SpeakingTracker};
use crate::model::types::{ChannelId, GuildId, UserId};
use crate::packet_handler::PacketHandler;
use crate::playback::queue::{DriverSink, PlaybackQueue, QueueCommand};

/// Everything the engine runs for one connected guild: the songbird
/// driver, the playback queue consumer, the speech capture engine, the
/// speaking tracker and the TTS speaker task.  Built on connect, torn
/// down as a unit on disconnect.
pub(crate) struct GuildVoice {
    guild_id: GuildId,
    driver: Arc<Mutex<songbird::Driver>>,
    engine: Arc<dyn SpeechEngine>,
    tracker: SharedTracker,
    tx_queue: UnboundedSender<QueueCommand>,
    tx_speech: UnboundedSender<SpeechRequest>,
    shutdown_token: CancellationToken,
    queue_task: Option<JoinHandle<()>>,
    speaker_task: Option<JoinHandle<()>>,
    // holds the driver's event registrations alive
    _packet_handler: Arc<PacketHandler>,
}

impl GuildVoice {
    pub(crate) async fn connect(
        guild_id: GuildId,
        connection_info: ConnectionInfo,
        config: &EngineConfig,
        tx_api: UnboundedSender<VoiceChannelEvent>,
        pool: WorkerPool,
        shutdown_token: CancellationToken,
    ) -> Result<Self, AudioError> {
        let shutdown_token = shutdown_token.child_token();

        let mut driver_config = songbird::Config::default();
        // have songbird decode inbound Opus to PCM for us
        driver_config.decode_mode = DecodeMode::Decode;
        let mut driver = songbird::Driver::new(driver_config);

        let tracker =
            SpeakingTracker::new(config.ducking_enabled, config.ducking_level, tx_api.clone());

        let engine =
            engine::create_engine(config, tx_api.clone(), pool, shutdown_token.clone())?;

        let packet_handler =
            PacketHandler::new(&mut driver, engine.clone(), tracker.clone()).await;

        // join the transport before the engine spawns its background
        // work; a failed join must leave no tasks behind
        if let Err(err) = driver.connect(connection_info).await {
            shutdown_token.cancel();
            return Err(err.into());
        }
        if let Err(err) = engine.start().await {
            driver.leave();
            shutdown_token.cancel();
            return Err(err);
        }
        info!("guild {}: connected to voice", guild_id);

        let driver = Arc::new(Mutex::new(driver));
        let (tx_queue, queue_task) = PlaybackQueue::monitor(
            guild_id,
            Arc::new(DriverSink::new(driver.clone())),
            tracker.clone(),
            tx_api,
            shutdown_token.clone(),
            config.playback_timeout,
            config.ducking_transition,
        );

        let (tx_speech, rx_speech) = mpsc::unbounded_channel();
        let speaker_task = Speaker::monitor(rx_speech, tx_queue.clone(), shutdown_token.clone());

        Ok(Self {
            guild_id,
            driver,
            engine,
            tracker,
            tx_queue,
            tx_speech,
            shutdown_token,
            queue_task: Some(queue_task),
            speaker_task: Some(speaker_task),
            _packet_handler: packet_handler,
        })
    }

    pub(crate) async fn disconnect(mut self) {
        self.driver.lock().unwrap().leave();
        self.shutdown_token.cancel();
        self.engine.stop().await;

        if let Some(task) = self.queue_task.take() {
            task.await.ok();
        }
        if let Some(task) = self.speaker_task.take() {
            task.await.ok();
        }
        debug!("guild {}: voice torn down", self.guild_id);
    }

    pub(crate) fn enqueue(&self, request: PlaybackRequest) {
        self.tx_queue.send(QueueCommand::Enqueue(request)).ok();
    }

    pub(crate) fn stop_current(&self) {
        self.tx_queue.send(QueueCommand::StopCurrent).ok();
    }

    pub(crate) fn clear_queue(&self) {
        self.tx_queue.send(QueueCommand::Clear).ok();
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        self.tx_queue.send(QueueCommand::SetVolume(volume)).ok();
    }

    pub(crate) fn set_ducking(&self, enabled: bool, level: f32) {
        self.tracker.lock().unwrap().set_ducking(enabled, level);
    }

    pub(crate) fn say(&self, text: String, requested_by: UserId, channel_id: ChannelId) {
        self.tx_speech
            .send(SpeechRequest {
                text,
                requested_by,
                channel_id,
            })
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    use crate::api::api_types::{SpeechEngineKind, SttComputeType, SttDevice};

    #[tokio::test]
    async fn test_unloadable_model_fails_before_any_connection() {
        let mut config = EngineConfig::default();
        config.speech_engine = SpeechEngineKind::Buffered {
            model_path: PathBuf::from("/does/not/exist/model.bin"),
            device: SttDevice::Cpu,
            compute_type: SttComputeType::Float32,
        };
        let (tx_api, _rx_api) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let connection_info = ConnectionInfo {
            channel_id: None,
            endpoint: String::new(),
            guild_id: songbird::id::GuildId::from(1u64),
            session_id: String::new(),
            token: String::new(),
            user_id: songbird::id::UserId::from(2u64),
        };

        let result = GuildVoice::connect(
            1,
            connection_info,
            &config,
            tx_api,
            Arc::new(Semaphore::new(2)),
            token.clone(),
        )
        .await;

        assert!(matches!(result, Err(AudioError::Recognition(_))));
        // the failed attempt leaves the caller's token untouched
        assert!(!token.is_cancelled());
    }
}
