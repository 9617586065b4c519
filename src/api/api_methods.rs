use std::collections::HashMap;
use std::sync::Arc;

use songbird::id::{ChannelId, GuildId, UserId};
use songbird::ConnectionInfo;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::api_types::{EngineConfig, PlaybackRequest, VoiceChannelEvent};
use crate::capture::engine::WorkerPool;
use crate::errors::AudioError;
use crate::model::types;
use crate::voice::GuildVoice;

/// The crate's front door.  Owns one [`GuildVoice`] per connected
/// guild, a transcription worker pool shared across all of them, and
/// the task that fans engine events out to the host's callback.
///
/// The host drives voice-gateway negotiation itself (this crate never
/// touches the main Discord gateway) and hands the resulting
/// credentials to [`AudioEngine::connect`].
pub struct AudioEngine {
    config: EngineConfig,
    guilds: Mutex<HashMap<types::GuildId, GuildVoice>>,
    pool: WorkerPool,
    tx_api: UnboundedSender<VoiceChannelEvent>,
    api_task: Option<JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl AudioEngine {
    pub fn new(
        config: EngineConfig,
        event_callback: Arc<dyn Fn(VoiceChannelEvent) + Send + Sync>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let pool: WorkerPool = Arc::new(Semaphore::new(config.worker_pool_size));
        let api_task = Some(tokio::spawn(Self::start_api_task(rx_api, event_callback)));

        Self {
            config,
            guilds: Mutex::new(HashMap::new()),
            pool,
            tx_api,
            api_task,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Joins a voice channel with credentials the host obtained from
    /// its gateway session.  An existing connection for the guild is
    /// torn down first.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        &self,
        guild_id: types::GuildId,
        channel_id: types::ChannelId,
        endpoint: &str,
        session_id: &str,
        user_id: types::UserId,
        voice_token: &str,
    ) -> Result<(), AudioError> {
        let connection_info = ConnectionInfo {
            channel_id: Some(ChannelId::from(channel_id)),
            endpoint: endpoint.to_string(),
            guild_id: GuildId::from(guild_id),
            session_id: session_id.to_string(),
            token: voice_token.to_string(),
            user_id: UserId::from(user_id),
        };

        let voice = GuildVoice::connect(
            guild_id,
            connection_info,
            &self.config,
            self.tx_api.clone(),
            self.pool.clone(),
            self.shutdown_token.clone(),
        )
        .await?;

        if let Some(previous) = self.guilds.lock().await.insert(guild_id, voice) {
            info!("guild {}: replacing existing voice connection", guild_id);
            previous.disconnect().await;
        }
        Ok(())
    }

    pub async fn disconnect(&self, guild_id: types::GuildId) {
        let voice = self.guilds.lock().await.remove(&guild_id);
        if let Some(voice) = voice {
            voice.disconnect().await;
        }
    }

    /// Queues a sound for playback.  Requests play strictly in the
    /// order they arrive; a sound already playing is never interrupted
    /// by a new request.
    pub async fn play(
        &self,
        guild_id: types::GuildId,
        request: PlaybackRequest,
    ) -> Result<(), AudioError> {
        self.with_guild(guild_id, |voice| voice.enqueue(request))
            .await
    }

    /// Stops whatever is currently playing; queued requests are kept.
    pub async fn stop_current(&self, guild_id: types::GuildId) -> Result<(), AudioError> {
        self.with_guild(guild_id, |voice| voice.stop_current()).await
    }

    /// Drops all queued requests without touching the one playing now.
    pub async fn clear_queue(&self, guild_id: types::GuildId) -> Result<(), AudioError> {
        self.with_guild(guild_id, |voice| voice.clear_queue()).await
    }

    /// Sets the guild-wide volume multiplier, applied immediately to
    /// the current sound and to everything queued behind it.
    pub async fn set_guild_volume(
        &self,
        guild_id: types::GuildId,
        volume: f32,
    ) -> Result<(), AudioError> {
        self.with_guild(guild_id, |voice| voice.set_volume(volume))
            .await
    }

    pub async fn set_ducking(
        &self,
        guild_id: types::GuildId,
        enabled: bool,
        level: f32,
    ) -> Result<(), AudioError> {
        self.with_guild(guild_id, |voice| voice.set_ducking(enabled, level))
            .await
    }

    /// Speaks `text` into the guild's channel.  The synthesized audio
    /// goes through the playback queue like any other sound.
    pub async fn say(
        &self,
        guild_id: types::GuildId,
        text: String,
        requested_by: types::UserId,
        channel_id: types::ChannelId,
    ) -> Result<(), AudioError> {
        self.with_guild(guild_id, |voice| voice.say(text, requested_by, channel_id))
            .await
    }

    /// Disconnects every guild and stops the event fan-out task.
    pub async fn shutdown(&mut self) {
        let guilds: Vec<GuildVoice> = self.guilds.lock().await.drain().map(|(_, v)| v).collect();
        for voice in guilds {
            voice.disconnect().await;
        }
        self.shutdown_token.cancel();

        if let Some(task) = self.api_task.take() {
            task.abort();
            task.await.ok();
        }
    }

    async fn with_guild(
        &self,
        guild_id: types::GuildId,
        f: impl FnOnce(&GuildVoice),
    ) -> Result<(), AudioError> {
        match self.guilds.lock().await.get(&guild_id) {
            Some(voice) => {
                f(voice);
                Ok(())
            }
            None => Err(AudioError::TransportDisconnected),
        }
    }

    async fn start_api_task(
        mut rx_api: mpsc::UnboundedReceiver<VoiceChannelEvent>,
        event_callback: Arc<dyn Fn(VoiceChannelEvent) + Send + Sync>,
    ) {
        while let Some(event) = rx_api.recv().await {
            event_callback(event);
        }
    }
}
