use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use songbird::events::context_data::{DisconnectData, SpeakingUpdateData, VoiceData};
use songbird::model::payload::{ClientDisconnect, Speaking};
use songbird::EventContext;
use tracing::{debug, warn};

use crate::capture::engine::SpeechEngine;
use crate::errors::AudioError;
use crate::model::speaking::SharedTracker;
use crate::model::types::{Ssrc, UserId};

/// Bridges songbird's driver events into the capture engine and the
/// speaking tracker.  Decoded packets arrive keyed by SSRC, not user
/// id, so this keeps the SSRC assignment map and translates before
/// routing anything onward.  All callbacks run on the driver's event
/// context and must stay cheap.
pub(crate) struct PacketHandler {
    ssrc_to_user_id: RwLock<HashMap<Ssrc, UserId>>,
    engine: Arc<dyn SpeechEngine>,
    tracker: SharedTracker,
}

impl PacketHandler {
    pub(crate) async fn new(
        driver: &mut songbird::Driver,
        engine: Arc<dyn SpeechEngine>,
        tracker: SharedTracker,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            ssrc_to_user_id: RwLock::new(HashMap::new()),
            engine,
            tracker,
        });
        register_events(&handler, driver).await;
        handler
    }

    /// Users are assigned an SSRC when they start transmitting; note
    /// the mapping so later packets can be attributed.
    fn on_ssrc_assigned(&self, ssrc: Ssrc, user_id: UserId) {
        self.ssrc_to_user_id.write().unwrap().insert(ssrc, user_id);
    }

    fn on_start_talking(&self, ssrc: Ssrc) {
        if let Some(user_id) = self.user_id_from_ssrc(ssrc) {
            self.tracker.lock().unwrap().on_speaking_start(user_id);
            self.engine.on_speaking(user_id, true);
        }
    }

    /// "Stopped talking" here means the driver has seen 100ms of
    /// continuous silence from this SSRC.
    fn on_stop_talking(&self, ssrc: Ssrc) {
        if let Some(user_id) = self.user_id_from_ssrc(ssrc) {
            self.tracker.lock().unwrap().on_speaking_stop(user_id);
            self.engine.on_speaking(user_id, false);
        }
    }

    fn on_audio(&self, ssrc: Ssrc, audio: &[i16]) {
        if let Some(user_id) = self.user_id_from_ssrc(ssrc) {
            self.engine.on_packet(user_id, audio);
        }
    }

    fn on_user_leave(&self, user_id: UserId) {
        // leave the SSRC mapping in place; a reused SSRC will simply
        // overwrite it, and stray late events for this user are
        // harmless
        self.tracker.lock().unwrap().on_speaking_stop(user_id);
        self.engine.on_user_gone(user_id);
    }

    fn on_driver_disconnect(&self) {
        warn!("{}", AudioError::TransportDisconnected);
    }

    fn user_id_from_ssrc(&self, ssrc: Ssrc) -> Option<UserId> {
        self.ssrc_to_user_id.read().unwrap().get(&ssrc).copied()
    }
}

struct DriverEventHandler<T>
where
    T: Fn(&songbird::EventContext, &Arc<PacketHandler>) + Send + Sync,
{
    handler: T,
    packet_handler: Arc<PacketHandler>,
}

#[async_trait]
impl<T> songbird::EventHandler for DriverEventHandler<T>
where
    T: Fn(&songbird::EventContext, &Arc<PacketHandler>) + Send + Sync,
{
    async fn act(&self, ctx: &songbird::EventContext<'_>) -> Option<songbird::Event> {
        (self.handler)(ctx, &self.packet_handler);
        None
    }
}

pub(crate) async fn register_events(handler: &Arc<PacketHandler>, driver: &mut songbird::Driver) {
    driver.add_global_event(
        songbird::CoreEvent::SpeakingStateUpdate.into(),
        DriverEventHandler {
            packet_handler: handler.clone(),
            handler: |ctx, packet_handler| {
                if let EventContext::SpeakingStateUpdate(Speaking {
                    speaking,
                    ssrc,
                    user_id,
                    ..
                }) = ctx
                {
                    // only microphone audio matters here; screen-share
                    // streams carry their own speaking flag we ignore
                    if speaking.microphone() {
                        if let Some(user_id) = user_id {
                            packet_handler.on_ssrc_assigned(*ssrc, user_id.0);
                        } else {
                            debug!("speaking state update without a user id");
                        }
                    }
                }
            },
        },
    );
    driver.add_global_event(
        songbird::CoreEvent::SpeakingUpdate.into(),
        DriverEventHandler {
            packet_handler: handler.clone(),
            handler: |ctx, packet_handler| {
                if let EventContext::SpeakingUpdate(SpeakingUpdateData { ssrc, speaking, .. }) = ctx
                {
                    if *speaking {
                        packet_handler.on_start_talking(*ssrc);
                    } else {
                        packet_handler.on_stop_talking(*ssrc);
                    }
                }
            },
        },
    );
    driver.add_global_event(
        songbird::CoreEvent::VoicePacket.into(),
        DriverEventHandler {
            packet_handler: handler.clone(),
            handler: |ctx, packet_handler| {
                if let EventContext::VoicePacket(VoiceData { audio, packet, .. }) = ctx {
                    // fires for every received packet, with the
                    // decoded stereo 48khz samples
                    if let Some(audio) = audio {
                        packet_handler.on_audio(packet.ssrc, audio);
                    }
                }
            },
        },
    );
    driver.add_global_event(
        songbird::CoreEvent::ClientDisconnect.into(),
        DriverEventHandler {
            packet_handler: handler.clone(),
            handler: |ctx, packet_handler| {
                if let EventContext::ClientDisconnect(ClientDisconnect { user_id, .. }) = ctx {
                    packet_handler.on_user_leave(user_id.0);
                }
            },
        },
    );
    driver.add_global_event(
        songbird::CoreEvent::DriverDisconnect.into(),
        DriverEventHandler {
            packet_handler: handler.clone(),
            handler: |ctx, packet_handler| {
                if let EventContext::DriverDisconnect(DisconnectData { .. }) = ctx {
                    packet_handler.on_driver_disconnect();
                }
            },
        },
    );
}
