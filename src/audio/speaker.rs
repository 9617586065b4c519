use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::api_types::PlaybackRequest;
use crate::audio::espeakng;
use crate::audio::resample;
use crate::model::constants::{DISCORD_SAMPLES_PER_SECOND, ESPEAK_SAMPLES_PER_SECOND};
use crate::model::types::{AudioSample, ChannelId, UserId};
use crate::playback::queue::QueueCommand;

/// Something the engine should say out loud in a voice channel.
pub struct SpeechRequest {
    pub text: String,
    pub requested_by: UserId,
    pub channel_id: ChannelId,
}

/// Drives text-to-speech for one guild.  Synthesis itself is
/// serialized process-wide inside the espeak layer; the finished audio
/// is handed to the playback queue as pre-decoded PCM, so
/// announcements wait their turn behind queued sounds like anything
/// else.
pub(crate) struct Speaker;

impl Speaker {
    pub fn monitor(
        mut rx: UnboundedReceiver<SpeechRequest>,
        tx_queue: UnboundedSender<QueueCommand>,
        shutdown_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_token.cancelled() => {
                        debug!("speaker task shut down");
                        return;
                    }
                    request = rx.recv() => {
                        let Some(request) = request else { return };
                        Self::say(&tx_queue, request).await;
                    }
                }
            }
        })
    }

    async fn say(tx_queue: &UnboundedSender<QueueCommand>, request: SpeechRequest) {
        info!("synthesizing {} characters of speech", request.text.len());

        let mono_22k = espeakng::speak(&request.text).await;
        if mono_22k.is_empty() {
            return;
        }

        let mono_48k = resample::resample(
            ESPEAK_SAMPLES_PER_SECOND,
            DISCORD_SAMPLES_PER_SECOND,
            &mono_22k,
        );
        let stereo = widen_to_stereo(&mono_48k);

        let mut playback =
            PlaybackRequest::new("tts", request.requested_by, request.channel_id);
        playback.sound_name = Some("tts".to_string());

        tx_queue
            .send(QueueCommand::EnqueueDecoded(playback, stereo))
            .ok();
    }
}

fn widen_to_stereo(mono: &[AudioSample]) -> Vec<AudioSample> {
    let mut stereo = Vec::with_capacity(mono.len() * 2);
    for sample in mono {
        stereo.push(*sample);
        stereo.push(*sample);
    }
    stereo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widen_duplicates_each_sample() {
        let stereo = widen_to_stereo(&[1, -2, 3]);
        assert_eq!(vec![1, 1, -2, -2, 3, 3], stereo);
    }
}
