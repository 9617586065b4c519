use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vosk::{DecodingState, Model, Recognizer};

use crate::api::api_types::{TranscriptEvent, VoiceChannelEvent};
use crate::capture::engine::SpeechEngine;
use crate::capture::resample;
use crate::errors::AudioError;
use crate::model::constants::STT_SAMPLES_PER_SECOND;
use crate::model::types::{AudioSample, UserId};

/// What became of a recognizer after one blocking decode step; the
/// recognizer rides along so it can return to the per-user map.
enum RecognizerStep {
    Running(Recognizer),
    Finalized(Recognizer, String),
    Failed,
}

enum StreamMessage {
    Audio(UserId, Vec<AudioSample>),
    /// the user went quiet; finalize whatever their recognizer holds
    Flush(UserId),
    Gone(UserId),
}

/// Low-latency variant: one persistent Vosk recognizer per speaking
/// user, fed a packet at a time on a dedicated worker task.  Vosk does
/// its own phrase endpointing, so there is no chunking and no VAD gate
/// here; completed phrases surface as soon as the recognizer finalizes
/// them.
pub(crate) struct StreamingEngine {
    tx_worker: UnboundedSender<StreamMessage>,
    // handed to the worker task on start()
    pending: Mutex<Option<(Model, UnboundedReceiver<StreamMessage>)>>,
    tx_api: UnboundedSender<VoiceChannelEvent>,
    shutdown_token: CancellationToken,
    listening: AtomicBool,
    worker_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingEngine {
    pub fn new(
        model_path: &Path,
        tx_api: UnboundedSender<VoiceChannelEvent>,
        shutdown_token: CancellationToken,
    ) -> Result<Self, AudioError> {
        let model = Model::new(model_path.to_string_lossy()).ok_or_else(|| {
            AudioError::Recognition(format!(
                "failed to load vosk model from {}",
                model_path.display()
            ))
        })?;
        info!("loaded vosk model {}", model_path.display());

        let (tx_worker, rx_worker) = mpsc::unbounded_channel();
        Ok(Self {
            tx_worker,
            pending: Mutex::new(Some((model, rx_worker))),
            tx_api,
            shutdown_token: shutdown_token.child_token(),
            listening: AtomicBool::new(false),
            worker_task: Mutex::new(None),
        })
    }

    async fn worker(
        model: Model,
        mut rx: UnboundedReceiver<StreamMessage>,
        tx_api: UnboundedSender<VoiceChannelEvent>,
        shutdown_token: CancellationToken,
    ) {
        let mut recognizers: HashMap<UserId, Recognizer> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    return;
                }
                message = rx.recv() => {
                    let Some(message) = message else { return };
                    match message {
                        StreamMessage::Audio(user_id, pcm) => {
                            let mono = resample::to_stt_i16(&pcm);
                            let mut recognizer = match recognizers.remove(&user_id) {
                                Some(recognizer) => recognizer,
                                None => match Recognizer::new(
                                    &model,
                                    STT_SAMPLES_PER_SECOND as f32,
                                ) {
                                    Some(recognizer) => recognizer,
                                    None => {
                                        warn!(
                                            "user {}: {}",
                                            user_id,
                                            AudioError::Recognition(
                                                "could not create recognizer".into()
                                            )
                                        );
                                        continue;
                                    }
                                },
                            };
                            // vosk decoding is CPU-bound; keep it off
                            // the runtime workers, especially on
                            // finalization of a long phrase
                            let step = tokio::task::spawn_blocking(move || {
                                match recognizer.accept_waveform(&mono) {
                                    DecodingState::Finalized => {
                                        let text = recognizer
                                            .result()
                                            .single()
                                            .map(|r| r.text.to_string())
                                            .unwrap_or_default();
                                        RecognizerStep::Finalized(recognizer, text)
                                    }
                                    DecodingState::Failed => RecognizerStep::Failed,
                                    DecodingState::Running => {
                                        RecognizerStep::Running(recognizer)
                                    }
                                }
                            })
                            .await;
                            match step {
                                Ok(RecognizerStep::Running(recognizer)) => {
                                    recognizers.insert(user_id, recognizer);
                                }
                                Ok(RecognizerStep::Finalized(recognizer, text)) => {
                                    publish(&tx_api, user_id, text);
                                    recognizers.insert(user_id, recognizer);
                                }
                                Ok(RecognizerStep::Failed) => {
                                    warn!(
                                        "user {}: {}",
                                        user_id,
                                        AudioError::Recognition("decoder failure".into())
                                    );
                                }
                                Err(join_err) => {
                                    warn!(
                                        "user {}: {}",
                                        user_id,
                                        AudioError::Recognition(join_err.to_string())
                                    );
                                }
                            }
                        }
                        StreamMessage::Flush(user_id) => {
                            if let Some(mut recognizer) = recognizers.remove(&user_id) {
                                let result = tokio::task::spawn_blocking(move || {
                                    recognizer
                                        .final_result()
                                        .single()
                                        .map(|r| r.text.to_string())
                                        .unwrap_or_default()
                                })
                                .await;
                                match result {
                                    Ok(text) => publish(&tx_api, user_id, text),
                                    Err(join_err) => warn!(
                                        "user {}: {}",
                                        user_id,
                                        AudioError::Recognition(join_err.to_string())
                                    ),
                                }
                            }
                        }
                        StreamMessage::Gone(user_id) => {
                            recognizers.remove(&user_id);
                        }
                    }
                }
            }
        }
    }
}

/// Results are delivered exactly once per finalized phrase; empty
/// phrases (endpointed silence) produce no event.
fn publish(tx_api: &UnboundedSender<VoiceChannelEvent>, user_id: UserId, text: String) {
    if text.trim().is_empty() {
        return;
    }
    tx_api
        .send(VoiceChannelEvent::Transcript(TranscriptEvent {
            user_id,
            display_name: None,
            text,
            // vosk reports no utterance confidence
            confidence: 1.0,
            timestamp: SystemTime::now(),
        }))
        .ok();
}

#[async_trait]
impl SpeechEngine for StreamingEngine {
    async fn start(&self) -> Result<(), AudioError> {
        let Some((model, rx_worker)) = self.pending.lock().unwrap().take() else {
            return Err(AudioError::Recognition(
                "streaming engine already started".into(),
            ));
        };
        let task = tokio::spawn(Self::worker(
            model,
            rx_worker,
            self.tx_api.clone(),
            self.shutdown_token.clone(),
        ));
        *self.worker_task.lock().unwrap() = Some(task);
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.listening.store(false, Ordering::SeqCst);
        self.shutdown_token.cancel();
        let task = self.worker_task.lock().unwrap().take();
        if let Some(task) = task {
            task.await.ok();
        }
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn on_packet(&self, user_id: UserId, pcm: &[AudioSample]) {
        if self.is_listening() {
            self.tx_worker
                .send(StreamMessage::Audio(user_id, pcm.to_vec()))
                .ok();
        }
    }

    fn on_speaking(&self, user_id: UserId, speaking: bool) {
        if !speaking && self.is_listening() {
            self.tx_worker.send(StreamMessage::Flush(user_id)).ok();
        }
    }

    fn on_user_gone(&self, user_id: UserId) {
        self.tx_worker.send(StreamMessage::Gone(user_id)).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[tokio::test]
    async fn test_empty_phrases_are_not_published() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        publish(&tx, 1, "   ".to_string());
        assert_eq!(Err(TryRecvError::Empty), rx.try_recv());

        publish(&tx, 1, "hello".to_string());
        match rx.try_recv().unwrap() {
            VoiceChannelEvent::Transcript(event) => {
                assert_eq!(1, event.user_id);
                assert_eq!("hello", event.text);
                assert_eq!(1.0, event.confidence);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
