use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::api_types::{PlaybackRequest, VoiceChannelEvent};
use crate::errors::AudioError;
use crate::model::constants::DECODE_CACHE_MAX_ENTRIES;
use crate::model::speaking::SharedTracker;
use crate::model::types::{AudioSample, GuildId};
use crate::playback::converter;
use crate::playback::ducking::Ducker;
use crate::playback::source::{DuckHandle, PcmSource};

/// Where finished sources go.  The real implementation hands them to
/// the songbird driver; tests substitute a sink that drains frames
/// directly.
pub(crate) trait AudioSink: Send + Sync {
    fn play(&self, source: PcmSource) -> Box<dyn PlayingTrack>;
}

pub(crate) trait PlayingTrack: Send {
    fn stop(&mut self);
}

pub(crate) struct DriverSink {
    driver: Arc<Mutex<songbird::Driver>>,
}

impl DriverSink {
    pub fn new(driver: Arc<Mutex<songbird::Driver>>) -> Self {
        Self { driver }
    }
}

impl AudioSink for DriverSink {
    fn play(&self, source: PcmSource) -> Box<dyn PlayingTrack> {
        let handle = self
            .driver
            .lock()
            .unwrap()
            .play_only_source(source.into_input());
        Box::new(DriverTrack(handle))
    }
}

struct DriverTrack(songbird::tracks::TrackHandle);

impl PlayingTrack for DriverTrack {
    fn stop(&mut self) {
        self.0.stop().ok();
    }
}

pub(crate) enum QueueCommand {
    /// play a sound file, decoding it first
    Enqueue(PlaybackRequest),
    /// play already-decoded PCM (the TTS path)
    EnqueueDecoded(PlaybackRequest, Vec<AudioSample>),
    StopCurrent,
    Clear,
    SetVolume(f32),
}

struct QueueItem {
    request: PlaybackRequest,
    decoded: Option<Vec<AudioSample>>,
}

/// One ordered queue and one consumer loop per guild.  The loop is the
/// only mutator of now-playing state: it dequeues strictly FIFO,
/// decodes, registers the source with the speaking tracker, then waits
/// for completion bounded by the timeout ceiling.  Per-request errors
/// are logged and skipped; they never terminate the loop.
pub(crate) struct PlaybackQueue {
    guild_id: GuildId,
    sink: Arc<dyn AudioSink>,
    tracker: SharedTracker,
    tx_api: UnboundedSender<VoiceChannelEvent>,
    shutdown_token: CancellationToken,
    playback_timeout: Duration,
    ducking_transition: Duration,
    guild_volume: f32,
    cache: HashMap<PathBuf, Arc<Vec<AudioSample>>>,
    missing_tool_reported: bool,
}

impl PlaybackQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn monitor(
        guild_id: GuildId,
        sink: Arc<dyn AudioSink>,
        tracker: SharedTracker,
        tx_api: UnboundedSender<VoiceChannelEvent>,
        shutdown_token: CancellationToken,
        playback_timeout: Duration,
        ducking_transition: Duration,
    ) -> (UnboundedSender<QueueCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            guild_id,
            sink,
            tracker,
            tx_api,
            shutdown_token,
            playback_timeout,
            ducking_transition,
            guild_volume: 1.0,
            cache: HashMap::new(),
            missing_tool_reported: false,
        };
        let task = tokio::spawn(queue.loop_forever(rx));
        (tx, task)
    }

    async fn loop_forever(mut self, mut rx: UnboundedReceiver<QueueCommand>) {
        let mut pending: VecDeque<QueueItem> = VecDeque::new();

        // now-playing state; all four are Some while a source is active
        let mut current_request: Option<PlaybackRequest> = None;
        let mut current_track: Option<Box<dyn PlayingTrack>> = None;
        let mut current_ducker: Option<DuckHandle> = None;
        let mut done_rx: Option<oneshot::Receiver<()>> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            if done_rx.is_none() {
                if let Some(item) = pending.pop_front() {
                    match self.start_playback(item).await {
                        Some((request, track, ducker, rx_done)) => {
                            deadline = Some(Instant::now() + self.playback_timeout);
                            current_request = Some(request);
                            current_track = Some(track);
                            current_ducker = Some(ducker);
                            done_rx = Some(rx_done);
                        }
                        None => continue, // skipped; try the next request
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    if let Some(mut track) = current_track.take() {
                        track.stop();
                    }
                    self.tracker.lock().unwrap().set_active_source(None);
                    debug!("guild {}: playback queue shut down", self.guild_id);
                    return;
                }
                command = rx.recv() => {
                    let Some(command) = command else { return };
                    match command {
                        QueueCommand::Enqueue(request) => {
                            pending.push_back(QueueItem { request, decoded: None });
                        }
                        QueueCommand::EnqueueDecoded(request, pcm) => {
                            pending.push_back(QueueItem { request, decoded: Some(pcm) });
                        }
                        QueueCommand::StopCurrent => {
                            if let Some(mut track) = current_track.take() {
                                track.stop();
                            }
                            self.tracker.lock().unwrap().set_active_source(None);
                            current_request = None;
                            current_ducker = None;
                            done_rx = None;
                            deadline = None;
                        }
                        QueueCommand::Clear => {
                            // never touches the currently-playing source
                            pending.clear();
                        }
                        QueueCommand::SetVolume(volume) => {
                            self.guild_volume = volume;
                            if let (Some(ducker), Some(request)) =
                                (&current_ducker, &current_request)
                            {
                                ducker
                                    .lock()
                                    .unwrap()
                                    .set_volume(volume * request.volume);
                            }
                        }
                    }
                }
                result = async { done_rx.as_mut().unwrap().await }, if done_rx.is_some() => {
                    self.tracker.lock().unwrap().set_active_source(None);
                    current_track = None;
                    current_ducker = None;
                    done_rx = None;
                    deadline = None;
                    let request = current_request.take();
                    match (result, request) {
                        (Ok(()), Some(request)) => {
                            self.tx_api
                                .send(VoiceChannelEvent::PlaybackFinished {
                                    guild_id: self.guild_id,
                                    request,
                                })
                                .ok();
                        }
                        (Err(_), _) => {
                            // source dropped without finishing; the
                            // transport tore the track down under us,
                            // so pending requests have nowhere to go
                            debug!(
                                "guild {}: {}",
                                self.guild_id,
                                AudioError::TransportDisconnected
                            );
                            pending.clear();
                        }
                        _ => {}
                    }
                }
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() => {
                    warn!(
                        "guild {}: {}",
                        self.guild_id,
                        AudioError::PlaybackTimeout(self.playback_timeout)
                    );
                    if let Some(mut track) = current_track.take() {
                        track.stop();
                    }
                    self.tracker.lock().unwrap().set_active_source(None);
                    current_request = None;
                    current_ducker = None;
                    done_rx = None;
                    deadline = None;
                }
            }
        }
    }

    /// Decode (or pull from cache) and hand the source to the sink.
    /// Returns None when the request had to be skipped.
    async fn start_playback(
        &mut self,
        item: QueueItem,
    ) -> Option<(
        PlaybackRequest,
        Box<dyn PlayingTrack>,
        DuckHandle,
        oneshot::Receiver<()>,
    )> {
        let QueueItem { request, decoded } = item;

        let pcm = match decoded {
            Some(pcm) => pcm,
            None => match self.decode(&request.path).await {
                Ok(pcm) => pcm.to_vec(),
                Err(err) => {
                    self.report_decode_failure(&err);
                    return None;
                }
            },
        };

        let ducking_level = self.tracker.lock().unwrap().ducking_level();
        let ducker: DuckHandle = Arc::new(Mutex::new(Ducker::new(
            self.guild_volume * request.volume,
            ducking_level,
            self.ducking_transition,
        )));

        let (source, rx_done) = PcmSource::new(pcm, ducker.clone());

        // registering ducks the new source right away if someone is
        // already talking
        self.tracker
            .lock()
            .unwrap()
            .set_active_source(Some(ducker.clone()));

        info!(
            "guild {}: playing {} for user {}",
            self.guild_id,
            request.path.display(),
            request.requested_by
        );
        let track = self.sink.play(source);
        Some((request, track, ducker, rx_done))
    }

    async fn decode(&mut self, path: &std::path::Path) -> Result<Arc<Vec<AudioSample>>, AudioError> {
        if let Some(pcm) = self.cache.get(path) {
            return Ok(pcm.clone());
        }

        let owned = path.to_path_buf();
        let (pcm, duration_ms) = tokio::task::spawn_blocking(move || converter::convert(&owned))
            .await
            .map_err(|e| AudioError::decode(path, e.to_string()))??;
        debug!("decoded {} ({} ms)", path.display(), duration_ms);

        if self.cache.len() >= DECODE_CACHE_MAX_ENTRIES {
            self.cache.clear();
        }
        let pcm = Arc::new(pcm);
        self.cache.insert(path.to_path_buf(), pcm.clone());
        Ok(pcm)
    }

    fn report_decode_failure(&mut self, err: &AudioError) {
        match err {
            AudioError::MissingTool { .. } => {
                // surface this prominently once, then stop shouting
                if self.missing_tool_reported {
                    debug!("guild {}: {}", self.guild_id, err);
                } else {
                    warn!("guild {}: {}", self.guild_id, err);
                    self.missing_tool_reported = true;
                }
            }
            _ => warn!("guild {}: skipping request: {}", self.guild_id, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::model::constants::STEREO_FRAME_SIZE;
    use crate::model::speaking::SpeakingTracker;

    /// Drains frames from sources on a background task, as fast as
    /// the scheduler allows.
    struct TestSink;

    struct TestTrack(Arc<AtomicBool>);

    impl PlayingTrack for TestTrack {
        fn stop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl AudioSink for TestSink {
        fn play(&self, mut source: PcmSource) -> Box<dyn PlayingTrack> {
            let stopped = Arc::new(AtomicBool::new(false));
            let stopped_clone = stopped.clone();
            tokio::spawn(async move {
                while !stopped_clone.load(Ordering::SeqCst) {
                    if source.next_frame().is_none() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            });
            Box::new(TestTrack(stopped))
        }
    }

    fn request(name: &str) -> PlaybackRequest {
        let mut request = PlaybackRequest::new(name, 1, 2);
        request.sound_name = Some(name.to_string());
        request
    }

    fn spawn_queue() -> (
        UnboundedSender<QueueCommand>,
        mpsc::UnboundedReceiver<VoiceChannelEvent>,
        CancellationToken,
    ) {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let tracker = SpeakingTracker::new(true, 0.5, tx_api.clone());
        let token = CancellationToken::new();
        let (tx, _) = PlaybackQueue::monitor(
            42,
            Arc::new(TestSink),
            tracker,
            tx_api,
            token.clone(),
            Duration::from_secs(5),
            Duration::from_millis(100),
        );
        (tx, rx_api, token)
    }

    fn decoded(frames: usize) -> Vec<AudioSample> {
        vec![1000; STEREO_FRAME_SIZE * frames]
    }

    #[tokio::test]
    async fn test_requests_play_in_enqueue_order() {
        let (tx, mut rx_api, token) = spawn_queue();

        for name in ["a", "b", "c"] {
            tx.send(QueueCommand::EnqueueDecoded(request(name), decoded(2)))
                .unwrap();
        }

        for expected in ["a", "b", "c"] {
            let event = tokio::time::timeout(Duration::from_secs(2), rx_api.recv())
                .await
                .expect("timed out waiting for playback")
                .unwrap();
            match event {
                VoiceChannelEvent::PlaybackFinished { guild_id, request } => {
                    assert_eq!(42, guild_id);
                    assert_eq!(Some(expected.to_string()), request.sound_name);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        token.cancel();
    }

    #[tokio::test]
    async fn test_clear_drops_pending_but_not_current() {
        let (tx, mut rx_api, token) = spawn_queue();

        // a long sound, then two victims
        tx.send(QueueCommand::EnqueueDecoded(request("long"), decoded(50)))
            .unwrap();
        tx.send(QueueCommand::EnqueueDecoded(request("gone1"), decoded(2)))
            .unwrap();
        tx.send(QueueCommand::EnqueueDecoded(request("gone2"), decoded(2)))
            .unwrap();
        // let the consumer pick up "long"
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(QueueCommand::Clear).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx_api.recv())
            .await
            .expect("current sound should still finish")
            .unwrap();
        match event {
            VoiceChannelEvent::PlaybackFinished { request, .. } => {
                assert_eq!(Some("long".to_string()), request.sound_name);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // nothing else plays
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(Err(TryRecvError::Empty), rx_api.try_recv());

        token.cancel();
    }

    #[tokio::test]
    async fn test_stop_current_skips_finished_event() {
        let (tx, mut rx_api, token) = spawn_queue();

        tx.send(QueueCommand::EnqueueDecoded(request("stopme"), decoded(500)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(QueueCommand::StopCurrent).unwrap();

        // no PlaybackFinished for a stopped sound
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(Err(TryRecvError::Empty), rx_api.try_recv());

        // and the queue keeps serving later requests
        tx.send(QueueCommand::EnqueueDecoded(request("after"), decoded(2)))
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx_api.recv())
            .await
            .expect("queue should continue after a stop")
            .unwrap();
        match event {
            VoiceChannelEvent::PlaybackFinished { request, .. } => {
                assert_eq!(Some("after".to_string()), request.sound_name);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        token.cancel();
    }

    #[test]
    fn test_missing_transcoder_is_demoted_after_first_report() {
        let (tx_api, _rx_api) = mpsc::unbounded_channel();
        let tracker = SpeakingTracker::new(true, 0.5, tx_api.clone());
        let mut queue = PlaybackQueue {
            guild_id: 1,
            sink: Arc::new(TestSink),
            tracker,
            tx_api,
            shutdown_token: CancellationToken::new(),
            playback_timeout: Duration::from_secs(5),
            ducking_transition: Duration::from_millis(100),
            guild_volume: 1.0,
            cache: HashMap::new(),
            missing_tool_reported: false,
        };

        // ordinary decode failures never touch the flag
        queue.report_decode_failure(&AudioError::decode("boom.mp3", "bad data"));
        assert!(!queue.missing_tool_reported);

        queue.report_decode_failure(&AudioError::MissingTool { tool: "ffmpeg" });
        assert!(queue.missing_tool_reported);
        // later occurrences stay demoted
        queue.report_decode_failure(&AudioError::MissingTool { tool: "ffmpeg" });
        assert!(queue.missing_tool_reported);
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped_and_queue_continues() {
        let (tx, mut rx_api, token) = spawn_queue();

        tx.send(QueueCommand::Enqueue(request("/does/not/exist.wav")))
            .unwrap();
        tx.send(QueueCommand::EnqueueDecoded(request("next"), decoded(2)))
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx_api.recv())
            .await
            .expect("queue should survive a decode failure")
            .unwrap();
        match event {
            VoiceChannelEvent::PlaybackFinished { request, .. } => {
                assert_eq!(Some("next".to_string()), request.sound_name);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        token.cancel();
    }
}
