use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperToken};

use crate::api::api_types::{
    EngineConfig, SttComputeType, SttDevice, TranscriptEvent, VoiceChannelEvent,
};
use crate::capture::arena::CaptureArena;
use crate::capture::engine::{SpeechEngine, WorkerPool};
use crate::capture::{resample, vad};
use crate::errors::AudioError;
use crate::model::constants::{
    DISCORD_AUDIO_CHANNELS, DISCORD_SAMPLES_PER_SECOND, OUTRAGEOUSLY_MANY_TOKENS, TOKENS_TO_KEEP,
};
use crate::model::types::{AudioSample, SttSample, UserId};

/// Chunk-buffered batch recognizer.  Inbound packets accumulate in the
/// capture arena; a periodic drain task gates chunks through the VAD,
/// downsamples them, and runs a blocking Whisper call on the shared
/// worker pool.  Each user's recent tokens seed their next
/// transcription, the way incremental whisper.cpp frontends do.
pub(crate) struct BufferedEngine {
    arena: Arc<CaptureArena>,
    ctx: Arc<WhisperContext>,
    tx_api: UnboundedSender<VoiceChannelEvent>,
    pool: WorkerPool,
    drain_interval: Duration,
    chunk_duration: Duration,
    chunk_overlap: Duration,
    vad_rms_threshold: f32,
    n_threads: i32,
    shutdown_token: CancellationToken,
    listening: AtomicBool,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    token_history: Arc<Mutex<HashMap<UserId, BoundedTokenBuffer>>>,
}

impl BufferedEngine {
    pub fn new(
        model_path: &Path,
        device: SttDevice,
        compute_type: SttComputeType,
        config: &EngineConfig,
        tx_api: UnboundedSender<VoiceChannelEvent>,
        pool: WorkerPool,
        shutdown_token: CancellationToken,
    ) -> Result<Self, AudioError> {
        if !model_path.is_file() {
            return Err(AudioError::Recognition(format!(
                "model file does not exist: {}",
                model_path.display()
            )));
        }
        let ctx = WhisperContext::new(&model_path.to_string_lossy())
            .map_err(|e| AudioError::Recognition(format!("failed to load model: {:?}", e)))?;

        let n_threads = match device {
            SttDevice::Cpu => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4) as i32,
            // the accelerator does the heavy lifting; a few feeder
            // threads are plenty
            SttDevice::Accelerator => 4,
        };
        info!(
            "loaded whisper model {} ({:?}, {:?}, {} threads)",
            model_path.display(),
            device,
            compute_type,
            n_threads
        );

        Ok(Self {
            arena: Arc::new(CaptureArena::new()),
            ctx: Arc::new(ctx),
            tx_api,
            pool,
            drain_interval: config.drain_interval,
            chunk_duration: config.chunk_duration,
            chunk_overlap: config.chunk_overlap,
            vad_rms_threshold: config.vad_rms_threshold,
            n_threads,
            shutdown_token: shutdown_token.child_token(),
            listening: AtomicBool::new(false),
            drain_task: Mutex::new(None),
            token_history: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn drain_loop(
        arena: Arc<CaptureArena>,
        ctx: Arc<WhisperContext>,
        tx_api: UnboundedSender<VoiceChannelEvent>,
        pool: WorkerPool,
        token_history: Arc<Mutex<HashMap<UserId, BoundedTokenBuffer>>>,
        shutdown_token: CancellationToken,
        drain_interval: Duration,
        chunk_duration: Duration,
        chunk_overlap: Duration,
        vad_rms_threshold: f32,
        n_threads: i32,
    ) {
        let mut ticker = time::interval(drain_interval);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    return;
                }
                _ = ticker.tick() => {
                    let drained = arena.drain_ready(chunk_duration, chunk_overlap);
                    for (user_id, chunk) in gate_chunks(drained, vad_rms_threshold) {
                        Self::spawn_transcription(
                            user_id,
                            chunk,
                            ctx.clone(),
                            tx_api.clone(),
                            pool.clone(),
                            token_history.clone(),
                            shutdown_token.clone(),
                            n_threads,
                        );
                    }
                }
            }
        }
    }

    /// Runs one chunk through the model on the worker pool.  Failures
    /// drop the chunk; they never reach the drain loop.
    #[allow(clippy::too_many_arguments)]
    fn spawn_transcription(
        user_id: UserId,
        chunk: Vec<AudioSample>,
        ctx: Arc<WhisperContext>,
        tx_api: UnboundedSender<VoiceChannelEvent>,
        pool: WorkerPool,
        token_history: Arc<Mutex<HashMap<UserId, BoundedTokenBuffer>>>,
        shutdown_token: CancellationToken,
        n_threads: i32,
    ) {
        let audio_duration = Duration::from_millis(
            (chunk.len() / (DISCORD_SAMPLES_PER_SECOND / 1000 * DISCORD_AUDIO_CHANNELS)) as u64,
        );
        let audio = resample::to_stt_f32(&chunk);

        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire().await else {
                // the pool itself is gone; nothing can recover this
                error!("transcription worker pool is closed");
                return;
            };

            let previous_tokens = token_history
                .lock()
                .unwrap()
                .get(&user_id)
                .map(|b| b.get())
                .unwrap_or_default();

            let started = SystemTime::now();
            let result = tokio::task::spawn_blocking(move || {
                transcribe(&ctx, &audio, &previous_tokens, n_threads)
            })
            .await;

            if shutdown_token.is_cancelled() {
                // the connection went away while we were busy; the
                // result arrived too late to matter
                return;
            }

            match result {
                Ok(Ok(Some(transcription))) => {
                    token_history
                        .lock()
                        .unwrap()
                        .entry(user_id)
                        .or_insert_with(BoundedTokenBuffer::new)
                        .add_all(&transcription.token_ids);
                    tx_api
                        .send(VoiceChannelEvent::Transcript(TranscriptEvent {
                            user_id,
                            display_name: None,
                            text: transcription.text,
                            confidence: transcription.confidence,
                            timestamp: started - audio_duration,
                        }))
                        .ok();
                }
                Ok(Ok(None)) => {
                    // nothing worth publishing in this chunk
                }
                Ok(Err(err)) => {
                    warn!("user {}: {}", user_id, err);
                }
                Err(join_err) => {
                    warn!(
                        "user {}: {}",
                        user_id,
                        AudioError::Recognition(join_err.to_string())
                    );
                }
            }
        });
    }
}

#[async_trait]
impl SpeechEngine for BufferedEngine {
    async fn start(&self) -> Result<(), AudioError> {
        let task = tokio::spawn(Self::drain_loop(
            self.arena.clone(),
            self.ctx.clone(),
            self.tx_api.clone(),
            self.pool.clone(),
            self.token_history.clone(),
            self.shutdown_token.clone(),
            self.drain_interval,
            self.chunk_duration,
            self.chunk_overlap,
            self.vad_rms_threshold,
            self.n_threads,
        ));
        *self.drain_task.lock().unwrap() = Some(task);
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.listening.store(false, Ordering::SeqCst);
        self.shutdown_token.cancel();
        let task = self.drain_task.lock().unwrap().take();
        if let Some(task) = task {
            task.await.ok();
        }
        self.arena.clear();
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn on_packet(&self, user_id: UserId, pcm: &[AudioSample]) {
        if self.is_listening() {
            self.arena.write(user_id, pcm);
        }
    }

    fn on_user_gone(&self, user_id: UserId) {
        self.arena.remove_user(user_id);
        self.token_history.lock().unwrap().remove(&user_id);
    }
}

/// Drops drained chunks the VAD judges to be silence.  Anything that
/// survives the gate goes on to the recognizer.
fn gate_chunks(
    chunks: Vec<(UserId, Vec<AudioSample>)>,
    rms_threshold: f32,
) -> Vec<(UserId, Vec<AudioSample>)> {
    chunks
        .into_iter()
        .filter(|(user_id, chunk)| {
            let speech = vad::is_speech(chunk, rms_threshold);
            if !speech {
                debug!("user {}: chunk below VAD threshold, discarded", user_id);
            }
            speech
        })
        .collect()
}

struct Transcription {
    text: String,
    confidence: f32,
    token_ids: Vec<WhisperToken>,
}

/// Blocking batch call.  Takes a while; only ever invoked from the
/// worker pool, never from a runtime thread.
fn transcribe(
    ctx: &WhisperContext,
    audio: &[SttSample],
    previous_tokens: &[WhisperToken],
    n_threads: i32,
) -> Result<Option<Transcription>, AudioError> {
    let mut state = ctx
        .create_state()
        .map_err(|e| AudioError::Recognition(format!("create_state: {:?}", e)))?;

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    params.set_suppress_blank(true);
    params.set_suppress_non_speech_tokens(true);
    params.set_n_threads(n_threads);
    params.set_tokens(previous_tokens);

    state
        .full(params, audio)
        .map_err(|e| AudioError::Recognition(format!("full: {:?}", e)))?;

    let num_segments = state
        .full_n_segments()
        .map_err(|e| AudioError::Recognition(format!("n_segments: {:?}", e)))?;

    let mut text = String::new();
    let mut token_ids = Vec::new();
    let mut probability_sum = 0.0f32;
    let mut token_count = 0usize;

    for i in 0..num_segments {
        let num_tokens = state
            .full_n_tokens(i)
            .map_err(|e| AudioError::Recognition(format!("n_tokens: {:?}", e)))?;

        let mut segment_probabilities = Vec::with_capacity(num_tokens as usize);
        for j in 0..num_tokens {
            let prob = state.full_get_token_prob(i, j).unwrap_or(0.0);
            segment_probabilities.push((prob * 100.0) as u32);
        }
        if !is_valid_segment(&segment_probabilities) {
            debug!("discarding improbable segment of {} tokens", num_tokens);
            continue;
        }

        let segment_text = state
            .full_get_segment_text(i)
            .map_err(|e| AudioError::Recognition(format!("segment_text: {:?}", e)))?;
        if ignore_text(&segment_text) {
            continue;
        }

        for j in 0..num_tokens {
            if let Ok(token_id) = state.full_get_token_id(i, j) {
                token_ids.push(token_id);
            }
            let prob = state.full_get_token_prob(i, j).unwrap_or(0.0);
            probability_sum += prob;
            token_count += 1;
        }
        text.push_str(segment_text.trim());
        text.push(' ');
    }

    let text = text.trim().to_string();
    if text.is_empty() {
        return Ok(None);
    }
    let confidence = if token_count > 0 {
        (probability_sum / token_count as f32).clamp(0.0, 1.0)
    } else {
        1.0
    };
    Ok(Some(Transcription {
        text,
        confidence,
        token_ids,
    }))
}

/// Whisper is great at spoken words but poor at noticing audio with no
/// words in it.  Discard a segment when most of its tokens are low
/// probability, or when it is too long to be real speech.
fn is_valid_segment(token_probabilities: &[u32]) -> bool {
    let low = token_probabilities.iter().filter(|&&p| p <= 50).count();
    let high = token_probabilities.len() - low;
    if low > high {
        return false;
    }
    token_probabilities.len() < OUTRAGEOUSLY_MANY_TOKENS
}

fn ignore_text(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || (trimmed.starts_with("[_") && trimmed.ends_with(']'))
}

/// The most recent tokens we've seen from one user, used to seed their
/// next transcription.
struct BoundedTokenBuffer(VecDeque<WhisperToken>);

impl BoundedTokenBuffer {
    fn new() -> Self {
        Self(VecDeque::with_capacity(TOKENS_TO_KEEP))
    }

    fn add_all(&mut self, tokens: &[WhisperToken]) {
        for &token in tokens {
            if self.0.len() == TOKENS_TO_KEEP {
                self.0.pop_front();
            }
            self.0.push_back(token);
        }
    }

    fn get(&self) -> Vec<WhisperToken> {
        self.0.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::constants::DEFAULT_VAD_RMS_THRESHOLD;

    #[test]
    fn test_silent_chunks_never_reach_the_recognizer() {
        // 2 seconds of drained stereo silence from two users
        let silence = vec![0i16; 48000 * 2 * 2];
        let drained = vec![(1u64, silence.clone()), (2u64, silence)];

        let survivors = gate_chunks(drained, DEFAULT_VAD_RMS_THRESHOLD);
        assert!(survivors.is_empty());
    }

    #[test]
    fn test_loud_chunks_pass_the_gate() {
        let tone: Vec<i16> = (0..48000 * 2)
            .map(|i| (((i / 2) as f32 * 0.05).sin() * 12000.0) as i16)
            .collect();
        let quiet = vec![0i16; 48000 * 2];

        let survivors =
            gate_chunks(vec![(1, tone), (2, quiet)], DEFAULT_VAD_RMS_THRESHOLD);
        assert_eq!(1, survivors.len());
        assert_eq!(1, survivors[0].0);
    }

    #[test]
    fn test_mostly_low_probability_segments_are_invalid() {
        assert!(!is_valid_segment(&[10, 20, 30, 90]));
        assert!(is_valid_segment(&[90, 95, 80, 10]));
    }

    #[test]
    fn test_outrageously_long_segments_are_invalid() {
        let probabilities = vec![90u32; OUTRAGEOUSLY_MANY_TOKENS];
        assert!(!is_valid_segment(&probabilities));
    }

    #[test]
    fn test_empty_segment_is_valid_but_empty() {
        // zero tokens: nothing low, nothing outrageous
        assert!(is_valid_segment(&[]));
    }

    #[test]
    fn test_non_speech_markers_are_ignored() {
        assert!(ignore_text("[_BEG_]"));
        assert!(ignore_text("  "));
        assert!(!ignore_text("hello there"));
    }

    #[test]
    fn test_token_buffer_is_bounded() {
        let mut buffer = BoundedTokenBuffer::new();
        let tokens: Vec<WhisperToken> = (0..TOKENS_TO_KEEP as i32 + 10).collect();
        buffer.add_all(&tokens);
        let kept = buffer.get();
        assert_eq!(TOKENS_TO_KEEP, kept.len());
        // the oldest tokens fell off the front
        assert_eq!(10, kept[0]);
    }
}
