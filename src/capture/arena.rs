use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::errors::AudioError;
use crate::model::constants::{
    CORRUPTION_COUNTER_CEILING, CORRUPTION_LOG_EVERY, DISCORD_AUDIO_CHANNELS,
    DISCORD_SAMPLES_PER_SECOND,
};
use crate::model::types::{AudioSample, UserId};

/// Rolling capture buffer for one speaking participant.
struct UserCaptureBuffer {
    samples: Vec<AudioSample>,
    last_drain: Instant,
}

impl UserCaptureBuffer {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            last_drain: Instant::now(),
        }
    }
}

/// Per-guild arena of capture buffers: one map, one lock.  The packet
/// callback appends under the lock; the drain task swaps buffers out
/// under the same lock.  Guilds each get their own arena, so they
/// never contend with each other.
pub(crate) struct CaptureArena {
    users: Mutex<HashMap<UserId, UserCaptureBuffer>>,
    corruption_errors: AtomicU64,
}

impl CaptureArena {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            corruption_errors: AtomicU64::new(0),
        }
    }

    /// Appends a decoded inbound packet.  Invoked on the transport's
    /// packet context for every packet; it holds the lock just long
    /// enough to extend the vector and never touches I/O.
    pub fn write(&self, user_id: UserId, pcm: &[AudioSample]) {
        if pcm.is_empty() || pcm.len() % DISCORD_AUDIO_CHANNELS != 0 {
            self.note_corrupt_packet(pcm.len());
            return;
        }
        let mut users = self.users.lock().unwrap();
        users
            .entry(user_id)
            .or_insert_with(UserCaptureBuffer::new)
            .samples
            .extend_from_slice(pcm);
    }

    /// Swaps out every buffer that has been accumulating for at least
    /// `chunk_duration` and is non-empty.  Each drained buffer keeps a
    /// tail of `overlap` so words aren't cut at chunk boundaries; the
    /// returned chunk includes that tail (it is re-sent next time).
    pub fn drain_ready(
        &self,
        chunk_duration: Duration,
        overlap: Duration,
    ) -> Vec<(UserId, Vec<AudioSample>)> {
        let overlap_samples = duration_to_samples(overlap);
        let now = Instant::now();

        let mut drained = Vec::new();
        let mut users = self.users.lock().unwrap();
        for (&user_id, buffer) in users.iter_mut() {
            if buffer.samples.is_empty() || now.duration_since(buffer.last_drain) < chunk_duration
            {
                continue;
            }
            let tail_start = buffer.samples.len().saturating_sub(overlap_samples);
            let tail = buffer.samples[tail_start..].to_vec();
            let chunk = std::mem::replace(&mut buffer.samples, tail);
            buffer.last_drain = now;
            drained.push((user_id, chunk));
        }
        drained
    }

    /// Drops a participant's buffer (they left the channel).
    pub fn remove_user(&self, user_id: UserId) {
        self.users.lock().unwrap().remove(&user_id);
    }

    pub fn clear(&self) {
        self.users.lock().unwrap().clear();
    }

    /// Counts malformed packets, logging only every Nth so a bad
    /// stream can't flood the log, and resetting the counter once it
    /// passes the ceiling.
    fn note_corrupt_packet(&self, len: usize) {
        let count = self.corruption_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if count % CORRUPTION_LOG_EVERY == 1 {
            warn!(
                "{} (seen {} times)",
                AudioError::BufferCorruption(format!("packet of {} samples", len)),
                count
            );
        }
        if count > CORRUPTION_COUNTER_CEILING {
            self.corruption_errors.store(0, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn corruption_count(&self) -> u64 {
        self.corruption_errors.load(Ordering::Relaxed)
    }
}

fn duration_to_samples(duration: Duration) -> usize {
    duration.as_millis() as usize * DISCORD_SAMPLES_PER_SECOND * DISCORD_AUDIO_CHANNELS / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_drain_round_trip() {
        let arena = CaptureArena::new();
        arena.write(7, &[1, 2, 3, 4]);
        arena.write(7, &[5, 6]);

        // zero threshold: everything non-empty is ready
        let drained = arena.drain_ready(Duration::ZERO, Duration::ZERO);
        assert_eq!(1, drained.len());
        assert_eq!((7, vec![1, 2, 3, 4, 5, 6]), drained[0]);

        // nothing left behind with a zero overlap
        assert!(arena.drain_ready(Duration::ZERO, Duration::ZERO).is_empty());
    }

    #[test]
    fn test_empty_buffers_are_never_drained() {
        let arena = CaptureArena::new();
        arena.write(7, &[1, 2]);
        arena.drain_ready(Duration::ZERO, Duration::ZERO);

        // buffer exists but is empty now
        assert!(arena.drain_ready(Duration::ZERO, Duration::ZERO).is_empty());
    }

    #[test]
    fn test_young_buffers_wait_for_the_chunk_threshold() {
        let arena = CaptureArena::new();
        arena.write(7, &[1, 2]);
        assert!(arena
            .drain_ready(Duration::from_secs(60), Duration::ZERO)
            .is_empty());
    }

    #[test]
    fn test_overlap_tail_is_kept_and_resent() {
        let arena = CaptureArena::new();
        // 2ms of audio at 48kHz stereo = 192 samples
        let samples: Vec<i16> = (0..192).collect();
        arena.write(7, &samples);

        // keep a 1ms tail = 96 samples
        let drained = arena.drain_ready(Duration::ZERO, Duration::from_millis(1));
        assert_eq!(samples, drained[0].1);

        arena.write(7, &[1000, 1001]);
        let drained = arena.drain_ready(Duration::ZERO, Duration::ZERO);
        let chunk = &drained[0].1;
        // tail from last time, then the new packet
        assert_eq!(96 + 2, chunk.len());
        assert_eq!(96, chunk[0]);
        assert_eq!(&[1000, 1001], &chunk[96..]);
    }

    #[test]
    fn test_user_buffers_are_independent() {
        let arena = CaptureArena::new();
        arena.write(1, &[1, 2]);
        arena.write(2, &[3, 4]);
        arena.remove_user(1);

        let mut drained = arena.drain_ready(Duration::ZERO, Duration::ZERO);
        drained.sort_by_key(|(user_id, _)| *user_id);
        assert_eq!(vec![(2, vec![3, 4])], drained);
    }

    #[test]
    fn test_odd_length_packets_count_as_corruption() {
        let arena = CaptureArena::new();
        arena.write(7, &[1, 2, 3]); // not a whole stereo frame
        arena.write(7, &[]);
        assert_eq!(2, arena.corruption_count());

        // nothing was appended
        assert!(arena.drain_ready(Duration::ZERO, Duration::ZERO).is_empty());
    }
}
