use std::io;
use std::sync::{Arc, Mutex};

use songbird::input::{reader::MediaSource, Codec, Container, Input, Reader};
use tokio::sync::oneshot;

use crate::model::constants::STEREO_FRAME_SIZE;
use crate::model::types::AudioSample;
use crate::playback::ducking::{apply_gain, Ducker};

/// Shared handle to a source's ducking state.  The speaking-state
/// tracker holds one of these for the guild's active source and calls
/// duck()/unduck() on it from the transport's event context.
pub(crate) type DuckHandle = Arc<Mutex<Ducker>>;

/// A decoded PCM buffer played out one 20ms frame at a time, with the
/// ducker's gain applied per frame.  The transport's audio thread
/// pulls from this through the `io::Read` impl; when the buffer is
/// exhausted a oneshot fires so the queue consumer can move on.
pub(crate) struct PcmSource {
    pcm: Vec<AudioSample>,
    pos: usize,
    ducker: DuckHandle,
    on_finished: Option<oneshot::Sender<()>>,
    carry: Vec<u8>,
    carry_pos: usize,
}

impl PcmSource {
    pub fn new(pcm: Vec<AudioSample>, ducker: DuckHandle) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                pcm,
                pos: 0,
                ducker,
                on_finished: Some(tx),
                carry: Vec::with_capacity(STEREO_FRAME_SIZE * 2),
                carry_pos: 0,
            },
            rx,
        )
    }

    /// Produces the next 20ms frame with gain applied, padding the
    /// final partial frame with silence.  None once exhausted.
    pub fn next_frame(&mut self) -> Option<Vec<AudioSample>> {
        if self.pos >= self.pcm.len() {
            if let Some(tx) = self.on_finished.take() {
                tx.send(()).ok();
            }
            return None;
        }

        let end = (self.pos + STEREO_FRAME_SIZE).min(self.pcm.len());
        let mut frame = Vec::with_capacity(STEREO_FRAME_SIZE);
        frame.extend_from_slice(&self.pcm[self.pos..end]);
        frame.resize(STEREO_FRAME_SIZE, 0);
        self.pos = end;

        let gain = self.ducker.lock().unwrap().next_gain();
        apply_gain(&mut frame, gain);
        Some(frame)
    }

    /// Wraps this source for the songbird driver as a raw PCM input.
    pub fn into_input(self) -> Input {
        Input::new(
            true,
            Reader::Extension(Box::new(self)),
            Codec::Pcm,
            Container::Raw,
            Default::default(),
        )
    }
}

impl io::Read for PcmSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.carry_pos >= self.carry.len() {
            match self.next_frame() {
                Some(frame) => {
                    self.carry.clear();
                    self.carry_pos = 0;
                    for sample in frame {
                        self.carry.extend_from_slice(&sample.to_le_bytes());
                    }
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.carry.len() - self.carry_pos);
        buf[..n].copy_from_slice(&self.carry[self.carry_pos..self.carry_pos + n]);
        self.carry_pos += n;
        Ok(n)
    }
}

impl io::Seek for PcmSource {
    fn seek(&mut self, _pos: io::SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "playback sources are not seekable",
        ))
    }
}

impl MediaSource for PcmSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        Some((self.pcm.len() * std::mem::size_of::<AudioSample>()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;

    fn ducker(base: f32) -> DuckHandle {
        Arc::new(Mutex::new(Ducker::new(
            base,
            0.5,
            Duration::from_millis(100),
        )))
    }

    #[test]
    fn test_frames_are_fixed_size_and_padded() {
        // one and a half frames of audio
        let pcm = vec![1000i16; STEREO_FRAME_SIZE + STEREO_FRAME_SIZE / 2];
        let (mut source, _rx) = PcmSource::new(pcm, ducker(1.0));

        let first = source.next_frame().unwrap();
        assert_eq!(STEREO_FRAME_SIZE, first.len());
        assert!(first.iter().all(|&s| s == 1000));

        let second = source.next_frame().unwrap();
        assert_eq!(STEREO_FRAME_SIZE, second.len());
        // tail is padded with silence
        assert!(second[STEREO_FRAME_SIZE / 2..].iter().all(|&s| s == 0));

        assert!(source.next_frame().is_none());
    }

    #[test]
    fn test_exhaustion_fires_completion_exactly_once() {
        let pcm = vec![0i16; STEREO_FRAME_SIZE];
        let (mut source, mut rx) = PcmSource::new(pcm, ducker(1.0));

        assert!(rx.try_recv().is_err());
        source.next_frame();
        assert!(rx.try_recv().is_err());
        assert!(source.next_frame().is_none());
        assert!(rx.try_recv().is_ok());
        // repeated pulls stay exhausted and silent
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn test_ducked_frames_descend_in_level() {
        let pcm = vec![10000i16; STEREO_FRAME_SIZE * 6];
        let handle = ducker(1.0);
        let (mut source, _rx) = PcmSource::new(pcm, handle.clone());

        handle.lock().unwrap().duck();

        let mut last = i16::MAX;
        for _ in 0..5 {
            let frame = source.next_frame().unwrap();
            assert!(frame[0] < last);
            last = frame[0];
        }
        // 100ms transition = 5 frames; fully ducked now
        let frame = source.next_frame().unwrap();
        assert_eq!(5000, frame[0]);
    }

    #[test]
    fn test_read_yields_same_bytes_as_frames() {
        let pcm: Vec<i16> = (0..STEREO_FRAME_SIZE as i16).collect();
        let (mut source, _rx) = PcmSource::new(pcm.clone(), ducker(1.0));

        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).unwrap();
        assert_eq!(pcm.len() * 2, bytes.len());

        let decoded: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(pcm, decoded);
    }
}
