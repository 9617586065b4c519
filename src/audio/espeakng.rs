#![allow(non_upper_case_globals)]

use espeakng_sys::*;
use lazy_static::lazy_static;
use std::ffi::{c_short, c_void, CString};
use std::os::raw::c_int;
use std::sync::{Mutex, Once};
use tokio::sync::oneshot;

use crate::model::constants::{
    DISCORD_SAMPLES_PER_SECOND, ESPEAK_SAMPLES_PER_SECOND, MONO_FRAME_SIZE,
};

const BUFSIZE_MS: u64 = (1000 * MONO_FRAME_SIZE / DISCORD_SAMPLES_PER_SECOND) as u64;
const EE_INTERNAL_ERROR: i32 = -1;
const VOICE_NAME: &str = "English";

struct SynthJob {
    /// audio accumulated so far
    wav: Vec<i16>,
    /// fired when espeak signals completion
    tx: oneshot::Sender<Vec<i16>>,
}

lazy_static! {
    static ref ACTIVE_JOB: Mutex<Option<SynthJob>> = Mutex::new(None);
    /// espeak-ng keeps one global synthesis state, and speaker tasks
    /// are per guild; every synthesis in the process takes this first.
    static ref SYNTH_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
}

static INIT: Once = Once::new();

fn init() {
    unsafe {
        let sample_rate = espeak_Initialize(
            // deliver audio to our callback instead of a device, so
            // we never block a thread waiting on espeak-ng
            espeak_AUDIO_OUTPUT_AUDIO_OUTPUT_RETRIEVAL,
            // ms, not bytes!
            BUFSIZE_MS as c_int,
            // default directory for espeak-ng-data
            std::ptr::null(),
            // don't exit(1) on error inside a shared lib
            espeakINITIALIZE_DONT_EXIT as c_int,
        );
        assert_ne!(EE_INTERNAL_ERROR, sample_rate);
        assert_eq!(ESPEAK_SAMPLES_PER_SECOND as i32, sample_rate);

        if let Ok(cstr_voice) = CString::new(VOICE_NAME) {
            espeak_SetVoiceByName(cstr_voice.as_ptr());
        }

        espeak_SetSynthCallback(Some(synth_callback));
    }
}

/// Claims the synthesis slot.  Callers must hold `SYNTH_LOCK`; the
/// assert catches a bypass.
fn begin_job() -> oneshot::Receiver<Vec<i16>> {
    let (tx, rx) = oneshot::channel::<Vec<i16>>();
    let mut job_opt = ACTIVE_JOB.lock().unwrap();
    assert!(job_opt.is_none());
    *job_opt = Some(SynthJob {
        wav: Vec::new(),
        tx,
    });
    rx
}

fn abandon_job() {
    ACTIVE_JOB.lock().unwrap().take();
}

fn push_samples(samples: &[i16]) {
    // the callback can fire again after completion; with no job
    // pending there is nothing to record
    if let Some(job) = ACTIVE_JOB.lock().unwrap().as_mut() {
        job.wav.extend_from_slice(samples);
    }
}

fn finish_job() {
    if let Some(job) = ACTIVE_JOB.lock().unwrap().take() {
        job.tx.send(job.wav).ok();
    }
}

unsafe extern "C" fn synth_callback(
    wav: *mut c_short,
    sample_count: c_int,
    _events: *mut espeak_EVENT,
) -> c_int {
    if wav.is_null() {
        // null means synthesis is complete; hand the audio over
        finish_job();
    } else {
        push_samples(std::slice::from_raw_parts(wav, sample_count as usize));
    }
    0
}

/// Renders `text` as speech: mono i16 PCM at espeak's native 22.05kHz.
/// Safe to call from any number of guilds concurrently; syntheses are
/// serialized process-wide.
pub(crate) async fn speak(text: &str) -> Vec<i16> {
    let _synth = SYNTH_LOCK.lock().await;
    INIT.call_once(init);

    let rx = begin_job();

    let Ok(cstr_text) = CString::new(text) else {
        abandon_job();
        return Vec::new();
    };

    unsafe {
        let str_bytes = cstr_text.as_bytes_with_nul();
        espeak_Synth(
            str_bytes.as_ptr() as *const c_void,
            str_bytes.len(),
            0,
            espeak_POSITION_TYPE_POS_CHARACTER,
            0,
            espeakCHARS_AUTO,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
    };

    rx.await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // exercises the slot discipline without touching the C library:
    // each task mirrors what speak() does around espeak_Synth
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_speakers_serialize_on_the_synth_slot() {
        let mut handles = Vec::new();
        for i in 0..8i16 {
            handles.push(tokio::spawn(async move {
                let _synth = SYNTH_LOCK.lock().await;
                let rx = begin_job();
                push_samples(&[i, i, i]);
                tokio::task::yield_now().await;
                push_samples(&[i]);
                finish_job();
                rx.await.unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(vec![i as i16; 4], handle.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_abandoned_job_frees_the_slot() {
        let _synth = SYNTH_LOCK.lock().await;
        let _failed = begin_job();
        abandon_job();

        let rx = begin_job();
        push_samples(&[5]);
        finish_job();
        assert_eq!(vec![5], rx.await.unwrap());
    }
}
