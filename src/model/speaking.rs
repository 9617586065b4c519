use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::api::api_types::VoiceChannelEvent;
use crate::model::types::UserId;
use crate::playback::source::DuckHandle;

/// Guild-scoped set of currently-speaking participants.  Drives the
/// duck/unduck transitions of whatever source is currently playing,
/// and announces channel-silent edges the way the transport's other
/// listeners expect.
///
/// Updated only from speaking-start/stop notifications; those arrive
/// on the transport's event context, so the tracker lives behind a
/// plain mutex shared with the queue consumer.
pub(crate) struct SpeakingTracker {
    speaking: HashSet<UserId>,
    ducking_enabled: bool,
    ducking_level: f32,
    active: Option<DuckHandle>,
    tx_api: UnboundedSender<VoiceChannelEvent>,
}

pub(crate) type SharedTracker = Arc<Mutex<SpeakingTracker>>;

impl SpeakingTracker {
    pub fn new(
        ducking_enabled: bool,
        ducking_level: f32,
        tx_api: UnboundedSender<VoiceChannelEvent>,
    ) -> SharedTracker {
        Arc::new(Mutex::new(Self {
            speaking: HashSet::new(),
            ducking_enabled,
            ducking_level,
            active: None,
            tx_api,
        }))
    }

    pub fn on_speaking_start(&mut self, user_id: UserId) {
        if !self.speaking.insert(user_id) {
            // already marked speaking; ignore the churn
            return;
        }
        if self.speaking.len() == 1 {
            self.announce(false);
        }
        if self.ducking_enabled {
            if let Some(active) = &self.active {
                active.lock().unwrap().duck();
            }
        }
    }

    pub fn on_speaking_stop(&mut self, user_id: UserId) {
        if !self.speaking.remove(&user_id) {
            return;
        }
        if self.speaking.is_empty() {
            self.announce(true);
            if self.ducking_enabled {
                if let Some(active) = &self.active {
                    active.lock().unwrap().unduck();
                }
            }
        }
    }

    /// Registers (or clears) the guild's active playback source.  A
    /// new source starts ducked if anyone is already talking.
    pub fn set_active_source(&mut self, active: Option<DuckHandle>) {
        if let Some(handle) = &active {
            if self.ducking_enabled && !self.speaking.is_empty() {
                handle.lock().unwrap().duck();
            }
        }
        self.active = active;
    }

    pub fn set_ducking(&mut self, enabled: bool, level: f32) {
        self.ducking_enabled = enabled;
        self.ducking_level = level;
        if let Some(active) = &self.active {
            let mut ducker = active.lock().unwrap();
            ducker.set_ducking_level(level);
            if !enabled {
                ducker.unduck();
            } else if !self.speaking.is_empty() {
                ducker.duck();
            }
        }
    }

    pub fn ducking_level(&self) -> f32 {
        self.ducking_level
    }

    fn announce(&self, is_silent: bool) {
        self.tx_api
            .send(VoiceChannelEvent::ChannelSilent(is_silent))
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, error::TryRecvError};

    use crate::playback::ducking::Ducker;

    fn tracker() -> (
        SharedTracker,
        mpsc::UnboundedReceiver<VoiceChannelEvent>,
        DuckHandle,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = SpeakingTracker::new(true, 0.5, tx);
        let handle: DuckHandle = Arc::new(Mutex::new(Ducker::new(
            1.0,
            0.5,
            Duration::from_millis(100),
        )));
        tracker.lock().unwrap().set_active_source(Some(handle.clone()));
        (tracker, rx, handle)
    }

    #[test]
    fn test_ducked_iff_someone_is_speaking() {
        let (tracker, _rx, handle) = tracker();

        tracker.lock().unwrap().on_speaking_start(1);
        assert!(handle.lock().unwrap().is_ducked());

        tracker.lock().unwrap().on_speaking_start(2);
        assert!(handle.lock().unwrap().is_ducked());

        tracker.lock().unwrap().on_speaking_stop(1);
        assert!(handle.lock().unwrap().is_ducked());

        tracker.lock().unwrap().on_speaking_stop(2);
        assert!(!handle.lock().unwrap().is_ducked());
    }

    #[test]
    fn test_churn_is_ignored() {
        let (tracker, mut rx, _handle) = tracker();

        tracker.lock().unwrap().on_speaking_start(1);
        tracker.lock().unwrap().on_speaking_start(1);
        assert_eq!(
            Ok(VoiceChannelEvent::ChannelSilent(false)),
            rx.try_recv().map_err(|_| ())
        );
        assert_eq!(Err(TryRecvError::Empty), rx.try_recv());

        // stop for a user we never saw does nothing
        tracker.lock().unwrap().on_speaking_stop(99);
        assert_eq!(Err(TryRecvError::Empty), rx.try_recv());
    }

    #[test]
    fn test_new_source_starts_ducked_when_channel_is_loud() {
        let (tracker, _rx, _old) = tracker();
        tracker.lock().unwrap().on_speaking_start(1);

        let fresh: DuckHandle = Arc::new(Mutex::new(Ducker::new(
            1.0,
            0.5,
            Duration::from_millis(100),
        )));
        tracker.lock().unwrap().set_active_source(Some(fresh.clone()));
        assert!(fresh.lock().unwrap().is_ducked());
    }

    #[test]
    fn test_disabling_ducking_unducks_active_source() {
        let (tracker, _rx, handle) = tracker();
        tracker.lock().unwrap().on_speaking_start(1);
        assert!(handle.lock().unwrap().is_ducked());

        tracker.lock().unwrap().set_ducking(false, 0.5);
        assert!(!handle.lock().unwrap().is_ducked());

        // and re-enabling while someone is talking re-ducks
        tracker.lock().unwrap().set_ducking(true, 0.3);
        assert!(handle.lock().unwrap().is_ducked());
    }
}
