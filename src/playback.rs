//! Per-period playback sessions.
//!
//! Idle → Loading → Playing ⇄ Paused → Ended
//!
//! Each period key owns one session and at most one audio handle. Sessions
//! are independent unless exclusive mode is on, in which case starting one
//! stops the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{AudioHandle, AudioOutput};
use crate::config::PlaybackConfig;
use crate::error::{NarrationError, PlaybackError};
use crate::narration::{CacheCorrelation, NarrationSynthesizer, NarrationTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Idle,
    Loading,
    Playing,
    Paused,
    Ended,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub key: String,
    pub state: TransportState,
    pub is_playing: bool,
    pub is_paused: bool,
    pub progress_percent: f64,
    pub duration_seconds: f64,
}

struct PlaybackSession {
    state: TransportState,
    progress_percent: f64,
    duration_seconds: f64,
    handle: Option<Box<dyn AudioHandle>>,
    /// A seek gesture is in progress.
    seeking: bool,
    /// Position events are ignored until this instant.
    hold_until: Option<Instant>,
    /// Bumped on stop so a load that finishes afterwards doesn't start playing.
    load_epoch: u64,
}

impl PlaybackSession {
    fn new() -> Self {
        Self {
            state: TransportState::Idle,
            progress_percent: 0.0,
            duration_seconds: 0.0,
            handle: None,
            seeking: false,
            hold_until: None,
            load_epoch: 0,
        }
    }

    fn snapshot(&self, key: &str) -> SessionSnapshot {
        SessionSnapshot {
            key: key.to_string(),
            state: self.state,
            is_playing: self.state == TransportState::Playing,
            is_paused: self.state == TransportState::Paused,
            progress_percent: self.progress_percent,
            duration_seconds: self.duration_seconds,
        }
    }

    fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
        }
        self.seeking = false;
        self.hold_until = None;
    }

    fn reset(&mut self, state: TransportState) {
        self.release();
        self.state = state;
        self.progress_percent = 0.0;
    }

    fn suppressing(&self, now: Instant) -> bool {
        self.seeking || self.hold_until.is_some_and(|until| now < until)
    }

    /// Apply a playhead report from the handle. Returns false when ignored.
    fn apply_position(&mut self, seconds: f64, now: Instant) -> bool {
        if self.state != TransportState::Playing || self.suppressing(now) {
            return false;
        }
        self.hold_until = None;
        if self.duration_seconds > 0.0 {
            self.progress_percent = (seconds / self.duration_seconds * 100.0).clamp(0.0, 100.0);
        }
        true
    }

    fn finish(&mut self) {
        self.reset(TransportState::Ended);
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.release();
    }
}

type SessionTable = HashMap<String, PlaybackSession>;

pub struct PlaybackController {
    synthesizer: Arc<NarrationSynthesizer>,
    output: Arc<dyn AudioOutput>,
    sessions: Mutex<SessionTable>,
    seek_settle: Duration,
    exclusive: bool,
}

impl PlaybackController {
    pub fn new(
        synthesizer: Arc<NarrationSynthesizer>,
        output: Arc<dyn AudioOutput>,
        config: &PlaybackConfig,
    ) -> Self {
        Self {
            synthesizer,
            output,
            sessions: Mutex::new(HashMap::new()),
            seek_settle: config.seek_settle(),
            exclusive: config.exclusive,
        }
    }

    /// Start or resume playback for `key`.
    ///
    /// Paused sessions resume in place. Otherwise the cached track is used
    /// when there is one, and `text` is synthesized when there isn't.
    pub async fn play(
        &self,
        key: &str,
        text: &str,
        correlation: Option<CacheCorrelation>,
    ) -> Result<SessionSnapshot, PlaybackError> {
        let epoch = {
            let mut sessions = self.sessions();
            let session = sessions
                .entry(key.to_string())
                .or_insert_with(PlaybackSession::new);

            match session.state {
                TransportState::Paused => {
                    if let Some(handle) = session.handle.as_mut() {
                        handle.play();
                    }
                    session.state = TransportState::Playing;
                    let snapshot = session.snapshot(key);
                    self.stop_others(&mut sessions, key);
                    debug!("Resumed {key} at {:.0}%", snapshot.progress_percent);
                    return Ok(snapshot);
                }
                TransportState::Playing | TransportState::Loading => {
                    return Ok(session.snapshot(key));
                }
                TransportState::Idle | TransportState::Ended => {}
            }

            if let Some(track) = self.synthesizer.cached(key) {
                return self.start(&mut sessions, key, &track);
            }

            session.state = TransportState::Loading;
            session.progress_percent = 0.0;
            session.load_epoch
        };

        info!("Loading narration for {key}");
        let result = self.synthesizer.play_or_synthesize(key, text, correlation).await;

        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(key) else {
            // Torn down while loading.
            return result
                .map(|_| PlaybackSession::new().snapshot(key))
                .map_err(PlaybackError::from);
        };

        if session.state != TransportState::Loading || session.load_epoch != epoch {
            debug!("{key} was stopped while loading, not starting playback");
            let snapshot = session.snapshot(key);
            return result.map(|_| snapshot).map_err(PlaybackError::from);
        }

        match result {
            Ok(track) => self.start(&mut sessions, key, &track),
            Err(e) => {
                session.reset(TransportState::Idle);
                Err(e.into())
            }
        }
    }

    pub fn pause(&self, key: &str) -> Result<SessionSnapshot, PlaybackError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| PlaybackError::NoSession(key.to_string()))?;
        if session.state != TransportState::Playing {
            return Err(invalid(key, "pause", session.state));
        }

        let now = Instant::now();
        if let Some(handle) = session.handle.as_mut() {
            handle.pause();
            let position = handle.position().as_secs_f64();
            session.apply_position(position, now);
        }
        session.state = TransportState::Paused;
        debug!("Paused {key} at {:.0}%", session.progress_percent);
        Ok(session.snapshot(key))
    }

    pub fn stop(&self, key: &str) -> Result<SessionSnapshot, PlaybackError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| PlaybackError::NoSession(key.to_string()))?;
        if session.state == TransportState::Idle {
            return Err(invalid(key, "stop", session.state));
        }
        session.load_epoch += 1;
        session.reset(TransportState::Idle);
        debug!("Stopped {key}");
        Ok(session.snapshot(key))
    }

    /// A seek gesture started: hold off playhead updates until `seek`.
    pub fn begin_seek(&self, key: &str) -> Result<SessionSnapshot, PlaybackError> {
        let mut sessions = self.sessions();
        let session = Self::with_handle(&mut sessions, key, "seek")?;
        session.seeking = true;
        Ok(session.snapshot(key))
    }

    /// Jump to `percent` of the track. Playhead updates stay suppressed for
    /// the settle window afterwards.
    pub fn seek(&self, key: &str, percent: f64) -> Result<SessionSnapshot, PlaybackError> {
        let mut sessions = self.sessions();
        let session = Self::with_handle(&mut sessions, key, "seek")?;
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };

        let target = Duration::from_secs_f64(session.duration_seconds * percent / 100.0);
        if let Some(handle) = session.handle.as_mut() {
            if let Err(e) = handle.seek(target) {
                warn!("Seek on {key} failed: {e}");
                session.seeking = false;
                return Err(PlaybackError::Output(e));
            }
        }

        session.progress_percent = percent;
        session.seeking = false;
        session.hold_until = Some(Instant::now() + self.seek_settle);
        debug!("Seeked {key} to {percent:.0}%");
        Ok(session.snapshot(key))
    }

    /// Playhead report from the audio handle, in seconds.
    pub fn on_position(&self, key: &str, seconds: f64) -> bool {
        self.sessions()
            .get_mut(key)
            .is_some_and(|s| s.apply_position(seconds, Instant::now()))
    }

    /// The handle reached the end of the track.
    pub fn on_ended(&self, key: &str) {
        if let Some(session) = self.sessions().get_mut(key) {
            if matches!(session.state, TransportState::Playing | TransportState::Paused) {
                session.finish();
                info!("Narration for {key} finished");
            }
        }
    }

    /// Poll every playing handle once: report position or completion.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions();
        for (key, session) in sessions.iter_mut() {
            if session.state != TransportState::Playing {
                continue;
            }
            let Some(handle) = session.handle.as_ref() else {
                continue;
            };
            if handle.is_finished() {
                session.finish();
                info!("Narration for {key} finished");
                continue;
            }
            let position = handle.position().as_secs_f64();
            session.apply_position(position, now);
        }
    }

    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                controller.tick();
            }
        })
    }

    pub fn snapshot(&self, key: &str) -> Option<SessionSnapshot> {
        self.sessions().get(key).map(|s| s.snapshot(key))
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .sessions()
            .iter()
            .map(|(k, s)| s.snapshot(k))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn playing_count(&self) -> usize {
        self.sessions()
            .values()
            .filter(|s| s.state == TransportState::Playing)
            .count()
    }

    /// View teardown: stop and release every handle, forget every session.
    pub fn teardown(&self) -> usize {
        let drained: Vec<(String, PlaybackSession)> = self.sessions().drain().collect();
        let released = drained.iter().filter(|(_, s)| s.handle.is_some()).count();
        drop(drained);
        if released > 0 {
            info!("Released {released} playback handle(s)");
        }
        released
    }

    fn start(
        &self,
        sessions: &mut SessionTable,
        key: &str,
        track: &NarrationTrack,
    ) -> Result<SessionSnapshot, PlaybackError> {
        let opened = track
            .audio()
            .and_then(|audio| self.output.open(audio).map_err(NarrationError::Decode));

        let session = sessions
            .entry(key.to_string())
            .or_insert_with(PlaybackSession::new);
        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot play {key}: {e}");
                session.reset(TransportState::Idle);
                return Err(e.into());
            }
        };

        session.release();
        session.handle = Some(handle);
        session.state = TransportState::Playing;
        session.duration_seconds = track.duration;
        session.progress_percent = 0.0;
        let snapshot = session.snapshot(key);

        self.stop_others(sessions, key);
        info!("Playing {key} ({:.1}s)", track.duration);
        Ok(snapshot)
    }

    fn stop_others(&self, sessions: &mut SessionTable, key: &str) {
        if !self.exclusive {
            return;
        }
        for (other, session) in sessions.iter_mut() {
            if other != key && matches!(session.state, TransportState::Playing | TransportState::Paused) {
                session.load_epoch += 1;
                session.reset(TransportState::Idle);
                debug!("Stopped {other} (exclusive playback)");
            }
        }
    }

    fn with_handle<'a>(
        sessions: &'a mut SessionTable,
        key: &str,
        action: &'static str,
    ) -> Result<&'a mut PlaybackSession, PlaybackError> {
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| PlaybackError::NoSession(key.to_string()))?;
        if session.handle.is_none() {
            return Err(invalid(key, action, session.state));
        }
        Ok(session)
    }

    fn sessions(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn invalid(key: &str, action: &'static str, state: TransportState) -> PlaybackError {
    PlaybackError::InvalidTransition {
        key: key.to_string(),
        action,
        state,
    }
}
