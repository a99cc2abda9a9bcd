//! Fixtures shared by the unit tests.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};

use crate::audio::{probe_duration, AudioHandle, AudioOutput};
use crate::error::NarrationError;
use crate::narration::{SpeechBackend, SpeechRequest};
use crate::period::Message;
use crate::summary::{SummaryBackend, SummaryRequest, SummaryResponse};

/// Mono 8 kHz 16-bit WAV of the given length.
pub fn wav_bytes(seconds: f64) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let frames = (seconds * spec.sample_rate as f64).round() as u32;
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames {
            let t = i as f64 / spec.sample_rate as f64;
            let sample = (t * 440.0 * std::f64::consts::TAU).sin() * 8000.0;
            writer.write_sample(sample as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// `count` messages spread over the hours of `date`.
pub fn messages_in(date: NaiveDate, count: u32) -> Vec<Message> {
    (0..count)
        .map(|i| Message {
            timestamp: Utc
                .from_utc_datetime(&date.and_hms_opt(8 + i % 12, 0, 0).unwrap()),
            role: if i % 2 == 0 { "user" } else { "assistant" }.into(),
            content: format!("message {i} on {date}"),
        })
        .collect()
}

/// Bind an ephemeral port and serve `router` on it; returns the base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub struct FakeSummaries {
    calls: AtomicUsize,
    delay: Duration,
    fail_start: Option<NaiveDate>,
}

impl FakeSummaries {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            fail_start: None,
        }
    }

    pub fn failing_on(start: NaiveDate) -> Self {
        Self {
            fail_start: Some(start),
            ..Self::new(Duration::ZERO)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SummaryBackend for FakeSummaries {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_start == Some(request.period_start) {
            return Err("summary backend unavailable".into());
        }
        Ok(SummaryResponse {
            summary: format!(
                "{} messages starting {}",
                request.message_count, request.period_start
            ),
            cached: false,
        })
    }
}

pub struct FakeSpeech {
    calls: AtomicUsize,
    audio: Vec<u8>,
    delay: Duration,
    failing: AtomicBool,
    requests: Mutex<Vec<SpeechRequest>>,
}

impl FakeSpeech {
    pub fn new(seconds: f64) -> Self {
        Self::returning(wav_bytes(seconds))
    }

    pub fn returning(audio: Vec<u8>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            audio,
            delay: Duration::ZERO,
            failing: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SpeechRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechBackend for FakeSpeech {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>, NarrationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(NarrationError::Request("connection refused".into()));
        }
        Ok(self.audio.clone())
    }
}

#[derive(Debug, Default)]
pub struct FakeHandleState {
    pub playing: bool,
    pub stopped: bool,
    pub finished: bool,
    pub position: Duration,
    pub seeks: Vec<Duration>,
}

/// Audio output that decodes for real but plays nothing. Tests move the
/// playhead by editing the shared handle state.
#[derive(Default)]
pub struct FakeOutput {
    handles: Mutex<Vec<Arc<Mutex<FakeHandleState>>>>,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn handle(&self, index: usize) -> Arc<Mutex<FakeHandleState>> {
        self.handles.lock().unwrap()[index].clone()
    }
}

impl AudioOutput for FakeOutput {
    fn open(&self, audio: Vec<u8>) -> Result<Box<dyn AudioHandle>, String> {
        probe_duration(&audio)?;
        let state = Arc::new(Mutex::new(FakeHandleState {
            playing: true,
            ..FakeHandleState::default()
        }));
        self.handles.lock().unwrap().push(state.clone());
        Ok(Box::new(FakeHandle { state }))
    }
}

struct FakeHandle {
    state: Arc<Mutex<FakeHandleState>>,
}

impl AudioHandle for FakeHandle {
    fn play(&mut self) {
        self.state.lock().unwrap().playing = true;
    }

    fn pause(&mut self) {
        self.state.lock().unwrap().playing = false;
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.playing = false;
        state.stopped = true;
    }

    fn seek(&mut self, position: Duration) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        state.position = position;
        state.seeks.push(position);
        Ok(())
    }

    fn position(&self) -> Duration {
        self.state.lock().unwrap().position
    }

    fn is_finished(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.finished || state.stopped
    }
}
