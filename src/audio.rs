//! Audio decode and playback.
//!
//! `AudioOutput` opens a playable handle from encoded bytes; `AudioHandle` is
//! the transport surface the playback controller drives. The rodio backend
//! keeps its `OutputStream` on a dedicated thread and hands sinks the mixer.

use std::io::Cursor;
use std::sync::mpsc;
use std::time::Duration;

use rodio::mixer::Mixer;
use rodio::{Decoder, OutputStreamBuilder, Sink, Source};
use tracing::{debug, info};

/// One decodable audio instance, exclusively owned by a playback session.
pub trait AudioHandle: Send {
    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    fn seek(&mut self, position: Duration) -> Result<(), String>;
    fn position(&self) -> Duration;
    /// True once the source has played out (or was stopped).
    fn is_finished(&self) -> bool;
}

pub trait AudioOutput: Send + Sync {
    /// Decode `audio` and start playing it from the beginning.
    fn open(&self, audio: Vec<u8>) -> Result<Box<dyn AudioHandle>, String>;
}

/// Decode once to measure duration in seconds.
///
/// Uses the container's own length when it has one, otherwise counts frames.
pub fn probe_duration(audio: &[u8]) -> Result<f64, String> {
    let decoder = Decoder::new(Cursor::new(audio.to_vec()))
        .map_err(|e| format!("unrecognised audio payload: {e}"))?;

    if let Some(total) = decoder.total_duration() {
        return Ok(total.as_secs_f64());
    }

    let rate = decoder.sample_rate() as f64;
    let channels = decoder.channels() as f64;
    if rate <= 0.0 || channels <= 0.0 {
        return Err("audio payload has no sample rate or channels".into());
    }
    let samples = decoder.count();
    if samples == 0 {
        return Err("audio payload contains no frames".into());
    }
    Ok(samples as f64 / (rate * channels))
}

pub struct RodioOutput {
    mixer: Mixer,
    // Dropping this ends the thread that owns the OutputStream.
    _keepalive: mpsc::Sender<()>,
}

impl RodioOutput {
    pub fn open_default() -> Result<Self, String> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<Mixer, String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("spotlight-audio".into())
            .spawn(move || match OutputStreamBuilder::open_default_stream() {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(stream.mixer().clone()));
                    // Blocks until the sender is dropped.
                    let _ = stop_rx.recv();
                    debug!("Closing audio output stream");
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("Failed to open audio output: {e}")));
                }
            })
            .map_err(|e| format!("Failed to spawn audio thread: {e}"))?;

        let mixer = ready_rx
            .recv()
            .map_err(|_| "audio thread exited before opening output".to_string())??;
        info!("Audio output ready");

        Ok(Self {
            mixer,
            _keepalive: stop_tx,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn open(&self, audio: Vec<u8>) -> Result<Box<dyn AudioHandle>, String> {
        let source = Decoder::new(Cursor::new(audio))
            .map_err(|e| format!("unrecognised audio payload: {e}"))?;
        let sink = Sink::connect_new(&self.mixer);
        sink.append(source);
        Ok(Box::new(RodioHandle { sink }))
    }
}

struct RodioHandle {
    sink: Sink,
}

impl AudioHandle for RodioHandle {
    fn play(&mut self) {
        self.sink.play();
    }

    fn pause(&mut self) {
        self.sink.pause();
    }

    fn stop(&mut self) {
        self.sink.stop();
    }

    fn seek(&mut self, position: Duration) -> Result<(), String> {
        self.sink
            .try_seek(position)
            .map_err(|e| format!("seek failed: {e}"))
    }

    fn position(&self) -> Duration {
        self.sink.get_pos()
    }

    fn is_finished(&self) -> bool {
        self.sink.empty()
    }
}
