//! Narration synthesis with a durable per-period cache.
//!
//! A period key is synthesized at most once for the lifetime of the cache
//! file: hits are served from memory (pre-loaded from disk at startup), and
//! concurrent misses for the same key share one request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::audio::probe_duration;
use crate::config::{BackendConfig, NarrationConfig};
use crate::error::{NarrationError, StoreError};
use crate::period::{Granularity, Period};
use crate::store::{CacheEntry, NarrationStore};

/// Lets the backend cache on its side too.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheCorrelation {
    pub user_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub granularity: Granularity,
}

impl CacheCorrelation {
    pub fn for_period(user_id: &str, period: &Period) -> Self {
        Self {
            user_id: user_id.to_string(),
            period_start: period.start,
            period_end: period.end,
            granularity: period.granularity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeechRequest {
    pub text: String,
    pub voice_id: String,
    pub model_id: String,
    #[serde(flatten)]
    pub correlation: Option<CacheCorrelation>,
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Raw encoded audio for `request.text`.
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>, NarrationError>;
}

pub struct HttpSpeechClient {
    url: String,
    api_key: String,
    client: Client,
}

impl HttpSpeechClient {
    pub fn new(backend: &BackendConfig, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            url: backend.tts_url(),
            api_key: backend.api_key.clone(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechClient {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>, NarrationError> {
        let mut builder = self.client.post(&self.url).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| NarrationError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NarrationError::Status(resp.status().as_u16()));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| NarrationError::Request(e.to_string()))?;
        if bytes.is_empty() {
            return Err(NarrationError::EmptyPayload);
        }
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NarrationTrack {
    /// Base64 audio bytes, exactly as persisted.
    pub payload: String,
    pub duration: f64,
}

impl NarrationTrack {
    /// Decode once for the authoritative duration, then encode for storage.
    pub fn from_audio(audio: &[u8]) -> Result<Self, NarrationError> {
        let duration = probe_duration(audio).map_err(NarrationError::Decode)?;
        Ok(Self {
            payload: STANDARD.encode(audio),
            duration,
        })
    }

    pub fn audio(&self) -> Result<Vec<u8>, NarrationError> {
        STANDARD
            .decode(&self.payload)
            .map_err(|e| NarrationError::Decode(format!("payload is not base64: {e}")))
    }
}

impl From<CacheEntry> for NarrationTrack {
    fn from(entry: CacheEntry) -> Self {
        Self {
            payload: entry.payload,
            duration: entry.duration,
        }
    }
}

pub struct NarrationSynthesizer {
    backend: Arc<dyn SpeechBackend>,
    store: NarrationStore,
    tracks: Mutex<HashMap<String, NarrationTrack>>,
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    voice_id: String,
    model_id: String,
}

impl NarrationSynthesizer {
    /// Loads every persisted track up front. An unreadable cache file is
    /// logged and treated as empty.
    pub fn new(backend: Arc<dyn SpeechBackend>, store: NarrationStore, config: &NarrationConfig) -> Self {
        let tracks: HashMap<String, NarrationTrack> = match store.load() {
            Ok(entries) => entries.into_iter().map(|(k, e)| (k, e.into())).collect(),
            Err(e) => {
                warn!("Ignoring narration cache {}: {e}", store.path().display());
                HashMap::new()
            }
        };
        info!(
            "Narration cache: {} tracks from {}",
            tracks.len(),
            store.path().display()
        );

        Self {
            backend,
            store,
            tracks: Mutex::new(tracks),
            inflight: Mutex::new(HashMap::new()),
            voice_id: config.voice_id.clone(),
            model_id: config.model_id.clone(),
        }
    }

    pub fn cached(&self, key: &str) -> Option<NarrationTrack> {
        self.tracks().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.tracks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks().is_empty()
    }

    /// Drop a track from memory and disk so the next play re-synthesizes.
    pub fn forget(&self, key: &str) -> Result<bool, StoreError> {
        let in_memory = self.tracks().remove(key).is_some();
        let on_disk = self.store.remove(key)?;
        Ok(in_memory || on_disk)
    }

    /// Cached track for `key`, or synthesize, measure and persist one.
    ///
    /// Nothing is cached or written when any step fails.
    pub async fn play_or_synthesize(
        &self,
        key: &str,
        text: &str,
        correlation: Option<CacheCorrelation>,
    ) -> Result<NarrationTrack, NarrationError> {
        if let Some(track) = self.cached(key) {
            debug!("Narration cache hit for {key}");
            return Ok(track);
        }

        let gate = self.gate(key);
        let _guard = gate.lock().await;
        // Another caller may have finished while we waited.
        if let Some(track) = self.cached(key) {
            return Ok(track);
        }

        if text.trim().is_empty() {
            return Err(NarrationError::EmptyText(key.to_string()));
        }

        let request = SpeechRequest {
            text: text.to_string(),
            voice_id: self.voice_id.clone(),
            model_id: self.model_id.clone(),
            correlation,
        };

        info!("Synthesizing narration for {key} ({} chars)", text.len());
        let t_start = Instant::now();
        let audio = self.backend.synthesize(&request).await.map_err(|e| {
            warn!("Synthesis for {key} failed: {e}");
            e
        })?;
        let synth_ms = t_start.elapsed().as_secs_f64() * 1000.0;

        let track = NarrationTrack::from_audio(&audio).map_err(|e| {
            warn!("Synthesized audio for {key} did not decode: {e}");
            e
        })?;

        // The store takes a file lock another process may hold.
        let store = self.store.clone();
        let entry = CacheEntry::new(track.payload.clone(), track.duration);
        let owned_key = key.to_string();
        let evicted = tokio::task::spawn_blocking(move || store.put(&owned_key, entry))
            .await
            .map_err(StoreError::from)??;

        {
            let mut tracks = self.tracks();
            for old in &evicted {
                tracks.remove(old);
            }
            tracks.insert(key.to_string(), track.clone());
        }
        // Later callers hit the cache before reaching the gate.
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if !evicted.is_empty() {
            info!("Evicted {} narration(s) to stay within capacity", evicted.len());
        }
        info!(
            "Narration for {key} ready: {:.1}s audio, {} bytes, {synth_ms:.0}ms",
            track.duration,
            audio.len()
        );

        Ok(track)
    }

    fn gate(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn tracks(&self) -> MutexGuard<'_, HashMap<String, NarrationTrack>> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
