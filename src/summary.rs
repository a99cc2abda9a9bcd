//! Per-period summary cache.
//!
//! `ensure_summaries` keeps at most one summary request in flight per period
//! and never requests a summary for a period that is still open. Failures are
//! stored as readable text and never retried on their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::period::{Granularity, Message, PeriodGroup};

const AWAITING_CLOSE_TEXT: &str = "Summary will be available after this period closes.";

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRequest {
    pub user_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub granularity: Granularity,
    pub message_count: usize,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummaryResponse {
    pub summary: String,
    #[serde(default)]
    pub cached: bool,
}

/// Summary generation service. Errors are human-readable diagnostics.
#[async_trait]
pub trait SummaryBackend: Send + Sync {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse, String>;
}

pub struct HttpSummaryClient {
    url: String,
    api_key: String,
    client: Client,
}

impl HttpSummaryClient {
    /// No client-level timeout: the summarizer bounds each request itself.
    pub fn new(config: &BackendConfig) -> reqwest::Result<Self> {
        Ok(Self {
            url: config.summary_url(),
            api_key: config.api_key.clone(),
            client: Client::builder().build()?,
        })
    }
}

#[async_trait]
impl SummaryBackend for HttpSummaryClient {
    async fn summarize(&self, request: &SummaryRequest) -> Result<SummaryResponse, String> {
        let mut builder = self.client.post(&self.url).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_connect() {
                format!("Cannot connect to summary service at {}", self.url)
            } else {
                format!("Summary request failed: {e}")
            }
        })?;

        if !resp.status().is_success() {
            return Err(format!("Summary service returned status {}", resp.status()));
        }

        resp.json::<SummaryResponse>()
            .await
            .map_err(|e| format!("Failed to parse summary response: {e}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryState {
    Loading,
    Ready,
    Failed,
    /// The period is still open; nothing was requested.
    AwaitingClose,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub text: String,
    pub cached: bool,
    pub loading: bool,
    pub state: SummaryState,
}

impl Summary {
    fn loading() -> Self {
        Self {
            text: String::new(),
            cached: false,
            loading: true,
            state: SummaryState::Loading,
        }
    }

    fn ready(text: String, cached: bool) -> Self {
        Self {
            text,
            cached,
            loading: false,
            state: SummaryState::Ready,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            text: message,
            cached: false,
            loading: false,
            state: SummaryState::Failed,
        }
    }

    fn awaiting_close() -> Self {
        Self {
            text: AWAITING_CLOSE_TEXT.into(),
            cached: false,
            loading: false,
            state: SummaryState::AwaitingClose,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SummaryState::Ready
    }
}

type SummaryTable = HashMap<String, Summary>;

fn lock(table: &Mutex<SummaryTable>) -> MutexGuard<'_, SummaryTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct PeriodSummarizer {
    backend: Arc<dyn SummaryBackend>,
    summaries: Arc<Mutex<SummaryTable>>,
    // Bumped by `clear`; results from an older generation are dropped.
    generation: Arc<AtomicU64>,
    user_id: String,
    timeout: Duration,
}

impl PeriodSummarizer {
    pub fn new(backend: Arc<dyn SummaryBackend>, user_id: &str, timeout: Duration) -> Self {
        Self {
            backend,
            summaries: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            user_id: user_id.to_string(),
            timeout,
        }
    }

    /// Dispatch a fetch for every closed period that has no summary yet.
    ///
    /// Safe to call on every re-render: a period that is loading, ready or
    /// failed is skipped. The returned handles resolve once each dispatched
    /// fetch has written its result.
    pub fn ensure_summaries(&self, groups: &[PeriodGroup]) -> Vec<JoinHandle<()>> {
        self.ensure_summaries_at(groups, Utc::now().date_naive())
    }

    pub fn ensure_summaries_at(&self, groups: &[PeriodGroup], today: NaiveDate) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for group in groups {
            let key = group.period.key();
            {
                // Check and mark under one lock, with no await in between.
                let mut table = lock(&self.summaries);
                if group.period.is_open(today) {
                    table.entry(key.clone()).or_insert_with(Summary::awaiting_close);
                    debug!("Skipping summary for open period {key}");
                    continue;
                }
                match table.get(&key).map(|s| s.state) {
                    None | Some(SummaryState::AwaitingClose) => {}
                    Some(_) => continue,
                }
                table.insert(key.clone(), Summary::loading());
            }
            handles.push(self.dispatch(key, group));
        }
        handles
    }

    /// Manual retry. Only a failed summary is re-requested.
    pub fn retry(&self, group: &PeriodGroup) -> Option<JoinHandle<()>> {
        let key = group.period.key();
        {
            let mut table = lock(&self.summaries);
            if table.get(&key).map(|s| s.state) != Some(SummaryState::Failed) {
                return None;
            }
            table.insert(key.clone(), Summary::loading());
        }
        info!("Retrying summary for {key}");
        Some(self.dispatch(key, group))
    }

    pub fn get(&self, key: &str) -> Option<Summary> {
        lock(&self.summaries).get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, Summary> {
        lock(&self.summaries).clone()
    }

    /// Forget every summary, e.g. when the period set changes.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.summaries).clear();
    }

    fn dispatch(&self, key: String, group: &PeriodGroup) -> JoinHandle<()> {
        let request = SummaryRequest {
            user_id: self.user_id.clone(),
            period_start: group.period.start,
            period_end: group.period.end,
            granularity: group.period.granularity,
            message_count: group.messages.len(),
            messages: group.messages.clone(),
        };
        let backend = self.backend.clone();
        let summaries = self.summaries.clone();
        let generation = self.generation.clone();
        let dispatched_in = generation.load(Ordering::SeqCst);
        let timeout = self.timeout;

        debug!("Requesting summary for {key} ({} messages)", request.message_count);

        tokio::spawn(async move {
            let t_start = Instant::now();
            let summary = match tokio::time::timeout(timeout, backend.summarize(&request)).await {
                Ok(Ok(resp)) => {
                    info!(
                        "Summary for {key} ready ({} chars, cached={}, {:.0}ms)",
                        resp.summary.len(),
                        resp.cached,
                        t_start.elapsed().as_secs_f64() * 1000.0
                    );
                    Summary::ready(resp.summary, resp.cached)
                }
                Ok(Err(message)) => {
                    warn!("Summary for {key} failed: {message}");
                    Summary::failed(message)
                }
                Err(_) => {
                    warn!("Summary for {key} timed out after {timeout:?}");
                    Summary::failed(format!("Summary request timed out after {timeout:?}"))
                }
            };

            if generation.load(Ordering::SeqCst) != dispatched_in {
                debug!("Discarding stale summary for {key}");
                return;
            }
            lock(&summaries).insert(key, summary);
        })
    }
}
