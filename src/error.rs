//! Error types for the narration pipeline.
//!
//! Summary failures never surface here: they are folded into the summary
//! table as readable text. Everything below is per-key and non-fatal.

use thiserror::Error;

use crate::playback::TransportState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("narration cache I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("narration cache is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to replace narration cache file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("narration cache writer did not finish: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum NarrationError {
    #[error("nothing to narrate for '{0}'")]
    EmptyText(String),

    #[error("synthesis request failed: {0}")]
    Request(String),

    #[error("synthesis service returned status {0}")]
    Status(u16),

    #[error("synthesis returned an empty audio payload")]
    EmptyPayload,

    #[error("audio decode failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("cannot {action} '{key}' while {state}")]
    InvalidTransition {
        key: String,
        action: &'static str,
        state: TransportState,
    },

    #[error("no playback session for '{0}'")]
    NoSession(String),

    #[error(transparent)]
    Narration(#[from] NarrationError),

    #[error("audio output unavailable: {0}")]
    Output(String),
}

#[derive(Debug, Error)]
pub enum SpotlightError {
    #[error("unknown period '{0}'")]
    UnknownPeriod(String),

    #[error("summary for '{0}' is not ready")]
    SummaryUnavailable(String),

    #[error(transparent)]
    Playback(#[from] PlaybackError),
}
