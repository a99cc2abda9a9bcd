//! Local HTTP control API for a Spotlight view.
//!
//! The dashboard shell talks to this instead of linking the crate:
//! load messages, list period cards, and drive per-card transport.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{PlaybackError, SpotlightError};
use crate::period::{Granularity, Message};
use crate::playback::SessionSnapshot;
use crate::spotlight::{PeriodCard, Spotlight};

#[derive(Clone)]
pub struct ApiState {
    pub spotlight: Arc<Spotlight>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct LoadMessagesRequest {
    #[serde(default)]
    granularity: Option<Granularity>,
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct SeekRequest {
    percent: f64,
}

#[derive(Serialize)]
struct StatusResponse {
    granularity: Granularity,
    periods: usize,
    playing: usize,
    cached_narrations: usize,
}

#[derive(Serialize)]
struct ActionResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    playback: Option<SessionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ActionResponse {
    fn ok(status: &str, playback: Option<SessionSnapshot>) -> Self {
        Self {
            status: status.into(),
            playback,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            playback: None,
            error: Some(message.into()),
        }
    }
}

type ActionResult = (StatusCode, Json<ActionResponse>);

fn respond(status: &str, result: Result<SessionSnapshot, SpotlightError>) -> ActionResult {
    match result {
        Ok(snapshot) => (StatusCode::OK, Json(ActionResponse::ok(status, Some(snapshot)))),
        Err(e) => {
            let code = match &e {
                SpotlightError::UnknownPeriod(_) | SpotlightError::Playback(PlaybackError::NoSession(_)) => {
                    StatusCode::NOT_FOUND
                }
                SpotlightError::SummaryUnavailable(_)
                | SpotlightError::Playback(PlaybackError::InvalidTransition { .. }) => StatusCode::CONFLICT,
                SpotlightError::Playback(_) => StatusCode::BAD_GATEWAY,
            };
            warn!("{status} failed: {e}");
            (code, Json(ActionResponse::err(e.to_string())))
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/messages", post(handle_load_messages))
        .route("/periods", get(handle_periods))
        .route("/periods/{key}/retry", post(handle_retry))
        .route("/periods/{key}/play", post(handle_play))
        .route("/periods/{key}/pause", post(handle_pause))
        .route("/periods/{key}/stop", post(handle_stop))
        .route("/periods/{key}/seek", post(handle_seek))
        .with_state(state)
}

/// Start the control API as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) -> Option<JoinHandle<()>> {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind control API on {addr}: {e}");
            return None;
        }
    };
    info!("Control API listening on {addr}");

    Some(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Control API server error: {e}");
        }
    }))
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let spotlight = &state.spotlight;
    Json(StatusResponse {
        granularity: spotlight.granularity(),
        periods: spotlight.cards().len(),
        playing: spotlight.playback().playing_count(),
        cached_narrations: spotlight.cached_narrations(),
    })
}

async fn handle_load_messages(
    State(state): State<ApiState>,
    Json(req): Json<LoadMessagesRequest>,
) -> Json<Vec<PeriodCard>> {
    info!("HTTP /messages: {} messages", req.messages.len());
    // Summaries land in the background; cards show them as loading.
    state.spotlight.load(req.messages, req.granularity);
    Json(state.spotlight.cards())
}

async fn handle_periods(State(state): State<ApiState>) -> Json<Vec<PeriodCard>> {
    state.spotlight.refresh();
    Json(state.spotlight.cards())
}

async fn handle_retry(State(state): State<ApiState>, Path(key): Path<String>) -> ActionResult {
    match state.spotlight.retry(&key) {
        Ok(Some(_)) => (StatusCode::OK, Json(ActionResponse::ok("retrying", None))),
        Ok(None) => (StatusCode::OK, Json(ActionResponse::ok("unchanged", None))),
        Err(e) => (StatusCode::NOT_FOUND, Json(ActionResponse::err(e.to_string()))),
    }
}

async fn handle_play(State(state): State<ApiState>, Path(key): Path<String>) -> ActionResult {
    respond("play", state.spotlight.play(&key).await)
}

async fn handle_pause(State(state): State<ApiState>, Path(key): Path<String>) -> ActionResult {
    respond("pause", state.spotlight.pause(&key))
}

async fn handle_stop(State(state): State<ApiState>, Path(key): Path<String>) -> ActionResult {
    respond("stop", state.spotlight.stop(&key))
}

async fn handle_seek(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(req): Json<SeekRequest>,
) -> ActionResult {
    respond("seek", state.spotlight.seek(&key, req.percent))
}
