//! Control endpoints for the live voice session.
//!
//! - `POST /api/v1/live/start`: acquire devices and begin connecting
//! - `POST /api/v1/live/stop`: end the session from our side
//! - `GET /api/v1/live/status`: current state, label and counters
//! - `GET /api/v1/live/transcript`: accumulated transcript entries

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// Start a session with the current configuration.
///
/// Responds as soon as the session is `connecting`; watch `/ws/live` or poll
/// `/live/status` for the switch to `active`.
pub async fn start_live(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();
    let snapshot = state.live.start(config).await?;
    state.increment_sessions_started();
    info!(session_id = ?snapshot.session_id, "Live session requested");

    Ok(HttpResponse::Accepted().json(json!({
        "status": "starting",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": snapshot
    })))
}

pub async fn stop_live(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = state.live.stop().await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "stopped",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": snapshot
    })))
}

pub async fn live_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = state.live.snapshot().await?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": snapshot
    })))
}

pub async fn live_transcript(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let entries = state.live.transcript().await?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": entries.len(),
        "entries": entries
    })))
}
