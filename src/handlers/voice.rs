//! Voice control endpoints.
//!
//! Thin wrappers around the shared `VoiceSession`: the session itself
//! decides whether a start is allowed, these only map the outcome to HTTP.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `POST /api/v1/voice/start`
///
/// Resolves once the microphone is open and the live service has accepted
/// the session. 409 if a session is already running, 503 if the device or
/// the service could not be reached.
pub async fn start_voice(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let settings = state.session_settings();
    let snapshot = state.voice.start(settings).await?;

    info!(session_id = ?snapshot.session_id, "Voice session started over HTTP");
    Ok(HttpResponse::Ok().json(json!({
        "status": "started",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": snapshot
    })))
}

/// `POST /api/v1/voice/stop`. Always succeeds.
pub async fn stop_voice(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.voice.stop().await;

    Ok(HttpResponse::Ok().json(json!({
        "status": "stopped",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.voice.snapshot()
    })))
}

/// `GET /api/v1/voice/status`
pub async fn voice_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.voice.snapshot()
    })))
}
