use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Config as shown to clients: the credential is replaced by a flag.
fn public_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": config.server,
        "live": {
            "endpoint": config.live.endpoint,
            "model": config.live.model,
            "system_instruction": config.live.system_instruction,
            "api_key_configured": !config.live.api_key.is_empty(),
            "connect_timeout_secs": config.live.connect_timeout_secs
        },
        "audio": config.audio,
        "websocket": config.websocket
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": public_view(&config)
    })))
}

/// Apply a partial update. Takes effect on the next voice session; fields
/// that are only read at startup are rejected with a 400.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(updated.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; applies to the next voice session",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": public_view(&updated)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::voice::{start_voice, stop_voice};
    use crate::state::tests::test_state;
    use crate::testing::ConnectBehavior;
    use actix_web::{http::StatusCode, test, App};
    use std::time::Duration;

    #[actix_web::test]
    async fn test_config_never_echoes_api_key() {
        let (state, _, _) = test_state(ConnectBehavior::Open);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"live": {"api_key": "secret-123"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert!(!String::from_utf8_lossy(&body).contains("secret-123"));
        assert_eq!(state.get_config().live.api_key, "secret-123");

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["live"]["api_key_configured"], true);
        assert!(body["config"]["live"].get("api_key").is_none());
    }

    #[actix_web::test]
    async fn test_invalid_update_is_rejected() {
        let (state, _, _) = test_state(ConnectBehavior::Open);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"audio": {"frame_size": 0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().audio.frame_size, 4096);
    }

    #[actix_web::test]
    async fn test_updated_live_settings_reach_next_connect() {
        let (state, _, transport) = test_state(ConnectBehavior::Open);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config))
                .route("/voice/start", web::post().to(start_voice))
                .route("/voice/stop", web::post().to(stop_voice)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"live": {
                "endpoint": "wss://staging.example/live",
                "api_key": "rotated-key",
                "connect_timeout_secs": 3
            }}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post().uri("/voice/start").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let setup = transport.last_setup().unwrap();
        assert_eq!(setup.endpoint, "wss://staging.example/live");
        assert_eq!(setup.api_key, "rotated-key");
        assert_eq!(setup.connect_timeout, Duration::from_secs(3));

        let req = test::TestRequest::post().uri("/voice/stop").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_device_change_needs_restart() {
        let (state, _, _) = test_state(ConnectBehavior::Open);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"audio": {"output_device": "Headphones"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().audio.output_device, "default");
    }
}
