use crate::audio::capture::{MODULE_PATH, PROCESSOR_NAME};
use crate::error::{AppError, AppResult};
use crate::{config::AppConfig, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Public view of the configuration. The credential itself never leaves the
/// process; only whether one is set.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "gemini": {
            "model": config.gemini.model,
            "endpoint": config.gemini.endpoint,
            "voice": config.gemini.voice,
            "system_instruction": config.gemini.system_instruction,
            "api_key_configured": config.has_credential()
        },
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "frame_samples": config.audio.frame_samples,
            "input_mime_type": config.audio.input_mime_type,
            "worklet": {
                "name": PROCESSOR_NAME,
                "module_path": MODULE_PATH
            }
        },
        "relay": {
            "enabled": config.relay.enabled,
            "path": config.relay.path,
            "port": config.relay.port,
            "greeting": config.relay.greeting,
            "max_connections": config.relay.max_connections,
            "heartbeat_interval_secs": config.relay.heartbeat_interval_secs,
            "client_timeout_secs": config.relay.client_timeout_secs,
            "recent_sessions": config.relay.recent_sessions
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};

    fn app_state() -> AppState {
        let mut config = AppConfig::default();
        config.gemini.api_key = Some("secret-key".to_string());
        AppState::new(config)
    }

    #[actix_web::test]
    async fn test_get_config_hides_credential() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = test::read_body(resp).await;
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("secret-key"));

        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["config"]["gemini"]["api_key_configured"], true);
        assert_eq!(value["config"]["audio"]["worklet"]["name"], "mic-processor");
        assert_eq!(
            value["config"]["audio"]["worklet"]["module_path"],
            "/audio-worklet/mic-processor.js"
        );
    }

    #[actix_web::test]
    async fn test_update_config() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "relay": { "greeting": "Hi!" }, "gemini": { "voice": "Kore" } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let config = state.get_config();
        assert_eq!(config.relay.greeting, "Hi!");
        assert_eq!(config.gemini.voice.as_deref(), Some("Kore"));
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(app_state()))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({ "relay": { "max_connections": 0 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
