use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Recently finished relay connections, newest first.
pub async fn recent_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.recent_sessions.snapshot();
    let metrics = state.get_metrics_snapshot();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_sessions": metrics.active_sessions,
        "capacity": state.recent_sessions.capacity(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::recent::SessionSummary;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_lists_recorded_sessions() {
        let state = AppState::new(AppConfig::default());
        let now = chrono::Utc::now();
        state.recent_sessions.record(SessionSummary {
            id: "conn-1".to_string(),
            opened_at: now,
            closed_at: now,
            upstream_opened: true,
            frames_forwarded: 12,
            events_relayed: 3,
            close_reason: Some("client disconnected".to_string()),
        });

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/sessions", web::get().to(recent_sessions)),
        )
        .await;

        let req = test::TestRequest::get().uri("/sessions").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["id"], "conn-1");
        assert_eq!(body["sessions"][0]["frames_forwarded"], 12);
    }
}
