//! Route table shared by the main server, the optional standalone relay
//! listener and the integration tests.

use crate::{handlers, health, relay};
use actix_web::web;

/// HTTP API routes plus, when `relay_path` is given, the relay upgrade route.
pub fn configure(cfg: &mut web::ServiceConfig, relay_path: Option<&str>) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/config", web::get().to(handlers::get_config))
            .route("/config", web::put().to(handlers::update_config))
            .route("/voice/sessions", web::get().to(handlers::recent_sessions)),
    )
    .route("/health", web::get().to(health::health_check));

    if let Some(path) = relay_path {
        configure_relay(cfg, path);
    }
}

/// Only the relay upgrade route.
pub fn configure_relay(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.route(path, web::get().to(relay::gemini_voice));
}
