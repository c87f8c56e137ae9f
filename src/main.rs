//! # Quest Voice - Server Entry Point
//!
//! Starts the HTTP server that hosts the Gemini voice relay.
//!
//! ## Listeners:
//! - **main**: `server.host:server.port`, serving the API routes and, unless
//!   a separate relay port is configured, the relay route
//! - **relay** (optional): `server.host:relay.port`, serving only the relay
//!   route. A bind failure here is logged and the main listener keeps going
//!   without the relay.
//!
//! ## Startup order:
//! 1. `.env` is loaded, then tracing is initialized
//! 2. Configuration is loaded and validated
//! 3. The upstream provider is built; a missing credential is not fatal
//! 4. Listeners are bound and run until SIGINT/SIGTERM

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use quest_voice::config::AppConfig;
use quest_voice::relay::GeminiLiveProvider;
use quest_voice::state::AppState;
use quest_voice::{middleware, routes};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a shutdown signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let mut app_state = AppState::new(config.clone());
    match GeminiLiveProvider::from_config(&config.gemini) {
        Ok(provider) => {
            info!(model = %config.gemini.model, "Gemini Live provider ready");
            app_state = app_state.with_provider(Arc::new(provider));
        }
        Err(e) => warn!("{}: relay clients will be told the credential is missing", e),
    }

    let relay_path = config.relay.path.clone();
    let separate_relay = config
        .relay
        .port
        .filter(|port| *port != config.server.port);

    setup_signal_handlers();

    let relay_handle = match separate_relay {
        Some(port) => start_relay_listener(&app_state, &config.server.host, port, &relay_path),
        None => None,
    };

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);
    if separate_relay.is_none() {
        info!("Voice relay at ws://{}{}", bind_addr, relay_path);
    }

    let main_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let relay_route = if separate_relay.is_none() {
            Some(relay_path.clone())
        } else {
            None
        };

        App::new()
            .app_data(web::Data::new(main_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(|cfg| routes::configure(cfg, relay_route.as_deref()))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    if let Some(handle) = relay_handle {
        handle.stop(true).await;
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Bind the standalone relay listener. Returns `None` (after logging) when
/// the port cannot be bound.
fn start_relay_listener(
    app_state: &AppState,
    host: &str,
    port: u16,
    path: &str,
) -> Option<actix_web::dev::ServerHandle> {
    let relay_addr = format!("{}:{}", host, port);
    let state = app_state.clone();
    let path = path.to_string();

    let server = HttpServer::new(move || {
        let path = path.clone();
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(TracingLogger::default())
            .configure(move |cfg| routes::configure_relay(cfg, &path))
    })
    .bind(&relay_addr);

    match server {
        Ok(server) => {
            let server = server.run();
            let handle = server.handle();
            tokio::spawn(async move {
                if let Err(e) = server.await {
                    error!("Relay listener error: {}", e);
                }
            });
            info!("Voice relay listening on {}", relay_addr);
            Some(handle)
        }
        Err(e) => {
            warn!("Voice relay could not bind {}: {}; continuing without it", relay_addr, e);
            None
        }
    }
}

/// `RUST_LOG` controls filtering; defaults to `quest_voice=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quest_voice=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Flip [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let signals = (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        );

        match signals {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            _ => {
                warn!("Could not install signal handlers, falling back to Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
