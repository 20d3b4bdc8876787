//! # Live Voice Backend - Main Application Entry Point
//!
//! Hosts one live voice session against the Gemini Live service and exposes
//! it over HTTP and WebSocket.
//!
//! ## Application Architecture:
//! - **config**: application configuration (TOML files + environment variables)
//! - **audio**: codec, outbound streaming, gapless playback, session state machine
//! - **transport**: duplex connection to the remote model
//! - **devices**: microphone/speaker backends (WAV files, or the sound card)
//! - **state**: shared application state and request metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and metrics
//! - **handlers**: HTTP handlers for configuration and session control
//! - **websocket**: observer channel for status and transcript
//! - **error**: error types and HTTP error responses

mod audio;
mod config;
mod devices;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod transport;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::controller::LiveController;
use audio::session::LiveSession;
use config::AppConfig;
use devices::ConfiguredDevices;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::gemini::GeminiLiveTransport;

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.live.model,
        devices = %config.devices.backend,
        "Configuration loaded"
    );
    if config.live.api_key.is_none() {
        warn!("No API key configured; sessions will fail until one is set");
    }

    let (session, inbox) = LiveSession::new(
        Box::new(ConfiguredDevices),
        Box::new(GeminiLiveTransport::new()),
    );
    let (live, controller_task) = LiveController::spawn(session, inbox);

    let app_state = web::Data::new(AppState::new(config.clone(), live.clone()));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .service(
                        web::scope("/live")
                            .route("/start", web::post().to(handlers::start_live))
                            .route("/stop", web::post().to(handlers::stop_live))
                            .route("/status", web::get().to(handlers::live_status))
                            .route("/transcript", web::get().to(handlers::live_transcript)),
                    ),
            )
            .route("/ws/live", web::get().to(websocket::live_websocket))
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(handlers::not_found))
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

    // Release the microphone and close the remote session before exiting
    if let Err(e) = live.shutdown().await {
        warn!("Live controller already gone: {}", e);
    }
    if let Err(e) = controller_task.await {
        error!("Live controller task failed: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, defaulting to
/// `live_voice_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGTERM or SIGINT. If the Unix handlers cannot be installed,
/// falls back to Ctrl+C alone.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to install signal handlers: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}
