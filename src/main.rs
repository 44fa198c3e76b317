//! # ASR Gateway - Main Application Entry Point
//!
//! Real-time transcription gateway: clients stream audio over a WebSocket at
//! `/asr` and receive transcription events as JSON while they speak.
//!
//! ## Application Architecture:
//! - **config**: configuration (defaults, optional config.toml, environment)
//! - **device**: picks the compute device for the model
//! - **engine**: the shared transcription engine and per-session pipelines
//! - **session**: the streaming session core (coordinator, processor, relay)
//! - **websocket**: the `/asr` endpoint and the actor bridging actix to a session
//! - **state**: admission control and counters
//! - **health**: `/health` and `/metrics`
//! - **middleware**: request logging and request metrics
//! - **error**: error types and HTTP error responses
//!
//! ## Startup Order:
//! The model is loaded before the listener binds, so the server never accepts
//! a connection it cannot serve. A model that fails to load aborts startup.

mod config;
mod device;
mod engine;
mod error;
mod health;
mod middleware;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use engine::whisper::WhisperEngine;
use session::{SessionCoordinator, SessionSettings};
use state::AppState;
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting asr-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.engine.model,
        language = %config.engine.language,
        diarization = config.engine.diarization,
        device = %config.engine.device,
        "Loading transcription engine"
    );

    let engine = WhisperEngine::load(&config.engine).await.map_err(|e| {
        error!("Failed to load transcription engine: {:#}", e);
        e
    })?;
    let coordinator = SessionCoordinator::new(Arc::new(engine), SessionSettings::from(&config.session));

    let app_state = web::Data::new(AppState::new(config.clone()));
    let coordinator = web::Data::new(coordinator);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // The service sits behind browsers on arbitrary origins.
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .app_data(coordinator.clone())
            // Middleware runs in reverse order of registration for requests.
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::metrics))
            .route("/asr", web::get().to(websocket::asr_endpoint))
    })
    .disable_signals()
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
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            // Graceful: open sessions get the workers' shutdown timeout to finish.
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging.
///
/// `RUST_LOG` controls the filter; it defaults to
/// `asr_gateway=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asr_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C only on non-Unix targets).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    }
}
