//! # Call Relay - Main Application Entry Point
//!
//! Bridges telephony media streams to a voice-AI streaming service, one call at a time,
//! and keeps a transcript of each conversation.
//!
//! ## Application Architecture:
//! - **config**: configuration from `config.toml` and environment variables
//! - **state**: shared state (configuration, call registry, counters)
//! - **handlers**: call-setup webhook
//! - **websocket**: the `/media-stream` actor that owns a call
//! - **call**: per-call state machine, registry and transcript
//! - **media** / **voice**: the two wire protocols and the voice service client
//! - **extraction**: post-call name/address extraction
//! - **health**: health endpoint
//! - **error**: error type and HTTP error responses

mod call;
mod config;
mod error;
mod extraction;
mod handlers;
mod health;
mod media;
mod state;
mod voice;
mod websocket;

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to close frames queued for voice connections before the server stops.
const UPSTREAM_CLOSE_GRACE: Duration = Duration::from_millis(250);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    // A missing voice credential stops us here, before anything is bound.
    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        voice_url = %config.voice.url,
        extraction = config.extraction_enabled(),
        "Configuration loaded: {}",
        config.bind_addr()
    );

    let app_state = AppState::new(config.clone()).map_err(|e| anyhow::anyhow!("{}", e))?;
    let registry = app_state.registry.clone();
    let bind_addr = config.bind_addr();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(TracingLogger::default())
            .route("/incoming-call", web::post().to(handlers::incoming_call_form))
            .route("/incoming-call", web::get().to(handlers::incoming_call_query))
            .route("/media-stream", web::get().to(websocket::media_stream))
            .route("/health", web::get().to(health::health_check))
    })
    .shutdown_timeout(config.server.shutdown_timeout_secs)
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
        _ = wait_for_shutdown() => {
            if !registry.is_empty() {
                info!(calls = ?registry.call_ids(), "Calls still active at shutdown");
            }
            let closed = registry.close_all_upstreams();
            info!(active_calls = registry.len(), closed_upstreams = closed, "Shutdown signal received, stopping server...");
            if closed > 0 {
                tokio::time::sleep(UPSTREAM_CLOSE_GRACE).await;
            }
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to `call_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialise tracing: {}", e))?;

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
