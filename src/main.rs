//! # Viseme Relay - Main Application Entry Point
//!
//! A websocket relay between browser clients and a realtime conversational
//! endpoint, with optional lip-sync animation derived from the assistant's
//! voice.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the server, every session and every upstream socket are asynchronous
//! - **actors**: each client connection is one actix actor owning one relay session
//! - **Result<T, E>**: startup failures propagate to `main` through `anyhow`
//! - **static**: the shutdown flag lives for the whole program
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared state, the session registry and aggregate metrics
//! - **gateway**: admits or rejects inbound websocket connections
//! - **websocket**: the per-connection session actor
//! - **relay**: session state machine, event decoding, upstream connection
//! - **audio**: PCM16 framing and spectrum analysis
//! - **animation**: viseme scheduling and the per-session lip-sync pipeline
//! - **health / handlers / middleware**: the small HTTP surface beside the relay
//! - **error**: HTTP-facing and relay-internal error types

mod animation;
mod audio;
mod config;
mod error;
mod gateway;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup:
/// 1. Read `.env`, install logging
/// 2. Load and validate configuration
/// 3. Build the shared state (registry, metrics, upstream connector)
/// 4. Serve the HTTP surface with the relay as the default service
///
/// ## Shutdown:
/// Stop accepting, ask every live session to close both of its sides, then
/// stop the HTTP server gracefully.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting viseme-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        path = %config.relay.path,
        upstream = %config.relay.upstream_url,
        model = %config.relay.model,
        "Configuration loaded"
    );
    if config.animation.enabled {
        info!(mode = ?config.animation.mode, boundary = ?config.animation.boundary, "Lip-sync enabled");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            // Everything else is a relay connection attempt
            .default_service(web::to(gateway::accept))
    })
    .workers(config.server.workers)
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, closing sessions...");
            app_state.shutdown_all();
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` controls the filter; the default is
/// `viseme_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "viseme_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Flip `SHUTDOWN_SIGNAL` on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()),
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
