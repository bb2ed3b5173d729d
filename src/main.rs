//! # Mantra Pulse - Voice Pipeline Daemon
//!
//! Owns the microphone, the speaker and the streaming connection to the
//! generative AI service, and lets a UI drive a single voice session over
//! HTTP and a WebSocket.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: capture, network and playback all run concurrently on tokio
//! - **traits as seams**: devices and the live service sit behind traits so
//!   tests can swap in fakes
//! - **Arc**: one `VoiceSession` shared by every handler
//! - **static AtomicBool**: process-wide shutdown flag set by the signal handler
//!
//! ## Application Architecture:
//! - **audio**: codec, capture framing, gapless playback scheduling, mixing
//! - **device**: picks the real (cpal) or detached audio devices
//! - **transport**: the live WebSocket protocol
//! - **session**: the voice session state machine
//! - **config / state / error**: configuration, shared state, error types
//! - **handlers / websocket / health / middleware**: the HTTP surface

mod audio;       // Audio pipeline (audio/ directory)
mod config;      // Configuration management (config.rs)
mod device;      // Audio device selection (device.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Request metrics (middleware/ directory)
mod session;     // Voice session state machine (session.rs)
mod state;       // Application state management (state.rs)
mod transport;   // Live service connection (transport/ directory)
mod websocket;   // UI websocket (websocket.rs)

#[cfg(test)]
mod testing;     // In-memory devices and transport for tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio::playback::PlaybackScheduler;
use config::AppConfig;
use device::AudioDevices;
use session::VoiceSession;
use state::AppState;
use transport::GeminiLiveTransport;

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from defaults, `config.toml` and the environment
/// 2. **Opens the audio devices** (falling back to detached ones)
/// 3. **Creates the voice session** and the shared application state
/// 4. **Serves HTTP and the UI websocket** until a shutdown signal
/// 5. **Stops the voice session** so the microphone and connection are released
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;
    transport::gemini::install_crypto_provider();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.live.api_key.is_empty() {
        warn!("No API key configured; the live service will likely refuse connections");
    }

    let devices = match AudioDevices::from_config(&config.audio) {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Audio devices unavailable ({}), running detached", e);
            AudioDevices::detached(config.audio.playback_sample_rate)
        }
    };
    info!("Microphone: {}", devices.input.describe());

    let scheduler = Arc::new(PlaybackScheduler::new(devices.output.clone()));
    let voice = Arc::new(VoiceSession::new(
        devices.input.clone(),
        Arc::new(GeminiLiveTransport::new()),
        scheduler,
        config.websocket.event_capacity,
    ));

    let app_state = AppState::new(config.clone(), voice.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs bottom-up for requests
            .wrap(middleware::RequestMetrics)
            .wrap(TracingLogger::default())
            .wrap(cors)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .service(
                        web::scope("/voice")
                            .route("/start", web::post().to(handlers::start_voice))
                            .route("/stop", web::post().to(handlers::stop_voice))
                            .route("/status", web::get().to(handlers::voice_status)),
                    ),
            )
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .route("/health", web::get().to(health::health_check))
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Release the microphone and the live connection before exiting
    voice.stop().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` controls the filter; without it the pipeline logs at debug and
/// actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mantra_pulse=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGINT/SIGTERM on a background task and raise the shutdown flag.
///
/// ## Rust Concepts:
/// - **tokio::select!**: whichever signal arrives first wins
/// - **Ordering::SeqCst**: the store is visible to every thread polling the flag
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Resolve once the shutdown flag is raised.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
