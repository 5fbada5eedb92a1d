//! # Voice Session Engine - Main Application Entry Point
//!
//! Runs one full-duplex voice session between the local microphone/speaker and a
//! remote conversational agent, controlled over a small HTTP + WebSocket API.
//!
//! ## Application Architecture:
//! - **session**: the engine actor (connect, disconnect, text, status)
//! - **audio**: capture, codec, gapless playback and the cpal device backend
//! - **transport**: the WebSocket link to the live agent endpoint
//! - **handlers / websocket**: the control surface for UIs
//! - **config / state / error**: configuration, shared state, HTTP error mapping

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_session_engine::audio::AudioBackend;
use voice_session_engine::config::AppConfig;
use voice_session_engine::session::{EngineSettings, FixedLocation, VoiceEngine};
use voice_session_engine::state::AppState;
use voice_session_engine::transport::LiveTransport;
use voice_session_engine::{handlers, health, websocket};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-session-engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.transport.api_key.trim().is_empty() {
        info!("No API key configured; connection attempts will report a missing credential");
    }

    let engine = VoiceEngine::spawn(
        EngineSettings::from_config(&config),
        audio_backend(&config)?,
        Arc::new(LiveTransport::new(config.transport.endpoint.clone())),
        Arc::new(FixedLocation(config.session.user_location.coordinates())),
    );

    let app_state = AppState::new(config.clone(), engine.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/connect", web::post().to(handlers::connect))
                    .route("/session/disconnect", web::post().to(handlers::disconnect))
                    .route("/session/text", web::post().to(handlers::send_text)),
            )
            .route("/ws/session", web::get().to(websocket::session_websocket))
            .route("/health", web::get().to(health::health_check))
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
        _ = wait_for_shutdown(shutdown) => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    if let Err(e) = engine.shutdown().await {
        error!("Voice engine did not shut down cleanly: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

#[cfg(feature = "native-audio")]
fn audio_backend(config: &AppConfig) -> Result<Arc<dyn AudioBackend>> {
    use voice_session_engine::audio::native::NativeAudio;

    Ok(Arc::new(NativeAudio::new(
        config.audio.input_device_name(),
        config.audio.output_device_name(),
    )))
}

#[cfg(not(feature = "native-audio"))]
fn audio_backend(_config: &AppConfig) -> Result<Arc<dyn AudioBackend>> {
    Err(anyhow::anyhow!(
        "built without the `native-audio` feature; no audio devices are available"
    ))
}

/// Initialize structured logging.
///
/// `RUST_LOG` controls what gets logged; defaults to
/// "voice_session_engine=debug,actix_web=info".
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session_engine=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT (Ctrl+C elsewhere) and flip the returned flag.
fn setup_signal_handlers() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
    });

    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers, falling back to Ctrl+C: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone without a signal: keep serving.
        std::future::pending::<()>().await;
    }
}
