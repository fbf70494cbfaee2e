//! # vosk-stream-server - Main Application Entry Point
//!
//! ## What this binary does:
//! 1. **Loads configuration** from defaults, `config.toml`, the environment and the command line
//! 2. **Sets up logging** for debugging and monitoring
//! 3. **Selects the recognition engine** and hands it to the lifecycle manager
//! 4. **Handles graceful shutdown** on SIGINT / SIGTERM
//!
//! ## Exit codes:
//! - `0`: graceful shutdown
//! - `1`: unrecoverable startup failure (bad configuration, unusable model, engine unavailable)

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vosk_stream_server::config::{AppConfig, Cli, EngineKind};
use vosk_stream_server::engine::energy::EnergyEngine;
use vosk_stream_server::engine::RecognitionEngine;
use vosk_stream_server::{LifecycleHandle, LifecycleManager};

#[actix_web::main]
async fn main() -> ExitCode {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!("Starting vosk-stream-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {} (engine {}, model {})",
        config.bind_addr(),
        config.models.engine,
        config.models.model_path
    );

    match config.models.engine {
        EngineKind::Energy => serve(EnergyEngine::new(), config).await,
        #[cfg(feature = "vosk")]
        EngineKind::Vosk => serve(vosk_stream_server::engine::vosk::VoskEngine::new(), config).await,
        #[cfg(not(feature = "vosk"))]
        EngineKind::Vosk => Err(vosk_stream_server::AppError::Config(
            "engine 'vosk' is not available in this build (rebuild with --features vosk)".to_string(),
        )
        .into()),
    }
}

async fn serve<E: RecognitionEngine>(engine: E, config: AppConfig) -> Result<()> {
    let manager = LifecycleManager::new(Arc::new(engine), config);
    setup_signal_handlers(manager.handle());
    manager.run().await.context("server failed")
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged (e.g. "info", "vosk_stream_server=trace")
/// - If not set, defaults to "vosk_stream_server=debug,actix_web=info"
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vosk_stream_server=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Request a graceful shutdown on SIGINT (Ctrl+C) or SIGTERM.
fn setup_signal_handlers(handle: LifecycleHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    info!("Received SIGINT");
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

        handle.shutdown();
    });
}
