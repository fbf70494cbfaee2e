//! # Server Lifecycle
//!
//! Owns the startup sequence and keeps the listener alive:
//!
//! 1. **Load** the model (and optional speaker model) into a [`ServerContext`]
//! 2. **Bind** the HTTP/WebSocket listener
//! 3. **Serve** until shutdown is requested or the listener dies
//! 4. **Restart** after a fixed backoff when the listener dies; the whole
//!    sequence reruns, models included
//!
//! Configuration and model failures are fatal and returned to `main`; only
//! transport failures are retried.
//!
//! ## Rust Concepts:
//! - **Generics over the engine**: the server is monomorphized for the engine chosen in `main`
//! - **watch channels**: one sender, many receivers that always see the latest value;
//!   used for the shutdown flag and the bound address
//! - **tokio::select!**: wait for whichever finishes first, the server or the shutdown signal

use crate::config::AppConfig;
use crate::engine::RecognitionEngine;
use crate::error::{AppError, AppResult};
use crate::health;
use crate::session::SessionConfig;
use crate::state::AppState;
use crate::supervisor::{Supervisor, SupervisorLimits};
use crate::websocket;
use actix_web::{web, App, HttpServer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;

/// Immutable process context handed to every session.
///
/// Built once per startup cycle and dropped after the last session of that
/// cycle has closed, which is when the models are freed.
pub struct ServerContext<E: RecognitionEngine> {
    engine: Arc<E>,
    model: E::Model,
    speaker_model: Option<E::SpeakerModel>,
    session_defaults: SessionConfig,
    /// Present only for engines that cannot feed different recognizers concurrently.
    feed_gate: Option<Mutex<()>>,
}

impl<E: RecognitionEngine> ServerContext<E> {
    pub fn new(
        engine: Arc<E>,
        model: E::Model,
        speaker_model: Option<E::SpeakerModel>,
        session_defaults: SessionConfig,
    ) -> Self {
        let feed_gate = (!engine.concurrent_feeds()).then(|| Mutex::new(()));
        Self {
            engine,
            model,
            speaker_model,
            session_defaults,
            feed_gate,
        }
    }

    /// Load the models named in the configuration.
    ///
    /// ## Errors:
    /// Whatever the engine reports, `Config` for unusable paths. These are
    /// never retried.
    pub fn load(engine: Arc<E>, config: &AppConfig) -> AppResult<Self> {
        let model_path = Path::new(&config.models.model_path);
        let model = engine.load_model(model_path)?;

        let speaker_model = match config.models.speaker_model_path.as_deref() {
            Some(path) => Some(engine.load_speaker_model(Path::new(path))?),
            None => None,
        };

        info!(
            engine = engine.name(),
            model = %model_path.display(),
            speaker_model = speaker_model.is_some(),
            "models loaded"
        );

        Ok(Self::new(engine, model, speaker_model, config.session_defaults()))
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn model(&self) -> &E::Model {
        &self.model
    }

    pub fn speaker_model(&self) -> Option<&E::SpeakerModel> {
        self.speaker_model.as_ref()
    }

    pub fn session_defaults(&self) -> &SessionConfig {
        &self.session_defaults
    }

    pub fn is_serialized(&self) -> bool {
        self.feed_gate.is_some()
    }

    /// Run an engine call, holding the process-wide gate if the engine needs one.
    pub fn serialized<T>(&self, call: impl FnOnce() -> T) -> T {
        match &self.feed_gate {
            Some(gate) => {
                let _guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
                call()
            }
            None => call(),
        }
    }
}

/// Remote control for a running [`LifecycleManager`].
#[derive(Clone)]
pub struct LifecycleHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    addr_rx: watch::Receiver<Option<SocketAddr>>,
}

impl LifecycleHandle {
    /// Ask the server to stop gracefully. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait until a listener is bound and return its address. `None` if the
    /// manager went away first.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.addr_rx.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current.is_some() {
                return current;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// How one startup cycle ended.
enum Stopped {
    Server(Result<std::io::Result<()>, tokio::task::JoinError>),
    Shutdown,
}

pub struct LifecycleManager<E: RecognitionEngine> {
    engine: Arc<E>,
    config: AppConfig,
    state: AppState,
    shutdown_tx: Arc<watch::Sender<bool>>,
    addr_tx: Arc<watch::Sender<Option<SocketAddr>>>,
}

impl<E: RecognitionEngine> LifecycleManager<E> {
    pub fn new(engine: Arc<E>, config: AppConfig) -> Self {
        let state = AppState::new(engine.name());
        let (shutdown_tx, _) = watch::channel(false);
        let (addr_tx, _) = watch::channel(None);
        Self {
            engine,
            config,
            state,
            shutdown_tx: Arc::new(shutdown_tx),
            addr_tx: Arc::new(addr_tx),
        }
    }

    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            addr_rx: self.addr_tx.subscribe(),
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve until shutdown. Returns `Ok` after a graceful shutdown and the
    /// first non-retryable error otherwise.
    pub async fn run(self) -> AppResult<()> {
        let backoff = Duration::from_millis(self.config.server.restart_backoff_ms);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut attempt: u64 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            attempt += 1;
            info!(
                attempt,
                engine = self.engine.name(),
                bind = %self.config.bind_addr(),
                "starting server"
            );

            match self.run_cycle().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    self.addr_tx.send_replace(None);
                    let restarts = self.state.record_restart();
                    error!(
                        attempt,
                        restarts,
                        error = %e,
                        "listener failed, restarting in {}ms",
                        backoff.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = wait_for_shutdown(&mut shutdown) => {
                            info!("Shutdown requested during restart backoff");
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    error!(attempt, error = %e, "fatal startup error");
                    return Err(e);
                }
            }
        }
    }

    /// One load → bind → serve sequence.
    async fn run_cycle(&self) -> AppResult<()> {
        let engine = self.engine.clone();
        let config = self.config.clone();
        let context = tokio::task::spawn_blocking(move || ServerContext::load(engine, &config))
            .await
            .map_err(|e| AppError::EngineInit(format!("model loading panicked: {}", e)))??;

        let supervisor = Supervisor::new(
            Arc::new(context),
            SupervisorLimits::from(&self.config.performance),
            self.state.clone(),
        );

        let server = self.build_server(supervisor.clone())?;
        let server_handle = server.handle();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut server_task = actix_web::rt::spawn(server);

        let stopped = tokio::select! {
            result = &mut server_task => Stopped::Server(result),
            _ = wait_for_shutdown(&mut shutdown) => Stopped::Shutdown,
        };

        match stopped {
            Stopped::Server(Ok(Ok(()))) => {
                Err(AppError::Transport("server stopped unexpectedly".to_string()))
            }
            Stopped::Server(Ok(Err(e))) => Err(e.into()),
            Stopped::Server(Err(e)) => Err(AppError::Transport(format!("server task failed: {}", e))),
            Stopped::Shutdown => {
                info!("Shutdown signal received, stopping server...");
                server_handle.stop(true).await;

                let grace = Duration::from_secs(self.config.server.shutdown_timeout_secs);
                if tokio::time::timeout(grace, supervisor.wait_idle()).await.is_err() {
                    warn!(
                        active = supervisor.active_count(),
                        "sessions still open after the shutdown grace period"
                    );
                }
                if let Err(e) = server_task.await {
                    warn!(error = %e, "server task ended abnormally during shutdown");
                }

                self.addr_tx.send_replace(None);
                info!("Server stopped gracefully");
                Ok(())
            }
        }
    }

    fn build_server(&self, supervisor: Supervisor<E>) -> AppResult<actix_web::dev::Server> {
        let bind_addr = self.config.bind_addr();
        let supervisor = web::Data::new(supervisor);
        let state = web::Data::new(self.state.clone());

        let mut server = HttpServer::new(move || {
            App::new()
                .app_data(supervisor.clone())
                .app_data(state.clone())
                .wrap(TracingLogger::default())
                .route("/health", web::get().to(health::health_check::<E>))
                // Every other path upgrades to the streaming protocol.
                .default_service(web::to(websocket::audio_websocket::<E>))
        })
        .shutdown_timeout(self.config.server.shutdown_timeout_secs)
        .disable_signals();

        if self.config.server.workers > 0 {
            server = server.workers(self.config.server.workers);
        }

        let server = server.bind(&bind_addr)?;
        let bound = server.addrs();
        info!(addrs = ?bound, "listening");
        self.addr_tx.send_replace(bound.first().copied());

        Ok(server.run())
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender gone: nobody can request a shutdown any more.
            std::future::pending::<()>().await;
        }
    }
}
