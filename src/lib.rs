//! # vosk-stream-server
//!
//! Streaming speech-to-text over WebSocket. Clients push raw PCM audio and
//! receive partial and final transcriptions as JSON.
//!
//! ## Application Architecture:
//! - **engine**: recognition capability trait, recognizer handle discipline, engines
//! - **session**: per-connection state machine and end-of-stream detection
//! - **protocol**: JSON envelopes sent to clients
//! - **supervisor**: session registry and per-session worker tasks
//! - **websocket**: the actix actor bridging a connection to its worker
//! - **server**: model loading, listener lifecycle, restart and shutdown
//! - **config**: layered configuration (defaults, file, environment, CLI)
//! - **state** / **health**: counters and the `/health` endpoint
//! - **error**: the error taxonomy shared by every layer

pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod websocket;

pub use error::{AppError, AppResult};
pub use server::{LifecycleHandle, LifecycleManager, ServerContext};
