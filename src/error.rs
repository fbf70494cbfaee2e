//! # Error Handling
//!
//! Error taxonomy for the streaming server. Every failure the server can hit
//! belongs to exactly one class, and the class decides who recovers from it:
//!
//! | Variant | Scope | Recovery |
//! |---|---|---|
//! | `Config` | process | fatal at startup, exit non-zero |
//! | `EngineInit` / `Engine` / `UseAfterRelease` | one session | close that session |
//! | `Transport` | listener | restart with backoff |
//! | `Protocol` | one session | close with an error envelope |
//! | `SessionLimit` | one upgrade request | HTTP 503 |
//!
//! ## Rust Concepts:
//! - **enum with data**: each variant carries a human-readable message
//! - **Display / Error traits**: let the error print nicely and work with `?` and `anyhow`
//! - **ResponseError**: converts the error into an HTTP response on the upgrade path

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application error type.
///
/// ## Usage Example:
/// ```rust
/// use vosk_stream_server::error::AppError;
/// let err = AppError::Protocol("unexpected text frame".to_string());
/// assert!(err.is_session_scoped());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Bad configuration or model path. Fatal at startup, never retried.
    Config(String),

    /// The engine refused to create a recognizer (invalid model or settings).
    EngineInit(String),

    /// The engine failed while processing audio for a session.
    Engine(String),

    /// A recognizer handle was used after it had been released.
    UseAfterRelease,

    /// Listener-level socket failure.
    Transport(String),

    /// The client sent a frame the protocol does not allow.
    Protocol(String),

    /// The connection limit was reached.
    SessionLimit(usize),
}

impl AppError {
    /// Whether the error only concerns a single session and must never take
    /// down the listener or other sessions.
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            AppError::EngineInit(_)
                | AppError::Engine(_)
                | AppError::UseAfterRelease
                | AppError::Protocol(_)
        )
    }

    /// Whether the lifecycle manager should rerun the startup sequence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }

    /// Machine-readable error kind, used in logs and JSON bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::EngineInit(_) => "engine_init_error",
            AppError::Engine(_) => "engine_error",
            AppError::UseAfterRelease => "use_after_release",
            AppError::Transport(_) => "transport_error",
            AppError::Protocol(_) => "protocol_error",
            AppError::SessionLimit(_) => "session_limit",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AppError::EngineInit(msg) => write!(f, "Recognizer initialization failed: {}", msg),
            AppError::Engine(msg) => write!(f, "Recognition engine error: {}", msg),
            AppError::UseAfterRelease => write!(f, "Recognizer used after release"),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AppError::SessionLimit(max) => {
                write!(f, "Maximum concurrent sessions ({}) reached", max)
            }
        }
    }
}

impl std::error::Error for AppError {}

/// HTTP mapping, only reachable on the WebSocket upgrade and `/health` paths.
///
/// ## HTTP Status Code Mapping:
/// - SessionLimit → 503 (Service Unavailable)
/// - Protocol → 400 (Bad Request)
/// - everything else → 500 (Internal Server Error)
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::SessionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Protocol(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Configuration loading failures are always fatal.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Socket-level I/O failures surface from bind and the server future.
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
