//! # Configuration Management
//!
//! Resolves every runtime setting once at startup into an immutable
//! [`AppConfig`]. Sources, highest priority first:
//!
//! 1. Positional CLI argument (model path only)
//! 2. `VOSK_*` environment variables
//! 3. `APP_<SECTION>__<KEY>` environment variables
//! 4. Configuration file (`config.toml`, or `--config <file>`)
//! 5. Default values (defined in the `Default` impl)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the config crate deserializes the merged sources straight into our structs
//! - **Builder pattern**: `config::Config::builder()` layers the sources
//! - **ValueEnum / Parser**: clap derives the command line from a struct

use crate::session::{SessionConfig, MAX_SAMPLE_RATE};
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command line of the server binary.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "vosk-stream-server")]
#[command(version, about = "Streaming speech-to-text over WebSocket", long_about = None)]
pub struct Cli {
    /// Model path, overrides VOSK_MODEL_PATH and the config file
    pub model_path: Option<PathBuf>,

    /// Configuration file (defaults to ./config.toml when present)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
}

/// Which recognition backend serves the sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Built-in energy segmenter (always available)
    Energy,
    /// Native Vosk recognizer (requires the `vosk` cargo feature)
    Vosk,
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(feature = "vosk") {
            EngineKind::Vosk
        } else {
            EngineKind::Energy
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Energy => write!(f, "energy"),
            EngineKind::Vosk => write!(f, "vosk"),
        }
    }
}

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Listener settings, model locations, per-session recognition defaults and
/// capacity limits change for different reasons, so each gets its own section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub recognition: RecognitionConfig,
    pub performance: PerformanceConfig,
}

/// Listener settings.
///
/// ## Fields:
/// - `host` / `port`: interface to bind (`0.0.0.0:2700` accepts from anywhere)
/// - `workers`: actix worker threads (0 = one per core)
/// - `shutdown_timeout_secs`: grace period for open connections on shutdown
/// - `restart_backoff_ms`: fixed delay before the listener is restarted after a fatal error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub shutdown_timeout_secs: u64,
    pub restart_backoff_ms: u64,
}

/// Model locations and backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub engine: EngineKind,
    pub model_path: String,
    /// Empty or absent means no speaker identification.
    pub speaker_model_path: Option<String>,
}

/// Recognition defaults applied to every session.
///
/// ## Fields:
/// - `sample_rate`: PCM sample rate clients stream at (Hz)
/// - `max_alternatives`: N-best list size, 0 = plain text results
/// - `show_words`: include word timing in utterance/final results
/// - `partial_words`: include word timing in partial results
/// - `phrase_list`: optional vocabulary restriction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub sample_rate: f32,
    pub max_alternatives: u16,
    pub show_words: bool,
    pub partial_words: bool,
    pub phrase_list: Option<Vec<String>>,
}

/// Capacity and liveness tuning.
///
/// ## Fields:
/// - `max_concurrent_sessions`: upgrades beyond this are refused with 503
/// - `frame_queue_depth`: frames buffered per session before the reader pauses
/// - `idle_timeout_secs`: finalize a session with no inbound audio for this long (0 = never)
/// - `heartbeat_interval_secs` / `client_timeout_secs`: WebSocket ping cadence and dead-peer cutoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub frame_queue_depth: usize,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 2700,
                workers: 0,
                shutdown_timeout_secs: 30,
                restart_backoff_ms: 1000,
            },
            models: ModelsConfig {
                engine: EngineKind::default(),
                model_path: "model".to_string(),
                speaker_model_path: None,
            },
            recognition: RecognitionConfig {
                sample_rate: 16000.0,
                max_alternatives: 0,
                show_words: true,
                partial_words: false,
                phrase_list: None,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 64,
                frame_queue_depth: 16,
                idle_timeout_secs: 0,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order, reading the
    /// real process environment.
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_with(cli, |key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::load`] with an injectable lookup for the `VOSK_*`
    /// variables, so tests never touch the process environment.
    pub fn load_with<F>(cli: &Cli, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        settings = match &cli.config {
            Some(path) => settings.add_source(config::File::from(path.as_path()).required(true)),
            None => settings.add_source(config::File::with_name("config").required(false)),
        };

        settings = settings.add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        settings = apply_vosk_env(settings, &lookup)?;

        if let Some(model_path) = &cli.model_path {
            settings = settings.set_override("models.model_path", model_path.display().to_string())?;
        }

        let mut config: AppConfig = settings
            .build()
            .context("failed to merge configuration sources")?
            .try_deserialize()
            .context("configuration has invalid values")?;

        // An empty speaker path is how the environment says "none".
        if config
            .models
            .speaker_model_path
            .as_deref()
            .map_or(false, |p| p.trim().is_empty())
        {
            config.models.speaker_model_path = None;
        }

        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.models.model_path.trim().is_empty() {
            anyhow::bail!("Model path cannot be empty");
        }

        let rate = self.recognition.sample_rate;
        if !rate.is_finite() || rate <= 0.0 || rate > MAX_SAMPLE_RATE {
            anyhow::bail!(
                "Sample rate must be a positive number up to {} Hz, got {}",
                MAX_SAMPLE_RATE,
                rate
            );
        }

        if self.performance.max_concurrent_sessions == 0 {
            anyhow::bail!("Max concurrent sessions must be greater than 0");
        }

        if self.performance.frame_queue_depth == 0 {
            anyhow::bail!("Frame queue depth must be greater than 0");
        }

        if self.performance.heartbeat_interval_secs == 0 {
            anyhow::bail!("Heartbeat interval must be greater than 0");
        }

        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            anyhow::bail!(
                "Client timeout ({}s) must exceed the heartbeat interval ({}s)",
                self.performance.client_timeout_secs,
                self.performance.heartbeat_interval_secs
            );
        }

        Ok(())
    }

    /// Per-session recognition settings derived from the process defaults.
    pub fn session_defaults(&self) -> SessionConfig {
        SessionConfig {
            sample_rate: self.recognition.sample_rate,
            max_alternatives: self.recognition.max_alternatives,
            show_words: self.recognition.show_words,
            partial_words: self.recognition.partial_words,
            phrase_list: self.recognition.phrase_list.clone(),
        }
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

type Builder = config::ConfigBuilder<config::builder::DefaultState>;

/// Map the `VOSK_*` variables onto config keys.
///
/// Unparseable numbers are rejected instead of silently falling back to the
/// default, so a typo in the deployment fails at startup.
fn apply_vosk_env<F>(mut settings: Builder, lookup: &F) -> Result<Builder>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = non_empty(lookup("VOSK_SERVER_INTERFACE")) {
        settings = settings.set_override("server.host", host)?;
    }

    if let Some(port) = non_empty(lookup("VOSK_SERVER_PORT")) {
        let port: u16 = port
            .trim()
            .parse()
            .with_context(|| format!("VOSK_SERVER_PORT is not a valid port: {}", port))?;
        settings = settings.set_override("server.port", port as u64)?;
    }

    if let Some(path) = non_empty(lookup("VOSK_MODEL_PATH")) {
        settings = settings.set_override("models.model_path", path)?;
    }

    if let Some(path) = lookup("VOSK_SPK_MODEL_PATH") {
        settings = settings.set_override("models.speaker_model_path", path)?;
    }

    if let Some(engine) = non_empty(lookup("VOSK_ENGINE")) {
        settings = settings.set_override("models.engine", engine.trim().to_lowercase())?;
    }

    if let Some(rate) = non_empty(lookup("VOSK_SAMPLE_RATE")) {
        let rate: f64 = rate
            .trim()
            .parse()
            .with_context(|| format!("VOSK_SAMPLE_RATE is not a number: {}", rate))?;
        settings = settings.set_override("recognition.sample_rate", rate)?;
    }

    if let Some(alternatives) = non_empty(lookup("VOSK_ALTERNATIVES")) {
        let alternatives: u16 = alternatives.trim().parse().with_context(|| {
            format!("VOSK_ALTERNATIVES is not a non-negative integer: {}", alternatives)
        })?;
        settings = settings.set_override("recognition.max_alternatives", alternatives as u64)?;
    }

    // Only the literal "true" enables a flag.
    if let Some(show_words) = non_empty(lookup("VOSK_SHOW_WORDS")) {
        settings = settings.set_override("recognition.show_words", show_words.trim() == "true")?;
    }

    if let Some(partial_words) = non_empty(lookup("VOSK_PARTIAL_WORDS")) {
        settings =
            settings.set_override("recognition.partial_words", partial_words.trim() == "true")?;
    }

    if let Some(phrases) = non_empty(lookup("VOSK_PHRASE_LIST")) {
        let phrases: Vec<String> = serde_json::from_str(&phrases)
            .with_context(|| format!("VOSK_PHRASE_LIST must be a JSON array of strings: {}", phrases))?;
        settings = settings.set_override("recognition.phrase_list", phrases)?;
    }

    Ok(settings)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
