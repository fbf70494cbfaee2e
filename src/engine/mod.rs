//! # Recognition Engine Adapter
//!
//! The speech recognizer itself is an external collaborator. This module
//! describes it as a capability (load a model, create a recognizer, feed
//! samples, finalize) so any compliant engine can serve the sessions.
//!
//! ## Key Components:
//! - **RecognitionEngine**: loads shared models and creates recognizers
//! - **Recognizer**: one per session, consumes 16-bit PCM samples
//! - **RecognizerHandle**: enforces create → feed* → finalize → release discipline
//! - **Transcript / FeedOutcome**: engine-neutral results the session shapes into envelopes
//!
//! ## Available Engines:
//! - **energy**: built-in utterance segmenter, always compiled
//! - **vosk**: native Vosk bindings behind the `vosk` cargo feature

pub mod energy;
pub mod handle;
#[cfg(feature = "vosk")]
pub mod vosk;

pub use handle::{HandleStats, RecognizerHandle};

use crate::error::AppError;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A recognition backend.
///
/// ## Thread Safety:
/// The engine and its models are shared read-only by every session, so they
/// must be `Send + Sync`. Recognizers are owned by exactly one session at a
/// time and only need `Send`.
pub trait RecognitionEngine: Send + Sync + 'static {
    /// Acoustic + language data, loaded once per startup cycle.
    type Model: Send + Sync + 'static;
    /// Optional speaker-identification data.
    type SpeakerModel: Send + Sync + 'static;
    /// Per-session recognizer instance.
    type Recognizer: Recognizer;

    /// Short engine name for logs and `/health`.
    fn name(&self) -> &'static str;

    /// Load the shared model. Failures are configuration errors.
    fn load_model(&self, path: &Path) -> Result<Self::Model, AppError>;

    /// Load the optional speaker model. Failures are configuration errors.
    fn load_speaker_model(&self, path: &Path) -> Result<Self::SpeakerModel, AppError>;

    /// Allocate a recognizer. Must fail with [`AppError::EngineInit`] on
    /// out-of-range settings.
    fn create_recognizer(
        &self,
        model: &Self::Model,
        speaker_model: Option<&Self::SpeakerModel>,
        config: &SessionConfig,
    ) -> Result<Self::Recognizer, AppError>;

    /// Whether `accept` may run concurrently on *different* recognizers.
    /// When `false` the server serializes every engine call process-wide.
    fn concurrent_feeds(&self) -> bool {
        true
    }
}

/// A single recognizer instance. Never called reentrantly.
pub trait Recognizer: Send + 'static {
    /// Consume samples and report whether an utterance just completed.
    fn accept(&mut self, samples: &[i16]) -> Result<FeedOutcome, AppError>;

    /// Flush buffered audio and return the last result.
    fn finalize(&mut self) -> Result<Transcript, AppError>;

    /// Free engine resources. Called at most once by the handle.
    fn release(&mut self) {}
}

/// Result of feeding one chunk of audio.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedOutcome {
    /// Audio is still in an utterance; the transcript is provisional.
    PartialUpdate(Transcript),
    /// The engine decided an utterance ended inside this chunk.
    UtteranceComplete(Transcript),
}

impl FeedOutcome {
    pub fn transcript(&self) -> &Transcript {
        match self {
            FeedOutcome::PartialUpdate(t) | FeedOutcome::UtteranceComplete(t) => t,
        }
    }

    pub fn is_utterance_complete(&self) -> bool {
        matches!(self, FeedOutcome::UtteranceComplete(_))
    }
}

/// Engine-neutral recognition result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub words: Vec<WordTiming>,
    pub alternatives: Vec<Alternative>,
    /// Speaker embedding and the number of frames it was computed over.
    pub speaker: Option<SpeakerVector>,
}

impl Transcript {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// One recognized word, times in seconds from stream start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f32,
    pub end: f32,
    pub conf: f32,
}

/// One N-best hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative {
    pub text: String,
    pub confidence: f32,
    pub words: Vec<WordTiming>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerVector {
    pub vector: Vec<f32>,
    pub frames: u32,
}
