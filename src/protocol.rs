//! # Wire Envelopes
//!
//! Everything the server sends to a client is one JSON text frame built here.
//! The engine returns a neutral [`Transcript`]; the session's
//! [`SessionConfig`] decides what parts of it reach the wire.
//!
//! ## Shapes:
//! - partial: `{"partial": "..."}` (+ `"partial_result"` with `partial_words`)
//! - utterance / final, plain: `{"text": "..."}` (+ `"result"` with `show_words`,
//!   + `"spk"` / `"spk_frames"` when a speaker vector exists)
//! - utterance / final, N-best: `{"alternatives": [{"text", "confidence", "result"?}]}`
//! - error: `{"error": "..."}`

use crate::engine::{Alternative, Transcript, WordTiming};
use crate::session::SessionConfig;
use serde::Serialize;

/// Which recognition event an envelope reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Provisional text for the utterance in progress.
    Partial,
    /// The engine closed an utterance inside the stream.
    Utterance,
    /// The stream ended; nothing follows this envelope.
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlternativePayload {
    pub text: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<WordTiming>>,
}

/// JSON body of a result envelope. Untagged, so each variant serializes to
/// exactly the shape listed in the module docs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultPayload {
    Partial {
        partial: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        partial_result: Option<Vec<WordTiming>>,
    },
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Vec<WordTiming>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        spk: Option<Vec<f32>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        spk_frames: Option<u32>,
    },
    Alternatives {
        alternatives: Vec<AlternativePayload>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultEnvelope {
    kind: EnvelopeKind,
    payload: ResultPayload,
}

impl ResultEnvelope {
    pub fn partial(transcript: &Transcript, config: &SessionConfig) -> Self {
        Self {
            kind: EnvelopeKind::Partial,
            payload: ResultPayload::Partial {
                partial: transcript.text.clone(),
                partial_result: config.partial_words.then(|| transcript.words.clone()),
            },
        }
    }

    pub fn utterance(transcript: &Transcript, config: &SessionConfig) -> Self {
        Self::complete(EnvelopeKind::Utterance, transcript, config)
    }

    pub fn final_result(transcript: &Transcript, config: &SessionConfig) -> Self {
        Self::complete(EnvelopeKind::Final, transcript, config)
    }

    fn complete(kind: EnvelopeKind, transcript: &Transcript, config: &SessionConfig) -> Self {
        let payload = if config.max_alternatives > 0 {
            ResultPayload::Alternatives {
                alternatives: shape_alternatives(transcript, config),
            }
        } else {
            ResultPayload::Text {
                text: transcript.text.clone(),
                result: words_if(config.show_words, &transcript.words),
                spk: transcript.speaker.as_ref().map(|s| s.vector.clone()),
                spk_frames: transcript.speaker.as_ref().map(|s| s.frames),
            }
        };
        Self { kind, payload }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn payload(&self) -> &ResultPayload {
        &self.payload
    }
}

/// Sorted by descending confidence and cut to `max_alternatives`. An engine
/// that produced no N-best list still yields one hypothesis: its plain text.
fn shape_alternatives(transcript: &Transcript, config: &SessionConfig) -> Vec<AlternativePayload> {
    let mut alternatives: Vec<Alternative> = if transcript.alternatives.is_empty() {
        vec![Alternative {
            text: transcript.text.clone(),
            confidence: 1.0,
            words: transcript.words.clone(),
        }]
    } else {
        transcript.alternatives.clone()
    };

    alternatives.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    alternatives.truncate(config.max_alternatives as usize);

    alternatives
        .into_iter()
        .map(|alt| AlternativePayload {
            result: words_if(config.show_words, &alt.words),
            text: alt.text,
            confidence: alt.confidence,
        })
        .collect()
}

fn words_if(enabled: bool, words: &[WordTiming]) -> Option<Vec<WordTiming>> {
    (enabled && !words.is_empty()).then(|| words.to_vec())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
}

/// One outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Result(ResultEnvelope),
    Error(ErrorEnvelope),
}

impl Envelope {
    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error(ErrorEnvelope {
            error: message.into(),
        })
    }

    /// `None` for error envelopes.
    pub fn kind(&self) -> Option<EnvelopeKind> {
        match self {
            Envelope::Result(result) => Some(result.kind),
            Envelope::Error(_) => None,
        }
    }

    pub fn to_json(&self) -> String {
        let encoded = match self {
            Envelope::Result(result) => serde_json::to_string(&result.payload),
            Envelope::Error(error) => serde_json::to_string(error),
        };
        encoded.unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
    }
}

impl From<ResultEnvelope> for Envelope {
    fn from(result: ResultEnvelope) -> Self {
        Envelope::Result(result)
    }
}
