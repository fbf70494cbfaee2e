//! Vosk backend (cargo feature `vosk`).
//!
//! Vosk models are thread-safe and may be shared by any number of
//! recognizers; each recognizer is used by one session only.

use crate::engine::{
    Alternative, FeedOutcome, RecognitionEngine, Recognizer, SpeakerVector, Transcript, WordTiming,
};
use crate::error::AppError;
use crate::session::SessionConfig;
use std::path::Path;
use vosk::{CompleteResult, DecodingState};

#[derive(Debug, Clone, Copy, Default)]
pub struct VoskEngine;

impl VoskEngine {
    pub fn new() -> Self {
        vosk::set_log_level(vosk::LogLevel::Warn);
        Self
    }
}

impl RecognitionEngine for VoskEngine {
    type Model = vosk::Model;
    type SpeakerModel = vosk::SpeakerModel;
    type Recognizer = VoskRecognizer;

    fn name(&self) -> &'static str {
        "vosk"
    }

    fn load_model(&self, path: &Path) -> Result<vosk::Model, AppError> {
        if !path.exists() {
            return Err(AppError::Config(format!("model path does not exist: {}", path.display())));
        }
        vosk::Model::new(path.display().to_string())
            .ok_or_else(|| AppError::Config(format!("failed to load Vosk model from {}", path.display())))
    }

    fn load_speaker_model(&self, path: &Path) -> Result<vosk::SpeakerModel, AppError> {
        if !path.exists() {
            return Err(AppError::Config(format!(
                "speaker model path does not exist: {}",
                path.display()
            )));
        }
        vosk::SpeakerModel::new(path.display().to_string()).ok_or_else(|| {
            AppError::Config(format!("failed to load Vosk speaker model from {}", path.display()))
        })
    }

    fn create_recognizer(
        &self,
        model: &vosk::Model,
        speaker_model: Option<&vosk::SpeakerModel>,
        config: &SessionConfig,
    ) -> Result<VoskRecognizer, AppError> {
        let recognizer = match &config.phrase_list {
            Some(phrases) => vosk::Recognizer::new_with_grammar(model, config.sample_rate, phrases.as_slice()),
            None => vosk::Recognizer::new(model, config.sample_rate),
        };
        let mut recognizer = recognizer.ok_or_else(|| {
            AppError::EngineInit(format!(
                "Vosk rejected recognizer settings (sample rate {})",
                config.sample_rate
            ))
        })?;

        recognizer.set_max_alternatives(config.max_alternatives);
        recognizer.set_words(config.show_words);
        recognizer.set_partial_words(config.partial_words);
        if let Some(speaker_model) = speaker_model {
            recognizer.set_speaker_model(speaker_model);
        }

        Ok(VoskRecognizer { inner: recognizer })
    }
}

pub struct VoskRecognizer {
    inner: vosk::Recognizer,
}

impl Recognizer for VoskRecognizer {
    fn accept(&mut self, samples: &[i16]) -> Result<FeedOutcome, AppError> {
        let state = self
            .inner
            .accept_waveform(samples)
            .map_err(|e| AppError::Engine(format!("accept_waveform failed: {:?}", e)))?;

        match state {
            DecodingState::Finalized => Ok(FeedOutcome::UtteranceComplete(complete(self.inner.result()))),
            DecodingState::Running => {
                let partial = self.inner.partial_result();
                Ok(FeedOutcome::PartialUpdate(Transcript {
                    text: partial.partial.to_string(),
                    words: partial.partial_result.iter().map(word).collect(),
                    ..Transcript::default()
                }))
            }
            DecodingState::Failed => Err(AppError::Engine("Vosk decoding failed".to_string())),
        }
    }

    fn finalize(&mut self) -> Result<Transcript, AppError> {
        Ok(complete(self.inner.final_result()))
    }
}

fn word(w: &vosk::Word<'_>) -> WordTiming {
    WordTiming {
        word: w.word.to_string(),
        start: w.start,
        end: w.end,
        conf: w.conf,
    }
}

fn complete(result: CompleteResult<'_>) -> Transcript {
    match result {
        CompleteResult::Single(single) => Transcript {
            text: single.text.to_string(),
            words: single.result.iter().map(word).collect(),
            alternatives: Vec::new(),
            speaker: single.speaker_info.map(|spk| SpeakerVector {
                vector: spk.vector,
                frames: spk.frames as u32,
            }),
        },
        CompleteResult::Multiple(multiple) => {
            let alternatives: Vec<Alternative> = multiple
                .alternatives
                .iter()
                .map(|alt| Alternative {
                    text: alt.text.to_string(),
                    confidence: alt.confidence,
                    words: alt
                        .result
                        .iter()
                        .map(|w| WordTiming {
                            word: w.word.to_string(),
                            start: w.start,
                            end: w.end,
                            conf: 1.0,
                        })
                        .collect(),
                })
                .collect();

            Transcript {
                text: alternatives.first().map(|a| a.text.clone()).unwrap_or_default(),
                words: Vec::new(),
                alternatives,
                speaker: None,
            }
        }
    }
}
