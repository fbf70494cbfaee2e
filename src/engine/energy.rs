//! # Energy Segmentation Engine
//!
//! Built-in backend that needs no native library. It splits the stream into
//! utterances from short-frame RMS energy and reports their timing, without
//! lexical content: every utterance is a single `<speech>` word whose
//! confidence is the share of voiced frames inside it.
//!
//! A chunk long enough to close several utterances reports the first one;
//! the rest are queued and reported by the following chunks, then by
//! `finalize`, which merges whatever is still queued into the final result.
//!
//! ## Model Layout:
//! The "model" is tuning data. `model_path` may be a TOML file or a directory
//! containing `energy.toml`; missing keys (or a directory without the file)
//! use the defaults below.
//!
//! ```toml
//! frame_ms = 20
//! energy_threshold = 500.0
//! hangover_ms = 600
//! min_speech_ms = 120
//! ```

use crate::engine::{Alternative, FeedOutcome, RecognitionEngine, Recognizer, Transcript, WordTiming};
use crate::error::AppError;
use crate::session::SessionConfig;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;

/// File looked up inside a model directory.
pub const PARAMS_FILE: &str = "energy.toml";

/// Token reported for a detected utterance.
pub const SPEECH_TOKEN: &str = "<speech>";

/// Largest analysis frame, in samples, a recognizer will allocate.
pub const MAX_FRAME_SAMPLES: usize = 1 << 20;

/// Segmentation parameters.
///
/// ## Tuning:
/// - `energy_threshold`: RMS (16-bit scale) above which a frame counts as voiced
/// - `hangover_ms`: silence needed after speech before the utterance closes
/// - `min_speech_ms`: shorter voiced bursts are discarded as clicks
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnergyParams {
    pub frame_ms: u32,
    pub energy_threshold: f32,
    pub hangover_ms: u32,
    pub min_speech_ms: u32,
}

impl Default for EnergyParams {
    fn default() -> Self {
        Self {
            frame_ms: 20,
            energy_threshold: 500.0,
            hangover_ms: 600,
            min_speech_ms: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyEngine;

impl EnergyEngine {
    pub fn new() -> Self {
        Self
    }
}

impl RecognitionEngine for EnergyEngine {
    type Model = EnergyParams;
    type SpeakerModel = ();
    type Recognizer = EnergyRecognizer;

    fn name(&self) -> &'static str {
        "energy"
    }

    fn load_model(&self, path: &Path) -> Result<EnergyParams, AppError> {
        let file = if path.is_dir() {
            let candidate = path.join(PARAMS_FILE);
            if !candidate.exists() {
                tracing::info!(model = %path.display(), "no {} in model directory, using defaults", PARAMS_FILE);
                return Ok(EnergyParams::default());
            }
            candidate
        } else if path.is_file() {
            path.to_path_buf()
        } else {
            return Err(AppError::Config(format!(
                "model path does not exist: {}",
                path.display()
            )));
        };

        let raw = std::fs::read_to_string(&file)
            .map_err(|e| AppError::Config(format!("cannot read {}: {}", file.display(), e)))?;
        let params: EnergyParams = toml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("invalid {}: {}", file.display(), e)))?;

        if params.frame_ms == 0 {
            return Err(AppError::Config("frame_ms must be greater than 0".to_string()));
        }
        if !params.energy_threshold.is_finite() || params.energy_threshold < 0.0 {
            return Err(AppError::Config("energy_threshold must be a non-negative number".to_string()));
        }

        Ok(params)
    }

    fn load_speaker_model(&self, path: &Path) -> Result<(), AppError> {
        Err(AppError::Config(format!(
            "the energy engine has no speaker identification (speaker model {})",
            path.display()
        )))
    }

    fn create_recognizer(
        &self,
        model: &EnergyParams,
        _speaker_model: Option<&()>,
        config: &SessionConfig,
    ) -> Result<EnergyRecognizer, AppError> {
        let frame_len = (f64::from(config.sample_rate) * f64::from(model.frame_ms) / 1000.0).round();
        if !frame_len.is_finite() || frame_len < 1.0 {
            return Err(AppError::EngineInit(format!(
                "sample rate {} too low for {}ms frames",
                config.sample_rate, model.frame_ms
            )));
        }
        if frame_len > MAX_FRAME_SAMPLES as f64 {
            return Err(AppError::EngineInit(format!(
                "{}ms frames at {} Hz exceed {} samples",
                model.frame_ms, config.sample_rate, MAX_FRAME_SAMPLES
            )));
        }
        let frame_len = frame_len as usize;

        if config.phrase_list.is_some() {
            tracing::debug!("energy engine ignores the phrase list");
        }

        Ok(EnergyRecognizer::new(model.clone(), config.sample_rate, frame_len))
    }
}

/// Per-session segmenter state.
pub struct EnergyRecognizer {
    params: EnergyParams,
    sample_rate: f32,
    frame_len: usize,
    /// Samples not yet forming a whole analysis frame.
    pending: Vec<i16>,
    /// Whole frames consumed since stream start.
    frame_index: u64,
    current: Option<Segment>,
    /// Utterances closed but not yet reported.
    completed: VecDeque<Transcript>,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start_frame: u64,
    last_voiced_frame: u64,
    voiced_frames: u64,
}

impl EnergyRecognizer {
    fn new(params: EnergyParams, sample_rate: f32, frame_len: usize) -> Self {
        Self {
            params,
            sample_rate,
            frame_len,
            pending: Vec::with_capacity(frame_len),
            frame_index: 0,
            current: None,
            completed: VecDeque::new(),
        }
    }

    fn frames_for_ms(&self, ms: u32) -> u64 {
        (ms as u64).div_ceil(self.params.frame_ms as u64)
    }

    fn frame_seconds(&self, frame: u64) -> f32 {
        (frame as f32 * self.frame_len as f32) / self.sample_rate
    }

    /// Process one analysis frame; returns a finished segment if the
    /// hangover elapsed on this frame.
    fn step(&mut self, level: f32) -> Option<Segment> {
        let index = self.frame_index;
        self.frame_index += 1;
        let voiced = level >= self.params.energy_threshold;
        let hangover = self.frames_for_ms(self.params.hangover_ms);

        match (&mut self.current, voiced) {
            (Some(segment), true) => {
                segment.last_voiced_frame = index;
                segment.voiced_frames += 1;
                None
            }
            (Some(segment), false) => {
                let silent = index - segment.last_voiced_frame;
                if silent >= hangover {
                    self.current.take()
                } else {
                    None
                }
            }
            (None, true) => {
                self.current = Some(Segment {
                    start_frame: index,
                    last_voiced_frame: index,
                    voiced_frames: 1,
                });
                None
            }
            (None, false) => None,
        }
    }

    /// Turn a closed segment into a transcript; `None` for bursts shorter
    /// than `min_speech_ms`.
    fn transcript_for(&self, segment: Segment) -> Option<Transcript> {
        let span = segment.last_voiced_frame - segment.start_frame + 1;
        if span < self.frames_for_ms(self.params.min_speech_ms) {
            return None;
        }

        let conf = segment.voiced_frames as f32 / span as f32;
        let word = WordTiming {
            word: SPEECH_TOKEN.to_string(),
            start: self.frame_seconds(segment.start_frame),
            end: self.frame_seconds(segment.last_voiced_frame + 1),
            conf,
        };

        Some(Transcript {
            text: String::new(),
            alternatives: vec![Alternative {
                text: String::new(),
                confidence: conf,
                words: vec![word.clone()],
            }],
            words: vec![word],
            speaker: None,
        })
    }

    fn in_progress(&self) -> Transcript {
        match self.current {
            Some(segment) => Transcript {
                words: vec![WordTiming {
                    word: SPEECH_TOKEN.to_string(),
                    start: self.frame_seconds(segment.start_frame),
                    end: self.frame_seconds(self.frame_index),
                    conf: segment.voiced_frames as f32
                        / (self.frame_index - segment.start_frame).max(1) as f32,
                }],
                ..Transcript::default()
            },
            None => Transcript::default(),
        }
    }
}

impl Recognizer for EnergyRecognizer {
    fn accept(&mut self, samples: &[i16]) -> Result<FeedOutcome, AppError> {
        self.pending.extend_from_slice(samples);

        let whole = self.pending.len() / self.frame_len * self.frame_len;
        let frames: Vec<f32> = self.pending[..whole]
            .chunks_exact(self.frame_len)
            .map(rms)
            .collect();
        self.pending.drain(..whole);

        for level in frames {
            if let Some(segment) = self.step(level) {
                if let Some(transcript) = self.transcript_for(segment) {
                    self.completed.push_back(transcript);
                }
            }
        }

        Ok(match self.completed.pop_front() {
            Some(transcript) => FeedOutcome::UtteranceComplete(transcript),
            None => FeedOutcome::PartialUpdate(self.in_progress()),
        })
    }

    fn finalize(&mut self) -> Result<Transcript, AppError> {
        let mut closed = None;
        if !self.pending.is_empty() {
            let level = rms(&self.pending);
            self.pending.clear();
            closed = self.step(level);
        }
        if let Some(segment) = closed.or_else(|| self.current.take()) {
            if let Some(transcript) = self.transcript_for(segment) {
                self.completed.push_back(transcript);
            }
        }

        Ok(merge(self.completed.drain(..)))
    }

    fn release(&mut self) {
        self.pending = Vec::new();
        self.current = None;
        self.completed.clear();
    }
}

/// Fold queued utterances into one transcript, words in stream order.
fn merge(transcripts: impl Iterator<Item = Transcript>) -> Transcript {
    let mut merged = Transcript::default();
    for transcript in transcripts {
        merged.words.extend(transcript.words);
    }
    if !merged.words.is_empty() {
        let conf = merged.words.iter().map(|w| w.conf).sum::<f32>() / merged.words.len() as f32;
        merged.alternatives = vec![Alternative {
            text: String::new(),
            confidence: conf,
            words: merged.words.clone(),
        }];
    }
    merged
}

fn rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / frame.len() as f64).sqrt() as f32
}
