//! # Recognizer Handle
//!
//! Owns one engine recognizer and enforces the lifecycle every session relies on:
//!
//! 1. **create**: validates settings, allocates the recognizer
//! 2. **feed**: decodes little-endian 16-bit PCM and hands samples to the engine
//! 3. **finalize**: flushes the engine, returns the last transcript
//! 4. **release**: frees the recognizer exactly once
//!
//! After release every `feed`/`finalize` fails with [`AppError::UseAfterRelease`].
//! Dropping an unreleased handle releases it, so an aborted session cannot leak
//! engine resources.
//!
//! ## PCM Framing:
//! WebSocket frames are not guaranteed to split on sample boundaries. An odd
//! trailing byte is kept and prepended to the next frame.

use crate::engine::{FeedOutcome, RecognitionEngine, Recognizer, Transcript};
use crate::error::AppError;
use crate::session::{SessionConfig, MAX_SAMPLE_RATE};
use byteorder::{ByteOrder, LittleEndian};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Counters kept per handle, reported when the session closes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HandleStats {
    pub frames: u64,
    pub bytes: u64,
    pub samples: u64,
    pub utterances: u64,
}

pub struct RecognizerHandle<R: Recognizer> {
    recognizer: Option<R>,
    /// Odd byte left over from the previous frame.
    carry: Option<u8>,
    stats: HandleStats,
}

impl<R: Recognizer> RecognizerHandle<R> {
    /// Create a recognizer for one session.
    ///
    /// ## Errors:
    /// - **EngineInit**: sample rate outside `(0, MAX_SAMPLE_RATE]`, the engine
    ///   refused, or the engine panicked while allocating
    pub fn create<E>(
        engine: &E,
        model: &E::Model,
        speaker_model: Option<&E::SpeakerModel>,
        config: &SessionConfig,
    ) -> Result<Self, AppError>
    where
        E: RecognitionEngine<Recognizer = R>,
    {
        if !config.sample_rate.is_finite()
            || config.sample_rate <= 0.0
            || config.sample_rate > MAX_SAMPLE_RATE
        {
            return Err(AppError::EngineInit(format!(
                "sample rate must be in (0, {}] Hz, got {}",
                MAX_SAMPLE_RATE, config.sample_rate
            )));
        }

        let recognizer = panic::catch_unwind(AssertUnwindSafe(|| {
            engine.create_recognizer(model, speaker_model, config)
        }))
        .map_err(|payload| AppError::EngineInit(panic_message("create", payload)))??;
        Ok(Self::from_recognizer(recognizer))
    }

    /// Wrap an already constructed recognizer.
    pub fn from_recognizer(recognizer: R) -> Self {
        Self {
            recognizer: Some(recognizer),
            carry: None,
            stats: HandleStats::default(),
        }
    }

    /// Feed one inbound audio frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<FeedOutcome, AppError> {
        if self.recognizer.is_none() {
            return Err(AppError::UseAfterRelease);
        }
        let samples = self.decode(chunk);
        let recognizer = self.recognizer.as_mut().ok_or(AppError::UseAfterRelease)?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| recognizer.accept(&samples)))
            .map_err(|payload| AppError::Engine(panic_message("accept", payload)))??;

        self.stats.frames += 1;
        self.stats.bytes += chunk.len() as u64;
        self.stats.samples += samples.len() as u64;
        if outcome.is_utterance_complete() {
            self.stats.utterances += 1;
        }

        Ok(outcome)
    }

    /// Flush the engine and return the final transcript. A dangling half
    /// sample cannot be decoded and is discarded.
    pub fn finalize(&mut self) -> Result<Transcript, AppError> {
        let recognizer = self.recognizer.as_mut().ok_or(AppError::UseAfterRelease)?;
        self.carry = None;

        panic::catch_unwind(AssertUnwindSafe(|| recognizer.finalize()))
            .map_err(|payload| AppError::Engine(panic_message("finalize", payload)))?
    }

    /// Free the recognizer. Idempotent; returns `true` only for the call that
    /// actually released it.
    pub fn release(&mut self) -> bool {
        match self.recognizer.take() {
            Some(mut recognizer) => {
                // A panicking release must not escape into the session worker.
                if panic::catch_unwind(AssertUnwindSafe(|| recognizer.release())).is_err() {
                    tracing::error!("recognizer panicked during release");
                }
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.recognizer.is_none()
    }

    pub fn stats(&self) -> HandleStats {
        self.stats
    }

    fn decode(&mut self, chunk: &[u8]) -> Vec<i16> {
        let mut bytes = Vec::with_capacity(chunk.len() + 1);
        if let Some(byte) = self.carry.take() {
            bytes.push(byte);
        }
        bytes.extend_from_slice(chunk);

        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }

        let mut samples = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(&bytes, &mut samples);
        samples
    }
}

impl<R: Recognizer> Drop for RecognizerHandle<R> {
    fn drop(&mut self) {
        if self.release() {
            tracing::debug!("recognizer released on drop");
        }
    }
}

fn panic_message(call: &str, payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("recognizer panicked in {}: {}", call, detail)
}
