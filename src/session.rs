//! # Streaming Session
//!
//! One [`Session`] per WebSocket connection. It owns the connection's
//! recognizer and turns inbound frames into envelopes.
//!
//! ## Session Lifecycle:
//! 1. **Created**: connection accepted, no recognizer yet
//! 2. **Active**: recognizer allocated on the first audio frame; every frame yields one envelope
//! 3. **Finalizing**: end-of-stream, transport close, idle timeout or an engine failure
//! 4. **Closed**: recognizer released; anything that still arrives is dropped
//!
//! ## Rust Concepts:
//! - **Synchronous core**: `apply` never awaits, so the supervisor can run it on the
//!   blocking pool and move the whole session in and out of the closure
//! - **Ownership**: the session exclusively owns its `RecognizerHandle`; nothing else
//!   can feed or release it

use crate::engine::{FeedOutcome, RecognitionEngine, RecognizerHandle};
use crate::error::AppError;
use crate::protocol::{Envelope, ResultEnvelope};
use crate::server::ServerContext;
use actix_web::web::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Highest PCM sample rate a session may be configured with (Hz).
pub const MAX_SAMPLE_RATE: f32 = 192_000.0;

/// Recognition settings for one session, derived from the process defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub sample_rate: f32,
    pub max_alternatives: u16,
    pub show_words: bool,
    pub partial_words: bool,
    pub phrase_list: Option<Vec<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000.0,
            max_alternatives: 0,
            show_words: true,
            partial_words: false,
            phrase_list: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Finalizing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Finalizing => "finalizing",
            SessionState::Closed => "closed",
        }
    }
}

/// The in-band end-of-stream signal.
///
/// A frame is the signal only when its payload equals `bytes` exactly. There
/// is no parsing, trimming or substring search, so audio can never be
/// mistaken for it and a near-miss never finalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMarker {
    pub version: u16,
    pub bytes: &'static [u8],
}

impl ControlMarker {
    pub const V1: ControlMarker = ControlMarker {
        version: 1,
        bytes: br#"{"eof" : 1}"#,
    };

    pub fn matches(&self, payload: &[u8]) -> bool {
        payload == self.bytes
    }
}

/// Marker accepted by this server.
pub const EOF_MARKER: ControlMarker = ControlMarker::V1;

/// A data frame as read from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Binary(Bytes),
    Text(String),
}

/// What a frame means to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Audio(Bytes),
    EndOfStream,
    /// Non-marker text; the reason is sent back to the client.
    Invalid(String),
}

impl InboundFrame {
    pub fn classify(self) -> Frame {
        match self {
            InboundFrame::Binary(data) if EOF_MARKER.matches(&data) => Frame::EndOfStream,
            InboundFrame::Binary(data) => Frame::Audio(data),
            InboundFrame::Text(text) if EOF_MARKER.matches(text.as_bytes()) => Frame::EndOfStream,
            InboundFrame::Text(text) => Frame::Invalid(format!(
                "unexpected text frame ({} bytes); audio must be binary",
                text.len()
            )),
        }
    }
}

/// Everything that can drive a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Frame(InboundFrame),
    /// The peer is gone; nothing can be sent any more.
    TransportClosed,
    /// No inbound frame within the configured idle timeout.
    IdleTimeout,
}

/// What the worker must do after an event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    pub envelope: Option<Envelope>,
    /// Close the connection (normally) after sending `envelope`.
    pub close: bool,
}

impl Reply {
    fn send(envelope: impl Into<Envelope>) -> Self {
        Self {
            envelope: Some(envelope.into()),
            close: false,
        }
    }

    fn finish(envelope: impl Into<Envelope>) -> Self {
        Self {
            envelope: Some(envelope.into()),
            close: true,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

pub struct Session<E: RecognitionEngine> {
    id: Uuid,
    context: Arc<ServerContext<E>>,
    config: SessionConfig,
    handle: Option<RecognizerHandle<E::Recognizer>>,
    state: SessionState,
    failure: Option<AppError>,
    dropped_frames: u64,
}

impl<E: RecognitionEngine> Session<E> {
    /// Bind a new session to the shared context, using its default settings.
    pub fn new(id: Uuid, context: Arc<ServerContext<E>>) -> Self {
        let config = context.session_defaults().clone();
        Self {
            id,
            context,
            config,
            handle: None,
            state: SessionState::Created,
            failure: None,
            dropped_frames: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The error that ended the session, if it did not end cleanly.
    pub fn failure(&self) -> Option<&AppError> {
        self.failure.as_ref()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn stats(&self) -> crate::engine::HandleStats {
        self.handle.as_ref().map(|h| h.stats()).unwrap_or_default()
    }

    /// Drive the state machine with one event.
    pub fn apply(&mut self, event: SessionEvent) -> Reply {
        match event {
            SessionEvent::Frame(frame) => self.handle_frame(frame),
            SessionEvent::TransportClosed => {
                self.transport_closed();
                Reply::none()
            }
            SessionEvent::IdleTimeout => {
                if self.state == SessionState::Closed {
                    return Reply::none();
                }
                info!(session_id = %self.id, "idle timeout, finalizing session");
                self.end_of_stream()
            }
        }
    }

    pub fn handle_frame(&mut self, frame: InboundFrame) -> Reply {
        if self.state == SessionState::Closed {
            self.dropped_frames += 1;
            warn!(session_id = %self.id, "dropping frame received after session closed");
            return Reply::none();
        }

        match frame.classify() {
            Frame::Audio(data) => self.on_audio(&data),
            Frame::EndOfStream => self.end_of_stream(),
            Frame::Invalid(reason) => self.fail(AppError::Protocol(reason)),
        }
    }

    /// Feed one audio frame; exactly one envelope comes back on success.
    fn on_audio(&mut self, data: &[u8]) -> Reply {
        if self.state == SessionState::Created {
            let context = &self.context;
            let config = &self.config;
            let created = context.serialized(|| {
                RecognizerHandle::create(
                    context.engine(),
                    context.model(),
                    context.speaker_model(),
                    config,
                )
            });
            match created {
                Ok(handle) => {
                    self.handle = Some(handle);
                    self.state = SessionState::Active;
                    debug!(session_id = %self.id, "recognizer created");
                }
                Err(e) => return self.fail(e),
            }
        }

        let outcome = match self.handle.as_mut() {
            Some(handle) => self.context.serialized(|| handle.feed(data)),
            None => Err(AppError::UseAfterRelease),
        };

        match outcome {
            Ok(FeedOutcome::PartialUpdate(transcript)) => {
                Reply::send(ResultEnvelope::partial(&transcript, &self.config))
            }
            Ok(FeedOutcome::UtteranceComplete(transcript)) => {
                debug!(session_id = %self.id, text = %transcript.text, "utterance complete");
                Reply::send(ResultEnvelope::utterance(&transcript, &self.config))
            }
            Err(e) => self.fail(e),
        }
    }

    /// Finalize, emit the final envelope and close.
    fn end_of_stream(&mut self) -> Reply {
        if self.state == SessionState::Created {
            self.state = SessionState::Closed;
            debug!(session_id = %self.id, "end of stream before any audio");
            return Reply::finish(ResultEnvelope::final_result(
                &Default::default(),
                &self.config,
            ));
        }

        self.state = SessionState::Finalizing;
        let finalized = match self.handle.as_mut() {
            Some(handle) => self.context.serialized(|| handle.finalize()),
            None => Err(AppError::UseAfterRelease),
        };
        self.release();

        match finalized {
            Ok(transcript) => Reply::finish(ResultEnvelope::final_result(&transcript, &self.config)),
            Err(e) => {
                error!(session_id = %self.id, error = %e, "finalize failed");
                let reply = Reply::finish(Envelope::error(e.to_string()));
                self.failure = Some(e);
                reply
            }
        }
    }

    /// The peer went away. Flush and release; nobody is left to read a result.
    pub fn transport_closed(&mut self) {
        match self.state {
            SessionState::Closed => {}
            SessionState::Created => self.state = SessionState::Closed,
            SessionState::Active | SessionState::Finalizing => {
                self.state = SessionState::Finalizing;
                self.finalize_best_effort();
                self.release();
            }
        }
    }

    /// Session-scoped failure: best-effort finalize, release, then report the
    /// error to the client and close.
    fn fail(&mut self, err: AppError) -> Reply {
        match &err {
            AppError::Protocol(reason) => {
                warn!(session_id = %self.id, %reason, "protocol violation, closing session")
            }
            other => error!(session_id = %self.id, error = %other, "session failed"),
        }

        if self.state == SessionState::Active {
            self.state = SessionState::Finalizing;
            self.finalize_best_effort();
        }
        self.release();

        let reply = Reply::finish(Envelope::error(err.to_string()));
        self.failure = Some(err);
        reply
    }

    /// Secondary failures are logged and swallowed.
    fn finalize_best_effort(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = self.context.serialized(|| handle.finalize()) {
                debug!(session_id = %self.id, error = %e, "best-effort finalize failed");
            }
        }
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            if self.context.serialized(|| handle.release()) {
                debug!(session_id = %self.id, "recognizer released");
            }
        }
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Recognizer, Transcript};
    use crate::protocol::EnvelopeKind;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        feeds: AtomicUsize,
        finalized: AtomicUsize,
        released: AtomicUsize,
    }

    /// Every frame is a partial, except frames starting with `!` which fail
    /// and frames starting with `.` which complete an utterance.
    struct CountingEngine {
        counters: Arc<Counters>,
    }

    struct CountingRecognizer {
        counters: Arc<Counters>,
        heard: usize,
    }

    impl RecognitionEngine for CountingEngine {
        type Model = ();
        type SpeakerModel = ();
        type Recognizer = CountingRecognizer;

        fn name(&self) -> &'static str {
            "counting"
        }

        fn load_model(&self, _path: &Path) -> Result<(), AppError> {
            Ok(())
        }

        fn load_speaker_model(&self, _path: &Path) -> Result<(), AppError> {
            Ok(())
        }

        fn create_recognizer(
            &self,
            _model: &(),
            _speaker_model: Option<&()>,
            _config: &SessionConfig,
        ) -> Result<CountingRecognizer, AppError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(CountingRecognizer {
                counters: self.counters.clone(),
                heard: 0,
            })
        }
    }

    impl Recognizer for CountingRecognizer {
        fn accept(&mut self, samples: &[i16]) -> Result<FeedOutcome, AppError> {
            self.counters.feeds.fetch_add(1, Ordering::SeqCst);
            self.heard += 1;
            match samples.first().map(|s| s.to_le_bytes()[0]) {
                Some(b'!') => Err(AppError::Engine("injected".to_string())),
                Some(b'.') => Ok(FeedOutcome::UtteranceComplete(Transcript::text("done"))),
                _ => Ok(FeedOutcome::PartialUpdate(Transcript::text(format!(
                    "heard {}",
                    self.heard
                )))),
            }
        }

        fn finalize(&mut self) -> Result<Transcript, AppError> {
            self.counters.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(Transcript {
                alternatives: (0..5)
                    .map(|i| crate::engine::Alternative {
                        text: format!("alt {}", i),
                        confidence: i as f32 / 10.0,
                        words: Vec::new(),
                    })
                    .collect(),
                ..Transcript::text("final")
            })
        }

        fn release(&mut self) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session_with(config: SessionConfig) -> (Session<CountingEngine>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let engine = Arc::new(CountingEngine {
            counters: counters.clone(),
        });
        let context = Arc::new(ServerContext::new(engine, (), None, config));
        (Session::new(Uuid::new_v4(), context), counters)
    }

    fn session() -> (Session<CountingEngine>, Arc<Counters>) {
        session_with(SessionConfig::default())
    }

    fn audio(bytes: &'static [u8]) -> SessionEvent {
        SessionEvent::Frame(InboundFrame::Binary(Bytes::from_static(bytes)))
    }

    fn eof() -> SessionEvent {
        SessionEvent::Frame(InboundFrame::Text(r#"{"eof" : 1}"#.to_string()))
    }

    fn kind(reply: &Reply) -> Option<EnvelopeKind> {
        reply.envelope.as_ref().and_then(|e| e.kind())
    }

    #[test]
    fn test_marker_requires_exact_bytes() {
        assert!(EOF_MARKER.matches(br#"{"eof" : 1}"#));
        assert!(!EOF_MARKER.matches(br#"{"eof":1}"#));
        assert!(!EOF_MARKER.matches(br#"{"eof" : 1} "#));
        assert!(!EOF_MARKER.matches(br#"xx{"eof" : 1}xx"#));

        let binary = InboundFrame::Binary(Bytes::from_static(br#"{"eof" : 1}"#));
        assert_eq!(binary.classify(), Frame::EndOfStream);
        let near_miss = InboundFrame::Binary(Bytes::from_static(br#"{"eof": 1}"#));
        assert!(matches!(near_miss.classify(), Frame::Audio(_)));
    }

    #[test]
    fn test_three_frames_then_marker() {
        let (mut session, counters) = session();

        for _ in 0..3 {
            let reply = session.apply(audio(b"abcd"));
            assert_eq!(kind(&reply), Some(EnvelopeKind::Partial));
            assert!(!reply.close);
        }
        assert_eq!(session.state(), SessionState::Active);

        let reply = session.apply(eof());
        assert_eq!(kind(&reply), Some(EnvelopeKind::Final));
        assert!(reply.close);
        assert_eq!(session.state(), SessionState::Closed);

        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.feeds.load(Ordering::SeqCst), 3);
        assert_eq!(counters.finalized.load(Ordering::SeqCst), 1);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_utterance_boundary_is_not_end_of_stream() {
        let (mut session, _) = session();
        let reply = session.apply(audio(b".x"));
        assert_eq!(kind(&reply), Some(EnvelopeKind::Utterance));
        assert!(!reply.close);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_marker_substring_is_audio() {
        let (mut session, counters) = session();
        let reply = session.apply(audio(br#"..{"eof" : 1}"#));
        assert!(!reply.close);
        assert_eq!(counters.feeds.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_end_of_stream_before_audio() {
        let (mut session, counters) = session();
        let reply = session.apply(eof());

        assert_eq!(reply.envelope.unwrap().to_json(), r#"{"text":""}"#);
        assert!(reply.close);
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transport_close_releases_once_without_reply() {
        let (mut session, counters) = session();
        session.apply(audio(b"abcd"));

        assert_eq!(session.apply(SessionEvent::TransportClosed), Reply::default());
        assert_eq!(session.state(), SessionState::Closed);

        // A racing end-of-stream is ignored.
        assert_eq!(session.apply(eof()), Reply::default());
        assert_eq!(session.dropped_frames(), 1);
        drop(session);

        assert_eq!(counters.finalized.load(Ordering::SeqCst), 1);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_frames_after_close_are_dropped() {
        let (mut session, counters) = session();
        session.apply(audio(b"abcd"));
        session.apply(eof());

        assert_eq!(session.apply(audio(b"abcd")), Reply::default());
        assert_eq!(counters.feeds.load(Ordering::SeqCst), 1);
        assert_eq!(session.dropped_frames(), 1);
    }

    #[test]
    fn test_engine_failure_finalizes_and_closes() {
        let (mut session, counters) = session();
        session.apply(audio(b"abcd"));

        let reply = session.apply(audio(b"!bad"));
        assert!(reply.close);
        assert!(reply.envelope.unwrap().to_json().contains("injected"));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.failure(), Some(AppError::Engine(_))));
        assert_eq!(counters.finalized.load(Ordering::SeqCst), 1);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_text_frame_is_protocol_error() {
        let (mut session, counters) = session();
        session.apply(audio(b"abcd"));

        let reply = session.apply(SessionEvent::Frame(InboundFrame::Text("hello".to_string())));
        assert!(reply.close);
        assert!(matches!(session.failure(), Some(AppError::Protocol(_))));
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_final_alternatives_are_capped_and_sorted() {
        let (mut session, _) = session_with(SessionConfig {
            max_alternatives: 3,
            ..SessionConfig::default()
        });
        session.apply(audio(b"abcd"));

        let json = session.apply(eof()).envelope.unwrap().to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let confidences: Vec<f64> = value["alternatives"]
            .as_array()
            .unwrap()
            .iter()
            .map(|alt| alt["confidence"].as_f64().unwrap())
            .collect();

        assert_eq!(confidences.len(), 3);
        assert!(confidences.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_idle_timeout_behaves_like_end_of_stream() {
        let (mut session, counters) = session();
        session.apply(audio(b"abcd"));

        let reply = session.apply(SessionEvent::IdleTimeout);
        assert_eq!(kind(&reply), Some(EnvelopeKind::Final));
        assert!(reply.close);
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
    }
}
