//! Shared harness for the integration tests: an instrumented scripted engine,
//! a server launcher bound to an ephemeral port and a small WebSocket client.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use vosk_stream_server::config::AppConfig;
use vosk_stream_server::engine::{
    Alternative, FeedOutcome, RecognitionEngine, Recognizer, Transcript, WordTiming,
};
use vosk_stream_server::session::SessionConfig;
use vosk_stream_server::state::AppState;
use vosk_stream_server::{AppError, AppResult, LifecycleHandle, LifecycleManager};

pub const EOF: &str = r#"{"eof" : 1}"#;
pub const WAIT: Duration = Duration::from_secs(5);

/// Call counters shared between the test and every recognizer.
#[derive(Debug, Default)]
pub struct Counters {
    pub model_loads: AtomicUsize,
    pub created: AtomicUsize,
    pub feeds: AtomicUsize,
    pub finalized: AtomicUsize,
    pub released: AtomicUsize,
    pub in_feed: AtomicUsize,
    pub max_parallel_feeds: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Engine whose behaviour is scripted by the first byte of each frame:
///
/// | first byte | outcome |
/// |---|---|
/// | `.` | utterance complete, text `utterance <n>` |
/// | `!` | engine error |
/// | `P` | panic inside the recognizer |
/// | `D` | partial, and the recognizer panics when it is dropped |
/// | anything else | partial, text `partial <n>` |
///
/// `finalize` returns text `final after <n>` with five alternatives of
/// increasing confidence.
pub struct ScriptedEngine {
    pub counters: Arc<Counters>,
    pub concurrent: bool,
    pub feed_delay: Duration,
    pub fail_model_load: bool,
}

impl ScriptedEngine {
    pub fn new() -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Self {
                counters: counters.clone(),
                concurrent: true,
                feed_delay: Duration::ZERO,
                fail_model_load: false,
            },
            counters,
        )
    }
}

pub struct ScriptedRecognizer {
    counters: Arc<Counters>,
    feed_delay: Duration,
    frames: usize,
    panic_on_drop: bool,
}

impl RecognitionEngine for ScriptedEngine {
    type Model = ();
    type SpeakerModel = ();
    type Recognizer = ScriptedRecognizer;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn load_model(&self, path: &Path) -> Result<(), AppError> {
        self.counters.model_loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_model_load {
            return Err(AppError::Config(format!("no model at {}", path.display())));
        }
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
    ) -> Result<ScriptedRecognizer, AppError> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedRecognizer {
            counters: self.counters.clone(),
            feed_delay: self.feed_delay,
            frames: 0,
            panic_on_drop: false,
        })
    }

    fn concurrent_feeds(&self) -> bool {
        self.concurrent
    }
}

impl Recognizer for ScriptedRecognizer {
    fn accept(&mut self, samples: &[i16]) -> Result<FeedOutcome, AppError> {
        let counters = &self.counters;
        counters.feeds.fetch_add(1, Ordering::SeqCst);
        let parallel = counters.in_feed.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_parallel_feeds.fetch_max(parallel, Ordering::SeqCst);
        if !self.feed_delay.is_zero() {
            std::thread::sleep(self.feed_delay);
        }
        counters.in_feed.fetch_sub(1, Ordering::SeqCst);

        self.frames += 1;
        match samples.first().map(|s| s.to_le_bytes()[0]) {
            Some(b'!') => Err(AppError::Engine("scripted failure".to_string())),
            Some(b'P') => panic!("scripted panic"),
            Some(b'D') => {
                self.panic_on_drop = true;
                Ok(FeedOutcome::PartialUpdate(Transcript::text("armed")))
            }
            Some(b'.') => Ok(FeedOutcome::UtteranceComplete(Transcript {
                words: vec![WordTiming {
                    word: "utterance".to_string(),
                    start: 0.0,
                    end: 0.5,
                    conf: 0.9,
                }],
                ..Transcript::text(format!("utterance {}", self.frames))
            })),
            _ => Ok(FeedOutcome::PartialUpdate(Transcript::text(format!(
                "partial {}",
                self.frames
            )))),
        }
    }

    fn finalize(&mut self) -> Result<Transcript, AppError> {
        self.counters.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(Transcript {
            alternatives: (1..=5)
                .map(|i| Alternative {
                    text: format!("hypothesis {}", i),
                    confidence: i as f32 * 0.1,
                    words: Vec::new(),
                })
                .collect(),
            ..Transcript::text(format!("final after {}", self.frames))
        })
    }

    fn release(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ScriptedRecognizer {
    fn drop(&mut self) {
        if self.panic_on_drop && !std::thread::panicking() {
            panic!("scripted drop panic");
        }
    }
}

/// Defaults for a test server on an ephemeral loopback port.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.workers = 1;
    config.server.shutdown_timeout_secs = 1;
    config.server.restart_backoff_ms = 300;
    config.models.model_path = "scripted-model".to_string();
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: LifecycleHandle,
    pub state: AppState,
    pub task: tokio::task::JoinHandle<AppResult<()>>,
}

impl TestServer {
    pub async fn start(engine: ScriptedEngine, config: AppConfig) -> Self {
        let manager = LifecycleManager::new(Arc::new(engine), config);
        let handle = manager.handle();
        let state = manager.state();
        let task = actix_web::rt::spawn(manager.run());

        let addr = tokio::time::timeout(WAIT, handle.bound_addr())
            .await
            .expect("server did not bind in time")
            .expect("lifecycle manager stopped before binding");

        Self {
            addr,
            handle,
            state,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub async fn connect(&self) -> Client {
        let (ws, _) = connect_async(self.url()).await.expect("WebSocket connect failed");
        Client { ws }
    }

    pub async fn stop(self) -> AppResult<()> {
        self.handle.shutdown();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server did not stop in time")
            .expect("lifecycle task panicked")
    }
}

/// Poll until `condition` holds, panicking after [`WAIT`].
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct Client {
    pub ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// What the client observed next.
#[derive(Debug, PartialEq)]
pub enum Received {
    Json(Value),
    Closed(Option<CloseCode>),
}

impl Client {
    pub async fn send_audio(&mut self, bytes: &[u8]) {
        self.ws
            .send(Message::Binary(bytes.to_vec()))
            .await
            .expect("send audio");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("send text");
    }

    pub async fn send_eof(&mut self) {
        self.send_text(EOF).await;
    }

    /// Next JSON envelope or close, skipping control frames.
    pub async fn next(&mut self) -> Received {
        let next = async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Received::Json(serde_json::from_str(&text).expect("envelope is JSON"))
                    }
                    Some(Ok(Message::Close(frame))) => return Received::Closed(frame.map(|f| f.code)),
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return Received::Closed(None),
                }
            }
        };
        tokio::time::timeout(WAIT, next)
            .await
            .expect("no message from server in time")
    }

    pub async fn next_json(&mut self) -> Value {
        match self.next().await {
            Received::Json(value) => value,
            other => panic!("expected an envelope, got {:?}", other),
        }
    }
}
