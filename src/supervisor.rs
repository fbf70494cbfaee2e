//! # Connection Supervisor
//!
//! Tracks every live session and runs each one in its own worker task.
//!
//! ## Per-session worker:
//! - frames arrive over a **bounded** queue; a full queue pauses the
//!   transport reader instead of dropping audio
//! - frames are processed strictly one at a time, each on the blocking pool,
//!   so a slow recognizer never stalls the accept loop or other sessions
//! - results leave over an unbounded queue that the WebSocket actor drains
//!
//! ## Failure isolation:
//! A failing or panicking session only ends itself. The registry slot is held
//! by a guard that frees it when the worker ends for any reason, including
//! panics and runtime shutdown.

use crate::config::PerformanceConfig;
use crate::engine::RecognitionEngine;
use crate::error::{AppError, AppResult};
use crate::protocol::Envelope;
use crate::server::ServerContext;
use crate::session::{InboundFrame, Session, SessionEvent, SessionState};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity settings, taken from the `performance` config section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorLimits {
    pub max_sessions: usize,
    pub queue_depth: usize,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    /// WebSocket ping cadence.
    pub heartbeat_interval: Duration,
    /// Close the transport after this long without a ping or pong from the peer.
    pub client_timeout: Duration,
}

impl From<&PerformanceConfig> for SupervisorLimits {
    fn from(config: &PerformanceConfig) -> Self {
        Self {
            max_sessions: config.max_concurrent_sessions,
            queue_depth: config.frame_queue_depth.max(1),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.client_timeout_secs),
        }
    }
}

/// Registry entry for one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub peer: Option<String>,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub frames: u64,
}

/// Message from a session worker to its WebSocket actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    /// Close the connection with a normal close code. A worker that ends
    /// without sending this gets an error close instead.
    Close,
}

/// The transport side of an opened session.
pub struct SessionLink {
    pub id: Uuid,
    pub frames: mpsc::Sender<InboundFrame>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Summary of supervisor state, served by `/health`.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSummary {
    pub active: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<&'static str, usize>,
    pub serialized_feeds: bool,
}

pub struct Supervisor<E: RecognitionEngine> {
    context: Arc<ServerContext<E>>,
    limits: SupervisorLimits,
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
    state: AppState,
    idle: Arc<Notify>,
}

// Manual impl: `E` itself does not need to be `Clone`.
impl<E: RecognitionEngine> Clone for Supervisor<E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            limits: self.limits,
            sessions: self.sessions.clone(),
            state: self.state.clone(),
            idle: self.idle.clone(),
        }
    }
}

impl<E: RecognitionEngine> Supervisor<E> {
    pub fn new(context: Arc<ServerContext<E>>, limits: SupervisorLimits, state: AppState) -> Self {
        Self {
            context,
            limits,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            state,
            idle: Arc::new(Notify::new()),
        }
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, SessionInfo>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_sessions(&self) -> RwLockReadGuard<'_, HashMap<Uuid, SessionInfo>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session and start its worker. Must be called from within a
    /// tokio runtime.
    ///
    /// ## Errors:
    /// - **SessionLimit**: `max_sessions` sessions are already live
    pub fn open(&self, peer: Option<String>) -> AppResult<SessionLink> {
        let id = Uuid::new_v4();
        let active = {
            let mut sessions = self.write_sessions();
            if sessions.len() >= self.limits.max_sessions {
                self.state.session_rejected();
                warn!(peer = ?peer, max = self.limits.max_sessions, "session limit reached, refusing connection");
                return Err(AppError::SessionLimit(self.limits.max_sessions));
            }
            sessions.insert(
                id,
                SessionInfo {
                    id,
                    peer: peer.clone(),
                    state: SessionState::Created,
                    opened_at: Utc::now(),
                    frames: 0,
                },
            );
            sessions.len()
        };
        self.state.session_opened();

        let (frame_tx, frame_rx) = mpsc::channel(self.limits.queue_depth);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Session::new(id, self.context.clone());

        tokio::spawn(self.clone().run_session(session, frame_rx, out_tx));
        info!(session_id = %id, peer = ?peer, active, "session opened");

        Ok(SessionLink {
            id,
            frames: frame_tx,
            outbound: out_rx,
        })
    }

    async fn run_session(
        self,
        session: Session<E>,
        mut frames: mpsc::Receiver<InboundFrame>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        let id = session.id();
        let mut slot = SlotGuard {
            supervisor: self.clone(),
            id,
            failed: true,
        };
        let mut session = session;

        loop {
            let event = if outbound.is_closed() {
                SessionEvent::TransportClosed
            } else {
                self.next_event(&mut frames).await
            };
            let is_frame = matches!(event, SessionEvent::Frame(_));

            let processed = tokio::task::spawn_blocking(move || {
                let reply = session.apply(event);
                (session, reply)
            })
            .await;

            let reply = match processed {
                Ok((returned, reply)) => {
                    session = returned;
                    reply
                }
                Err(e) => {
                    // The session was dropped while unwinding, which released its recognizer.
                    // Dropping `outbound` without a `Close` makes the actor close with an error code.
                    error!(session_id = %id, error = %e, "session worker panicked");
                    return;
                }
            };

            if is_frame {
                self.state.frame_received();
            }
            self.update(id, session.state(), session.stats().frames);

            if let Some(envelope) = reply.envelope {
                if let Envelope::Error(error) = &envelope {
                    debug!(session_id = %id, error = %error.error, "sending error envelope");
                }
                if outbound.send(Outbound::Text(envelope.to_json())).is_ok() {
                    self.state.envelope_sent();
                }
            }
            if reply.close {
                let _ = outbound.send(Outbound::Close);
            }
            if session.state() == SessionState::Closed {
                break;
            }
        }

        if matches!(session.failure(), Some(AppError::Protocol(_))) {
            self.state.protocol_error();
        }
        slot.failed = session.failure().is_some();

        let stats = session.stats();
        info!(
            session_id = %id,
            frames = stats.frames,
            bytes = stats.bytes,
            utterances = stats.utterances,
            dropped = session.dropped_frames(),
            failed = slot.failed,
            "session closed"
        );
    }

    async fn next_event(&self, frames: &mut mpsc::Receiver<InboundFrame>) -> SessionEvent {
        let received = match self.limits.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, frames.recv()).await {
                Ok(received) => received,
                Err(_) => return SessionEvent::IdleTimeout,
            },
            None => frames.recv().await,
        };
        received
            .map(SessionEvent::Frame)
            .unwrap_or(SessionEvent::TransportClosed)
    }

    fn update(&self, id: Uuid, state: SessionState, frames: u64) {
        if let Some(info) = self.write_sessions().get_mut(&id) {
            info.state = state;
            info.frames = frames;
        }
    }

    fn remove(&self, id: Uuid, failed: bool) {
        if self.write_sessions().remove(&id).is_some() {
            self.state.session_closed(failed);
        }
        self.idle.notify_waiters();
    }

    pub fn active_count(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn limits(&self) -> SupervisorLimits {
        self.limits
    }

    pub fn engine_name(&self) -> &'static str {
        self.context.engine().name()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.read_sessions().values().cloned().collect()
    }

    pub fn summary(&self) -> SupervisorSummary {
        let sessions = self.read_sessions();
        let mut state_counts = HashMap::new();
        for info in sessions.values() {
            *state_counts.entry(info.state.as_str()).or_insert(0) += 1;
        }

        SupervisorSummary {
            active: sessions.len(),
            max_sessions: self.limits.max_sessions,
            state_counts,
            serialized_feeds: self.context.is_serialized(),
        }
    }

    /// Resolve once no session is registered.
    pub async fn wait_idle(&self) {
        loop {
            // Created before the check so a removal in between is not missed.
            let notified = self.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Frees the registry slot when the worker ends, however it ends.
struct SlotGuard<E: RecognitionEngine> {
    supervisor: Supervisor<E>,
    id: Uuid,
    failed: bool,
}

impl<E: RecognitionEngine> Drop for SlotGuard<E> {
    fn drop(&mut self) {
        self.supervisor.remove(self.id, self.failed);
    }
}
