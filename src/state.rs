//! # Application State Management
//!
//! Process-wide counters shared by the lifecycle manager, every session worker
//! and the `/health` endpoint. The state outlives listener restarts, so the
//! restart counter keeps counting across cycles.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many owners (each worker task and HTTP worker holds a clone)
//! - **RwLock**: many concurrent readers (health checks) or one writer (a counter bump)
//! - **T**: the plain metrics struct being protected
//!
//! ### Lock poisoning
//! A panic while holding the lock "poisons" it. Counters stay meaningful even
//! then, so the guard is recovered with `PoisonError::into_inner` instead of
//! propagating the panic into unrelated sessions.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The shared application state.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: cloning copies the `Arc`, not the metrics
/// - **Instant**: never changes after startup, so it needs no lock
#[derive(Debug, Clone)]
pub struct AppState {
    /// Counters updated by sessions and the lifecycle manager
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Name of the recognition engine serving sessions
    pub engine: &'static str,

    /// When the process started (not the current listener cycle)
    pub start_time: Instant,
}

/// Counters collected since process start.
///
/// ## Why these metrics matter:
/// - **sessions_***: connection churn and how many ended in an error
/// - **frames_received / envelopes_sent**: should track each other one-to-one plus finals
/// - **protocol_errors**: clients that do not speak the protocol
/// - **restarts**: listener instability
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AppMetrics {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_failed: u64,
    pub sessions_rejected: u64,
    pub frames_received: u64,
    pub envelopes_sent: u64,
    pub protocol_errors: u64,
    pub restarts: u64,
    pub active_sessions: u32,
}

impl AppState {
    /// Create empty state for the given engine.
    pub fn new(engine: &'static str) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            engine,
            start_time: Instant::now(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connection was upgraded and a session registered.
    pub fn session_opened(&self) {
        let mut metrics = self.write();
        metrics.sessions_opened += 1;
        metrics.active_sessions += 1;
    }

    /// A session left the registry.
    ///
    /// ## Underflow protection:
    /// `active_sessions` is only decremented while positive.
    pub fn session_closed(&self, failed: bool) {
        let mut metrics = self.write();
        metrics.sessions_closed += 1;
        if failed {
            metrics.sessions_failed += 1;
        }
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// An upgrade was refused because the session limit was reached.
    pub fn session_rejected(&self) {
        self.write().sessions_rejected += 1;
    }

    pub fn frame_received(&self) {
        self.write().frames_received += 1;
    }

    pub fn envelope_sent(&self) {
        self.write().envelopes_sent += 1;
    }

    pub fn protocol_error(&self) {
        self.write().protocol_errors += 1;
    }

    /// The listener is about to be restarted.
    pub fn record_restart(&self) -> u64 {
        let mut metrics = self.write();
        metrics.restarts += 1;
        metrics.restarts
    }

    /// Get a copy of the counters, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counters() {
        let state = AppState::new("energy");
        state.session_opened();
        state.session_opened();
        state.session_closed(false);
        state.session_closed(true);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.sessions_opened, 2);
        assert_eq!(metrics.sessions_closed, 2);
        assert_eq!(metrics.sessions_failed, 1);
        assert_eq!(metrics.active_sessions, 0);
    }

    #[test]
    fn test_active_sessions_never_underflow() {
        let state = AppState::new("energy");
        state.session_closed(false);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_clones_share_counters() {
        let state = AppState::new("energy");
        let clone = state.clone();
        clone.frame_received();
        assert_eq!(clone.record_restart(), 1);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.frames_received, 1);
        assert_eq!(metrics.restarts, 1);
    }
}
