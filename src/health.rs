//! # Health Check
//!
//! `GET /health` reports whether the server is up and how loaded it is:
//! engine name, live sessions against the limit, lifetime counters, process
//! memory and a coarse load status with warnings.

use crate::engine::RecognitionEngine;
use crate::state::{AppMetrics, AppState};
use crate::supervisor::{Supervisor, SupervisorSummary};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check<E: RecognitionEngine>(
    state: web::Data<AppState>,
    supervisor: web::Data<Supervisor<E>>,
) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let summary = supervisor.summary();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "engine": state.engine,
        },
        "sessions": {
            "active": summary.active,
            "limit": summary.max_sessions,
            "by_state": summary.state_counts,
            "serialized_feeds": summary.serialized_feeds,
        },
        "metrics": {
            "sessions_opened": metrics.sessions_opened,
            "sessions_closed": metrics.sessions_closed,
            "sessions_failed": metrics.sessions_failed,
            "sessions_rejected": metrics.sessions_rejected,
            "frames_received": metrics.frames_received,
            "envelopes_sent": metrics.envelopes_sent,
            "protocol_errors": metrics.protocol_errors,
            "restarts": metrics.restarts,
        },
        "memory": get_memory_info(),
        "system": get_system_status(&summary, &metrics),
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

fn get_system_status(summary: &SupervisorSummary, metrics: &AppMetrics) -> serde_json::Value {
    let session_usage = if summary.max_sessions > 0 {
        summary.active as f64 / summary.max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    let mut warnings = Vec::new();
    if session_usage > 0.8 {
        warnings.push("High session usage - consider increasing max_concurrent_sessions");
    }
    if metrics.restarts > 0 {
        warnings.push("Listener has been restarted since startup");
    }

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "load_warnings": warnings
    })
}
