//! Health and metrics endpoints.
//!
//! The service reports `degraded` while the live session sits in `error`;
//! it keeps serving requests either way.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let live = state.live.current();

    let status = if live.error.is_some() { "degraded" } else { "healthy" };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "sessions_started": metrics.sessions_started
        },
        "memory": memory_info(),
        "live": {
            "state": live.state,
            "label": live.label,
            "error": live.error,
            "model": config.live.model,
            "device_backend": config.devices.backend,
            "api_key_configured": config.live.api_key.as_deref().is_some_and(|k| !k.is_empty())
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let live = state.live.current();

    let mut endpoints: Vec<_> = metrics.endpoint_metrics.iter().collect();
    endpoints.sort_by(|a, b| a.0.cmp(b.0));
    let endpoint_stats: Vec<_> = endpoints
        .into_iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms()
            })
        })
        .collect();

    let requests_per_second = if uptime_seconds > 0 {
        metrics.request_count as f64 / uptime_seconds as f64
    } else {
        0.0
    };

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": requests_per_second
        },
        "endpoints": endpoint_stats,
        "memory": memory_info(),
        "live_session": {
            "sessions_started": metrics.sessions_started,
            "session_id": live.session_id,
            "state": live.state,
            "playback_clock": live.playback_clock,
            "active_units": live.active_units,
            "transcript_entries": live.transcript_entries,
            "stats": live.stats
        }
    }))
}

/// Value of a `/proc/<pid>/status` line such as `VmRSS:  1234 kB`, in bytes.
fn status_field_bytes(status: &str, field: &str) -> u64 {
    status
        .lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

fn memory_info() -> serde_json::Value {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => json!({
            "resident_memory_bytes": status_field_bytes(&status, "VmRSS:"),
            "virtual_memory_bytes": status_field_bytes(&status, "VmSize:"),
            "available": true
        }),
        Err(_) => json!({
            "available": false,
            "note": "Memory info not available on this platform"
        }),
    }
}
