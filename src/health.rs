use crate::state::{AppState, RelayMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let metrics = state.metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let capacity = state.sessions.capacity();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "relay_path": config.relay.path
        },
        "upstream": {
            "url": config.relay.upstream_url,
            "model": config.relay.model
        },
        "animation": {
            "enabled": config.animation.enabled,
            "mode": config.animation.mode
        },
        "sessions": session_status(&metrics, state.sessions.len(), capacity),
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "accepted": metrics.sessions_accepted,
            "active": metrics.sessions_active,
            "closed": metrics.sessions_closed,
            "errored": metrics.sessions_errored,
            "rejected": metrics.rejections.total(),
            "sessions_per_minute": if uptime_seconds > 0 {
                metrics.sessions_accepted as f64 * 60.0 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "rejections": metrics.rejections,
        "upstream_connect_failures": metrics.upstream_connect_failures,
        "relay": metrics.relay,
        "animation": metrics.animation,
        "memory": get_memory_info()
    }))
}

fn session_status(metrics: &RelayMetrics, registered: usize, capacity: usize) -> serde_json::Value {
    let usage = if capacity > 0 {
        registered as f64 / capacity as f64
    } else {
        1.0
    };

    let status = if registered >= capacity {
        "at_capacity"
    } else if usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "active": metrics.sessions_active,
        "registered": registered,
        "max_sessions": capacity,
        "usage_percent": (usage * 100.0).round()
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb();
                } else if line.starts_with("VmSize:") {
                    vm_size = kb();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
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
