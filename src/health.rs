//! # Health and Metrics Endpoints
//!
//! - `GET /health` and `GET /api/v1/health`: liveness plus a short summary
//! - `GET /api/v1/metrics`: every counter, per-route statistics and memory use

use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};

use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": status_label(&config, &metrics),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "calls": {
            "active": metrics.active_calls,
            "capacity": config.performance.max_concurrent_calls,
            "total": metrics.calls_total
        },
        "providers": provider_status(&config),
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let turns_total = metrics.turns_delivered + metrics.turns_skipped + metrics.turns_failed;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "requests_per_second": ratio(metrics.request_count, uptime_seconds)
        },
        "calls": {
            "active": metrics.active_calls,
            "total": metrics.calls_total,
            "rejected": metrics.calls_rejected,
            "frames_received": metrics.frames_received
        },
        "turns": {
            "total": turns_total,
            "delivered": metrics.turns_delivered,
            "skipped": metrics.turns_skipped,
            "failed": metrics.turns_failed,
            "fallback_replies": metrics.fallback_replies,
            "delivery_rate": ratio(metrics.turns_delivered, turns_total)
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}

/// "degraded" when providers are unconfigured or the call limit is reached.
fn status_label(config: &AppConfig, metrics: &AppMetrics) -> &'static str {
    let at_capacity = metrics.active_calls as usize >= config.performance.max_concurrent_calls;
    let missing_keys = config.speech.api_key.is_empty() || config.reasoning.api_key.is_empty();
    if at_capacity || missing_keys {
        "degraded"
    } else {
        "healthy"
    }
}

fn provider_status(config: &AppConfig) -> serde_json::Value {
    json!({
        "speech": {
            "configured": !config.speech.api_key.is_empty(),
            "stt_model": config.speech.stt_model,
            "tts_model": config.speech.tts_model,
            "voice_id": config.speech.voice_id
        },
        "reasoning": {
            "configured": !config.reasoning.api_key.is_empty(),
            "model": config.reasoning.model
        },
        "telephony": {
            "configured": !config.telephony.account_sid.is_empty()
                && !config.telephony.auth_token.is_empty()
        }
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
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

    json!({ "available": false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::app_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_calls() {
        let state = app_state();
        assert!(state.try_open_call(50));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["calls"]["active"], 1);
        assert_eq!(body["service"]["name"], "callbridge");
        // Default config has no provider keys
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["providers"]["speech"]["configured"], false);
    }

    #[actix_web::test]
    async fn test_metrics_include_turn_counters() {
        let state = app_state();
        state.record_turn(&crate::pipeline::TurnOutcome::Delivered { fallback_audio: false }, false);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["turns"]["delivered"], 1);
        assert_eq!(body["turns"]["delivery_rate"], 1.0);
    }

    #[actix_web::test]
    async fn test_ratio() {
        assert_eq!(ratio(1, 4), 0.25);
        assert_eq!(ratio(3, 0), 0.0);
    }
}
