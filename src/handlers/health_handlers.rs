//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and the cache monitor

use crate::services::{cache_monitor::MonitorStatsSnapshot, relay_service::RelayService};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe; always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Verifies the cache monitor worker is alive when monitoring is enabled.
///
/// Returns JSON describing each check plus the monitor counters. HTTP 200 when
/// all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(service): State<RelayService>) -> impl IntoResponse {
    // 1) SQLite check
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.db)
        .await
    {
        Ok(1) => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    // 2) Monitor check
    let monitor = &service.monitor;
    let monitor_check = if !monitor.is_enabled() || monitor.is_running() {
        (true, None)
    } else {
        (false, Some("cache monitor worker is not running".to_string()))
    };

    let overall_ok = sqlite_check.0 && monitor_check.0;

    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_check.0,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "cdn_monitor",
        CheckStatus {
            ok: monitor_check.0,
            error: monitor_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
        monitor: MonitorReport {
            enabled: monitor.is_enabled(),
            running: monitor.is_running(),
            stats: monitor.stats(),
        },
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
    monitor: MonitorReport,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

#[derive(Serialize)]
struct MonitorReport {
    enabled: bool,
    running: bool,
    stats: MonitorStatsSnapshot,
}
