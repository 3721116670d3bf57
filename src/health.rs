//! # Health Check
//!
//! `GET /health` for load balancers and operators: liveness, uptime, and how many calls
//! are currently being relayed. Counters are process-lifetime totals from
//! [`crate::state::CallMetrics`].

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "call-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "calls": {
            "active": state.registry.len(),
            "started": metrics.calls_started,
            "completed": metrics.calls_completed,
            "decode_errors": metrics.decode_errors,
            "upstream_failures": metrics.upstream_failures
        },
        "extraction_enabled": state.extractor.is_some()
    }))
}
