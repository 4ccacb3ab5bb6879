//! `GET /health` for every service.
//!
//! Always answers 200; the body says whether each dependency responded.
//!
//! ```json
//! {
//!   "status": "degraded",
//!   "service": "post",
//!   "dependencies": { "database": true, "cache": true, "event_bus": false },
//!   "version": "0.1.0",
//!   "timestamp": "2024-01-15T10:30:00Z"
//! }
//! ```

use axum::Json;
use chrono::Utc;
use serde_json::{Map, Value};

use crate::models::HealthResponse;

/// Build the health body from `(dependency, reachable)` pairs.
pub fn health_report(service: &str, dependencies: &[(&str, bool)]) -> Json<HealthResponse> {
    let healthy = dependencies.iter().all(|(_, up)| *up);
    let dependencies: Map<String, Value> = dependencies
        .iter()
        .map(|(name, up)| ((*name).to_string(), Value::Bool(*up)))
        .collect();

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        service: service.to_string(),
        dependencies,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}
