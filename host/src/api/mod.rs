//! Host HTTP API (spec.md §6).

mod health;
pub mod nodes;
pub mod tasks;
pub mod tunnel;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/nodes/register", post(nodes::register))
        .route("/nodes/:hostname/heartbeat", post(nodes::heartbeat))
        .route("/nodes", get(nodes::list))
        .route("/nodes/:hostname", get(nodes::get_one))
        .route("/tasks", post(tasks::submit).get(tasks::list))
        .route("/tasks/:id", get(tasks::get_one))
        .route("/tasks/:id/status", post(tasks::status_update))
        .route("/tasks/:id/approve", post(tasks::approve))
        .route("/tasks/:id/reject", post(tasks::reject))
        .route("/tasks/:id", delete(tasks::cancel))
        .route("/tasks/:id/kill", post(tasks::kill))
        .route("/tasks/:id/pause", post(tasks::pause))
        .route("/tasks/:id/resume", post(tasks::resume))
        .route("/forward/:task_id/:port", get(tunnel::forward))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
