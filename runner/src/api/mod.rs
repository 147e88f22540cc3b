//! Runner HTTP API (spec.md §6).

mod docker;
mod health;
mod tasks;
mod tunnel;
mod vps;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/tasks", post(tasks::create))
        .route("/tasks/:id/kill", post(tasks::kill))
        .route("/tasks/:id/pause", post(tasks::pause))
        .route("/tasks/:id/resume", post(tasks::resume))
        .route("/vps/create/:id", post(vps::create))
        .route("/docker/images", get(docker::list_images))
        .route("/docker/sync/*name", post(docker::sync))
        .route("/tunnel/:container_id", get(tunnel::container_socket))
        .route("/tunnel/:container_id/host", get(tunnel::host_socket))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
