//! `WS /tunnel/{container_id}` and `GET /tunnel/{container_id}/host`
//! (SPEC_FULL.md's resolution of spec.md §4.A component J): the two legs
//! the relay splices together for one container's tunnel.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::Response;

use crate::state::AppState;

pub async fn container_socket(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.relay.handle_container_socket(container_id, socket).await;
    })
}

pub async fn host_socket(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.relay.handle_host_socket(container_id, socket).await;
    })
}
