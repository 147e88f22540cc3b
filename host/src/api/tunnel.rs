//! `GET /forward/{task_id}/{port}` (spec.md §6): upgrades to WebSocket and
//! splices the connection into the task's container tunnel via the
//! Runner's `/tunnel/{container_id}/host` attachment (SPEC_FULL.md §4.A/L).

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use kohakuriver_common::{container_name, TaskId};
use kohakuriver_tunnel::Protocol;
use tracing::warn;

use crate::error::HostError;
use crate::state::AppState;

pub async fn forward(
    State(state): State<AppState>,
    Path((task_id, port)): Path<(TaskId, u16)>,
    ws: WebSocketUpgrade,
) -> Response {
    let task = match state.scheduler.get(task_id).await {
        Ok(t) => t,
        Err(err) => return err.into_response(),
    };
    let Some(hostname) = task.assigned_node.clone() else {
        return HostError::Validation(format!("task {task_id} has no assigned node yet")).into_response();
    };
    let node = match state.registry.get(&hostname).await {
        Ok(n) => n,
        Err(err) => return err.into_response(),
    };

    let runner_ws_base_url = format!("ws://{}:{}", node.address, node.port);
    let container_id = container_name(task.task_type, task_id);
    let session = match state.tunnels.get_or_connect(&runner_ws_base_url, &container_id).await {
        Ok(s) => s,
        Err(err) => {
            warn!(task_id, %err, "failed to attach to runner tunnel");
            return HostError::Dispatch(err.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        session.serve_external(socket, Protocol::Tcp, port).await;
    })
}
