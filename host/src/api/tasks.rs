//! Task lifecycle endpoints (spec.md §6, §4.F).

use axum::extract::{Path, Query, State};
use axum::Json;
use kohakuriver_common::{Task, TaskId, TaskStatus, TaskStatusUpdate, TaskSubmission};
use serde::Deserialize;

use crate::error::HostResult;
use crate::state::AppState;

pub async fn submit(State(state): State<AppState>, Json(body): Json<TaskSubmission>) -> HostResult<Json<Task>> {
    Ok(Json(state.scheduler.submit(body).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
}

pub async fn list(State(state): State<AppState>, Query(q): Query<ListQuery>) -> HostResult<Json<Vec<Task>>> {
    Ok(Json(state.scheduler.list(q.status).await?))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<TaskId>) -> HostResult<Json<Task>> {
    Ok(Json(state.scheduler.get(id).await?))
}

/// Runner-originated status push (spec.md §4.F.4).
pub async fn status_update(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
    Json(mut body): Json<TaskStatusUpdate>,
) -> HostResult<Json<Task>> {
    body.task_id = id;
    Ok(Json(state.scheduler.apply_status_update(body).await?))
}

pub async fn approve(State(state): State<AppState>, Path(id): Path<TaskId>) -> HostResult<Json<Task>> {
    Ok(Json(state.scheduler.approve(id).await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct ReasonBody {
    #[serde(default)]
    pub reason: String,
}

pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
    body: Option<Json<ReasonBody>>,
) -> HostResult<Json<Task>> {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_default();
    Ok(Json(state.scheduler.reject(id, &reason).await?))
}

pub async fn cancel(State(state): State<AppState>, Path(id): Path<TaskId>) -> HostResult<Json<Task>> {
    Ok(Json(state.scheduler.cancel(id).await?))
}

pub async fn kill(State(state): State<AppState>, Path(id): Path<TaskId>) -> HostResult<Json<Task>> {
    Ok(Json(state.scheduler.kill(id).await?))
}

pub async fn pause(State(state): State<AppState>, Path(id): Path<TaskId>) -> HostResult<Json<Task>> {
    Ok(Json(state.scheduler.pause(id).await?))
}

pub async fn resume(State(state): State<AppState>, Path(id): Path<TaskId>) -> HostResult<Json<Task>> {
    Ok(Json(state.scheduler.resume(id).await?))
}
