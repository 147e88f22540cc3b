//! Command task lifecycle endpoints (spec.md §6 Runner routes).

use axum::extract::{Path, State};
use axum::Json;
use kohakuriver_common::TaskId;

use crate::error::{RunnerError, RunnerResult};
use crate::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    Json(dispatch): Json<kohakuriver_common::TaskDispatch>,
) -> RunnerResult<()> {
    if !state.readiness.is_ready() {
        return Err(RunnerError::NotReady);
    }
    state.executor.dispatch_command(dispatch).await
}

pub async fn kill(State(state): State<AppState>, Path(id): Path<TaskId>) -> RunnerResult<()> {
    state.executor.kill(id).await
}

pub async fn pause(State(state): State<AppState>, Path(id): Path<TaskId>) -> RunnerResult<()> {
    state.executor.pause(id).await
}

pub async fn resume(State(state): State<AppState>, Path(id): Path<TaskId>) -> RunnerResult<()> {
    state.executor.resume(id).await
}
