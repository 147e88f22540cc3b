//! `POST /vps/create/{id}` (spec.md §6, §4.H.5): the Host dispatches a vps
//! task here instead of `/tasks`; kill/pause/resume share the generic
//! `/tasks/{id}/...` routes since both task types stop the same container.

use axum::extract::State;
use axum::Json;

use crate::error::{RunnerError, RunnerResult};
use crate::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    Json(dispatch): Json<kohakuriver_common::TaskDispatch>,
) -> RunnerResult<()> {
    if !state.readiness.is_ready() {
        return Err(RunnerError::NotReady);
    }
    state.executor.dispatch_vps(dispatch).await
}
