//! `GET /docker/images`, `POST /docker/sync/{name}` (spec.md §6, §4.H.1).

use axum::extract::{Path, State};
use axum::Json;
use bollard::models::ImageSummary;

use crate::docker::{ImageOps, SyncOps};
use crate::error::RunnerResult;
use crate::state::AppState;

pub async fn list_images(State(state): State<AppState>) -> RunnerResult<Json<Vec<ImageSummary>>> {
    Ok(Json(state.docker.list_images().await?))
}

pub async fn sync(State(state): State<AppState>, Path(name): Path<String>) -> RunnerResult<()> {
    state.docker.sync_image(&name).await
}
