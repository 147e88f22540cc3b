//! Node registry endpoints (spec.md §6, §4.C).

use axum::extract::{Path, State};
use axum::Json;
use kohakuriver_common::{NodeTotals, Utilization};
use serde::Deserialize;

use crate::error::HostResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub totals: NodeTotals,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> HostResult<Json<kohakuriver_common::Node>> {
    let node = state
        .registry
        .register(&body.hostname, &body.address, body.port, body.totals)
        .await?;
    Ok(Json(node))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
    Json(utilization): Json<Utilization>,
) -> HostResult<()> {
    state.registry.heartbeat(&hostname, utilization).await
}

pub async fn list(State(state): State<AppState>) -> HostResult<Json<Vec<kohakuriver_common::Node>>> {
    Ok(Json(state.registry.list().await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(hostname): Path<String>,
) -> HostResult<Json<kohakuriver_common::Node>> {
    Ok(Json(state.registry.get(&hostname).await?))
}
