//! Shared `axum` router state.

use crate::registry::Registry;
use crate::scheduler::Scheduler;
use kohakuriver_tunnel::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub registry: Registry,
    /// Warm per-container tunnel attachments for the
    /// `/forward/{task_id}/{port}` proxy endpoint (spec.md §4.A component L).
    pub tunnels: SessionRegistry,
}
