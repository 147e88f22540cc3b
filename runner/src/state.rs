//! Shared `axum` router state for the Runner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kohakuriver_tunnel::Relay;

use crate::config::RunnerConfig;
use crate::docker::DockerManager;
use crate::executor::Executor;
use crate::vault::Vault;

/// Gates task-dispatch endpoints until startup reconciliation has run
/// (spec.md §4.I: a Runner must not accept new work while it still doesn't
/// know what it's already running).
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RunnerConfig>,
    pub docker: Arc<DockerManager>,
    pub vault: Vault,
    pub executor: Arc<Executor>,
    pub relay: Relay,
    pub http: reqwest::Client,
    pub readiness: Readiness,
}
