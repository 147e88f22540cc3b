//! Background monitor (spec.md §4.G): the only path that produces `lost`,
//! plus the assigning-timeout reaper resolved as an open question — see
//! `DESIGN.md`.

use std::time::Duration;

use tracing::{info, warn};

use crate::db::tasks::CasOutcome;
use crate::db::TaskRepo;
use crate::error::HostResult;
use crate::registry::Registry;

pub struct Monitor {
    tasks: TaskRepo,
    registry: Registry,
    heartbeat_timeout: chrono::Duration,
    assigning_timeout: chrono::Duration,
    tick: Duration,
}

impl Monitor {
    pub fn new(
        tasks: TaskRepo,
        registry: Registry,
        heartbeat_timeout: Duration,
        assigning_timeout: Duration,
        tick: Duration,
    ) -> Self {
        Self {
            tasks,
            registry,
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or(chrono::Duration::seconds(15)),
            assigning_timeout: chrono::Duration::from_std(assigning_timeout)
                .unwrap_or(chrono::Duration::seconds(60)),
            tick,
        }
    }

    /// Runs forever; spawn this as a background task from `main`.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep().await {
                warn!(%err, "monitor sweep failed");
            }
        }
    }

    async fn sweep(&self) -> HostResult<()> {
        self.reap_dead_runners().await?;
        self.reap_stuck_assigning().await?;
        Ok(())
    }

    /// §4.G: nodes past `heartbeat_timeout` go offline; every non-terminal
    /// task they held becomes `lost` with a synthetic error.
    async fn reap_dead_runners(&self) -> HostResult<()> {
        let stale = self.registry.reap_stale(self.heartbeat_timeout).await?;
        for node in stale {
            let orphaned = self.tasks.list_non_terminal_for_node(&node.hostname).await?;
            let reason = format!("runner {} died", node.hostname);
            for task in orphaned {
                match self.tasks.mark_lost(task.id, &node.hostname, &reason).await? {
                    CasOutcome::Applied(_) => {
                        warn!(task_id = task.id, hostname = %node.hostname, "task marked lost");
                    }
                    CasOutcome::Conflict(_) | CasOutcome::NotFound => {}
                }
            }
        }
        Ok(())
    }

    /// §9 resolved Open Question: a dispatch that never produces a `running`
    /// update within `assigning_timeout` fails instead of hanging forever.
    async fn reap_stuck_assigning(&self) -> HostResult<()> {
        let cutoff = chrono::Utc::now() - self.assigning_timeout;
        let stuck = self.tasks.list_stuck_assigning(cutoff).await?;
        for task in stuck {
            match self
                .tasks
                .fail_assigning_timeout(task.id, "assigning timed out without a running report")
                .await?
            {
                CasOutcome::Applied(_) => {
                    info!(task_id = task.id, "assigning timeout, marked failed");
                }
                CasOutcome::Conflict(_) | CasOutcome::NotFound => {}
            }
        }
        Ok(())
    }
}
