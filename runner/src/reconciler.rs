//! Startup reconciliation (spec.md §4.I): before a Runner accepts new
//! dispatches, it must reconcile what Docker says is running against what
//! the vault says it dispatched, so a restart never orphans a container or
//! silently forgets a task the Host still believes is live.
//!
//! Grounded on `original_source/runner/background/startup_check.py`, which
//! performs the same five-step reconciliation against the vault's Python
//! counterpart (`TaskStateStore`).

use std::collections::HashSet;
use std::sync::Arc;

use kohakuriver_common::{parse_container_name, TaskId};
use tracing::{info, warn};

use crate::docker::{ContainerOps, DockerManager};
use crate::error::RunnerResult;
use crate::executor::{report_dead_on_arrival, Executor};
use crate::vault::Vault;

pub struct ReconcileReport {
    pub readopted: usize,
    pub reported_dead: usize,
    pub removed_orphans: usize,
    pub vault_entries_cleared: usize,
}

/// Runs the full five-step reconciliation described in spec.md §4.I:
///
/// 1. list containers Docker actually has running, filtered to ones this
///    runner's naming convention produced;
/// 2. for each container still running whose id is in the vault, re-adopt
///    it (spawn a waiter, leave the vault entry alone);
/// 3. for each container still running whose id is NOT in the vault (or
///    whose name doesn't parse), it's an orphan: stop and remove it;
/// 4. for each vault entry whose container isn't running any more, report
///    its terminal status to the Host and drop the vault entry;
/// 5. anything left in neither set needs no action.
pub async fn reconcile(
    docker: Arc<DockerManager>,
    vault: &Vault,
    executor: &Executor,
    http: &reqwest::Client,
    host_base_url: &str,
    hostname: &str,
) -> RunnerResult<ReconcileReport> {
    let running = docker.list_kohakuriver_containers().await?;

    let mut running_ids: HashSet<TaskId> = HashSet::new();
    let mut readopted = 0usize;
    let mut removed_orphans = 0usize;

    for container in &running {
        let name = container
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string());
        let Some(name) = name else {
            continue;
        };
        let task_id = parse_container_name(&name);
        let vault_entry = match task_id {
            Some(id) => vault.get(id).await?,
            None => None,
        };

        match (task_id, vault_entry) {
            (Some(id), Some(entry)) => {
                running_ids.insert(id);
                info!(task_id = id, container = %name, "re-adopting running container");
                executor.readopt(&entry);
                readopted += 1;
            }
            (Some(id), None) => {
                warn!(task_id = id, container = %name, "container is running but has no vault entry, treating as orphan");
                stop_and_remove(&docker, &name).await;
                removed_orphans += 1;
            }
            (None, _) => {
                warn!(container = %name, "container name does not match the naming convention, treating as orphan");
                stop_and_remove(&docker, &name).await;
                removed_orphans += 1;
            }
        }
    }

    let mut reported_dead = 0usize;
    let mut vault_entries_cleared = 0usize;
    for entry in vault.list_all().await? {
        if running_ids.contains(&entry.task_id) {
            continue;
        }
        match docker.inspect(&entry.container_name).await {
            Ok(inspection) => {
                info!(task_id = entry.task_id, "vault entry's container is no longer running, reporting terminal status");
                report_dead_on_arrival(http, host_base_url, hostname, entry.task_id, &inspection).await;
            }
            Err(_) => {
                // Container doesn't exist at all any more; still report a
                // terminal status so the Host doesn't wait forever.
                warn!(task_id = entry.task_id, "vault entry's container no longer exists");
                let inspection = crate::docker::ContainerInspection {
                    running: false,
                    exit_code: None,
                    started_at: None,
                };
                report_dead_on_arrival(http, host_base_url, hostname, entry.task_id, &inspection).await;
            }
        }
        let _ = vault.remove(entry.task_id).await;
        reported_dead += 1;
        vault_entries_cleared += 1;
    }

    Ok(ReconcileReport {
        readopted,
        reported_dead,
        removed_orphans,
        vault_entries_cleared,
    })
}

async fn stop_and_remove(docker: &DockerManager, name: &str) {
    if let Err(err) = docker.stop(name).await {
        warn!(container = %name, %err, "failed to stop orphaned container");
    }
    if let Err(err) = docker.remove(name).await {
        warn!(container = %name, %err, "failed to remove orphaned container");
    }
}
