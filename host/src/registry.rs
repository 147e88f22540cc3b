//! Node registry (spec.md §4.C): registration, heartbeats, and the
//! online/offline view the scheduler and monitor read from.

use chrono::Utc;
use kohakuriver_common::{Node, NodeStatus, NodeTotals, Utilization};
use tracing::{info, warn};

use crate::db::NodeRepo;
use crate::error::{HostError, HostResult};

#[derive(Clone)]
pub struct Registry {
    repo: NodeRepo,
}

impl Registry {
    pub fn new(repo: NodeRepo) -> Self {
        Self { repo }
    }

    pub async fn register(&self, hostname: &str, address: &str, port: u16, totals: NodeTotals) -> HostResult<Node> {
        if totals.cores == 0 {
            return Err(HostError::Validation("node must declare at least one core".into()));
        }
        let node = Node {
            hostname: hostname.to_string(),
            address: address.to_string(),
            port,
            last_heartbeat: Utc::now(),
            totals,
            utilization: Utilization::default(),
            status: NodeStatus::Online,
        };
        self.repo.register(&node).await?;
        info!(hostname, address, port, "node registered");
        Ok(node)
    }

    pub async fn heartbeat(&self, hostname: &str, utilization: Utilization) -> HostResult<()> {
        let applied = self.repo.heartbeat(hostname, &utilization, Utc::now()).await?;
        if !applied {
            return Err(HostError::NodeNotFound(hostname.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, hostname: &str) -> HostResult<Node> {
        self.repo
            .get(hostname)
            .await?
            .ok_or_else(|| HostError::NodeNotFound(hostname.to_string()))
    }

    pub async fn list(&self) -> HostResult<Vec<Node>> {
        self.repo.list().await
    }

    pub async fn list_online(&self) -> HostResult<Vec<Node>> {
        self.repo.list_online().await
    }

    /// §4.G step 1: runners whose heartbeat is older than `timeout` get
    /// marked offline; their non-terminal tasks are the monitor's job.
    pub async fn reap_stale(&self, timeout: chrono::Duration) -> HostResult<Vec<Node>> {
        let cutoff = Utc::now() - timeout;
        let stale = self.repo.list_stale(cutoff).await?;
        for node in &stale {
            warn!(hostname = %node.hostname, "node heartbeat expired, marking offline");
            self.repo.mark_offline(&node.hostname).await?;
        }
        Ok(stale)
    }
}
