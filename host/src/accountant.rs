//! Resource accounting (spec.md §4.D): derives each node's free capacity
//! from its declared totals and the requests of tasks currently committed
//! against it, then picks a fit for a new request.
//!
//! Pure and synchronous on purpose — the scheduler gathers the inputs
//! (node totals, in-flight reservations) from the database and this module
//! never touches `sqlx` itself, so the tie-break and exact-match rules can
//! be exercised directly in unit tests.

use std::collections::BTreeSet;

use kohakuriver_common::{Node, NumaTopology, ResourceRequest};

#[derive(Debug, Clone)]
pub struct NodeCapacity {
    pub hostname: String,
    pub free_cores: u32,
    pub free_memory_bytes: u64,
    pub free_gpu_indices: BTreeSet<u32>,
    pub numa: Option<NumaTopology>,
}

impl NodeCapacity {
    /// `committed` is every `ResourceRequest` for a task currently assigned
    /// to this node in a non-terminal state (spec.md §4.D.1): pending
    /// dispatches count against capacity the same as running ones.
    pub fn derive(node: &Node, committed: &[ResourceRequest]) -> Self {
        let mut free_cores = node.totals.cores;
        let mut free_memory_bytes = node.totals.memory_bytes;
        let mut taken_gpus: BTreeSet<u32> = BTreeSet::new();

        for req in committed {
            free_cores = free_cores.saturating_sub(req.cores);
            free_memory_bytes = free_memory_bytes.saturating_sub(req.memory_bytes);
            if let Some(indices) = &req.gpu_indices {
                taken_gpus.extend(indices.iter().copied());
            }
        }

        let free_gpu_indices = node
            .totals
            .gpus
            .iter()
            .map(|g| g.index)
            .filter(|idx| !taken_gpus.contains(idx))
            .collect();

        Self {
            hostname: node.hostname.clone(),
            free_cores,
            free_memory_bytes,
            free_gpu_indices,
            numa: node.totals.numa.clone(),
        }
    }

    /// Exact match only: a request for GPUs `{0, 2}` is satisfied only if
    /// both 0 and 2 are free, never by a superset or a different pair
    /// (spec.md §4.D.2 — no partial-fit substitution).
    fn fits(&self, request: &ResourceRequest) -> bool {
        if self.free_cores < request.cores {
            return false;
        }
        if self.free_memory_bytes < request.memory_bytes {
            return false;
        }
        if let Some(wanted) = &request.gpu_indices {
            if !wanted.is_subset(&self.free_gpu_indices) {
                return false;
            }
        }
        if let Some(numa_node) = request.target_numa_node {
            let has_node = self
                .numa
                .as_ref()
                .map(|topo| topo.nodes.iter().any(|n| n.id == numa_node))
                .unwrap_or(false);
            if !has_node {
                return false;
            }
        }
        true
    }
}

/// Picks the best-fitting node: most free cores wins, ties broken by the
/// lexicographically smaller hostname so node selection is deterministic
/// across scheduler restarts (spec.md §4.D.3).
pub fn select_node(candidates: &[NodeCapacity], request: &ResourceRequest) -> Option<String> {
    candidates
        .iter()
        .filter(|c| c.fits(request))
        .max_by(|a, b| {
            a.free_cores
                .cmp(&b.free_cores)
                .then_with(|| b.hostname.cmp(&a.hostname))
        })
        .map(|c| c.hostname.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kohakuriver_common::{GpuInfo, NodeStatus, NodeTotals, Utilization};
    use chrono::Utc;

    fn node(hostname: &str, cores: u32, memory: u64, gpu_count: u32) -> Node {
        Node {
            hostname: hostname.to_string(),
            address: "10.0.0.1".to_string(),
            port: 7601,
            last_heartbeat: Utc::now(),
            totals: NodeTotals {
                cores,
                memory_bytes: memory,
                numa: None,
                gpus: (0..gpu_count)
                    .map(|i| GpuInfo {
                        index: i,
                        name: "test-gpu".into(),
                        memory_bytes: 1 << 34,
                        uuid: format!("gpu-{i}"),
                        pci_address: format!("0000:0{i}:00.0"),
                    })
                    .collect(),
            },
            utilization: Utilization::default(),
            status: NodeStatus::Online,
        }
    }

    fn req(cores: u32, memory: u64) -> ResourceRequest {
        ResourceRequest {
            cores,
            memory_bytes: memory,
            gpu_indices: None,
            target_numa_node: None,
        }
    }

    #[test]
    fn free_capacity_never_goes_negative() {
        let n = node("a", 4, 1024, 0);
        let committed = vec![req(10, 10_000)];
        let cap = NodeCapacity::derive(&n, &committed);
        assert_eq!(cap.free_cores, 0);
        assert_eq!(cap.free_memory_bytes, 0);
    }

    #[test]
    fn tie_break_prefers_lexicographically_smaller_hostname() {
        let cap_a = NodeCapacity {
            hostname: "beta".into(),
            free_cores: 8,
            free_memory_bytes: 1 << 30,
            free_gpu_indices: BTreeSet::new(),
            numa: None,
        };
        let cap_b = NodeCapacity {
            hostname: "alpha".into(),
            free_cores: 8,
            free_memory_bytes: 1 << 30,
            free_gpu_indices: BTreeSet::new(),
            numa: None,
        };
        let chosen = select_node(&[cap_a, cap_b], &req(2, 1024));
        assert_eq!(chosen.as_deref(), Some("alpha"));
    }

    #[test]
    fn gpu_request_needs_exact_indices_free() {
        let n = node("gpu-node", 16, 1 << 34, 4);
        let committed = vec![ResourceRequest {
            cores: 1,
            memory_bytes: 0,
            gpu_indices: Some(BTreeSet::from([0, 1])),
            target_numa_node: None,
        }];
        let cap = NodeCapacity::derive(&n, &committed);
        let want_taken = ResourceRequest {
            cores: 1,
            memory_bytes: 0,
            gpu_indices: Some(BTreeSet::from([1, 2])),
            target_numa_node: None,
        };
        assert!(select_node(&[cap.clone()], &want_taken).is_none());

        let want_free = ResourceRequest {
            cores: 1,
            memory_bytes: 0,
            gpu_indices: Some(BTreeSet::from([2, 3])),
            target_numa_node: None,
        };
        assert!(select_node(&[cap], &want_free).is_some());
    }

    #[test]
    fn highest_free_cores_wins_over_lower() {
        let busy = NodeCapacity {
            hostname: "busy".into(),
            free_cores: 2,
            free_memory_bytes: 1 << 30,
            free_gpu_indices: BTreeSet::new(),
            numa: None,
        };
        let idle = NodeCapacity {
            hostname: "idle".into(),
            free_cores: 16,
            free_memory_bytes: 1 << 30,
            free_gpu_indices: BTreeSet::new(),
            numa: None,
        };
        let chosen = select_node(&[busy, idle], &req(1, 1024));
        assert_eq!(chosen.as_deref(), Some("idle"));
    }
}
