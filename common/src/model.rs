//! Shared data model for the control plane (spec.md §3).
//!
//! These types cross the Host↔Runner HTTP boundary, so they live in one
//! crate the way `ob-poc-types` is the single source of truth for the
//! teacher's Rust↔TypeScript boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type TaskId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Command,
    Vps,
}

/// Task state machine (spec.md §3). Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    PendingApproval,
    Assigning,
    /// Internal: dispatch HTTP call has been sent, guards against a retry
    /// re-dispatching the same task (spec.md §4.F.3).
    AssigningDispatched,
    Running,
    Paused,
    Killing,
    Completed,
    Failed,
    Killed,
    Lost,
    Rejected,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Killed
                | TaskStatus::Lost
                | TaskStatus::Rejected
                | TaskStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::PendingApproval => "pending_approval",
            TaskStatus::Assigning => "assigning",
            TaskStatus::AssigningDispatched => "assigning_dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Killing => "killing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
            TaskStatus::Lost => "lost",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => TaskStatus::Pending,
            "pending_approval" => TaskStatus::PendingApproval,
            "assigning" => TaskStatus::Assigning,
            "assigning_dispatched" => TaskStatus::AssigningDispatched,
            "running" => TaskStatus::Running,
            "paused" => TaskStatus::Paused,
            "killing" => TaskStatus::Killing,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "killed" => TaskStatus::Killed,
            "lost" => TaskStatus::Lost,
            "rejected" => TaskStatus::Rejected,
            "canceled" => TaskStatus::Canceled,
            other => return Err(format!("unknown task status {other:?}")),
        })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_bytes: u64,
    pub uuid: String,
    pub pci_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaTopology {
    pub nodes: Vec<NumaNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNode {
    pub id: u32,
    pub cpu_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Declared capacity of a node, reported at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTotals {
    pub cores: u32,
    pub memory_bytes: u64,
    pub numa: Option<NumaTopology>,
    pub gpus: Vec<GpuInfo>,
}

/// Live utilization, reported at every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Utilization {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub gpu_utilization: Vec<GpuUtilization>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuUtilization {
    pub index: u32,
    pub utilization_percent: f32,
    pub memory_used_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub last_heartbeat: DateTime<Utc>,
    pub totals: NodeTotals,
    pub utilization: Utilization,
    pub status: NodeStatus,
}

/// Which GPU indices / NUMA node a task requests, kept separate from the
/// node's declared inventory so the accountant can diff them directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cores: u32,
    pub memory_bytes: u64,
    pub gpu_indices: Option<BTreeSet<u32>>,
    pub target_numa_node: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub user_id: String,
    pub submitted_at: DateTime<Utc>,
    pub assigned_node: Option<String>,
    pub resources: ResourceRequest,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: std::collections::BTreeMap<String, String>,
    pub ssh_port: Option<u16>,
    pub overlay_ip: Option<String>,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_vps(&self) -> bool {
        matches!(self.task_type, TaskType::Vps)
    }
}

/// Naming convention shared by the Runner (container creation, startup
/// reconciliation) and the Host (tunnel container id) so both sides derive
/// the same container name from a task id without a lookup table
/// (spec.md §6 "Container naming convention").
pub fn container_name(task_type: TaskType, task_id: TaskId) -> String {
    match task_type {
        TaskType::Command => format!("kohakuriver-task-{task_id}"),
        TaskType::Vps => format!("kohakuriver-vps-{task_id}"),
    }
}

/// Inverse of [`container_name`]: parses a container name produced by this
/// convention back into its task id. Any container whose name matches one
/// of the two prefixes but whose suffix isn't a valid id is orphaned
/// (spec.md §6), so this returns `None` rather than erroring.
pub fn parse_container_name(name: &str) -> Option<TaskId> {
    name.strip_prefix("kohakuriver-task-")
        .or_else(|| name.strip_prefix("kohakuriver-vps-"))
        .and_then(|suffix| suffix.parse().ok())
}

/// Target resolution (spec.md §4.F.1 step 2, §9 redesign of dynamic target
/// dicts into a tagged enum).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSpec {
    Hostname { hostname: String },
    AnyMatching { min_cores: u32, min_memory_bytes: u64 },
    FromPool { pool: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_type: TaskType,
    pub user_id: String,
    pub resources: ResourceRequest,
    pub target: TargetSpec,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: std::collections::BTreeMap<String, String>,
    pub want_overlay_ip: bool,
    pub requested_ssh_port: Option<u16>,
    pub auto_approve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: TaskId,
    pub from_hostname: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

/// Full descriptor the Host POSTs to a Runner to start a workload
/// (spec.md §6, Runner `POST /tasks` / `POST /vps/create/{id}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: std::collections::BTreeMap<String, String>,
    pub resources: ResourceRequest,
    pub ssh_port: Option<u16>,
    pub overlay_ip: Option<String>,
    pub tunnel_ws_base_url: String,
}
