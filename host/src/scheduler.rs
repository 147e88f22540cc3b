//! Task scheduler (spec.md §4.F): admission, approval, dispatch, status
//! reconciliation, and control operations. This is the biggest single
//! component (§2 budgets F+E+D at roughly a third of the core), so it
//! leans on `accountant` for the fit/tie-break decision and `ipam` for
//! port/IP allocation and keeps its own logic to orchestration.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use kohakuriver_common::{
    ResourceRequest, Task, TaskDispatch, TaskId, TaskStatus, TaskStatusUpdate, TaskSubmission, TargetSpec, TaskType,
};
use tracing::{info, instrument, warn};

use crate::accountant::{self, NodeCapacity};
use crate::db::tasks::CasOutcome;
use crate::db::TaskRepo;
use crate::error::{HostError, HostResult};
use crate::ipam::{OverlayIpAllocator, SshPortAllocator};
use crate::registry::Registry;

#[derive(Clone)]
pub struct Scheduler {
    tasks: TaskRepo,
    registry: Registry,
    http: reqwest::Client,
    ids: std::sync::Arc<kohakuriver_common::Snowflake>,
    ssh_ports: SshPortAllocator,
    overlay_ips: Option<OverlayIpAllocator>,
    dispatch_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        tasks: TaskRepo,
        registry: Registry,
        ids: std::sync::Arc<kohakuriver_common::Snowflake>,
        ssh_port_range: (u16, u16),
        overlay_subnet_cidr: Option<&str>,
        dispatch_timeout: Duration,
    ) -> HostResult<Self> {
        let overlay_ips = overlay_subnet_cidr
            .map(OverlayIpAllocator::parse)
            .transpose()
            .map_err(HostError::Validation)?;
        Ok(Self {
            tasks,
            registry,
            http: reqwest::Client::new(),
            ids,
            ssh_ports: SshPortAllocator::new(ssh_port_range),
            overlay_ips,
            dispatch_timeout,
        })
    }

    /// §4.F.1: admits a submission. Resolves the target and reserves a node
    /// slot synchronously (so a `ResourceExhaustion` error never creates a
    /// row); dispatch itself happens after this returns.
    #[instrument(skip(self, submission))]
    pub async fn submit(&self, submission: TaskSubmission) -> HostResult<Task> {
        validate(&submission)?;

        // Port/IP reservations are cluster-wide, not node-specific, so they
        // are made now even if node selection (below) waits for approval.
        let (ssh_port, overlay_ip) = self.reserve(&submission, submission.task_type).await?;

        let needs_approval = !submission.auto_approve;
        let assigned_node = if needs_approval {
            None
        } else {
            Some(self.resolve_target(&submission.target, &submission.resources).await?)
        };

        let id = self
            .ids
            .next_id()
            .map_err(|e| HostError::Internal(e.to_string()))?;
        let status = if needs_approval {
            TaskStatus::PendingApproval
        } else {
            TaskStatus::Assigning
        };
        let task = Task {
            id,
            task_type: submission.task_type,
            user_id: submission.user_id,
            submitted_at: chrono::Utc::now(),
            assigned_node,
            resources: submission.resources,
            image: submission.image,
            command: submission.command,
            env: submission.env,
            ssh_port,
            overlay_ip: overlay_ip.map(|ip| ip.to_string()),
            status,
            exit_code: None,
            error_message: None,
            stdout_path: None,
            stderr_path: None,
            finished_at: None,
        };
        self.tasks.insert(&task).await?;
        info!(task_id = id, status = %status, "task admitted");

        if !needs_approval {
            self.spawn_dispatch(id);
        }
        Ok(task)
    }

    /// §4.F.2: `approve(id)` resolves the target now (capacity may have
    /// shifted since submission) and dispatches.
    #[instrument(skip(self))]
    pub async fn approve(&self, id: TaskId) -> HostResult<Task> {
        let task = self.get(id).await?;
        if task.status != TaskStatus::PendingApproval {
            return Err(HostError::StateConflict(format!(
                "task {id} is {}, not pending_approval",
                task.status
            )));
        }
        let hostname = self.resolve_target(&TargetSpec::AnyMatching {
            min_cores: task.resources.cores,
            min_memory_bytes: task.resources.memory_bytes,
        }, &task.resources).await?;

        let mut tx_task = task;
        tx_task.assigned_node = Some(hostname.clone());

        let outcome = self.tasks.begin_assignment(id, &hostname, tx_task.ssh_port, tx_task.overlay_ip.clone()).await?;
        let applied = match outcome {
            CasOutcome::Applied(t) => t,
            CasOutcome::Conflict(t) => {
                return Err(HostError::StateConflict(format!("task {id} is now {}", t.status)))
            }
            CasOutcome::NotFound => return Err(HostError::NotFound(id)),
        };
        info!(task_id = id, hostname, "task approved");
        self.spawn_dispatch(id);
        Ok(applied)
    }

    #[instrument(skip(self))]
    pub async fn reject(&self, id: TaskId, reason: &str) -> HostResult<Task> {
        self.apply_cas(id, self.tasks.reject(id, reason).await?)
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, id: TaskId) -> HostResult<Task> {
        self.apply_cas(id, self.tasks.cancel(id).await?)
    }

    /// §4.F.5: "kill proceeds to mark the task `killed` regardless" of
    /// whether the Runner could be reached — user intent is definitive, and
    /// the Runner will reconcile any disagreement on its next startup scan.
    #[instrument(skip(self))]
    pub async fn kill(&self, id: TaskId) -> HostResult<Task> {
        let task = self.apply_cas(id, self.tasks.request_kill(id).await?)?;
        self.forward_control(&task, "kill").await;
        match self.tasks.mark_killed(id).await {
            Ok(CasOutcome::Applied(killed)) => Ok(killed),
            Ok(CasOutcome::Conflict(_) | CasOutcome::NotFound) => Ok(task),
            Err(err) => {
                warn!(task_id = id, %err, "failed to finalize killed status");
                Ok(task)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn pause(&self, id: TaskId) -> HostResult<Task> {
        let task = self.apply_cas(id, self.tasks.request_pause(id).await?)?;
        self.forward_control(&task, "pause").await;
        Ok(task)
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, id: TaskId) -> HostResult<Task> {
        let task = self.apply_cas(id, self.tasks.request_resume(id).await?)?;
        self.forward_control(&task, "resume").await;
        Ok(task)
    }

    /// §4.F.4: a runner-originated status push.
    #[instrument(skip(self, update))]
    pub async fn apply_status_update(&self, update: TaskStatusUpdate) -> HostResult<Task> {
        let id = update.task_id;
        self.apply_cas(id, self.tasks.apply_runner_status(&update).await?)
    }

    pub async fn get(&self, id: TaskId) -> HostResult<Task> {
        self.tasks.get(id).await?.ok_or(HostError::NotFound(id))
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> HostResult<Vec<Task>> {
        self.tasks.list(status).await
    }

    fn apply_cas(&self, id: TaskId, outcome: CasOutcome) -> HostResult<Task> {
        match outcome {
            CasOutcome::Applied(t) => Ok(t),
            CasOutcome::Conflict(t) => Err(HostError::StateConflict(format!(
                "task {} is {}, transition not allowed",
                t.id, t.status
            ))),
            CasOutcome::NotFound => Err(HostError::NotFound(id)),
        }
    }

    fn spawn_dispatch(&self, id: TaskId) {
        let me = self.clone();
        tokio::spawn(async move {
            if let Err(err) = me.dispatch(id).await {
                warn!(task_id = id, %err, "dispatch task failed");
            }
        });
    }

    /// §4.F.3.
    async fn dispatch(&self, id: TaskId) -> HostResult<()> {
        let task = self.get(id).await?;
        let hostname = task
            .assigned_node
            .clone()
            .ok_or_else(|| HostError::Internal(format!("task {id} has no assigned_node at dispatch time")))?;

        let dispatched = match self.tasks.mark_dispatched(id, &hostname).await? {
            CasOutcome::Applied(t) => t,
            CasOutcome::Conflict(_) | CasOutcome::NotFound => {
                info!(task_id = id, "dispatch skipped: already dispatched or moved");
                return Ok(());
            }
        };

        let node = self.registry.get(&hostname).await?;
        let body = TaskDispatch {
            task_id: dispatched.id,
            task_type: dispatched.task_type,
            image: dispatched.image.clone(),
            command: dispatched.command.clone(),
            env: dispatched.env.clone(),
            resources: dispatched.resources.clone(),
            ssh_port: dispatched.ssh_port,
            overlay_ip: dispatched.overlay_ip.clone(),
            tunnel_ws_base_url: format!("ws://{}:{}", node.address, node.port),
        };
        let path = match dispatched.task_type {
            TaskType::Command => "tasks".to_string(),
            TaskType::Vps => format!("vps/create/{}", dispatched.id),
        };
        let url = format!("http://{}:{}/{}", node.address, node.port, path);

        let result = self
            .http
            .post(&url)
            .timeout(self.dispatch_timeout)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(task_id = id, %hostname, "dispatched");
                Ok(())
            }
            Ok(resp) => {
                let reason = format!("runner rejected dispatch: HTTP {}", resp.status());
                warn!(task_id = id, %reason, "dispatch rejected");
                self.tasks.fail_dispatch(id, &hostname, &reason).await?;
                Ok(())
            }
            Err(err) => {
                let reason = format!("runner unreachable: {err}");
                warn!(task_id = id, %reason, "dispatch failed");
                self.tasks.fail_dispatch(id, &hostname, &reason).await?;
                Ok(())
            }
        }
    }

    async fn forward_control(&self, task: &Task, verb: &str) {
        let Some(hostname) = &task.assigned_node else { return };
        let node = match self.registry.get(hostname).await {
            Ok(n) => n,
            Err(err) => {
                warn!(task_id = task.id, %err, "cannot forward control op: node lookup failed");
                return;
            }
        };
        let url = format!("http://{}:{}/tasks/{}/{verb}", node.address, node.port, task.id);
        if let Err(err) = self.http.post(&url).timeout(self.dispatch_timeout).send().await {
            warn!(task_id = task.id, %err, verb, "control op delivery failed");
        }
    }

    /// §4.D: collects online-node capacity (minus every non-terminal
    /// reservation) and picks a fit.
    async fn resolve_target(&self, target: &TargetSpec, resources: &ResourceRequest) -> HostResult<String> {
        let online = self.registry.list_online().await?;
        let all_active = self.tasks.list_non_terminal().await?;

        let candidates: Vec<NodeCapacity> = online
            .iter()
            .filter(|n| match target {
                TargetSpec::Hostname { hostname } => &n.hostname == hostname,
                TargetSpec::AnyMatching { .. } => true,
                TargetSpec::FromPool { .. } => true,
            })
            .map(|n| {
                let committed: Vec<ResourceRequest> = all_active
                    .iter()
                    .filter(|t| t.assigned_node.as_deref() == Some(n.hostname.as_str()))
                    .map(|t| t.resources.clone())
                    .collect();
                NodeCapacity::derive(n, &committed)
            })
            .collect();

        accountant::select_node(&candidates, resources)
            .ok_or_else(|| HostError::ResourceExhaustion(format!("no online node satisfies {resources:?}")))
    }

    /// §4.F.1 steps 3-4: ssh_port for vps tasks (or an explicit request),
    /// overlay IP when requested.
    async fn reserve(&self, submission: &TaskSubmission, task_type: TaskType) -> HostResult<(Option<u16>, Option<Ipv4Addr>)> {
        let active = self.tasks.list_non_terminal().await?;

        let ssh_port = if let Some(requested) = submission.requested_ssh_port {
            let used: BTreeSet<u16> = active.iter().filter_map(|t| t.ssh_port).collect();
            if used.contains(&requested) {
                return Err(HostError::ResourceExhaustion(format!("ssh port {requested} already in use")));
            }
            Some(requested)
        } else if task_type == TaskType::Vps {
            let used: BTreeSet<u16> = active.iter().filter_map(|t| t.ssh_port).collect();
            Some(
                self.ssh_ports
                    .allocate(&used)
                    .ok_or_else(|| HostError::ResourceExhaustion("no ssh ports available".into()))?,
            )
        } else {
            None
        };

        let overlay_ip = if submission.want_overlay_ip {
            let allocator = self
                .overlay_ips
                .ok_or_else(|| HostError::Validation("overlay networking is not configured".into()))?;
            let used: BTreeSet<Ipv4Addr> = active
                .iter()
                .filter_map(|t| t.overlay_ip.as_ref())
                .filter_map(|ip| ip.parse().ok())
                .collect();
            Some(
                allocator
                    .allocate(&used)
                    .ok_or_else(|| HostError::ResourceExhaustion("overlay IP pool exhausted".into()))?,
            )
        } else {
            None
        };

        Ok((ssh_port, overlay_ip))
    }
}

fn validate(submission: &TaskSubmission) -> HostResult<()> {
    if submission.resources.cores == 0 {
        return Err(HostError::Validation("resources.cores must be > 0".into()));
    }
    if submission.image.trim().is_empty() {
        return Err(HostError::Validation("image must not be empty".into()));
    }
    if submission.task_type == TaskType::Command && submission.command.as_ref().map_or(true, |c| c.is_empty()) {
        return Err(HostError::Validation("command tasks require a non-empty command".into()));
    }
    Ok(())
}
