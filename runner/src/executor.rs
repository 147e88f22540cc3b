//! Runner task executor (spec.md §4.H): turns a `TaskDispatch` into a
//! running container, wires up the tunnel-client mount and environment,
//! and reports every lifecycle transition back to the Host.
//!
//! Concurrency model: one supervisory `tokio::spawn`ed task per container;
//! the only state shared between supervisors is the vault (spec.md §4.H
//! "Concurrency" note).

use std::collections::HashMap;
use std::sync::Arc;

use kohakuriver_common::{
    container_name, TaskDispatch, TaskId, TaskStatus, TaskStatusUpdate, TaskType,
};
use tracing::{info, instrument, warn};

use crate::docker::{wrap_command, ContainerInspection, ContainerOps, ContainerSpec, DockerManager};
use crate::error::{RunnerError, RunnerResult};
use crate::vault::{Vault, VaultEntry};

const TUNNEL_CLIENT_MOUNT_PATH: &str = "/opt/kohakuriver/tunnel-client";

pub struct Executor {
    docker: Arc<DockerManager>,
    vault: Vault,
    http: reqwest::Client,
    host_base_url: String,
    hostname: String,
    tunnel_client_binary_path: String,
    task_log_dir: String,
}

impl Executor {
    pub fn new(
        docker: Arc<DockerManager>,
        vault: Vault,
        host_base_url: String,
        hostname: String,
        tunnel_client_binary_path: String,
        task_log_dir: String,
    ) -> Self {
        Self {
            docker,
            vault,
            http: reqwest::Client::new(),
            host_base_url,
            hostname,
            tunnel_client_binary_path,
            task_log_dir,
        }
    }

    /// spec.md §4.H: command tasks `exec` the user command after
    /// backgrounding the tunnel client, so the container's own exit code
    /// is the command's exit code.
    #[instrument(skip(self, dispatch))]
    pub async fn dispatch_command(&self, dispatch: TaskDispatch) -> RunnerResult<()> {
        let name = container_name(TaskType::Command, dispatch.task_id);
        if self.vault.get(dispatch.task_id).await?.is_some() {
            return Err(RunnerError::AlreadyRunning(dispatch.task_id));
        }
        let command = dispatch
            .command
            .clone()
            .ok_or_else(|| RunnerError::Validation("command tasks require a non-empty command".into()))?;

        let mut env: HashMap<String, String> = dispatch.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.insert("KOHAKURIVER_TUNNEL_URL".into(), dispatch.tunnel_ws_base_url.clone());
        env.insert("KOHAKURIVER_CONTAINER_ID".into(), name.clone());

        let spec = ContainerSpec {
            name: name.clone(),
            image: dispatch.image.clone(),
            shell_command: wrap_command(TUNNEL_CLIENT_MOUNT_PATH, &command, true),
            env,
            resources: dispatch.resources.clone(),
            cpu_ids: None,
            tunnel_client_binary_path: self.tunnel_client_binary_path.clone(),
            tunnel_client_mount_path: TUNNEL_CLIENT_MOUNT_PATH.to_string(),
            publish_ssh_port: None,
        };

        self.docker.create_and_start(spec).await?;
        self.vault
            .put(&VaultEntry {
                task_id: dispatch.task_id,
                container_name: name.clone(),
                ssh_port: None,
                reserved_ip: dispatch.overlay_ip.clone(),
                started_at: chrono::Utc::now(),
                dispatch: dispatch.clone(),
            })
            .await?;

        self.report_status(dispatch.task_id, TaskStatus::Running, None, None).await;
        self.spawn_log_tail(&name, dispatch.task_id);
        self.spawn_waiter(name, dispatch.task_id);
        Ok(())
    }

    /// spec.md §4.H.5: vps tasks stay long-lived; the tunnel runs
    /// alongside the main process rather than replacing it via `exec`.
    #[instrument(skip(self, dispatch))]
    pub async fn dispatch_vps(&self, dispatch: TaskDispatch) -> RunnerResult<()> {
        let name = container_name(TaskType::Vps, dispatch.task_id);
        if self.vault.get(dispatch.task_id).await?.is_some() {
            return Err(RunnerError::AlreadyRunning(dispatch.task_id));
        }
        let ssh_port = dispatch
            .ssh_port
            .ok_or_else(|| RunnerError::Validation("vps tasks require an ssh_port".into()))?;

        let mut env: HashMap<String, String> = dispatch.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        env.insert("KOHAKURIVER_TUNNEL_URL".into(), dispatch.tunnel_ws_base_url.clone());
        env.insert("KOHAKURIVER_CONTAINER_ID".into(), name.clone());

        // vps images carry their own entrypoint (typically an sshd); the
        // wrapper only needs to add the backgrounded tunnel client ahead
        // of whatever `docker run` would otherwise execute.
        let sshd_command = vec!["/usr/sbin/sshd".to_string(), "-D".to_string()];
        let spec = ContainerSpec {
            name: name.clone(),
            image: dispatch.image.clone(),
            shell_command: wrap_command(TUNNEL_CLIENT_MOUNT_PATH, &sshd_command, false),
            env,
            resources: dispatch.resources.clone(),
            cpu_ids: None,
            tunnel_client_binary_path: self.tunnel_client_binary_path.clone(),
            tunnel_client_mount_path: TUNNEL_CLIENT_MOUNT_PATH.to_string(),
            publish_ssh_port: Some(ssh_port),
        };

        self.docker.create_and_start(spec).await?;
        self.vault
            .put(&VaultEntry {
                task_id: dispatch.task_id,
                container_name: name.clone(),
                ssh_port: Some(ssh_port),
                reserved_ip: dispatch.overlay_ip.clone(),
                started_at: chrono::Utc::now(),
                dispatch: dispatch.clone(),
            })
            .await?;

        self.report_status(dispatch.task_id, TaskStatus::Running, None, None).await;
        self.spawn_waiter(name, dispatch.task_id);
        Ok(())
    }

    pub async fn kill(&self, task_id: TaskId) -> RunnerResult<()> {
        let entry = self.vault.get(task_id).await?.ok_or(RunnerError::NotFound(task_id))?;
        self.docker.stop(&entry.container_name).await?;
        let _ = self.docker.remove(&entry.container_name).await;
        self.vault.remove(task_id).await?;
        Ok(())
    }

    pub async fn pause(&self, task_id: TaskId) -> RunnerResult<()> {
        let entry = self.vault.get(task_id).await?.ok_or(RunnerError::NotFound(task_id))?;
        self.docker.pause(&entry.container_name).await
    }

    pub async fn resume(&self, task_id: TaskId) -> RunnerResult<()> {
        let entry = self.vault.get(task_id).await?.ok_or(RunnerError::NotFound(task_id))?;
        self.docker.unpause(&entry.container_name).await
    }

    /// Rebuilds a supervisory task for a container discovered already
    /// running at startup (spec.md §4.I step 3); does not touch the vault,
    /// which already has the right entry by construction.
    pub fn readopt(&self, entry: &VaultEntry) {
        self.spawn_waiter(entry.container_name.clone(), entry.task_id);
    }

    fn spawn_log_tail(&self, container_name: &str, task_id: TaskId) {
        let docker = self.docker.clone();
        let stdout_path = format!("{}/{task_id}.stdout.log", self.task_log_dir);
        let stderr_path = format!("{}/{task_id}.stderr.log", self.task_log_dir);
        let container_name = container_name.to_string();
        tokio::spawn(async move {
            if let Err(err) = docker.tail_logs_to_files(&container_name, &stdout_path, &stderr_path).await {
                warn!(task_id, %err, "log tail ended with an error");
            }
        });
    }

    /// Polls the container until it stops, then reports the terminal
    /// status to the Host and clears the vault entry (spec.md §4.H step 6).
    fn spawn_waiter(&self, container_name: String, task_id: TaskId) {
        let docker = self.docker.clone();
        let vault = self.vault.clone();
        let http = self.http.clone();
        let host_base_url = self.host_base_url.clone();
        let hostname = self.hostname.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));
            loop {
                interval.tick().await;
                let inspection = match docker.inspect(&container_name).await {
                    Ok(i) => i,
                    Err(err) => {
                        warn!(task_id, %err, "lost ability to inspect container, giving up on waiter");
                        return;
                    }
                };
                if !inspection.running {
                    report_terminal(&http, &host_base_url, &hostname, task_id, &inspection).await;
                    let _ = vault.remove(task_id).await;
                    return;
                }
            }
        });
    }

    /// spec.md §4.H step 6 / §6 `POST /tasks/{id}/status`.
    pub async fn report_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        exit_code: Option<i32>,
        error_message: Option<String>,
    ) {
        report_status_inner(&self.http, &self.host_base_url, &self.hostname, task_id, status, exit_code, error_message)
            .await;
    }
}

async fn report_terminal(
    http: &reqwest::Client,
    host_base_url: &str,
    hostname: &str,
    task_id: TaskId,
    inspection: &ContainerInspection,
) {
    let (status, error_message) = match inspection.exit_code {
        Some(0) => (TaskStatus::Completed, None),
        Some(code) => (TaskStatus::Failed, Some(format!("container exited with code {code}"))),
        None => (TaskStatus::Failed, Some("container stopped without a reported exit code".into())),
    };
    report_status_inner(http, host_base_url, hostname, task_id, status, inspection.exit_code, error_message).await;
}

async fn report_status_inner(
    http: &reqwest::Client,
    host_base_url: &str,
    hostname: &str,
    task_id: TaskId,
    status: TaskStatus,
    exit_code: Option<i32>,
    error_message: Option<String>,
) {
    let update = TaskStatusUpdate {
        task_id,
        from_hostname: hostname.to_string(),
        status,
        exit_code,
        error_message,
    };
    let url = format!("{}/tasks/{}/status", host_base_url.trim_end_matches('/'), task_id);
    match http.post(&url).json(&update).send().await {
        Ok(resp) if resp.status().is_success() => {
            info!(task_id, %status, "status reported to host");
        }
        Ok(resp) => {
            warn!(task_id, %status, http_status = %resp.status(), "host rejected status update");
        }
        Err(err) => {
            warn!(task_id, %status, %err, "failed to report status to host");
        }
    }
}

/// Known-record container no longer running at startup: reports its
/// terminal status without a live waiter loop (spec.md §4.I step 5).
pub async fn report_dead_on_arrival(
    http: &reqwest::Client,
    host_base_url: &str,
    hostname: &str,
    task_id: TaskId,
    inspection: &ContainerInspection,
) {
    report_terminal(http, host_base_url, hostname, task_id, inspection).await;
}

/// Reconstructs the `Task`-independent bits an orphan-detection pass
/// needs from a live container name alone.
pub fn parse_task_id(container: &str) -> Option<TaskId> {
    kohakuriver_common::parse_container_name(container)
}
