//! Task store (spec.md §4.E) and the CAS transitions that back the state
//! machine in §3. Every transition reads the current row with `FOR UPDATE`
//! inside a transaction and only writes if the precondition still holds,
//! so a retried dispatch or a racing status update can never move a task
//! backwards or past a terminal state.

use chrono::{DateTime, Utc};
use kohakuriver_common::{ResourceRequest, Task, TaskId, TaskStatus, TaskStatusUpdate, TaskType};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::{HostError, HostResult};

#[derive(Debug)]
pub enum CasOutcome {
    Applied(Task),
    /// Current row did not satisfy the precondition; returns it as-is.
    Conflict(Task),
    NotFound,
}

#[derive(Clone)]
pub struct TaskRepo {
    pool: PgPool,
}

impl TaskRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, task: &Task) -> HostResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, task_type, user_id, submitted_at, assigned_node, resources, image,
                 command, env, ssh_port, overlay_ip, status, exit_code, error_message,
                 stdout_path, stderr_path, assigning_since, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(task.id)
        .bind(task_type_str(task.task_type))
        .bind(&task.user_id)
        .bind(task.submitted_at)
        .bind(&task.assigned_node)
        .bind(serde_json::to_value(&task.resources).map_err(|e| HostError::Internal(e.to_string()))?)
        .bind(&task.image)
        .bind(task.command.as_ref().map(|c| serde_json::to_value(c).unwrap()))
        .bind(serde_json::to_value(&task.env).map_err(|e| HostError::Internal(e.to_string()))?)
        .bind(task.ssh_port.map(|p| p as i32))
        .bind(&task.overlay_ip)
        .bind(task.status.as_str())
        .bind(task.exit_code)
        .bind(&task.error_message)
        .bind(&task.stdout_path)
        .bind(&task.stderr_path)
        .bind(Option::<DateTime<Utc>>::None)
        .bind(task.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: TaskId) -> HostResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> HostResult<Vec<Task>> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM tasks WHERE status = $1 ORDER BY id")
                    .bind(s.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_task).collect()
    }

    /// Used by the scheduler to compute cluster-wide SSH-port/overlay-IP
    /// reservations and by the monitor to walk every live task.
    pub async fn list_non_terminal(&self) -> HostResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status NOT IN \
             ('completed','failed','killed','lost','rejected','canceled') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn list_non_terminal_for_node(&self, hostname: &str) -> HostResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE assigned_node = $1 AND status NOT IN \
             ('completed','failed','killed','lost','rejected','canceled') ORDER BY id",
        )
        .bind(hostname)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// SPEC_FULL.md §4.F resolved Open Question: every task still in
    /// `assigning`/`assigning_dispatched` when the Host starts up predates
    /// this process and cannot be trusted to ever see a `running` report,
    /// so it is marked `lost` identically to runner-death handling.
    pub async fn list_assigning_at_startup(&self) -> HostResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status IN ('assigning','assigning_dispatched') ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn mark_lost_at_startup(&self, id: TaskId, reason: &str) -> HostResult<CasOutcome> {
        self.cas_simple(
            id,
            &[TaskStatus::Assigning, TaskStatus::AssigningDispatched],
            None,
            TaskStatus::Lost,
            Some(reason),
        )
        .await
    }

    pub async fn list_stuck_assigning(&self, cutoff: DateTime<Utc>) -> HostResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status IN ('assigning','assigning_dispatched') \
             AND assigning_since < $1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// §4.F.1 step 5 / §4.F.3: resolves target + allocates ssh_port/overlay_ip,
    /// then moves `pending`/`pending_approval` straight to `assigning`.
    pub async fn begin_assignment(
        &self,
        id: TaskId,
        hostname: &str,
        ssh_port: Option<u16>,
        overlay_ip: Option<String>,
    ) -> HostResult<CasOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = self.lock_row(&mut tx, id).await? else {
            return Ok(CasOutcome::NotFound);
        };
        if !matches!(current.status, TaskStatus::Pending | TaskStatus::PendingApproval) {
            return Ok(CasOutcome::Conflict(current));
        }
        let row = sqlx::query(
            "UPDATE tasks SET status = 'assigning', assigned_node = $2, ssh_port = $3, \
             overlay_ip = $4, assigning_since = now() WHERE id = $1 AND status = $5 RETURNING *",
        )
        .bind(id)
        .bind(hostname)
        .bind(ssh_port.map(|p| p as i32))
        .bind(overlay_ip)
        .bind(current.status.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        self.finish(tx, row, current).await
    }

    /// §4.F.3: guards against a retried HTTP dispatch firing twice.
    pub async fn mark_dispatched(&self, id: TaskId, hostname: &str) -> HostResult<CasOutcome> {
        self.cas_simple(
            id,
            &[TaskStatus::Assigning],
            Some(hostname),
            TaskStatus::AssigningDispatched,
            None,
        )
        .await
    }

    /// §4.F.4: applies a runner-reported status update. Rejects if the
    /// reporting hostname doesn't match `assigned_node` or the task is
    /// already terminal (invariant: terminal states never transition).
    pub async fn apply_runner_status(&self, update: &TaskStatusUpdate) -> HostResult<CasOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = self.lock_row(&mut tx, update.task_id).await? else {
            return Ok(CasOutcome::NotFound);
        };
        if current.status.is_terminal() {
            return Ok(CasOutcome::Conflict(current));
        }
        if current.assigned_node.as_deref() != Some(update.from_hostname.as_str()) {
            return Ok(CasOutcome::Conflict(current));
        }
        let finished_at = update.status.is_terminal().then(chrono_now);
        let row = sqlx::query(
            "UPDATE tasks SET status = $2, exit_code = $3, error_message = $4, \
             finished_at = COALESCE($5, finished_at) WHERE id = $1 AND status = $6 RETURNING *",
        )
        .bind(update.task_id)
        .bind(update.status.as_str())
        .bind(update.exit_code)
        .bind(&update.error_message)
        .bind(finished_at)
        .bind(current.status.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        self.finish(tx, row, current).await
    }

    /// §4.G: dead-runner detection marks every non-terminal task owned by
    /// that hostname `lost`, regardless of which non-terminal state it's in,
    /// with the synthetic error spec.md §4.G calls for (S3: `"runner N1
    /// died"`).
    pub async fn mark_lost(&self, id: TaskId, hostname: &str, reason: &str) -> HostResult<CasOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = self.lock_row(&mut tx, id).await? else {
            return Ok(CasOutcome::NotFound);
        };
        if current.status.is_terminal() || current.assigned_node.as_deref() != Some(hostname) {
            return Ok(CasOutcome::Conflict(current));
        }
        let row = sqlx::query(
            "UPDATE tasks SET status = 'lost', error_message = $3, finished_at = now() \
             WHERE id = $1 AND status = $2 RETURNING *",
        )
        .bind(id)
        .bind(current.status.as_str())
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;
        self.finish(tx, row, current).await
    }

    /// §9 resolved Open Question: a task stuck in `assigning`/`assigning_dispatched`
    /// past the configured timeout fails rather than waiting forever.
    pub async fn fail_assigning_timeout(&self, id: TaskId, reason: &str) -> HostResult<CasOutcome> {
        self.cas_simple(
            id,
            &[TaskStatus::Assigning, TaskStatus::AssigningDispatched],
            None,
            TaskStatus::Failed,
            Some(reason),
        )
        .await
    }

    /// §4.F.3: the dispatch HTTP call itself failed or was rejected.
    pub async fn fail_dispatch(&self, id: TaskId, hostname: &str, reason: &str) -> HostResult<CasOutcome> {
        self.cas_simple(
            id,
            &[TaskStatus::AssigningDispatched],
            Some(hostname),
            TaskStatus::Failed,
            Some(reason),
        )
        .await
    }

    pub async fn reject(&self, id: TaskId, reason: &str) -> HostResult<CasOutcome> {
        self.cas_simple(
            id,
            &[TaskStatus::PendingApproval],
            None,
            TaskStatus::Rejected,
            Some(reason),
        )
        .await
    }

    pub async fn cancel(&self, id: TaskId) -> HostResult<CasOutcome> {
        self.cas_simple(
            id,
            &[TaskStatus::Pending, TaskStatus::PendingApproval],
            None,
            TaskStatus::Canceled,
            None,
        )
        .await
    }

    pub async fn request_kill(&self, id: TaskId) -> HostResult<CasOutcome> {
        self.cas_simple(
            id,
            &[TaskStatus::Running, TaskStatus::Paused],
            None,
            TaskStatus::Killing,
            None,
        )
        .await
    }

    /// §4.F.5: user intent to kill is definitive regardless of whether the
    /// Runner could be reached, so this finalizes `Killing → Killed` even
    /// on a best-effort basis after `forward_control` fails (spec.md: "kill
    /// proceeds to mark the task `killed` regardless").
    pub async fn mark_killed(&self, id: TaskId) -> HostResult<CasOutcome> {
        self.cas_simple(id, &[TaskStatus::Killing], None, TaskStatus::Killed, None)
            .await
    }

    pub async fn request_pause(&self, id: TaskId) -> HostResult<CasOutcome> {
        self.cas_simple(id, &[TaskStatus::Running], None, TaskStatus::Paused, None)
            .await
    }

    pub async fn request_resume(&self, id: TaskId) -> HostResult<CasOutcome> {
        self.cas_simple(id, &[TaskStatus::Paused], None, TaskStatus::Running, None)
            .await
    }

    async fn lock_row(&self, tx: &mut Transaction<'_, Postgres>, id: TaskId) -> HostResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    async fn finish(
        &self,
        tx: Transaction<'_, Postgres>,
        row: Option<sqlx::postgres::PgRow>,
        current: Task,
    ) -> HostResult<CasOutcome> {
        match row {
            Some(r) => {
                let task = row_to_task(&r)?;
                tx.commit().await?;
                Ok(CasOutcome::Applied(task))
            }
            None => {
                tx.rollback().await?;
                Ok(CasOutcome::Conflict(current))
            }
        }
    }

    async fn cas_simple(
        &self,
        id: TaskId,
        allowed: &[TaskStatus],
        expected_hostname: Option<&str>,
        to: TaskStatus,
        error_message: Option<&str>,
    ) -> HostResult<CasOutcome> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = self.lock_row(&mut tx, id).await? else {
            return Ok(CasOutcome::NotFound);
        };
        if !allowed.contains(&current.status) {
            return Ok(CasOutcome::Conflict(current));
        }
        if let Some(hostname) = expected_hostname {
            if current.assigned_node.as_deref() != Some(hostname) {
                return Ok(CasOutcome::Conflict(current));
            }
        }
        let finished_at = to.is_terminal().then(chrono_now);
        let row = sqlx::query(
            "UPDATE tasks SET status = $2, error_message = COALESCE($3, error_message), \
             finished_at = COALESCE($4, finished_at) WHERE id = $1 AND status = $5 RETURNING *",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(error_message)
        .bind(finished_at)
        .bind(current.status.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        self.finish(tx, row, current).await
    }
}

fn chrono_now() -> DateTime<Utc> {
    Utc::now()
}

fn task_type_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Command => "command",
        TaskType::Vps => "vps",
    }
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> HostResult<Task> {
    let task_type_raw: String = row.try_get("task_type")?;
    let task_type = match task_type_raw.as_str() {
        "command" => TaskType::Command,
        "vps" => TaskType::Vps,
        other => return Err(HostError::Internal(format!("unknown task_type {other:?}"))),
    };
    let status_raw: String = row.try_get("status")?;
    let status: TaskStatus = status_raw
        .parse()
        .map_err(|e: String| HostError::Internal(e))?;
    let resources_json: serde_json::Value = row.try_get("resources")?;
    let resources: ResourceRequest =
        serde_json::from_value(resources_json).map_err(|e| HostError::Internal(e.to_string()))?;
    let command_json: Option<serde_json::Value> = row.try_get("command")?;
    let command = command_json
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e: serde_json::Error| HostError::Internal(e.to_string()))?;
    let env_json: serde_json::Value = row.try_get("env")?;
    let env = serde_json::from_value(env_json).map_err(|e| HostError::Internal(e.to_string()))?;
    let ssh_port: Option<i32> = row.try_get("ssh_port")?;

    Ok(Task {
        id: row.try_get("id")?,
        task_type,
        user_id: row.try_get("user_id")?,
        submitted_at: row.try_get("submitted_at")?,
        assigned_node: row.try_get("assigned_node")?,
        resources,
        image: row.try_get("image")?,
        command,
        env,
        ssh_port: ssh_port.map(|p| p as u16),
        overlay_ip: row.try_get("overlay_ip")?,
        status,
        exit_code: row.try_get("exit_code")?,
        error_message: row.try_get("error_message")?,
        stdout_path: row.try_get("stdout_path")?,
        stderr_path: row.try_get("stderr_path")?,
        finished_at: row.try_get("finished_at")?,
    })
}
