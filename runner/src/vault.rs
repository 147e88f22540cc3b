//! Runner local vault (spec.md §6 "Persisted state / Runner", §4.I): a
//! small key/value store keyed by task id holding exactly what the startup
//! reconciler needs to re-adopt a container after a Runner restart.
//!
//! Backed by `sqlite` through `sqlx`, following the same
//! runtime-checked-`query()` convention as the Host's Postgres store
//! (`host/src/db`), since a vault row's shape changes rarely enough that
//! compile-time query checking buys little and a missing on-disk database
//! file at compile time would otherwise break the build.

use chrono::{DateTime, Utc};
use kohakuriver_common::{TaskDispatch, TaskId};
use sqlx::{Row, SqlitePool};

use crate::error::RunnerResult;

#[derive(Debug, Clone)]
pub struct VaultEntry {
    pub task_id: TaskId,
    pub container_name: String,
    pub ssh_port: Option<u16>,
    pub reserved_ip: Option<String>,
    pub started_at: DateTime<Utc>,
    pub dispatch: TaskDispatch,
}

#[derive(Clone)]
pub struct Vault {
    pool: SqlitePool,
}

impl Vault {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn put(&self, entry: &VaultEntry) -> RunnerResult<()> {
        sqlx::query(
            "INSERT INTO vault_entries (task_id, container_name, ssh_port, reserved_ip, started_at, dispatch_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(task_id) DO UPDATE SET \
               container_name = excluded.container_name, ssh_port = excluded.ssh_port, \
               reserved_ip = excluded.reserved_ip, started_at = excluded.started_at, \
               dispatch_json = excluded.dispatch_json",
        )
        .bind(entry.task_id)
        .bind(&entry.container_name)
        .bind(entry.ssh_port.map(|p| p as i64))
        .bind(&entry.reserved_ip)
        .bind(entry.started_at.to_rfc3339())
        .bind(serde_json::to_string(&entry.dispatch)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, task_id: TaskId) -> RunnerResult<Option<VaultEntry>> {
        let row = sqlx::query("SELECT * FROM vault_entries WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_entry(&r)).transpose()
    }

    pub async fn remove(&self, task_id: TaskId) -> RunnerResult<()> {
        sqlx::query("DELETE FROM vault_entries WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_all(&self) -> RunnerResult<Vec<VaultEntry>> {
        let rows = sqlx::query("SELECT * FROM vault_entries ORDER BY task_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> RunnerResult<VaultEntry> {
    let ssh_port: Option<i64> = row.try_get("ssh_port")?;
    let started_at_raw: String = row.try_get("started_at")?;
    let started_at = DateTime::parse_from_rfc3339(&started_at_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::error::RunnerError::Internal(format!("corrupt vault timestamp: {e}")))?;
    let dispatch_json: String = row.try_get("dispatch_json")?;
    let dispatch: TaskDispatch = serde_json::from_str(&dispatch_json)?;

    Ok(VaultEntry {
        task_id: row.try_get("task_id")?,
        container_name: row.try_get("container_name")?,
        ssh_port: ssh_port.map(|p| p as u16),
        reserved_ip: row.try_get("reserved_ip")?,
        started_at,
        dispatch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kohakuriver_common::{ResourceRequest, TaskType};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite pool");
        sqlx::query(
            "CREATE TABLE vault_entries (
                task_id INTEGER PRIMARY KEY,
                container_name TEXT NOT NULL,
                ssh_port INTEGER,
                reserved_ip TEXT,
                started_at TEXT NOT NULL,
                dispatch_json TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    fn sample_dispatch(task_id: TaskId) -> TaskDispatch {
        TaskDispatch {
            task_id,
            task_type: TaskType::Command,
            image: "alpine:latest".into(),
            command: Some(vec!["true".into()]),
            env: Default::default(),
            resources: ResourceRequest::default(),
            ssh_port: None,
            overlay_ip: None,
            tunnel_ws_base_url: "ws://127.0.0.1:7601".into(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let vault = Vault::new(test_pool().await);
        let entry = VaultEntry {
            task_id: 42,
            container_name: "kohakuriver-task-42".into(),
            ssh_port: None,
            reserved_ip: Some("10.200.0.5".into()),
            started_at: Utc::now(),
            dispatch: sample_dispatch(42),
        };
        vault.put(&entry).await.unwrap();
        let fetched = vault.get(42).await.unwrap().expect("entry present");
        assert_eq!(fetched.container_name, "kohakuriver-task-42");
        assert_eq!(fetched.reserved_ip.as_deref(), Some("10.200.0.5"));
    }

    #[tokio::test]
    async fn remove_clears_the_entry() {
        let vault = Vault::new(test_pool().await);
        let entry = VaultEntry {
            task_id: 7,
            container_name: "kohakuriver-task-7".into(),
            ssh_port: None,
            reserved_ip: None,
            started_at: Utc::now(),
            dispatch: sample_dispatch(7),
        };
        vault.put(&entry).await.unwrap();
        vault.remove(7).await.unwrap();
        assert!(vault.get(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_all_orders_by_task_id() {
        let vault = Vault::new(test_pool().await);
        for id in [3, 1, 2] {
            vault
                .put(&VaultEntry {
                    task_id: id,
                    container_name: format!("kohakuriver-task-{id}"),
                    ssh_port: None,
                    reserved_ip: None,
                    started_at: Utc::now(),
                    dispatch: sample_dispatch(id),
                })
                .await
                .unwrap();
        }
        let all = vault.list_all().await.unwrap();
        assert_eq!(all.iter().map(|e| e.task_id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
