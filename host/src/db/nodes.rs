//! Node registry persistence (spec.md §4.C).

use chrono::{DateTime, Utc};
use kohakuriver_common::{Node, NodeStatus, NodeTotals, Utilization};
use sqlx::{PgPool, Row};

use crate::error::HostResult;

#[derive(Clone)]
pub struct NodeRepo {
    pool: PgPool,
}

impl NodeRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upserts on every registration call: a runner that restarts with the
    /// same hostname replaces its declared totals rather than being rejected
    /// as a duplicate (spec.md §4.C.1).
    pub async fn register(&self, node: &Node) -> HostResult<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (hostname, address, port, last_heartbeat, totals, utilization, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (hostname) DO UPDATE SET
                address = EXCLUDED.address,
                port = EXCLUDED.port,
                last_heartbeat = EXCLUDED.last_heartbeat,
                totals = EXCLUDED.totals,
                utilization = EXCLUDED.utilization,
                status = EXCLUDED.status
            "#,
        )
        .bind(&node.hostname)
        .bind(&node.address)
        .bind(node.port as i32)
        .bind(node.last_heartbeat)
        .bind(serde_json::to_value(&node.totals)?)
        .bind(serde_json::to_value(&node.utilization)?)
        .bind(node_status_str(node.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, hostname: &str, utilization: &Utilization, at: DateTime<Utc>) -> HostResult<bool> {
        let result = sqlx::query(
            "UPDATE nodes SET last_heartbeat = $2, utilization = $3, status = 'online' WHERE hostname = $1",
        )
        .bind(hostname)
        .bind(at)
        .bind(serde_json::to_value(utilization)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, hostname: &str) -> HostResult<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE hostname = $1")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_node(&r)).transpose()
    }

    pub async fn list(&self) -> HostResult<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY hostname")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_node).collect()
    }

    pub async fn list_online(&self) -> HostResult<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE status = 'online' ORDER BY hostname")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_node).collect()
    }

    /// §4.G: nodes whose heartbeat is older than `cutoff` and still marked online.
    pub async fn list_stale(&self, cutoff: DateTime<Utc>) -> HostResult<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE status = 'online' AND last_heartbeat < $1")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_node).collect()
    }

    pub async fn mark_offline(&self, hostname: &str) -> HostResult<()> {
        sqlx::query("UPDATE nodes SET status = 'offline' WHERE hostname = $1")
            .bind(hostname)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn node_status_str(s: NodeStatus) -> &'static str {
    match s {
        NodeStatus::Online => "online",
        NodeStatus::Offline => "offline",
    }
}

fn row_to_node(row: &sqlx::postgres::PgRow) -> HostResult<Node> {
    let status_raw: String = row.try_get("status")?;
    let status = match status_raw.as_str() {
        "online" => NodeStatus::Online,
        _ => NodeStatus::Offline,
    };
    let totals_json: serde_json::Value = row.try_get("totals")?;
    let totals: NodeTotals = serde_json::from_value(totals_json)?;
    let utilization_json: serde_json::Value = row.try_get("utilization")?;
    let utilization: Utilization = serde_json::from_value(utilization_json)?;
    let port: i32 = row.try_get("port")?;

    Ok(Node {
        hostname: row.try_get("hostname")?,
        address: row.try_get("address")?,
        port: port as u16,
        last_heartbeat: row.try_get("last_heartbeat")?,
        totals,
        utilization,
        status,
    })
}
