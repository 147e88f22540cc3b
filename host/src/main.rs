//! KohakuRiver Host binary: task scheduler, node registry, tunnel proxy.

mod accountant;
mod api;
mod config;
mod db;
mod error;
mod ipam;
mod monitor;
mod registry;
mod scheduler;
mod state;

use std::sync::Arc;

use kohakuriver_common::Snowflake;
use kohakuriver_tunnel::SessionRegistry;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use crate::config::HostConfig;
use crate::db::{NodeRepo, TaskRepo};
use crate::monitor::Monitor;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = HostConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let tasks = TaskRepo::new(pool.clone());
    let nodes = NodeRepo::new(pool.clone());
    let registry = Registry::new(nodes);
    let ids = Arc::new(Snowflake::new(config.node_id)?);

    // SPEC_FULL.md §4.F resolved Open Question: a restart must not leave
    // tasks stranded mid-dispatch with no runner watching them.
    for task in tasks.list_assigning_at_startup().await? {
        if let Err(err) = tasks
            .mark_lost_at_startup(task.id, "host restarted while task was assigning")
            .await
        {
            tracing::warn!(task_id = task.id, %err, "failed to mark stranded task lost at startup");
        }
    }

    let scheduler = Scheduler::new(
        tasks.clone(),
        registry.clone(),
        ids,
        config.ssh_port_range,
        config.overlay_subnet_cidr.as_deref(),
        config.dispatch_timeout,
    )?;

    let monitor = Monitor::new(
        tasks,
        registry.clone(),
        config.heartbeat_timeout,
        config.assigning_timeout,
        config.monitor_tick,
    );
    tokio::spawn(monitor.run());

    let state = AppState {
        scheduler,
        registry,
        tunnels: SessionRegistry::new(),
    };
    let app = api::router(state);

    tracing::info!(addr = %config.bind_addr, "kohakuriver-host listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
