//! KohakuRiver Runner binary: task/VPS execution plane and tunnel server.

mod api;
mod config;
mod docker;
mod error;
mod executor;
mod heartbeat;
mod reconciler;
mod state;
mod vault;

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::EnvFilter;

use crate::config::RunnerConfig;
use crate::docker::{DockerManager, LocalTarballSource};
use crate::executor::Executor;
use crate::state::{AppState, Readiness};
use crate::vault::Vault;
use kohakuriver_tunnel::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Arc::new(RunnerConfig::from_env());

    tokio::fs::create_dir_all(&config.task_log_dir).await?;
    tokio::fs::create_dir_all(&config.image_tarball_dir).await?;

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", config.vault_path))
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    let vault = Vault::new(pool);

    let image_source = Box::new(LocalTarballSource::new(config.image_tarball_dir.clone()));
    let docker = Arc::new(DockerManager::connect_local(image_source)?);

    let http = reqwest::Client::new();
    let executor = Arc::new(Executor::new(
        docker.clone(),
        vault.clone(),
        config.host_base_url.clone(),
        config.hostname.clone(),
        config.tunnel_client_binary_path.clone(),
        config.task_log_dir.clone(),
    ));
    let relay = Relay::new();
    let readiness = Readiness::default();

    let state = AppState {
        config: config.clone(),
        docker: docker.clone(),
        vault: vault.clone(),
        executor: executor.clone(),
        relay,
        http: http.clone(),
        readiness: readiness.clone(),
    };

    // spec.md §4.I: reconcile Docker's view against the vault before
    // registering with the Host, so the registration race can't hand out
    // new work before we know what we're already running.
    let report = reconciler::reconcile(
        docker.clone(),
        &vault,
        &executor,
        &http,
        &config.host_base_url,
        &config.hostname,
    )
    .await?;
    tracing::info!(
        readopted = report.readopted,
        reported_dead = report.reported_dead,
        removed_orphans = report.removed_orphans,
        "startup reconciliation complete"
    );
    readiness.mark_ready();

    heartbeat::register_with_retry(&http, &config).await;
    tokio::spawn(heartbeat::heartbeat_loop(http, config.clone()));

    let app = api::router(state);
    tracing::info!(addr = %config.bind_addr, "kohakuriver-runner listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
