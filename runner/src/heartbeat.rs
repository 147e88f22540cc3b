//! Registration and periodic heartbeat against the Host (spec.md §4.C,
//! §6 `POST /nodes/register`, `POST /nodes/{hostname}/heartbeat`).

use kohakuriver_common::{NodeTotals, Utilization};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::RunnerConfig;

#[derive(Serialize)]
struct RegisterRequest {
    hostname: String,
    address: String,
    port: u16,
    totals: NodeTotals,
}

fn totals(config: &RunnerConfig) -> NodeTotals {
    NodeTotals {
        cores: config.cores,
        memory_bytes: config.memory_bytes,
        numa: config.numa.clone(),
        gpus: config.gpus.clone(),
    }
}

/// Retries registration with a fixed backoff until the Host accepts it;
/// a Runner with no Host to report to has nothing useful to do.
pub async fn register_with_retry(http: &reqwest::Client, config: &RunnerConfig) {
    let url = format!("{}/nodes/register", config.host_base_url.trim_end_matches('/'));
    let body = RegisterRequest {
        hostname: config.hostname.clone(),
        address: config.advertise_address.clone(),
        port: config.advertise_port,
        totals: totals(config),
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(hostname = %config.hostname, "registered with host");
                return;
            }
            Ok(resp) => {
                warn!(attempt, status = %resp.status(), "host rejected registration, retrying");
            }
            Err(err) => {
                warn!(attempt, %err, "failed to reach host for registration, retrying");
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(backoff_secs(attempt))).await;
    }
}

fn backoff_secs(attempt: u32) -> u64 {
    (attempt.min(6) as u64) * 2
}

/// Runs forever, sending a heartbeat every `config.heartbeat_interval`
/// (spec.md §4.C: the Host's monitor treats a missed heartbeat window as
/// grounds to mark the node offline and its tasks lost).
pub async fn heartbeat_loop(http: reqwest::Client, config: std::sync::Arc<RunnerConfig>) {
    let url = format!(
        "{}/nodes/{}/heartbeat",
        config.host_base_url.trim_end_matches('/'),
        config.hostname
    );
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    loop {
        interval.tick().await;
        let utilization = sample_utilization();
        match http.post(&url).json(&utilization).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) if resp.status().as_u16() == 404 => {
                warn!("host has forgotten this node, re-registering");
                register_with_retry(&http, &config).await;
            }
            Ok(resp) => warn!(status = %resp.status(), "host rejected heartbeat"),
            Err(err) => error!(%err, "failed to send heartbeat"),
        }
    }
}

/// Live utilization sampling isn't wired to a metrics crate; reporting
/// zeroed utilization keeps the heartbeat protocol exercised without
/// pulling in a system-stats dependency the rest of the corpus doesn't use.
fn sample_utilization() -> Utilization {
    Utilization::default()
}
