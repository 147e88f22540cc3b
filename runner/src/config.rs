//! Runner configuration, loaded from the environment.

use std::time::Duration;

use kohakuriver_common::{GpuInfo, NumaTopology};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub hostname: String,
    pub bind_addr: std::net::SocketAddr,
    pub advertise_address: String,
    pub advertise_port: u16,
    pub host_base_url: String,
    pub vault_path: String,
    pub heartbeat_interval: Duration,
    pub tunnel_client_binary_path: String,
    pub cores: u32,
    pub memory_bytes: u64,
    pub numa: Option<NumaTopology>,
    pub gpus: Vec<GpuInfo>,
    /// Where per-task stdout/stderr files are written (spec.md §3 Task
    /// `stdout_path`/`stderr_path`).
    pub task_log_dir: String,
    /// Shared tarball directory consulted by `LocalTarballSource`
    /// (SPEC_FULL.md §4.H image sync).
    pub image_tarball_dir: String,
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let hostname = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| "kohakuriver-runner".to_string());
        let bind_addr = std::env::var("KOHAKURIVER_RUNNER_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7601".to_string())
            .parse()
            .expect("KOHAKURIVER_RUNNER_BIND must be a valid socket address");
        let advertise_port = env_u64("KOHAKURIVER_RUNNER_ADVERTISE_PORT", 7601) as u16;
        let advertise_address = std::env::var("KOHAKURIVER_RUNNER_ADVERTISE_ADDRESS")
            .unwrap_or_else(|_| "127.0.0.1".to_string());
        let host_base_url = std::env::var("KOHAKURIVER_HOST_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:7600".to_string());
        let vault_path = std::env::var("KOHAKURIVER_RUNNER_VAULT_PATH")
            .unwrap_or_else(|_| "./runner-vault.sqlite".to_string());
        let heartbeat_interval = Duration::from_secs(env_u64("KOHAKURIVER_HEARTBEAT_INTERVAL_SECS", 5));
        let tunnel_client_binary_path = std::env::var("KOHAKURIVER_TUNNEL_CLIENT_BINARY")
            .unwrap_or_else(|_| "/usr/local/bin/kohakuriver-tunnel-client".to_string());
        let cores = env_u64("KOHAKURIVER_RUNNER_CORES", num_cpus_fallback()) as u32;
        let memory_bytes = env_u64("KOHAKURIVER_RUNNER_MEMORY_BYTES", 16 * 1024 * 1024 * 1024);
        let numa = std::env::var("KOHAKURIVER_RUNNER_NUMA_JSON")
            .ok()
            .and_then(|v| serde_json::from_str(&v).ok());
        let gpus = std::env::var("KOHAKURIVER_RUNNER_GPUS_JSON")
            .ok()
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default();
        let task_log_dir = std::env::var("KOHAKURIVER_RUNNER_TASK_LOG_DIR")
            .unwrap_or_else(|_| "./runner-task-logs".to_string());
        let image_tarball_dir = std::env::var("KOHAKURIVER_RUNNER_IMAGE_TARBALL_DIR")
            .unwrap_or_else(|_| "./runner-image-tarballs".to_string());

        Self {
            hostname,
            bind_addr,
            advertise_address,
            advertise_port,
            host_base_url,
            vault_path,
            heartbeat_interval,
            tunnel_client_binary_path,
            cores,
            memory_bytes,
            numa,
            gpus,
            task_log_dir,
            image_tarball_dir,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// `num_cpus` isn't in the dependency stack; a declared-totals fallback is
/// fine since operators are expected to set `KOHAKURIVER_RUNNER_CORES`
/// explicitly for anything but local testing.
fn num_cpus_fallback() -> u64 {
    std::thread::available_parallelism().map(|n| n.get() as u64).unwrap_or(1)
}
