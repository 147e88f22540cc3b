//! Host configuration, loaded from the environment (spec.md §1: config
//! loading is out of scope as a file-format concern; the control plane only
//! needs the resolved values below).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub database_url: String,
    pub bind_addr: std::net::SocketAddr,
    pub node_id: u64,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub assigning_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub monitor_tick: Duration,
    pub ssh_port_range: (u16, u16),
    pub overlay_subnet_cidr: Option<String>,
}

impl HostConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql:///kohakuriver".to_string());
        let bind_addr = std::env::var("KOHAKURIVER_HOST_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7600".to_string())
            .parse()
            .expect("KOHAKURIVER_HOST_BIND must be a valid socket address");
        let node_id = std::env::var("KOHAKURIVER_HOST_NODE_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| {
                let hostname = hostname_or_default();
                kohakuriver_common::Snowflake::node_id_from_name(&hostname)
            });
        let heartbeat_interval = Duration::from_secs(env_u64("KOHAKURIVER_HEARTBEAT_INTERVAL_SECS", 5));
        let heartbeat_timeout = Duration::from_secs(3 * heartbeat_interval.as_secs());
        let assigning_timeout = Duration::from_secs(env_u64("KOHAKURIVER_ASSIGNING_TIMEOUT_SECS", 60));
        let dispatch_timeout = Duration::from_secs(env_u64("KOHAKURIVER_DISPATCH_TIMEOUT_SECS", 30));
        let monitor_tick = Duration::from_secs(env_u64("KOHAKURIVER_MONITOR_TICK_SECS", 5));
        let ssh_port_low = env_u64("KOHAKURIVER_SSH_PORT_LOW", 32000) as u16;
        let ssh_port_high = env_u64("KOHAKURIVER_SSH_PORT_HIGH", 33000) as u16;
        let overlay_subnet_cidr = std::env::var("KOHAKURIVER_OVERLAY_SUBNET_CIDR").ok();

        Self {
            database_url,
            bind_addr,
            node_id,
            heartbeat_interval,
            heartbeat_timeout,
            assigning_timeout,
            dispatch_timeout,
            monitor_tick,
            ssh_port_range: (ssh_port_low, ssh_port_high),
            overlay_subnet_cidr,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "kohakuriver-host".to_string())
}
