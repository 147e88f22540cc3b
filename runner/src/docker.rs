//! Docker wrapper (spec.md §4.H, §9 "Mixin composition for Docker manager").
//!
//! The original composes its manager from three Python mixins
//! (`examples/original_source/src/kohakuriver/docker/client.py`). Re-expressed
//! per spec.md §9 as one value, [`DockerManager`], implementing three
//! narrow traits — [`ContainerOps`], [`ImageOps`], [`SyncOps`] — so callers
//! depend on the capability they need rather than the concrete type.
//! `bollard` is the enrichment import here: no teacher crate talks to
//! Docker directly, so this follows the nearest real example reachable in
//! the pack, `other_examples/.../sentiric-orchestrator` (axum + bollard +
//! tokio), for call shapes (`Config`, `HostConfig`, `CreateImageOptions`).

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    LogsOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerSummary, DeviceRequest, HostConfig, ImageSummary, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use kohakuriver_common::ResourceRequest;

use crate::error::{RunnerError, RunnerResult};

/// Container lifecycle: create/start/stop/remove/inspect/list, the
/// primitives §4.H and §4.I are both built from.
#[async_trait::async_trait]
pub trait ContainerOps: Send + Sync {
    async fn create_and_start(&self, spec: ContainerSpec) -> RunnerResult<String>;
    async fn stop(&self, name: &str) -> RunnerResult<()>;
    async fn remove(&self, name: &str) -> RunnerResult<()>;
    async fn pause(&self, name: &str) -> RunnerResult<()>;
    async fn unpause(&self, name: &str) -> RunnerResult<()>;
    async fn inspect(&self, name: &str) -> RunnerResult<ContainerInspection>;
    async fn list_kohakuriver_containers(&self) -> RunnerResult<Vec<ContainerSummary>>;
}

/// Local image inventory (`GET /docker/images`).
#[async_trait::async_trait]
pub trait ImageOps: Send + Sync {
    async fn list_images(&self) -> RunnerResult<Vec<ImageSummary>>;
    async fn pull(&self, image: &str) -> RunnerResult<()>;
}

/// Shared-tarball sync (`POST /docker/sync/{name}`), delegated to an
/// [`ImageSource`] so the actual distribution transport stays out of scope
/// (spec.md §1) while the call site and caching logic are real.
#[async_trait::async_trait]
pub trait SyncOps: Send + Sync {
    async fn sync_image(&self, image: &str) -> RunnerResult<()>;
}

/// Everything the executor needs to materialize one container (spec.md
/// §4.H steps 2-5: resource constraints, tunnel-client mount, wrapper
/// command).
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Full shell command the container's single process runs (already
    /// wrapped to background the tunnel client — see `wrap_command`).
    pub shell_command: String,
    pub env: HashMap<String, String>,
    pub resources: ResourceRequest,
    pub cpu_ids: Option<Vec<u32>>,
    /// Host path to the tunnel-client binary, bind-mounted read-only.
    pub tunnel_client_binary_path: String,
    pub tunnel_client_mount_path: String,
    /// `Some(port)` publishes container port 22/tcp on the host for vps
    /// tasks (spec.md §4.H.5).
    pub publish_ssh_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct ContainerInspection {
    pub running: bool,
    pub exit_code: Option<i32>,
    pub started_at: Option<String>,
}

pub struct DockerManager {
    docker: Docker,
    image_source: Box<dyn ImageSource>,
}

impl DockerManager {
    pub fn connect_local(image_source: Box<dyn ImageSource>) -> RunnerResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, image_source })
    }

    #[cfg(test)]
    pub fn from_client(docker: Docker, image_source: Box<dyn ImageSource>) -> Self {
        Self { docker, image_source }
    }

    /// Streams stdout/stderr into per-task files (spec.md §4.H.4). Spawned
    /// once per container by the executor; exits when the container's log
    /// stream ends.
    pub async fn tail_logs_to_files(&self, name: &str, stdout_path: &str, stderr_path: &str) -> RunnerResult<()> {
        use tokio::io::AsyncWriteExt;
        let mut stdout_file = tokio::fs::File::create(stdout_path).await?;
        let mut stderr_file = tokio::fs::File::create(stderr_path).await?;
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bollard::container::LogOutput::StdOut { message }) => {
                    let _ = stdout_file.write_all(&message).await;
                }
                Ok(bollard::container::LogOutput::StdErr { message }) => {
                    let _ = stderr_file.write_all(&message).await;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContainerOps for DockerManager {
    async fn create_and_start(&self, spec: ContainerSpec) -> RunnerResult<String> {
        self.image_source.ensure_fresh(&self.docker, &spec.image).await?;

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        if let Some(ssh_port) = spec.publish_ssh_port {
            exposed_ports.insert("22/tcp".to_string(), HashMap::new());
            port_bindings.insert(
                "22/tcp".to_string(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(ssh_port.to_string()),
                }]),
            );
        }

        let device_requests = if let Some(indices) = &spec.resources.gpu_indices {
            if indices.is_empty() {
                None
            } else {
                Some(vec![DeviceRequest {
                    driver: Some("nvidia".to_string()),
                    count: None,
                    device_ids: Some(indices.iter().map(|i| i.to_string()).collect()),
                    capabilities: Some(vec![vec!["gpu".to_string()]]),
                    ..Default::default()
                }])
            }
        } else {
            None
        };

        let host_config = HostConfig {
            memory: Some(spec.resources.memory_bytes as i64),
            nano_cpus: Some((spec.resources.cores as i64) * 1_000_000_000),
            cpuset_cpus: spec
                .cpu_ids
                .as_ref()
                .map(|ids| ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",")),
            port_bindings: Some(port_bindings),
            device_requests,
            binds: Some(vec![format!(
                "{}:{}:ro",
                spec.tunnel_client_binary_path, spec.tunnel_client_mount_path
            )]),
            ..Default::default()
        };

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), spec.shell_command.clone()]),
            env: Some(env),
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container::<String>(&spec.name, None)
            .await?;
        Ok(spec.name)
    }

    async fn stop(&self, name: &str) -> RunnerResult<()> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> RunnerResult<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await?;
        Ok(())
    }

    async fn pause(&self, name: &str) -> RunnerResult<()> {
        self.docker.pause_container(name).await?;
        Ok(())
    }

    async fn unpause(&self, name: &str) -> RunnerResult<()> {
        self.docker.unpause_container(name).await?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> RunnerResult<ContainerInspection> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        let state = info.state.unwrap_or_default();
        Ok(ContainerInspection {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code.map(|c| c as i32),
            started_at: state.started_at,
        })
    }

    async fn list_kohakuriver_containers(&self) -> RunnerResult<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;
        Ok(containers
            .into_iter()
            .filter(|c| {
                c.names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/'))
                    .map(|n| n.starts_with("kohakuriver-task-") || n.starts_with("kohakuriver-vps-"))
                    .unwrap_or(false)
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl ImageOps for DockerManager {
    async fn list_images(&self) -> RunnerResult<Vec<ImageSummary>> {
        Ok(self
            .docker
            .list_images(Some(ListImagesOptions::<String> { all: false, ..Default::default() }))
            .await?)
    }

    async fn pull(&self, image: &str) -> RunnerResult<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions { from_image: image.to_string(), ..Default::default() }),
            None,
            None,
        );
        while let Some(result) = stream.next().await {
            result.map_err(RunnerError::Docker)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SyncOps for DockerManager {
    async fn sync_image(&self, image: &str) -> RunnerResult<()> {
        self.image_source.ensure_fresh(&self.docker, image).await
    }
}

/// Seam over image distribution (spec.md §4.H.1: "pulling via shared
/// tarball if stale — delegated"). `LocalTarballSource` is the only
/// implementation shipped here; a real deployment's tarball-distribution
/// transport is out of scope per spec.md §1.
#[async_trait::async_trait]
pub trait ImageSource: Send + Sync {
    async fn ensure_fresh(&self, docker: &Docker, image: &str) -> RunnerResult<()>;
}

/// Checks a local manifest file (one digest per image, named after the
/// image with `/` and `:` replaced by `_`) against the image's current
/// local digest; re-loads `{tarball_dir}/{sanitized_name}.tar` when they
/// differ or no local image exists yet. Grounded on
/// `examples/original_source/src/kohakuriver/docker/sync_manager.py`'s
/// digest-compare-then-load flow.
pub struct LocalTarballSource {
    tarball_dir: std::path::PathBuf,
}

impl LocalTarballSource {
    pub fn new(tarball_dir: impl Into<std::path::PathBuf>) -> Self {
        Self { tarball_dir: tarball_dir.into() }
    }

    fn sanitize(image: &str) -> String {
        image.chars().map(|c| if c == '/' || c == ':' { '_' } else { c }).collect()
    }

    fn manifest_path(&self, image: &str) -> std::path::PathBuf {
        self.tarball_dir.join(format!("{}.digest", Self::sanitize(image)))
    }

    fn tarball_path(&self, image: &str) -> std::path::PathBuf {
        self.tarball_dir.join(format!("{}.tar", Self::sanitize(image)))
    }
}

#[async_trait::async_trait]
impl ImageSource for LocalTarballSource {
    async fn ensure_fresh(&self, docker: &Docker, image: &str) -> RunnerResult<()> {
        let local_digest = docker.inspect_image(image).await.ok().and_then(|i| i.id);
        let manifest_digest = tokio::fs::read_to_string(self.manifest_path(image)).await.ok();

        let stale = match (&local_digest, &manifest_digest) {
            (Some(_), None) => false, // no manifest to compare against; trust what's local
            (None, _) => true,
            (Some(local), Some(wanted)) => local.trim() != wanted.trim(),
        };
        if !stale {
            return Ok(());
        }

        let tarball = self.tarball_path(image);
        if !tokio::fs::try_exists(&tarball).await.unwrap_or(false) {
            tracing::debug!(image, "no local tarball staged, falling back to registry pull");
            let mut stream = docker.create_image(
                Some(CreateImageOptions { from_image: image.to_string(), ..Default::default() }),
                None,
                None,
            );
            while let Some(result) = stream.next().await {
                result.map_err(RunnerError::Docker)?;
            }
            return Ok(());
        }

        tracing::info!(image, tarball = %tarball.display(), "loading stale image from shared tarball");
        let file = tokio::fs::File::open(&tarball).await?;
        let body = hyper::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));
        let mut stream = docker.import_image(bollard::image::ImportImageOptions { quiet: true }, body, None);
        while let Some(result) = stream.next().await {
            result.map_err(RunnerError::Docker)?;
        }
        Ok(())
    }
}

/// Builds the single-process wrapper command §4.H.4/5 requires: the
/// tunnel-client binary is always started in the background first,
/// `exec` replaces the shell with the user command for command tasks
/// (so the container's exit code is the command's), vps tasks skip
/// `exec` because the tunnel "runs alongside the main process" rather
/// than being replaced by it.
pub fn wrap_command(tunnel_client_mount_path: &str, original: &[String], use_exec: bool) -> String {
    let quoted: Vec<String> = original.iter().map(|arg| shell_quote(arg)).collect();
    let joined = quoted.join(" ");
    if use_exec {
        format!("{tunnel_client_mount_path} & exec {joined}")
    } else {
        format!("{tunnel_client_mount_path} & {joined}")
    }
}

fn shell_quote(arg: &str) -> String {
    if arg.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=')) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_command_with_exec_for_command_tasks() {
        let wrapped = wrap_command("/opt/kr/tunnel-client", &["echo".into(), "hello world".into()], true);
        assert_eq!(wrapped, "/opt/kr/tunnel-client & exec echo 'hello world'");
    }

    #[test]
    fn wraps_without_exec_for_vps_tasks() {
        let wrapped = wrap_command("/opt/kr/tunnel-client", &["/usr/sbin/sshd".into(), "-D".into()], false);
        assert_eq!(wrapped, "/opt/kr/tunnel-client & /usr/sbin/sshd -D");
    }

    #[test]
    fn quotes_arguments_containing_shell_metacharacters() {
        let wrapped = wrap_command("/tc", &["sh".into(), "-c".into(), "echo $HOME; rm -rf /".into()], true);
        assert!(wrapped.contains("'echo $HOME; rm -rf /'"));
    }
}
