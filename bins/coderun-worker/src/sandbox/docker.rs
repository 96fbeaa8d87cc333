//! Docker-backed sandbox provider.
//!
//! Each run gets one container named `coderun-<language>-<uuid>` with the
//! run's staging directory bind-mounted at `/var/tmp/exec/<subdir>`. Output
//! is streamed through an attach session opened before the container starts,
//! so nothing written early is lost.
//!
//! Containers carry an owner label unique to the provider instance, so a
//! shutdown sweep can find ones whose create call never returned.
use super::{RunSpec, Sandbox, SandboxError, SandboxProvider};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use coderun_common::config::SandboxConfig;
use coderun_common::spec::{parse_image, LanguageSpec};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const LABEL_OWNER: &str = "coderun.owner";
pub const LABEL_RUN: &str = "coderun.run";

pub struct DockerProvider {
    docker: Docker,
    limits: SandboxConfig,
    owner: String,
}

impl DockerProvider {
    pub fn connect(limits: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Runtime(format!("failed to connect to Docker daemon: {}", e)))?;
        Ok(Self {
            docker,
            limits,
            owner: uuid::Uuid::new_v4().simple().to_string(),
        })
    }

    /// Round-trip to the daemon; used at startup to fail fast.
    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Runtime(format!("Docker daemon unreachable: {}", e)))
    }

    /// Ids of every container, running or not, created by this provider.
    pub async fn owned_containers(&self) -> Result<Vec<String>, SandboxError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{}={}", LABEL_OWNER, self.owner)],
            )]),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| SandboxError::Runtime(format!("list containers: {}", e)))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

fn container_config(run: &RunSpec, host_dir: &str, limits: &SandboxConfig, owner: &str) -> Config<String> {
    let entrypoint = run.entrypoint();
    Config {
        image: Some(run.spec.image.clone()),
        entrypoint: (!entrypoint.is_empty()).then_some(entrypoint),
        cmd: Some(run.command_with_args()),
        env: Some(run.env()),
        working_dir: Some(run.container_dir()),
        labels: Some(HashMap::from([
            (LABEL_OWNER.to_string(), owner.to_string()),
            (LABEL_RUN.to_string(), run.subdir.clone()),
        ])),
        attach_stdin: Some(run.attach_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(run.attach_stdin),
        stdin_once: Some(run.attach_stdin),
        tty: Some(false),
        network_disabled: Some(limits.network_disabled),
        host_config: Some(HostConfig {
            binds: Some(vec![format!("{}:{}", host_dir, run.container_dir())]),
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_bytes),
            nano_cpus: Some((limits.cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    async fn prepare(&self, spec: &LanguageSpec) -> Result<(), SandboxError> {
        if self.docker.inspect_image(&spec.image).await.is_ok() {
            debug!(image = %spec.image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %spec.image, "Image cache miss, pulling");
        let (repo, tag) = parse_image(&spec.image);
        let options = Some(CreateImageOptions {
            from_image: repo.as_str(),
            tag: tag.as_str(),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::ImageFetch {
                image: spec.image.clone(),
                message: e.to_string(),
            })?;
        }

        info!(image = %spec.image, "Image pulled");
        Ok(())
    }

    async fn create_sandbox(&self, run: &RunSpec) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.prepare(&run.spec).await?;

        let host_dir = tokio::fs::canonicalize(run.assembled_host_dir()).await?;
        let host_dir = host_dir.to_string_lossy().into_owned();
        let name = container_name(&run.spec.language);

        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(
                Some(options),
                container_config(run, &host_dir, &self.limits, &self.owner),
            )
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        for warning in &created.warnings {
            warn!(container = %name, warning = %warning, "Docker warning on create");
        }
        debug!(container = %name, id = %created.id, "Container created");

        Ok(Arc::new(DockerSandbox {
            docker: self.docker.clone(),
            id: created.id,
            name,
            attach_stdin: run.attach_stdin,
        }))
    }

    async fn sweep_orphans(&self) -> Result<usize, SandboxError> {
        let mut removed = 0;
        for id in self.owned_containers().await? {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match self.docker.remove_container(&id, Some(options)).await {
                Ok(()) => removed += 1,
                Err(e) if already_gone(&e) => {}
                Err(e) => warn!(container_id = %id, error = %e, "Failed to remove orphaned container"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed orphaned containers");
        }
        Ok(removed)
    }
}

fn container_name(language: &str) -> String {
    let language: String = language
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("coderun-{}-{}", language, uuid::Uuid::new_v4().simple())
}

pub struct DockerSandbox {
    docker: Docker,
    id: String,
    name: String,
    attach_stdin: bool,
}

/// Errors from kill/remove that mean the work is already done.
fn already_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404 | 409, .. }
    )
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        stdin: Vec<u8>,
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
        done: oneshot::Sender<()>,
    ) -> Result<(), SandboxError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(self.attach_stdin),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(&self.id, Some(options))
            .await
            .map_err(|e| SandboxError::Start(format!("attach failed: {}", e)))?;

        let name = self.name.clone();
        let attach_stdin = self.attach_stdin;
        tokio::spawn(async move {
            if attach_stdin {
                if let Err(e) = input.write_all(&stdin).await {
                    debug!(container = %name, error = %e, "Failed to write stdin");
                }
                let _ = input.shutdown().await;
            }

            while let Some(frame) = output.next().await {
                let sent = match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.send(message.to_vec()).await
                    }
                    Ok(LogOutput::StdErr { message }) => stderr.send(message.to_vec()).await,
                    Ok(LogOutput::StdIn { .. }) => Ok(()),
                    Err(e) => {
                        debug!(container = %name, error = %e, "Attach stream ended with error");
                        break;
                    }
                };
                // Collector is gone; the run is already over.
                if sent.is_err() {
                    break;
                }
            }
            let _ = done.send(());
        });

        self.docker
            .start_container(&self.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Start(e.to_string()))?;

        debug!(container = %self.name, "Container started");
        Ok(())
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        match self
            .docker
            .kill_container(&self.id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if already_gone(&e) => Ok(()),
            Err(e) => Err(SandboxError::Runtime(format!("kill {}: {}", self.name, e))),
        }
    }

    async fn delete(&self) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&self.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if already_gone(&e) => Ok(()),
            Err(e) => Err(SandboxError::Runtime(format!("remove {}: {}", self.name, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_container_config_maps_run_and_limits() {
        let mut run = RunSpec {
            spec: LanguageSpec {
                image: "python:3.12-alpine".to_string(),
                entrypoint: "python3 -u".to_string(),
                filename: "main.py".to_string(),
                ..Default::default()
            },
            command: "main.py".to_string(),
            arguments: Vec::new(),
            environment: HashMap::from([("DEBUG".to_string(), "1".to_string())]),
            subdir: "run-7".to_string(),
            host_dir: PathBuf::from("/srv/coderun"),
            attach_stdin: true,
        };
        let limits = SandboxConfig {
            timeout: Duration::from_secs(5),
            memory_bytes: 128 * 1024 * 1024,
            cpus: 0.5,
            network_disabled: true,
            output_limit: 1024,
        };

        let config = container_config(&run, "/srv/coderun/run-7", &limits, "owner-a");
        assert_eq!(config.image.as_deref(), Some("python:3.12-alpine"));
        assert_eq!(config.entrypoint, Some(vec!["python3".to_string(), "-u".to_string()]));
        assert_eq!(config.cmd, Some(vec!["main.py".to_string()]));
        assert_eq!(config.working_dir.as_deref(), Some("/var/tmp/exec/run-7"));
        assert_eq!(config.attach_stdin, Some(true));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.stdin_once, Some(true));
        assert_eq!(config.network_disabled, Some(true));

        let env = config.env.unwrap();
        assert_eq!(env[0], "RUNNER_HOSTDIR=/srv/coderun");
        assert!(env.contains(&"DEBUG=1".to_string()));

        let labels = config.labels.unwrap();
        assert_eq!(labels[LABEL_OWNER], "owner-a");
        assert_eq!(labels[LABEL_RUN], "run-7");

        let host = config.host_config.unwrap();
        assert_eq!(host.binds, Some(vec!["/srv/coderun/run-7:/var/tmp/exec/run-7".to_string()]));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, Some(128 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));

        run.attach_stdin = false;
        run.spec.entrypoint = String::new();
        let config = container_config(&run, "/srv/coderun/run-7", &limits, "owner-a");
        assert_eq!(config.open_stdin, Some(false));
        assert_eq!(config.attach_stdin, Some(false));
        assert_eq!(config.entrypoint, None);
    }

    #[test]
    fn test_container_name_is_sanitized_and_unique() {
        let a = container_name("C++ 17");
        let b = container_name("C++ 17");
        assert!(a.starts_with("coderun-c---17-"));
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_already_gone_statuses() {
        let gone = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "is not running".to_string(),
        };
        let server = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(already_gone(&gone));
        assert!(already_gone(&conflict));
        assert!(!already_gone(&server));
    }
}
