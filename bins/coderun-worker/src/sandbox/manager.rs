//! Sandbox Manager: one end-to-end run per call.
//!
//! ```text
//! STAGING -> CREATING -> RUNNING -> { COMPLETED | TIMED_OUT }
//!                     \-> CREATE_FAILED
//! every path -> CLEANING_UP -> DONE
//! ```
//!
//! Cleanup is unconditional. The explicit path kills, deletes and
//! deregisters the sandbox, then removes the staging directory. If the run
//! future is dropped mid-flight, the guards below do the same work from
//! `Drop`.
use super::{
    ExecutionRequest, RunSpec, Sandbox, SandboxError, SandboxProvider, SandboxRegistry,
};
use crate::output::OutputSinks;
use coderun_common::spec::SpecResolver;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Staging,
    Creating,
    Running,
    Completed,
    TimedOut,
    CreateFailed,
    CleaningUp,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Staging => "STAGING",
            RunState::Creating => "CREATING",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::TimedOut => "TIMED_OUT",
            RunState::CreateFailed => "CREATE_FAILED",
            RunState::CleaningUp => "CLEANING_UP",
            RunState::Done => "DONE",
        };
        f.write_str(s)
    }
}

pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    resolver: Arc<SpecResolver>,
    registry: Arc<SandboxRegistry>,
    host_root: PathBuf,
    timeout: Duration,
}

impl SandboxManager {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        resolver: Arc<SpecResolver>,
        registry: Arc<SandboxRegistry>,
        host_root: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            resolver,
            registry,
            host_root: host_root.into(),
            timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &SpecResolver {
        &self.resolver
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Shutdown sweep: reclaim every registered sandbox, then anything the
    /// provider still owns but never handed back. Call once no run is in
    /// flight.
    pub async fn reap_all(&self) -> usize {
        let reaped = self.registry.reap_all().await;
        match self.provider.sweep_orphans().await {
            Ok(orphans) => reaped + orphans,
            Err(e) => {
                warn!(error = %e, "Orphan sweep failed");
                reaped
            }
        }
    }

    /// Run `request` in a fresh sandbox, streaming output into `sinks`.
    ///
    /// The stop signal in `sinks` is sent before this returns, on every
    /// path, so the collector's buffers are final once the caller awaits it.
    pub async fn run_in_sandbox(
        &self,
        job_id: &str,
        request: &ExecutionRequest,
        stdin: Vec<u8>,
        sinks: OutputSinks,
    ) -> Result<(), SandboxError> {
        let OutputSinks { stdout, stderr, stop } = sinks;
        let result = self.execute(job_id, request, stdin, stdout, stderr).await;
        let _ = stop.send(());
        result
    }

    async fn execute(
        &self,
        job_id: &str,
        request: &ExecutionRequest,
        stdin: Vec<u8>,
        stdout: tokio::sync::mpsc::Sender<Vec<u8>>,
        stderr: tokio::sync::mpsc::Sender<Vec<u8>>,
    ) -> Result<(), SandboxError> {
        let spec = self.resolver.resolve(&request.language)?;

        let subdir = if validate_file_name(job_id).is_ok() {
            job_id.to_string()
        } else {
            uuid::Uuid::new_v4().simple().to_string()
        };
        let job = subdir.as_str();

        debug!(job_id = %job, state = %RunState::Staging, "Run state");
        let mut staging = StagingDir::create(&self.host_root, &subdir).await?;
        if let Err(e) = stage_files(staging.path(), &spec.filename, request).await {
            staging.remove().await;
            debug!(job_id = %job, state = %RunState::Done, "Run state");
            return Err(e);
        }

        let run = RunSpec {
            command: request.command.clone().unwrap_or_else(|| spec.command()),
            spec,
            arguments: request.arguments.clone(),
            environment: request.environment.clone(),
            subdir: subdir.clone(),
            host_dir: self.host_root.clone(),
            attach_stdin: !stdin.is_empty(),
        };

        debug!(job_id = %job, state = %RunState::Creating, image = %run.spec.image, "Run state");
        let sandbox = match self.provider.create_sandbox(&run).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(job_id = %job, state = %RunState::CreateFailed, error = %e, "Sandbox creation failed");
                debug!(job_id = %job, state = %RunState::CleaningUp, "Run state");
                staging.remove().await;
                debug!(job_id = %job, state = %RunState::Done, "Run state");
                return Err(e);
            }
        };

        self.registry.register(sandbox.clone());
        let lease = SandboxLease::new(sandbox.clone(), self.registry.clone());
        info!(job_id = %job, container_id = %sandbox.id(), "Sandbox created");

        debug!(job_id = %job, state = %RunState::Running, "Run state");
        let (done_tx, done_rx) = oneshot::channel();
        let race = tokio::time::timeout(self.timeout, async {
            sandbox.run(stdin, stdout, stderr, done_tx).await?;
            // A dropped sender also ends the run: the stream is gone.
            let _ = done_rx.await;
            Ok::<(), SandboxError>(())
        })
        .await;

        let result = match race {
            Ok(Ok(())) => {
                debug!(job_id = %job, state = %RunState::Completed, "Run state");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(job_id = %job, error = %e, "Sandbox failed to run");
                Err(e)
            }
            Err(_) => {
                warn!(
                    job_id = %job,
                    state = %RunState::TimedOut,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Execution timed out"
                );
                Err(SandboxError::Timeout(self.timeout))
            }
        };

        debug!(job_id = %job, state = %RunState::CleaningUp, "Run state");
        lease.release().await;
        staging.remove().await;
        debug!(job_id = %job, state = %RunState::Done, "Run state");

        result
    }
}

/// Rejects anything that is not a single plain path component.
pub fn validate_file_name(name: &str) -> Result<(), SandboxError> {
    let valid = !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidFile(name.to_string()))
    }
}

async fn stage_files(dir: &Path, filename: &str, request: &ExecutionRequest) -> Result<(), SandboxError> {
    validate_file_name(filename)?;
    tokio::fs::write(dir.join(filename), request.code.as_bytes()).await?;

    for file in &request.files {
        validate_file_name(&file.name)?;
        tokio::fs::write(dir.join(&file.name), file.contents.as_bytes()).await?;
    }
    Ok(())
}

/// Per-run host directory; removed exactly once.
struct StagingDir {
    path: PathBuf,
    removed: bool,
}

impl StagingDir {
    /// Fails if the directory already exists, so two runs never share one.
    async fn create(root: &Path, subdir: &str) -> Result<Self, SandboxError> {
        tokio::fs::create_dir_all(root).await?;
        let path = root.join(subdir);
        tokio::fs::create_dir(&path).await?;
        Ok(Self { path, removed: false })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            debug!(path = %self.path.display(), error = %e, "Staging cleanup failed");
        }
        self.removed = true;
    }
}

impl Drop for StagingDir {
    // Only reached when the run was cancelled before its explicit cleanup.
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Staging cleanup failed");
        }
    }
}

/// Owns a registered sandbox until it has been killed, deleted and
/// deregistered.
struct SandboxLease {
    sandbox: Option<Arc<dyn Sandbox>>,
    registry: Arc<SandboxRegistry>,
}

impl SandboxLease {
    fn new(sandbox: Arc<dyn Sandbox>, registry: Arc<SandboxRegistry>) -> Self {
        Self {
            sandbox: Some(sandbox),
            registry,
        }
    }

    async fn release(mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            teardown(sandbox, &self.registry).await;
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        // Cancelled mid-run. Without a runtime the entry stays registered
        // and the shutdown sweep reaps it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.registry.clone();
            handle.spawn(async move {
                teardown(sandbox, &registry).await;
            });
        }
    }
}

async fn teardown(sandbox: Arc<dyn Sandbox>, registry: &SandboxRegistry) {
    let id = sandbox.id().to_string();
    if let Err(e) = sandbox.kill().await {
        debug!(container_id = %id, error = %e, "Kill failed");
    }
    if let Err(e) = sandbox.delete().await {
        debug!(container_id = %id, error = %e, "Delete failed");
    }
    registry.deregister(&id);
}
