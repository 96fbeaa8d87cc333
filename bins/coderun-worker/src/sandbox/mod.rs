//! Sandboxed execution: provider abstraction, run parameters and errors.
//!
//! The manager drives one run through the provider traits defined here; the
//! Docker-backed provider lives in `docker`, and tests use the in-process
//! provider in `mock`.
pub mod docker;
pub mod manager;
pub mod registry;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use coderun_common::spec::{LanguageSpec, SpecError};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub use manager::SandboxManager;
pub use registry::SandboxRegistry;

/// Marker variable telling the sandboxed process where the host staging root is.
pub const HOSTDIR_ENV: &str = "RUNNER_HOSTDIR";

/// Mount point of the staging directory inside the container.
pub const CONTAINER_EXEC_ROOT: &str = "/var/tmp/exec";

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] SpecError),
    #[error("failed to fetch image {image}: {message}")]
    ImageFetch { image: String, message: String },
    #[error("failed to create sandbox: {0}")]
    Create(String),
    #[error("failed to start sandbox: {0}")]
    Start(String),
    #[error("execution timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("failed to stage files: {0}")]
    Staging(#[from] std::io::Error),
    #[error("invalid staged file name: {0}")]
    InvalidFile(String),
    #[error("sandbox runtime error: {0}")]
    Runtime(String),
}

impl SandboxError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }
}

/// Extra file written next to the submitted source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub name: String,
    pub contents: String,
}

impl StagedFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// What to run: the submission plus anything the caller generated for it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    pub files: Vec<StagedFile>,
    /// Replaces the spec's command template, e.g. to run a judge harness.
    pub command: Option<String>,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
}

/// Fully resolved parameters of one run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub spec: LanguageSpec,
    pub command: String,
    pub arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    /// Unique per run; names both the host and the container directory.
    pub subdir: String,
    pub host_dir: PathBuf,
    pub attach_stdin: bool,
}

impl RunSpec {
    pub fn assembled_host_dir(&self) -> PathBuf {
        self.host_dir.join(&self.subdir)
    }

    pub fn container_dir(&self) -> String {
        format!("{}/{}", CONTAINER_EXEC_ROOT, self.subdir)
    }

    pub fn entrypoint(&self) -> Vec<String> {
        split_args(&self.spec.entrypoint)
    }

    pub fn command_with_args(&self) -> Vec<String> {
        let mut cmd = split_args(&self.command);
        cmd.extend(self.arguments.iter().cloned());
        cmd
    }

    pub fn env(&self) -> Vec<String> {
        let mut env = vec![format!("{}={}", HOSTDIR_ENV, self.host_dir.display())];
        let mut overrides: Vec<_> = self.environment.iter().collect();
        overrides.sort();
        env.extend(overrides.into_iter().map(|(k, v)| format!("{}={}", k, v)));
        env
    }
}

/// Shell-like tokenization: whitespace separates, double quotes group.
pub fn split_args(value: &str) -> Vec<String> {
    static ARG_RX: OnceLock<Regex> = OnceLock::new();
    let rx = ARG_RX.get_or_init(|| Regex::new(r#"(?:[^\s"]+|"[^"]*")+"#).expect("static regex"));
    rx.find_iter(value)
        .map(|m| m.as_str().replace('"', ""))
        .collect()
}

/// One isolated execution environment.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Start the environment and stream its output into the sinks. Returns
    /// once started; `done` fires exactly once when the process exits or the
    /// output stream closes.
    async fn run(
        &self,
        stdin: Vec<u8>,
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
        done: oneshot::Sender<()>,
    ) -> Result<(), SandboxError>;

    /// Best-effort and idempotent.
    async fn kill(&self) -> Result<(), SandboxError>;

    /// Best-effort and idempotent.
    async fn delete(&self) -> Result<(), SandboxError>;
}

/// Container runtime abstraction.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Make sure the spec's image is available locally.
    async fn prepare(&self, spec: &LanguageSpec) -> Result<(), SandboxError>;

    /// Create (but do not start) a sandbox bound to the run's staging
    /// directory. Implementations call `prepare` first.
    async fn create_sandbox(&self, run: &RunSpec) -> Result<Arc<dyn Sandbox>, SandboxError>;

    /// Remove every sandbox this provider created that still exists,
    /// including ones whose `create_sandbox` call was cancelled before it
    /// returned. Only safe once no run is in flight.
    async fn sweep_orphans(&self) -> Result<usize, SandboxError> {
        Ok(0)
    }
}
