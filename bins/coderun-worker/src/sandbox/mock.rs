//! In-process sandbox provider for tests.
use super::{RunSpec, Sandbox, SandboxError, SandboxProvider};
use async_trait::async_trait;
use coderun_common::spec::LanguageSpec;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Produces `(stdout, stderr)` from the run parameters and stdin. Runs while
/// the staging directory still exists, so it may read staged files.
pub type Responder = Arc<dyn Fn(&RunSpec, &[u8]) -> (Vec<u8>, Vec<u8>) + Send + Sync>;

#[derive(Clone)]
pub enum Behavior {
    Respond(Responder),
    /// Starts but never signals completion.
    Hang,
    FailPrepare,
    FailCreate,
    FailStart,
    /// The sandbox exists but `create_sandbox` never returns it.
    HangCreate,
}

impl Behavior {
    pub fn output(stdout: &str, stderr: &str) -> Self {
        let (stdout, stderr) = (stdout.as_bytes().to_vec(), stderr.as_bytes().to_vec());
        Behavior::Respond(Arc::new(move |_, _| (stdout.clone(), stderr.clone())))
    }

    pub fn respond<F>(f: F) -> Self
    where
        F: Fn(&RunSpec, &[u8]) -> (Vec<u8>, Vec<u8>) + Send + Sync + 'static,
    {
        Behavior::Respond(Arc::new(f))
    }
}

#[derive(Default)]
pub struct Counters {
    pub prepared: AtomicUsize,
    pub created: AtomicUsize,
    pub kills: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl Counters {
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub struct MockProvider {
    behavior: Behavior,
    pub counters: Arc<Counters>,
    pub runs: Mutex<Vec<RunSpec>>,
    live: Mutex<Vec<Arc<MockSandbox>>>,
}

impl MockProvider {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            counters: Arc::new(Counters::default()),
            runs: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
        })
    }

    pub fn last_run(&self) -> Option<RunSpec> {
        self.runs.lock().last().cloned()
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    async fn prepare(&self, spec: &LanguageSpec) -> Result<(), SandboxError> {
        self.counters.prepared.fetch_add(1, Ordering::SeqCst);
        if matches!(self.behavior, Behavior::FailPrepare) {
            return Err(SandboxError::ImageFetch {
                image: spec.image.clone(),
                message: "registry unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn create_sandbox(&self, run: &RunSpec) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.prepare(&run.spec).await?;
        self.runs.lock().push(run.clone());
        if matches!(self.behavior, Behavior::FailCreate) {
            return Err(SandboxError::Create("runtime rejected config".to_string()));
        }
        let n = self.counters.created.fetch_add(1, Ordering::SeqCst);
        let sandbox = Arc::new(MockSandbox {
            id: format!("mock-{}", n),
            behavior: self.behavior.clone(),
            run: run.clone(),
            counters: self.counters.clone(),
            held: Mutex::new(None),
            deleted: AtomicBool::new(false),
        });
        self.live.lock().push(sandbox.clone());
        if matches!(self.behavior, Behavior::HangCreate) {
            return std::future::pending().await;
        }
        Ok(sandbox)
    }

    async fn sweep_orphans(&self) -> Result<usize, SandboxError> {
        let live: Vec<_> = self.live.lock().clone();
        let mut swept = 0;
        for sandbox in live {
            if !sandbox.deleted.load(Ordering::SeqCst) {
                sandbox.delete().await?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

pub struct MockSandbox {
    id: String,
    behavior: Behavior,
    run: RunSpec,
    counters: Arc<Counters>,
    held: Mutex<Option<oneshot::Sender<()>>>,
    deleted: AtomicBool,
}

#[async_trait]
impl Sandbox for MockSandbox {
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
        match &self.behavior {
            Behavior::Respond(respond) => {
                let (out, err) = respond(&self.run, &stdin);
                tokio::spawn(async move {
                    if !out.is_empty() {
                        let _ = stdout.send(out).await;
                    }
                    if !err.is_empty() {
                        let _ = stderr.send(err).await;
                    }
                    let _ = done.send(());
                });
                Ok(())
            }
            Behavior::Hang => {
                *self.held.lock() = Some(done);
                Ok(())
            }
            Behavior::FailStart => Err(SandboxError::Start("exec format error".to_string())),
            Behavior::FailPrepare | Behavior::FailCreate | Behavior::HangCreate => {
                Err(SandboxError::Runtime("sandbox should not exist".to_string()))
            }
        }
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self) -> Result<(), SandboxError> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.deleted.store(true, Ordering::SeqCst);
        self.held.lock().take();
        Ok(())
    }
}
