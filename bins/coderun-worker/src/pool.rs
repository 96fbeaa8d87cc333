use crate::worker::{Worker, WorkerContext};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Linear control law: one extra worker per two queued jobs, clamped to
/// `[min, max]`.
pub fn desired_workers(min: usize, max: usize, queue_depth: u64) -> usize {
    let extra = usize::try_from(queue_depth / 2).unwrap_or(usize::MAX);
    min.saturating_add(extra).min(max).max(min)
}

struct WorkerHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Dynamic set of workers sized by queue depth.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    min: usize,
    max: usize,
    workers: Mutex<BTreeMap<usize, WorkerHandle>>,
    /// Stopped workers finishing their last job.
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(ctx: Arc<WorkerContext>, min: usize, max: usize) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            min,
            max: max.max(min),
            workers: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bring the pool up to its minimum size.
    pub fn start(&self) {
        self.scale_to(self.min);
        info!(workers = self.size(), min = self.min, max = self.max, "Worker pool started");
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Grow or shrink toward `desired`, clamped to `[min, max]`. Returns the
    /// resulting size. Stopped workers finish any job in flight.
    pub fn scale_to(&self, desired: usize) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        let desired = desired.min(self.max).max(self.min);
        let mut workers = self.workers.lock();
        let current = workers.len();

        if desired > current {
            for _ in 0..desired - current {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let stop = self.shutdown.child_token();
                let task = tokio::spawn(Worker::new(id, self.ctx.clone()).run(stop.clone()));
                workers.insert(id, WorkerHandle { stop, task });
            }
            info!(from = current, to = desired, "Scaled workers up");
        } else if desired < current && current > self.min {
            let mut retired = self.retired.lock();
            retired.retain(|task| !task.is_finished());
            for _ in 0..current - desired {
                if let Some((id, handle)) = workers.pop_last() {
                    debug!(worker_id = id, "Stopping worker");
                    handle.stop.cancel();
                    retired.push(handle.task);
                }
            }
            info!(from = current, to = desired, "Scaled workers down");
        }

        workers.len()
    }

    /// One autoscaler step: read the queue depth and rescale.
    pub async fn autoscale_once(&self) -> Result<usize> {
        let depth = self.ctx.queue.len().await.context("Failed to read queue depth")?;
        let desired = desired_workers(self.min, self.max, depth);
        debug!(queue_depth = depth, desired, current = self.size(), "Autoscaler tick");
        Ok(self.scale_to(desired))
    }

    /// Run the autoscaler every `interval` until shutdown.
    pub fn spawn_autoscaler(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.autoscale_once().await {
                            warn!(error = %e, "Autoscaler tick failed");
                        }
                    }
                }
            }
            debug!("Autoscaler stopped");
        })
    }

    /// Stop every worker, wait up to `grace` for in-flight jobs, then reap
    /// any sandbox still registered or still owned by the provider.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();

        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock())
            .into_values()
            .map(|handle| handle.task)
            .collect();
        tasks.extend(std::mem::take(&mut *self.retired.lock()));

        info!(workers = tasks.len(), grace_secs = grace.as_secs(), "Shutting down worker pool");
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let drained = tokio::time::timeout(grace, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("Grace period elapsed with jobs still running, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        let reaped = self.ctx.manager.reap_all().await;
        info!(reaped, "Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::{Behavior, MockProvider};
    use crate::sandbox::{SandboxManager, SandboxRegistry};
    use async_trait::async_trait;
    use coderun_common::memory::MemoryStore;
    use coderun_common::queue::{JobQueue, QueueError};
    use coderun_common::questions::QuestionStore;
    use coderun_common::spec::SpecResolver;
    use coderun_common::types::Job;
    use std::sync::atomic::AtomicU64;

    /// Reports a settable depth and never hands out jobs.
    #[derive(Default)]
    struct DepthQueue {
        depth: AtomicU64,
    }

    #[async_trait]
    impl JobQueue for DepthQueue {
        async fn enqueue(&self, _job: &Job) -> Result<(), QueueError> {
            self.depth.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
            tokio::time::sleep(timeout).await;
            Ok(None)
        }

        async fn len(&self) -> Result<u64, QueueError> {
            Ok(self.depth.load(Ordering::SeqCst))
        }
    }

    fn pool(queue: Arc<DepthQueue>, min: usize, max: usize) -> (Arc<WorkerPool>, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(
            MockProvider::new(Behavior::output("", "")),
            Arc::new(SpecResolver::default()),
            Arc::new(SandboxRegistry::new()),
            root.path(),
            Duration::from_secs(1),
        );
        let ctx = Arc::new(WorkerContext {
            queue,
            store: Arc::new(MemoryStore::new()),
            questions: Arc::new(QuestionStore::new(root.path())),
            manager: Arc::new(manager),
            output_limit: 1024,
            dequeue_timeout: Duration::from_millis(20),
        });
        (WorkerPool::new(ctx, min, max), root)
    }

    #[test]
    fn test_desired_workers_is_always_within_bounds() {
        for (min, max) in [(0, 1), (1, 1), (2, 10), (3, 5)] {
            for depth in 0..200u64 {
                let desired = desired_workers(min, max, depth);
                assert!(min <= desired && desired <= max, "min={} max={} depth={}", min, max, depth);
            }
        }
        assert_eq!(desired_workers(2, 10, 0), 2);
        assert_eq!(desired_workers(2, 10, 1), 2);
        assert_eq!(desired_workers(2, 10, 5), 4);
        assert_eq!(desired_workers(2, 10, 100), 10);
        assert_eq!(desired_workers(2, 10, u64::MAX), 10);
    }

    #[tokio::test]
    async fn test_scale_never_leaves_bounds() {
        let (pool, _root) = pool(Arc::new(DepthQueue::default()), 2, 4);
        pool.start();
        assert_eq!(pool.size(), 2);

        assert_eq!(pool.scale_to(3), 3);
        assert_eq!(pool.scale_to(100), 4);
        assert_eq!(pool.scale_to(0), 2);
        assert_eq!(pool.size(), 2);

        pool.shutdown(Duration::from_secs(2)).await;
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.scale_to(3), 0);
    }

    #[tokio::test]
    async fn test_autoscale_follows_queue_depth() {
        let queue = Arc::new(DepthQueue::default());
        let (pool, _root) = pool(queue.clone(), 1, 5);
        pool.start();

        queue.depth.store(4, Ordering::SeqCst);
        assert_eq!(pool.autoscale_once().await.unwrap(), 3);

        queue.depth.store(50, Ordering::SeqCst);
        assert_eq!(pool.autoscale_once().await.unwrap(), 5);

        queue.depth.store(0, Ordering::SeqCst);
        assert_eq!(pool.autoscale_once().await.unwrap(), 1);

        pool.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_autoscaler_task_stops_on_shutdown() {
        let queue = Arc::new(DepthQueue::default());
        queue.depth.store(6, Ordering::SeqCst);
        let (pool, _root) = pool(queue, 1, 8);
        pool.start();

        let autoscaler = pool.spawn_autoscaler(Duration::from_millis(20));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.size() != 4 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.size(), 4);

        pool.shutdown(Duration::from_secs(2)).await;
        tokio::time::timeout(Duration::from_secs(2), autoscaler)
            .await
            .expect("autoscaler did not stop")
            .unwrap();
    }
}
