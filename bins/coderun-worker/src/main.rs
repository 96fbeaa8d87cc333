mod capped_buffer;
mod judge;
mod output;
mod pool;
mod sandbox;
mod worker;

use anyhow::{Context, Result};
use coderun_common::config::{LogFormat, RunnerConfig};
use coderun_common::questions::QuestionStore;
use coderun_common::redis::{RedisQueue, RedisSubmissionStore};
use coderun_common::spec::SpecResolver;
use pool::WorkerPool;
use sandbox::docker::DockerProvider;
use sandbox::{SandboxManager, SandboxRegistry};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use worker::WorkerContext;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = RunnerConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_format, config.debug);

    info!("coderun worker booting...");

    let resolver = SpecResolver::load(&config.spec_path)?;
    for (key, err) in resolver.validate() {
        warn!(language = %key, error = %err, "Spec entry does not resolve");
    }
    info!(languages = ?resolver.keys(), "Loaded execution specs");

    let client = redis::Client::open(config.redis_url.as_str())?;
    let queue = RedisQueue::connect(client.clone())
        .await
        .context("Failed to connect job queue")?;
    let store = RedisSubmissionStore::connect(client)
        .await
        .context("Failed to connect submission store")?;
    info!(redis = %config.redis_url, "Connected to Redis");

    let provider = DockerProvider::connect(config.sandbox.clone())?;
    provider.ping().await?;
    info!(
        timeout_secs = config.sandbox.timeout.as_secs(),
        memory_bytes = config.sandbox.memory_bytes,
        cpus = config.sandbox.cpus,
        network_disabled = config.sandbox.network_disabled,
        "Connected to Docker"
    );

    let manager = SandboxManager::new(
        Arc::new(provider),
        Arc::new(resolver),
        Arc::new(SandboxRegistry::new()),
        config.host_root_dir.clone(),
        config.sandbox.timeout,
    );

    let ctx = Arc::new(WorkerContext {
        queue: Arc::new(queue),
        store: Arc::new(store),
        questions: Arc::new(QuestionStore::new(config.questions_dir.clone())),
        manager: Arc::new(manager),
        output_limit: config.sandbox.output_limit,
        dequeue_timeout: config.worker.dequeue_timeout,
    });

    let pool = WorkerPool::new(ctx, config.worker.min, config.worker.max);
    pool.start();
    let autoscaler = pool.spawn_autoscaler(config.worker.scale_interval);

    shutdown_signal().await;
    warn!("Received shutdown signal, draining workers...");

    pool.shutdown(config.shutdown_grace).await;
    if let Err(e) = autoscaler.await {
        error!(error = %e, "Autoscaler task failed");
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat, debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
