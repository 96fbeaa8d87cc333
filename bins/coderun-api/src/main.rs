mod handlers;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use axum::Router;
use coderun_common::config::{LogFormat, RunnerConfig};
use coderun_common::queue::JobQueue;
use coderun_common::questions::QuestionStore;
use coderun_common::redis::{RedisQueue, RedisSubmissionStore};
use coderun_common::spec::SpecResolver;
use coderun_common::store::SubmissionStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub struct AppState {
    pub store: Arc<dyn SubmissionStore>,
    pub queue: Arc<dyn JobQueue>,
    pub specs: Arc<SpecResolver>,
    pub questions: Arc<QuestionStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = RunnerConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_format, config.debug);

    info!("coderun API booting...");

    let specs = SpecResolver::load(&config.spec_path)?;
    for (key, err) in specs.validate() {
        warn!(language = %key, error = %err, "Spec entry does not resolve");
    }

    let client = redis::Client::open(config.redis_url.as_str())?;
    let queue = RedisQueue::connect(client.clone())
        .await
        .context("Failed to connect job queue")?;
    let store = RedisSubmissionStore::connect(client)
        .await
        .context("Failed to connect submission store")?;
    info!(redis = %config.redis_url, "Connected to Redis");

    let state = Arc::new(AppState {
        store: Arc::new(store),
        queue: Arc::new(queue),
        specs: Arc::new(specs),
        questions: Arc::new(QuestionStore::new(config.questions_dir.clone())),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;
    info!(address = %config.bind_address, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("API shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat, debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

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
    warn!("Received shutdown signal, draining connections...");
}
