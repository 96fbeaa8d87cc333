use crate::types::Job;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Durable FIFO between the submission boundary and the worker pool.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Blocks until a job is ready or `timeout` elapses. `Ok(None)` means
    /// nothing arrived in time and is not a failure.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    async fn len(&self) -> Result<u64, QueueError>;
}
