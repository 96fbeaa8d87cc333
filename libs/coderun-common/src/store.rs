use crate::types::{Submission, SubmissionStatus, Verdict};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("submission {0} not found")]
    NotFound(String),
    #[error("submission {0} already exists")]
    AlreadyExists(String),
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("malformed submission record: {0}")]
    Record(#[from] serde_json::Error),
}

/// Key-value persistence of submission records, keyed by submission id.
/// Updates are last-write-wins.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn create_submission(&self, submission: &Submission) -> Result<(), StoreError>;

    async fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError>;

    /// Status-only transition, e.g. PENDING -> PROCESSING.
    async fn set_status(&self, id: &str, status: SubmissionStatus) -> Result<(), StoreError>;

    async fn update_result(&self, id: &str, verdict: &Verdict) -> Result<(), StoreError>;

    /// Most recent submissions first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Submission>, StoreError>;
}
