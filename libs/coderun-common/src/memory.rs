//! In-process queue and store. They share the semantics of the Redis
//! implementations and back the Docker-free tests of the worker and API.

use crate::queue::{JobQueue, QueueError};
use crate::store::{StoreError, SubmissionStore};
use crate::types::{Job, Submission, SubmissionStatus, Verdict};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
pub struct MemoryQueue {
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.queue.lock().await.push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return Ok(self.queue.lock().await.pop_front());
            }
        }
    }

    async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.queue.lock().await.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Submission>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn create_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&submission.id) {
            return Err(StoreError::AlreadyExists(submission.id.clone()));
        }
        records.insert(submission.id.clone(), submission.clone());
        Ok(())
    }

    async fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn set_status(&self, id: &str, status: SubmissionStatus) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let submission = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        submission.status = status;
        submission.updated_at = Utc::now();
        Ok(())
    }

    async fn update_result(&self, id: &str, verdict: &Verdict) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let submission = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        submission.apply(verdict);
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Submission>, StoreError> {
        let mut all: Vec<Submission> = self.records.lock().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }
}
