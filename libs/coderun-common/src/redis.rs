use crate::queue::{JobQueue, QueueError};
use crate::store::{StoreError, SubmissionStore};
use crate::types::{Job, Submission, SubmissionStatus, Verdict};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use std::time::Duration;

/// Redis key semantics shared by the API, the CLI and the worker so that
/// producers and consumers never drift.

pub const QUEUE_KEY: &str = "coderun:queue";
pub const SUBMISSION_PREFIX: &str = "coderun:submission";
pub const RECENT_KEY: &str = "coderun:submissions";

/// How many ids the recent-submissions list keeps.
pub const RECENT_LIMIT: isize = 100;

/// Generate the record key for a submission
pub fn submission_key(id: &str) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

/// Redis list backed job queue.
///
/// Pushes use RPUSH and pops use BLPOP, which gives FIFO order for a single
/// consumer. BLPOP parks the connection it runs on, so every blocking pop
/// borrows a dedicated connection from a small idle pool instead of the shared
/// multiplexed manager.
pub struct RedisQueue {
    client: redis::Client,
    conn: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    key: String,
}

impl RedisQueue {
    pub async fn connect(client: redis::Client) -> redis::RedisResult<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            key: QUEUE_KEY.to_string(),
        })
    }

    async fn blocking_conn(&self) -> redis::RedisResult<MultiplexedConnection> {
        let idle = self.blocking.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self.client.get_multiplexed_async_connection().await,
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&self.key, payload).await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let mut conn = self.blocking_conn().await?;
        // A zero timeout would block forever in Redis.
        let seconds = timeout.as_secs_f64().max(0.01);
        let result: Option<(String, String)> = conn.blpop(&self.key, seconds).await?;
        // Connections that errored are dropped rather than returned to the pool.
        self.blocking.lock().push(conn);

        match result {
            Some((_key, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn len(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.key).await?)
    }
}

/// Submission records stored as JSON strings, one key per submission.
#[derive(Clone)]
pub struct RedisSubmissionStore {
    conn: ConnectionManager,
}

impl RedisSubmissionStore {
    pub async fn connect(client: redis::Client) -> redis::RedisResult<Self> {
        Ok(Self {
            conn: ConnectionManager::new(client).await?,
        })
    }

    async fn load(&self, id: &str) -> Result<Submission, StoreError> {
        self.get_submission(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(&self, submission: &Submission) -> Result<(), StoreError> {
        let payload = serde_json::to_string(submission)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(submission_key(&submission.id), payload).await?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for RedisSubmissionStore {
    async fn create_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let payload = serde_json::to_string(submission)?;
        let mut conn = self.conn.clone();
        let created: bool = conn.set_nx(submission_key(&submission.id), payload).await?;
        if !created {
            return Err(StoreError::AlreadyExists(submission.id.clone()));
        }
        let _: () = conn.lpush(RECENT_KEY, &submission.id).await?;
        let _: () = conn.ltrim(RECENT_KEY, 0, RECENT_LIMIT - 1).await?;
        Ok(())
    }

    async fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(submission_key(id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn set_status(&self, id: &str, status: SubmissionStatus) -> Result<(), StoreError> {
        let mut submission = self.load(id).await?;
        submission.status = status;
        submission.updated_at = Utc::now();
        self.save(&submission).await
    }

    async fn update_result(&self, id: &str, verdict: &Verdict) -> Result<(), StoreError> {
        let mut submission = self.load(id).await?;
        submission.apply(verdict);
        self.save(&submission).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Submission>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(RECENT_KEY, 0, limit as isize - 1).await?;
        let mut submissions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(submission) = self.get_submission(&id).await? {
                submissions.push(submission);
            }
        }
        Ok(submissions)
    }
}
