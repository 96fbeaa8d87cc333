use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Queue payload. One JSON value per queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub submission_id: String,
    pub language: String,
    pub code: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub question_id: Option<String>,
}

impl Job {
    pub fn from_submission(submission: &Submission) -> Self {
        Self {
            submission_id: submission.id.clone(),
            language: submission.language.clone(),
            code: submission.code.clone(),
            question_id: submission.question_id.clone(),
        }
    }
}

/// Producers written against the original wire format send `""` for "no question".
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Processing,
    Success,
    Failure,
    Timeout,
    Error,
}

impl SubmissionStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending | SubmissionStatus::Processing)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Processing => "PROCESSING",
            SubmissionStatus::Success => "SUCCESS",
            SubmissionStatus::Failure => "FAILURE",
            SubmissionStatus::Timeout => "TIMEOUT",
            SubmissionStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub input: String,
    #[serde(alias = "expected")]
    pub expected_output: String,
}

/// Final outcome of one submission, written once as an update of the
/// pre-existing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exec_time_ms: u64,
    pub passed_count: u32,
    pub total_count: u32,
}

impl Verdict {
    /// Verdict for failures that happen before or instead of a run.
    pub fn error(stderr: impl Into<String>) -> Self {
        Self {
            status: SubmissionStatus::Error,
            stdout: String::new(),
            stderr: stderr.into(),
            exec_time_ms: 0,
            passed_count: 0,
            total_count: 0,
        }
    }
}

/// Persisted submission record, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub question_id: Option<String>,
    pub status: SubmissionStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exec_time_ms: u64,
    #[serde(default)]
    pub passed_count: u32,
    #[serde(default)]
    pub total_count: u32,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    /// New PENDING record with a fresh id.
    pub fn new(language: impl Into<String>, code: impl Into<String>, question_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            language: language.into(),
            code: code.into(),
            question_id: question_id.filter(|q| !q.trim().is_empty()),
            status: SubmissionStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            exec_time_ms: 0,
            passed_count: 0,
            total_count: 0,
            stdin: None,
            arguments: Vec::new(),
            environment: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, verdict: &Verdict) {
        self.status = verdict.status;
        self.stdout = verdict.stdout.clone();
        self.stderr = verdict.stderr.clone();
        self.exec_time_ms = verdict.exec_time_ms;
        self.passed_count = verdict.passed_count;
        self.total_count = verdict.total_count;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionMeta {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub description: String,
}
