// HTTP route handlers for the coderun API

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use coderun_common::questions::QuestionError;
use coderun_common::types::{Job, Submission, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

/// Page size of the submission history endpoint.
const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub question_id: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    pub submission_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct SpecEntry {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judged_with_harness: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.queue.len().await {
        Ok(depth) => metrics::QUEUE_DEPTH.set(depth as i64),
        Err(e) => warn!(error = %e, "Failed to read queue depth for metrics"),
    }

    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /api/v1/spec - Configured languages, resolved through aliases
pub async fn list_specs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries: Vec<SpecEntry> = state
        .specs
        .entries()
        .iter()
        .map(|(key, raw)| match state.specs.resolve(key) {
            Ok(spec) => SpecEntry {
                key: key.clone(),
                alias_of: raw.alias_of.clone(),
                image: Some(spec.image),
                filename: Some(spec.filename),
                judged_with_harness: Some(spec.harness.is_some()),
                error: None,
            },
            Err(e) => SpecEntry {
                key: key.clone(),
                alias_of: raw.alias_of.clone(),
                image: None,
                filename: None,
                judged_with_harness: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    Json(entries)
}

/// GET /api/v1/questions
pub async fn list_questions(State(state): State<Arc<AppState>>) -> Response {
    match state.questions.list_questions() {
        Ok(questions) => Json(questions).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list questions");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/v1/questions/:id
pub async fn get_question(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.questions.get_question(&id) {
        Ok(question) => Json(question).into_response(),
        Err(e @ QuestionError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ QuestionError::InvalidId(_)) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            error!(question_id = %id, error = %e, "Failed to read question");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// POST /api/v1/exec - Create a PENDING submission and enqueue it
pub async fn submit(State(state): State<Arc<AppState>>, Json(payload): Json<ExecRequest>) -> Response {
    let spec = match state.specs.resolve(&payload.language) {
        Ok(spec) => spec,
        Err(e) => {
            metrics::SUBMISSIONS_REJECTED.with_label_values(&["language"]).inc();
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let question_id = payload.question_id.filter(|q| !q.trim().is_empty());
    if let Some(qid) = &question_id {
        if !state.questions.exists(qid) {
            metrics::SUBMISSIONS_REJECTED.with_label_values(&["question"]).inc();
            return error_response(StatusCode::NOT_FOUND, format!("question {} not found", qid));
        }
    }

    let mut submission = Submission::new(payload.language, payload.code, question_id);
    submission.stdin = payload.stdin;
    submission.arguments = payload.arguments;
    submission.environment = payload.environment;

    if let Err(e) = state.store.create_submission(&submission).await {
        error!(error = %e, "Failed to create submission");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    if let Err(e) = state.queue.enqueue(&Job::from_submission(&submission)).await {
        error!(submission_id = %submission.id, error = %e, "Failed to enqueue job");
        let verdict = Verdict::error(format!("Failed to enqueue submission: {}", e));
        if let Err(e) = state.store.update_result(&submission.id, &verdict).await {
            warn!(submission_id = %submission.id, error = %e, "Failed to record enqueue failure");
        }
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "job queue unavailable");
    }

    metrics::SUBMISSIONS_TOTAL.with_label_values(&[&spec.language]).inc();
    info!(
        submission_id = %submission.id,
        language = %submission.language,
        question_id = submission.question_id.as_deref().unwrap_or("-"),
        "Submission queued"
    );

    (
        StatusCode::CREATED,
        Json(ExecResponse {
            submission_id: submission.id,
            status: submission.status.to_string(),
        }),
    )
        .into_response()
}

/// GET /api/v1/submissions - Most recent submissions, newest first
pub async fn list_submissions(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_recent(HISTORY_LIMIT).await {
        Ok(submissions) => Json(submissions).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list submissions");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/v1/submissions/:id
pub async fn get_submission(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.get_submission(&id).await {
        Ok(Some(submission)) => Json(submission).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("submission {} not found", id)),
        Err(e) => {
            error!(submission_id = %id, error = %e, "Failed to fetch submission");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
