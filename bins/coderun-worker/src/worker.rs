use crate::judge::{self, CaseFailure};
use crate::output::{CapturedOutput, OutputCollector};
use crate::sandbox::{ExecutionRequest, SandboxError, SandboxManager};
use anyhow::{Context, Result};
use coderun_common::queue::JobQueue;
use coderun_common::questions::QuestionStore;
use coderun_common::spec::{HarnessKind, LanguageSpec};
use coderun_common::store::SubmissionStore;
use coderun_common::types::{Job, Submission, SubmissionStatus, TestCase, Verdict};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Delay after a queue error before the next dequeue attempt.
const QUEUE_BACKOFF: Duration = Duration::from_secs(1);

/// Everything a worker needs, shared by every worker in the pool.
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn SubmissionStore>,
    pub questions: Arc<QuestionStore>,
    pub manager: Arc<SandboxManager>,
    pub output_limit: usize,
    pub dequeue_timeout: Duration,
}

struct RunOutcome {
    result: Result<(), SandboxError>,
    output: CapturedOutput,
    elapsed_ms: u64,
}

pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    /// Consume jobs until `stop` is cancelled. The token is only checked at
    /// the loop head, so a job in flight always runs to completion.
    #[instrument(skip(self, stop), fields(worker_id = self.id))]
    pub async fn run(self, stop: CancellationToken) {
        info!("Worker started, waiting for jobs");

        loop {
            if stop.is_cancelled() {
                break;
            }

            match self.ctx.queue.dequeue(self.ctx.dequeue_timeout).await {
                Ok(Some(job)) => {
                    let submission_id = job.submission_id.clone();
                    if let Err(e) = self.process(job).await {
                        error!(submission_id = %submission_id, error = %e, "Failed to process job");
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Queue error");
                    tokio::select! {
                        _ = tokio::time::sleep(QUEUE_BACKOFF) => {}
                        _ = stop.cancelled() => {}
                    }
                }
            }
        }

        info!("Worker stopped");
    }

    pub(crate) async fn process(&self, job: Job) -> Result<()> {
        let id = job.submission_id.as_str();
        info!(
            submission_id = %id,
            language = %job.language,
            question_id = job.question_id.as_deref().unwrap_or("-"),
            "Processing job"
        );

        let Some(submission) = self
            .ctx
            .store
            .get_submission(id)
            .await
            .context("Failed to load submission")?
        else {
            warn!(submission_id = %id, "Submission record not found, dropping job");
            return Ok(());
        };

        if let Err(e) = self.ctx.store.set_status(id, SubmissionStatus::Processing).await {
            // Best effort so the record does not stay PENDING forever.
            let verdict = Verdict::error(format!("Failed to start processing: {}", e));
            if let Err(persist) = self.ctx.store.update_result(id, &verdict).await {
                warn!(submission_id = %id, error = %persist, "Failed to record processing error");
            }
            return Err(anyhow::Error::new(e).context("Failed to mark submission as processing"));
        }

        let verdict = self.judge(&job, &submission).await;

        self.ctx
            .store
            .update_result(id, &verdict)
            .await
            .context("Failed to persist verdict")?;

        info!(
            submission_id = %id,
            status = %verdict.status,
            passed = verdict.passed_count,
            total = verdict.total_count,
            exec_time_ms = verdict.exec_time_ms,
            "Job finished"
        );
        Ok(())
    }

    async fn judge(&self, job: &Job, submission: &Submission) -> Verdict {
        let Some(question_id) = job.question_id.clone() else {
            return self.run_playground(job, submission).await;
        };

        let questions = self.ctx.questions.clone();
        let cases = match tokio::task::spawn_blocking(move || questions.get_test_cases(&question_id)).await {
            Ok(Ok(cases)) => cases,
            Ok(Err(e)) => return Verdict::error(format!("Failed to load question: {}", e)),
            Err(e) => return Verdict::error(format!("Failed to load question: {}", e)),
        };

        let spec = match self.ctx.manager.resolver().resolve(&job.language) {
            Ok(spec) => spec,
            Err(e) => return Verdict::error(e.to_string()),
        };

        debug!(
            submission_id = %job.submission_id,
            cases = cases.len(),
            harness = ?spec.harness,
            "Judging submission"
        );

        match spec.harness {
            Some(kind) => self.run_harness(kind, &spec, job, submission, &cases).await,
            None => self.run_stdin_cases(job, submission, &cases).await,
        }
    }

    fn request(job: &Job, submission: &Submission) -> ExecutionRequest {
        ExecutionRequest {
            language: job.language.clone(),
            code: job.code.clone(),
            files: Vec::new(),
            command: None,
            arguments: submission.arguments.clone(),
            environment: submission.environment.clone(),
        }
    }

    async fn execute(&self, run_id: &str, request: &ExecutionRequest, stdin: Vec<u8>) -> RunOutcome {
        let limit = self.ctx.output_limit;
        let (collector, sinks) = OutputCollector::spawn(limit);
        let started = Instant::now();
        let result = self.ctx.manager.run_in_sandbox(run_id, request, stdin, sinks).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let output = collector.finish(limit).await;
        RunOutcome {
            result,
            output,
            elapsed_ms,
        }
    }

    async fn run_playground(&self, job: &Job, submission: &Submission) -> Verdict {
        let request = Self::request(job, submission);
        let stdin = submission.stdin.clone().unwrap_or_default().into_bytes();
        let outcome = self.execute(&job.submission_id, &request, stdin).await;

        let mut stderr = outcome.output.stderr.to_string_lossy();
        if outcome.output.truncated() {
            stderr.push_str("\n[output truncated at capture limit]");
        }

        let status = match &outcome.result {
            Ok(()) => SubmissionStatus::Success,
            Err(e) => {
                stderr = format!("{}\n{}", e, stderr).trim_end().to_string();
                failed_status(e)
            }
        };

        Verdict {
            status,
            stdout: outcome.output.stdout.to_string_lossy(),
            stderr,
            exec_time_ms: outcome.elapsed_ms,
            passed_count: 0,
            total_count: 0,
        }
    }

    async fn run_harness(
        &self,
        kind: HarnessKind,
        spec: &LanguageSpec,
        job: &Job,
        submission: &Submission,
        cases: &[TestCase],
    ) -> Verdict {
        let harness = match judge::build_harness(kind, spec, cases) {
            Ok(harness) => harness,
            Err(e) => return Verdict::error(format!("Failed to generate judge harness: {}", e)),
        };

        let mut request = Self::request(job, submission);
        request.files = harness.files;
        request.command = Some(harness.command);

        let outcome = self.execute(&job.submission_id, &request, Vec::new()).await;
        let mut verdict = match &outcome.result {
            Ok(()) => judge::interpret(
                &outcome.output.stdout.to_string_lossy(),
                cases,
                outcome.output.truncated(),
            ),
            Err(e) => run_failure(e, None, &outcome.output, 0, cases.len()),
        };
        verdict.exec_time_ms = outcome.elapsed_ms;
        verdict
    }

    /// One run per case with the input on stdin, stopping at the first
    /// failure.
    async fn run_stdin_cases(&self, job: &Job, submission: &Submission, cases: &[TestCase]) -> Verdict {
        let request = Self::request(job, submission);
        let mut exec_time_ms = 0;

        for (index, case) in cases.iter().enumerate() {
            let run_id = format!("{}-{}", job.submission_id, index + 1);
            let outcome = self.execute(&run_id, &request, case.input.clone().into_bytes()).await;
            exec_time_ms += outcome.elapsed_ms;

            let failure: Option<CaseFailure> = match &outcome.result {
                Ok(()) => judge::check_case(case, &outcome.output.stdout.to_string_lossy()),
                Err(e) => {
                    let mut verdict = run_failure(e, Some(&case.id), &outcome.output, index, cases.len());
                    verdict.exec_time_ms = exec_time_ms;
                    return verdict;
                }
            };

            if let Some(failure) = failure {
                let mut verdict = judge::failure_verdict(&failure, cases);
                verdict.exec_time_ms = exec_time_ms;
                return verdict;
            }
        }

        Verdict {
            status: SubmissionStatus::Success,
            stdout: "Success".to_string(),
            stderr: String::new(),
            exec_time_ms,
            passed_count: cases.len() as u32,
            total_count: cases.len() as u32,
        }
    }
}

fn failed_status(err: &SandboxError) -> SubmissionStatus {
    if err.is_timeout() {
        SubmissionStatus::Timeout
    } else {
        SubmissionStatus::Error
    }
}

/// TIMEOUT or ERROR verdict for a judged run that did not finish normally.
fn run_failure(
    err: &SandboxError,
    case_id: Option<&str>,
    output: &CapturedOutput,
    passed: usize,
    total: usize,
) -> Verdict {
    let prefix = match case_id {
        Some(id) => format!("Error on Test Case {}: {}", id, err),
        None => err.to_string(),
    };
    let stderr = format!("{}\n{}", prefix, output.stderr.to_string_lossy());
    Verdict {
        status: failed_status(err),
        stdout: "Runtime/Compilation Error".to_string(),
        stderr: stderr.trim_end().to_string(),
        exec_time_ms: 0,
        passed_count: passed as u32,
        total_count: total as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::{Behavior, MockProvider};
    use crate::sandbox::SandboxRegistry;
    use coderun_common::memory::{MemoryQueue, MemoryStore};
    use coderun_common::spec::SpecResolver;
    use coderun_common::store::StoreError;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _staging: TempDir,
        _questions: TempDir,
        ctx: Arc<WorkerContext>,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        provider: Arc<MockProvider>,
    }

    fn specs() -> Arc<SpecResolver> {
        let mut specs = BTreeMap::new();
        specs.insert(
            "python".to_string(),
            LanguageSpec {
                image: "python:3.12-alpine".to_string(),
                entrypoint: "python -u".to_string(),
                filename: "main.py".to_string(),
                harness: Some(HarnessKind::Python),
                ..Default::default()
            },
        );
        specs.insert(
            "c".to_string(),
            LanguageSpec {
                image: "gcc:13".to_string(),
                entrypoint: "sh -c".to_string(),
                filename: "main.c".to_string(),
                cmd: "\"gcc {file} -o main && ./main\"".to_string(),
                ..Default::default()
            },
        );
        Arc::new(SpecResolver::new(specs))
    }

    fn fixture(behavior: Behavior, timeout: Duration) -> Fixture {
        let staging = tempfile::tempdir().unwrap();
        let questions = tempfile::tempdir().unwrap();

        let q = questions.path().join("7");
        fs::create_dir_all(&q).unwrap();
        let cases: Vec<TestCase> = (1..=5)
            .map(|i| TestCase {
                id: i.to_string(),
                input: i.to_string(),
                expected_output: (i * 2).to_string(),
            })
            .collect();
        fs::write(q.join("tests.json"), serde_json::to_string(&cases).unwrap()).unwrap();

        let provider = MockProvider::new(behavior);
        let manager = SandboxManager::new(
            provider.clone(),
            specs(),
            Arc::new(SandboxRegistry::new()),
            staging.path(),
            timeout,
        );
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            store: store.clone(),
            questions: Arc::new(QuestionStore::new(questions.path())),
            manager: Arc::new(manager),
            output_limit: 1024,
            dequeue_timeout: Duration::from_millis(50),
        });

        Fixture {
            _staging: staging,
            _questions: questions,
            ctx,
            store,
            queue,
            provider,
        }
    }

    async fn submit(fx: &Fixture, language: &str, code: &str, question: Option<&str>, stdin: Option<&str>) -> Job {
        let mut submission = Submission::new(language, code, question.map(str::to_string));
        submission.stdin = stdin.map(str::to_string);
        fx.store.create_submission(&submission).await.unwrap();
        Job::from_submission(&submission)
    }

    async fn verdict_of(fx: &Fixture, id: &str) -> Submission {
        fx.store.get_submission(id).await.unwrap().unwrap()
    }

    /// Accepts writes but refuses the PROCESSING transition.
    struct StatusRefusingStore(MemoryStore);

    #[async_trait::async_trait]
    impl SubmissionStore for StatusRefusingStore {
        async fn create_submission(&self, submission: &Submission) -> Result<(), StoreError> {
            self.0.create_submission(submission).await
        }

        async fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
            self.0.get_submission(id).await
        }

        async fn set_status(&self, _id: &str, _status: SubmissionStatus) -> Result<(), StoreError> {
            Err(StoreError::Backend(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection reset",
            ))))
        }

        async fn update_result(&self, id: &str, verdict: &Verdict) -> Result<(), StoreError> {
            self.0.update_result(id, verdict).await
        }

        async fn list_recent(&self, limit: usize) -> Result<Vec<Submission>, StoreError> {
            self.0.list_recent(limit).await
        }
    }

    #[tokio::test]
    async fn test_failed_status_transition_records_error() {
        let fx = fixture(Behavior::output("2", ""), Duration::from_secs(5));
        let store = Arc::new(StatusRefusingStore(MemoryStore::new()));
        let ctx = Arc::new(WorkerContext {
            queue: fx.queue.clone(),
            store: store.clone(),
            questions: fx.ctx.questions.clone(),
            manager: fx.ctx.manager.clone(),
            output_limit: 1024,
            dequeue_timeout: Duration::from_millis(50),
        });

        let submission = Submission::new("python", "print(2)", None);
        store.create_submission(&submission).await.unwrap();
        let result = Worker::new(0, ctx).process(Job::from_submission(&submission)).await;
        assert!(result.is_err());

        let sub = store.get_submission(&submission.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubmissionStatus::Error);
        assert!(sub.stderr.contains("Failed to start processing"));
        assert_eq!(fx.provider.counters.created(), 0);
    }

    #[tokio::test]
    async fn test_playground_echoes_output() {
        let fx = fixture(
            Behavior::respond(|_, stdin| (stdin.to_vec(), b"warn".to_vec())),
            Duration::from_secs(5),
        );
        let job = submit(&fx, "python", "print(input())", None, Some("hello")).await;

        Worker::new(0, fx.ctx.clone()).process(job.clone()).await.unwrap();

        let sub = verdict_of(&fx, &job.submission_id).await;
        assert_eq!(sub.status, SubmissionStatus::Success);
        assert_eq!(sub.stdout, "hello");
        assert_eq!(sub.stderr, "warn");
        assert_eq!(sub.total_count, 0);
    }

    #[tokio::test]
    async fn test_harness_all_pass() {
        let fx = fixture(
            Behavior::respond(|run, _| {
                assert_eq!(run.command, "__judge__.py");
                let dir = run.assembled_host_dir();
                assert!(dir.join("__judge__.py").is_file());
                assert!(dir.join("main.py").is_file());
                let staged: Vec<TestCase> =
                    serde_json::from_str(&fs::read_to_string(dir.join("tests.json")).unwrap()).unwrap();
                assert_eq!(staged.len(), 5);
                (b"[]\n".to_vec(), Vec::new())
            }),
            Duration::from_secs(5),
        );
        let job = submit(&fx, "python", "def solve(x): return x * 2", Some("7"), None).await;

        Worker::new(0, fx.ctx.clone()).process(job.clone()).await.unwrap();

        let sub = verdict_of(&fx, &job.submission_id).await;
        assert_eq!(sub.status, SubmissionStatus::Success);
        assert_eq!(sub.stdout, "Success");
        assert_eq!(sub.passed_count, 5);
        assert_eq!(sub.total_count, 5);
    }

    #[tokio::test]
    async fn test_harness_failure_on_case_three() {
        let fx = fixture(
            Behavior::output(r#"[{"id": "3", "expected": "6", "actual": "5"}]"#, ""),
            Duration::from_secs(5),
        );
        let job = submit(&fx, "python", "def solve(x): return x", Some("7"), None).await;

        Worker::new(0, fx.ctx.clone()).process(job.clone()).await.unwrap();

        let sub = verdict_of(&fx, &job.submission_id).await;
        assert_eq!(sub.status, SubmissionStatus::Failure);
        assert_eq!(sub.passed_count, 2);
        assert_eq!(sub.total_count, 5);
        assert_eq!(sub.stdout, "Failed Test case 3");
        assert!(sub.stderr.contains("Failed Case 3"));
    }

    #[tokio::test]
    async fn test_stdin_mode_stops_at_first_failure() {
        let fx = fixture(
            Behavior::respond(|_, stdin| {
                let n: i64 = String::from_utf8_lossy(stdin).trim().parse().unwrap();
                let out = if n == 3 { 0 } else { n * 2 };
                (format!("{}\n", out).into_bytes(), Vec::new())
            }),
            Duration::from_secs(5),
        );
        let job = submit(&fx, "c", "int main() {}", Some("7"), None).await;

        Worker::new(0, fx.ctx.clone()).process(job.clone()).await.unwrap();

        let sub = verdict_of(&fx, &job.submission_id).await;
        assert_eq!(sub.status, SubmissionStatus::Failure);
        assert_eq!(sub.passed_count, 2);
        assert!(sub.stderr.contains("Expected:\n6\n\nGot:\n0"));
        assert_eq!(fx.provider.runs.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_timeout_verdict() {
        let fx = fixture(Behavior::Hang, Duration::from_millis(100));
        let job = submit(&fx, "python", "while True: pass", None, None).await;

        Worker::new(0, fx.ctx.clone()).process(job.clone()).await.unwrap();

        let sub = verdict_of(&fx, &job.submission_id).await;
        assert_eq!(sub.status, SubmissionStatus::Timeout);
        assert!(sub.stderr.contains("timed out"));
        assert!(sub.exec_time_ms >= 100);
    }

    #[tokio::test]
    async fn test_configuration_errors_are_error_verdicts() {
        let fx = fixture(Behavior::output("[]", ""), Duration::from_secs(5));

        let unknown_question = submit(&fx, "python", "", Some("404"), None).await;
        let unknown_language = submit(&fx, "cobol", "", None, None).await;
        let worker = Worker::new(0, fx.ctx.clone());
        worker.process(unknown_question.clone()).await.unwrap();
        worker.process(unknown_language.clone()).await.unwrap();

        let sub = verdict_of(&fx, &unknown_question.submission_id).await;
        assert_eq!(sub.status, SubmissionStatus::Error);
        assert!(sub.stderr.starts_with("Failed to load question"));

        let sub = verdict_of(&fx, &unknown_language.submission_id).await;
        assert_eq!(sub.status, SubmissionStatus::Error);
        assert!(sub.stderr.contains("unsupported language"));
        assert_eq!(fx.provider.counters.created(), 0);
    }

    #[tokio::test]
    async fn test_missing_submission_is_skipped() {
        let fx = fixture(Behavior::output("", ""), Duration::from_secs(5));
        let job = Job {
            submission_id: "ghost".to_string(),
            language: "python".to_string(),
            code: String::new(),
            question_id: None,
        };
        Worker::new(0, fx.ctx.clone()).process(job).await.unwrap();
        assert_eq!(fx.provider.counters.created(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_processes_queue_until_stopped() {
        let fx = fixture(Behavior::output("ok", ""), Duration::from_secs(5));
        let job = submit(&fx, "python", "print('ok')", None, None).await;
        fx.queue.enqueue(&job).await.unwrap();

        let stop = CancellationToken::new();
        let handle = tokio::spawn(Worker::new(1, fx.ctx.clone()).run(stop.clone()));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let sub = verdict_of(&fx, &job.submission_id).await;
            if sub.status.is_final() || Instant::now() > deadline {
                assert_eq!(sub.status, SubmissionStatus::Success);
                assert_eq!(sub.stdout, "ok");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
