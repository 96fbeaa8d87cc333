// Operator commands for coderun
use anyhow::{bail, Context, Result};
use coderun_common::queue::JobQueue;
use coderun_common::questions::QuestionStore;
use coderun_common::spec::SpecResolver;
use coderun_common::store::SubmissionStore;
use coderun_common::types::{Job, Submission};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

/// How often `--wait` polls the submission record.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Print every spec key with its resolution. Fails if any entry is broken.
pub fn list_specs(specs: &SpecResolver) -> Result<()> {
    let mut broken = 0;

    for (key, raw) in specs.entries() {
        match specs.resolve(key) {
            Ok(spec) => {
                let via = raw
                    .alias_of
                    .as_deref()
                    .map(|target| format!(" (alias of {})", target))
                    .unwrap_or_default();
                let judged = if spec.harness.is_some() { "harness" } else { "stdin" };
                println!("  {:<14} {:<28} {:<12} {}{}", key, spec.image, spec.filename, judged, via);
            }
            Err(e) => {
                broken += 1;
                println!("  {:<14} BROKEN: {}", key, e);
            }
        }
    }

    if broken > 0 {
        bail!("{} spec entr{} failed to resolve", broken, if broken == 1 { "y" } else { "ies" });
    }
    println!("\n{} specs resolve cleanly", specs.entries().len());
    Ok(())
}

pub fn list_questions(questions: &QuestionStore) -> Result<()> {
    let listed = questions.list_questions().context("Failed to list questions")?;
    if listed.is_empty() {
        println!("No questions found");
        return Ok(());
    }
    for meta in listed {
        let cases = questions
            .get_test_cases(&meta.id)
            .map(|cases| cases.len().to_string())
            .unwrap_or_else(|e| format!("unreadable ({})", e));
        println!("  {:<8} {:<20} cases: {}", meta.id, meta.title, cases);
    }
    Ok(())
}

/// What `submit` needs besides the backends.
#[derive(Debug)]
pub struct SubmitArgs<'a> {
    pub language: &'a str,
    pub file: &'a Path,
    pub question: Option<&'a str>,
    pub stdin: Option<&'a Path>,
    pub arguments: Vec<String>,
}

/// Validate, persist and enqueue a submission read from disk. Returns the
/// new submission id.
pub async fn submit(
    specs: &SpecResolver,
    questions: &QuestionStore,
    store: &dyn SubmissionStore,
    queue: &dyn JobQueue,
    args: SubmitArgs<'_>,
) -> Result<String> {
    specs.resolve(args.language)?;
    if let Some(qid) = args.question {
        if !questions.exists(qid) {
            bail!("question {} not found", qid);
        }
    }

    let code = fs::read_to_string(args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let mut submission = Submission::new(args.language, code, args.question.map(str::to_string));
    if let Some(path) = args.stdin {
        let input = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        submission.stdin = Some(input);
    }
    submission.arguments = args.arguments;

    store
        .create_submission(&submission)
        .await
        .context("Failed to create submission")?;
    queue
        .enqueue(&Job::from_submission(&submission))
        .await
        .context("Failed to enqueue submission")?;

    Ok(submission.id)
}

/// Poll until the submission reaches a final status or `timeout` passes.
pub async fn wait_for(store: &dyn SubmissionStore, id: &str, timeout: Duration) -> Result<Submission> {
    let deadline = Instant::now() + timeout;
    loop {
        let submission = fetch(store, id).await?;
        if submission.status.is_final() {
            return Ok(submission);
        }
        if Instant::now() >= deadline {
            bail!("submission {} still {} after {}s", id, submission.status, timeout.as_secs());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub async fn fetch(store: &dyn SubmissionStore, id: &str) -> Result<Submission> {
    store
        .get_submission(id)
        .await
        .context("Failed to read submission")?
        .with_context(|| format!("submission {} not found", id))
}

pub fn print_submission(submission: &Submission) {
    println!("Submission: {}", submission.id);
    println!("Language:   {}", submission.language);
    if let Some(qid) = &submission.question_id {
        println!("Question:   {}", qid);
    }
    println!("Status:     {}", submission.status);
    if submission.status.is_final() {
        if submission.total_count > 0 {
            println!("Passed:     {}/{}", submission.passed_count, submission.total_count);
        }
        println!("Time:       {} ms", submission.exec_time_ms);
        if !submission.stdout.is_empty() {
            println!("\n--- stdout ---\n{}", submission.stdout);
        }
        if !submission.stderr.is_empty() {
            println!("\n--- stderr ---\n{}", submission.stderr);
        }
    }
}

pub async fn queue_depth(queue: &dyn JobQueue) -> Result<u64> {
    queue.len().await.context("Failed to read queue depth")
}
