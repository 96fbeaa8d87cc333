//! Judging protocol: harness generation and verdict interpretation.
//!
//! Languages with a harness run every test case inside one sandbox; the
//! harness prints a single JSON line, `[]` when every case passed or a
//! one-element list naming the first failing case. Languages without a
//! harness are judged case by case over stdin (see `check_case`).
use crate::sandbox::StagedFile;
use coderun_common::questions::TESTS_FILE;
use coderun_common::spec::{HarnessKind, LanguageSpec};
use coderun_common::types::{SubmissionStatus, TestCase, Verdict};
use serde::{Deserialize, Serialize};

const PYTHON_TEMPLATE: &str = include_str!("../harness/judge.py");
const JAVASCRIPT_TEMPLATE: &str = include_str!("../harness/judge.js");

/// Function the submitted solution must define.
pub const ENTRY_FUNCTION: &str = "solve";

const CAPTURE_HINT: &str = "output may have exceeded the capture limit";

/// One entry of the harness result list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFailure {
    pub id: String,
    pub expected: String,
    pub actual: String,
}

/// Files and command that turn a plain run into a judged run.
#[derive(Debug, Clone)]
pub struct Harness {
    pub files: Vec<StagedFile>,
    pub command: String,
}

fn harness_file_name(kind: HarnessKind) -> &'static str {
    match kind {
        HarnessKind::Python => "__judge__.py",
        HarnessKind::Javascript => "__judge__.js",
    }
}

/// Render the harness for `spec` and serialize `cases` next to it.
pub fn build_harness(kind: HarnessKind, spec: &LanguageSpec, cases: &[TestCase]) -> serde_json::Result<Harness> {
    let template = match kind {
        HarnessKind::Python => PYTHON_TEMPLATE,
        HarnessKind::Javascript => JAVASCRIPT_TEMPLATE,
    };

    // JSON string literals are valid literals in both target languages.
    let source = template
        .replace("{{SOLUTION_FILE}}", &serde_json::to_string(&spec.filename)?)
        .replace("{{TESTS_FILE}}", &serde_json::to_string(TESTS_FILE)?)
        .replace("{{ENTRY}}", &serde_json::to_string(ENTRY_FUNCTION)?);

    let name = harness_file_name(kind);
    Ok(Harness {
        files: vec![
            StagedFile::new(name, source),
            StagedFile::new(TESTS_FILE, serde_json::to_string(cases)?),
        ],
        command: name.to_string(),
    })
}

/// Turn harness stdout into a verdict. `exec_time_ms` is left at zero for
/// the caller to fill in.
pub fn interpret(stdout: &str, cases: &[TestCase], truncated: bool) -> Verdict {
    let total = cases.len() as u32;
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");

    match serde_json::from_str::<Vec<CaseFailure>>(line.trim()) {
        Ok(failures) => match failures.into_iter().next() {
            None => Verdict {
                status: SubmissionStatus::Success,
                stdout: "Success".to_string(),
                stderr: String::new(),
                exec_time_ms: 0,
                passed_count: total,
                total_count: total,
            },
            Some(failure) => failure_verdict(&failure, cases),
        },
        Err(e) => {
            let mut stderr = format!("Judge output could not be parsed ({}); {}.", e, CAPTURE_HINT);
            if truncated {
                stderr.push_str(" Captured output was truncated.");
            }
            Verdict {
                status: SubmissionStatus::Error,
                stdout: String::new(),
                stderr,
                exec_time_ms: 0,
                passed_count: 0,
                total_count: total,
            }
        }
    }
}

/// FAILURE verdict for the first failing case. Every case before it in
/// execution order counts as passed.
pub fn failure_verdict(failure: &CaseFailure, cases: &[TestCase]) -> Verdict {
    let position = cases.iter().position(|c| c.id == failure.id);
    let passed = match position {
        Some(index) => index,
        None => failure
            .id
            .trim()
            .parse::<usize>()
            .map(|k| k.saturating_sub(1))
            .unwrap_or(0)
            .min(cases.len()),
    };
    let input = position.map(|i| cases[i].input.as_str()).unwrap_or("");

    Verdict {
        status: SubmissionStatus::Failure,
        stdout: format!("Failed Test case {}", failure.id),
        stderr: format!(
            "Failed Case {}:\nInput:\n{}\n\nExpected:\n{}\n\nGot:\n{}",
            failure.id,
            input.trim(),
            failure.expected,
            failure.actual
        ),
        exec_time_ms: 0,
        passed_count: passed as u32,
        total_count: cases.len() as u32,
    }
}

fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Stdin-mode comparison for one case.
pub fn check_case(case: &TestCase, stdout: &str) -> Option<CaseFailure> {
    let actual = normalize_output(stdout);
    let expected = normalize_output(&case.expected_output);
    if actual == expected {
        None
    } else {
        Some(CaseFailure {
            id: case.id.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}
