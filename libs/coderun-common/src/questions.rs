use crate::types::{Question, QuestionMeta, TestCase};
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TESTS_FILE: &str = "tests.json";

#[derive(Error, Debug)]
pub enum QuestionError {
    #[error("question {0} not found")]
    NotFound(String),
    #[error("invalid question id: {0}")]
    InvalidId(String),
    #[error("failed to read question data: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse tests.json: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Question and test-case discovery from a static directory tree:
///
/// ```text
/// <root>/<id>/question.txt
/// <root>/<id>/tests.json            [{id, input, expected_output}, ...]
/// <root>/<id>/input/input_<k>.txt   (used when tests.json is absent)
/// <root>/<id>/output/output_<k>.txt
/// ```
#[derive(Debug, Clone)]
pub struct QuestionStore {
    root: PathBuf,
}

impl QuestionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn question_dir(&self, id: &str) -> Result<PathBuf, QuestionError> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\']);
        if !valid {
            return Err(QuestionError::InvalidId(id.to_string()));
        }
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(QuestionError::NotFound(id.to_string()));
        }
        Ok(dir)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.question_dir(id).is_ok()
    }

    pub fn list_questions(&self) -> Result<Vec<QuestionMeta>, QuestionError> {
        let mut ids: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        ids.sort_by(|a, b| compare_ids(a, b));

        Ok(ids
            .into_iter()
            .map(|id| QuestionMeta {
                title: format!("Problem {}", id),
                id,
            })
            .collect())
    }

    pub fn get_question(&self, id: &str) -> Result<Question, QuestionError> {
        let dir = self.question_dir(id)?;
        let mut names: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "txt"))
            .collect();
        names.sort();

        let description = names
            .iter()
            .find_map(|path| fs::read_to_string(path).ok())
            .unwrap_or_else(|| "No description available.".to_string());

        Ok(Question {
            id: id.to_string(),
            description,
        })
    }

    /// Test cases in execution order.
    pub fn get_test_cases(&self, id: &str) -> Result<Vec<TestCase>, QuestionError> {
        let dir = self.question_dir(id)?;
        let tests_file = dir.join(TESTS_FILE);

        let mut cases = if tests_file.is_file() {
            let content = fs::read_to_string(&tests_file)?;
            serde_json::from_str::<Vec<TestCase>>(&content)?
        } else {
            read_paired_files(&dir)?
        };

        sort_cases(&mut cases);
        Ok(cases)
    }
}

fn read_paired_files(dir: &Path) -> Result<Vec<TestCase>, QuestionError> {
    let input_dir = dir.join("input");
    let output_dir = dir.join("output");
    let mut cases = Vec::new();

    for entry in fs::read_dir(&input_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let id = stem.strip_prefix("input_").unwrap_or(stem).to_string();

        // Inputs without a matching output are skipped.
        let Ok(expected_output) = fs::read_to_string(output_dir.join(format!("output_{}.txt", id))) else {
            continue;
        };
        let input = fs::read_to_string(&path)?;
        cases.push(TestCase {
            id,
            input,
            expected_output,
        });
    }

    Ok(cases)
}

/// Numeric order when every id is an integer, lexicographic otherwise.
pub fn sort_cases(cases: &mut [TestCase]) {
    let all_numeric = cases.iter().all(|c| c.id.trim().parse::<i64>().is_ok());
    if all_numeric {
        cases.sort_by_key(|c| c.id.trim().parse::<i64>().unwrap_or_default());
    } else {
        cases.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
