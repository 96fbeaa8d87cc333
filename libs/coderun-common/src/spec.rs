// Execution spec resolution: language key -> image + command template
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// One entry of the spec map. An entry with `use` set is an alias and the
/// remaining fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageSpec {
    pub image: String,
    pub entrypoint: String,
    pub filename: String,
    pub cmd: String,
    pub language: String,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
    /// Judge harness family for question-backed submissions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harness: Option<HarnessKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarnessKind {
    Python,
    Javascript,
}

impl LanguageSpec {
    /// Command template with `{file}` expanded. An empty template runs the
    /// source file itself.
    pub fn command(&self) -> String {
        if self.cmd.trim().is_empty() {
            self.filename.clone()
        } else {
            self.cmd.replace("{file}", &self.filename)
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("unsupported language: {0}")]
    NotFound(String),
    #[error("alias cycle detected: {}", .0.join(" -> "))]
    AliasCycle(Vec<String>),
    #[error("spec entry '{0}' has no image")]
    MissingImage(String),
}

/// Resolves language keys to concrete specs, following `use` aliases.
#[derive(Debug, Clone, Default)]
pub struct SpecResolver {
    specs: BTreeMap<String, LanguageSpec>,
}

impl SpecResolver {
    pub fn new(specs: BTreeMap<String, LanguageSpec>) -> Self {
        Self { specs }
    }

    /// Load the spec map from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Spec file not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let specs: BTreeMap<String, LanguageSpec> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(Self { specs })
    }

    /// Resolve `key`, following aliases transitively.
    pub fn resolve(&self, key: &str) -> Result<LanguageSpec, SpecError> {
        let mut chain = vec![key.to_string()];
        let mut visited = HashSet::new();
        let mut current = key;

        loop {
            if !visited.insert(current) {
                return Err(SpecError::AliasCycle(chain));
            }
            let spec = self
                .specs
                .get(current)
                .ok_or_else(|| SpecError::NotFound(current.to_string()))?;

            match spec.alias_of.as_deref() {
                Some(target) if !target.is_empty() => {
                    chain.push(target.to_string());
                    current = target;
                }
                _ => {
                    if spec.image.trim().is_empty() {
                        return Err(SpecError::MissingImage(current.to_string()));
                    }
                    let mut resolved = spec.clone();
                    resolved.alias_of = None;
                    if resolved.language.is_empty() {
                        resolved.language = current.to_string();
                    }
                    return Ok(resolved);
                }
            }
        }
    }

    /// All configured keys, aliases included
    pub fn keys(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    /// Raw, unresolved entries
    pub fn entries(&self) -> &BTreeMap<String, LanguageSpec> {
        &self.specs
    }

    /// Resolve every key, collecting the ones that fail.
    pub fn validate(&self) -> Vec<(String, SpecError)> {
        self.specs
            .keys()
            .filter_map(|key| self.resolve(key).err().map(|e| (key.clone(), e)))
            .collect()
    }
}

/// Split an image reference into repository and tag. A bare name defaults to
/// `latest`; otherwise the split is on the last colon, unless that colon
/// belongs to a registry port.
pub fn parse_image(image: &str) -> (String, String) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') && !repo.is_empty() => {
            (repo.to_string(), tag.to_string())
        }
        _ => (image.to_string(), "latest".to_string()),
    }
}
