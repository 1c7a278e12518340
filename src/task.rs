//! Task-list parsing.
//!
//! The task list is plain text, one `owner/repo[/relative/path...]` entry per
//! line. Parsing is pure; a malformed line yields an error for that line only.

use crate::errors::TaskParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Dedup key for a repository: `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoKey(String);

impl RepoKey {
    pub fn new(owner: &str, name: &str) -> Self {
        Self(format!("{}/{}", owner, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of work from the task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryTask {
    pub owner: String,
    pub name: String,
    /// Target file inside the repository; empty when the line named only the repo.
    pub relative_path: String,
    /// 1-based line number in the task list.
    pub line: usize,
}

impl RepositoryTask {
    pub fn key(&self) -> RepoKey {
        RepoKey::new(&self.owner, &self.name)
    }

    pub fn has_target_file(&self) -> bool {
        !self.relative_path.is_empty()
    }
}

/// A non-blank task-list line, parsed or not.
#[derive(Debug, Clone)]
pub struct TaskLine {
    pub line: usize,
    pub raw: String,
    pub parsed: Result<RepositoryTask, TaskParseError>,
}

impl TaskLine {
    /// Best-effort key for reporting; malformed lines fall back to the raw text.
    pub fn report_key(&self) -> String {
        match &self.parsed {
            Ok(task) => task.key().to_string(),
            Err(_) => self.raw.clone(),
        }
    }
}

/// Parse one line. `line` is 1-based and used only for error messages.
pub fn parse_line(raw: &str, line: usize) -> Result<RepositoryTask, TaskParseError> {
    let trimmed = raw.trim();
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.len() < 2 {
        return Err(TaskParseError::TooFewSegments {
            line,
            raw: raw.to_string(),
        });
    }
    if parts[0].is_empty() {
        return Err(TaskParseError::EmptySegment {
            line,
            segment: "owner",
            raw: raw.to_string(),
        });
    }
    if parts[1].is_empty() {
        return Err(TaskParseError::EmptySegment {
            line,
            segment: "repository name",
            raw: raw.to_string(),
        });
    }

    let relative_path = parts[2..]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/");

    Ok(RepositoryTask {
        owner: parts[0].to_string(),
        name: parts[1].to_string(),
        relative_path,
        line,
    })
}

/// Parse a whole task list, preserving input order. Blank lines and `#`
/// comments are skipped.
pub fn parse_task_list(content: &str) -> Vec<TaskLine> {
    content
        .lines()
        .enumerate()
        .filter_map(|(idx, raw)| {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            Some(TaskLine {
                line: idx + 1,
                raw: trimmed.to_string(),
                parsed: parse_line(trimmed, idx + 1),
            })
        })
        .collect()
}
