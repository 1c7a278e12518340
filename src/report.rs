//! Error aggregation and the run report.
//!
//! The [`Aggregator`] collects one [`RepoResult`] per claimed repository
//! (plus malformed and duplicate lines) and, once every pipeline has joined,
//! logs one line per failure and produces the [`RunReport`].

use crate::errors::StageError;
use crate::pipeline::{Outcome, RepositoryState};
use crate::ui::icons::{CHECK, CROSS, SKIP, SPARKLE};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use console::style;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Final result for one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoResult {
    pub repo: String,
    /// Task-list line that claimed the repository.
    pub line: usize,
    pub target: String,
    pub state: RepositoryState,
    pub outcome: Outcome,
    pub duration_ms: u64,
}

/// A task line dropped because its repository was already claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscardedLine {
    pub line: usize,
    pub raw: String,
    pub repo: String,
    pub first_line: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub published: usize,
    pub already_published: usize,
    pub nothing_to_do: usize,
    pub dry_run: usize,
    pub failed: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub counts: Counts,
    pub results: Vec<RepoResult>,
    pub discarded: Vec<DiscardedLine>,
}

impl RunReport {
    pub fn errors(&self) -> impl Iterator<Item = &StageError> {
        self.results.iter().filter_map(|r| match &r.outcome {
            Outcome::Failed(err) => Some(err),
            _ => None,
        })
    }

    pub fn result_for(&self, repo: &str) -> Option<&RepoResult> {
        self.results.iter().find(|r| r.repo == repo)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize run report")
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write report to {}", path.display()))
    }

    /// Human-readable summary for the terminal.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        for result in &self.results {
            let line = match &result.outcome {
                Outcome::Published { pr_url, .. } => {
                    format!("{}{} {}", CHECK, style(&result.repo).bold(), style(pr_url).cyan())
                }
                Outcome::AlreadyPublished { pr_url, .. } => format!(
                    "{}{} already open: {}",
                    SKIP,
                    style(&result.repo).bold(),
                    style(pr_url).dim()
                ),
                Outcome::NothingToDo => {
                    format!("{}{} {}", SKIP, style(&result.repo).bold(), style("nothing to do").dim())
                }
                Outcome::DryRun { files } => {
                    let mut s = format!("{}{} would change:", SPARKLE, style(&result.repo).bold());
                    for f in files {
                        s.push_str(&format!(
                            "\n    {} {} (+{} -{})",
                            f.op, f.path, f.lines_added, f.lines_removed
                        ));
                    }
                    s
                }
                Outcome::Failed(err) => format!(
                    "{}{} {}: {}",
                    CROSS,
                    style(&result.repo).bold(),
                    style(err.tag()).red(),
                    err.cause
                ),
            };
            out.push_str(&line);
            out.push('\n');
        }
        for d in &self.discarded {
            out.push_str(&format!(
                "{}line {}: {} already claimed by line {}\n",
                SKIP,
                d.line,
                style(&d.repo).dim(),
                d.first_line
            ));
        }

        let c = &self.counts;
        out.push_str(&format!(
            "\n{} published, {} already open, {} nothing to do, {} dry run, {} failed, {} duplicates ({}ms)\n",
            style(c.published).green().bold(),
            c.already_published,
            c.nothing_to_do,
            c.dry_run,
            style(c.failed).red().bold(),
            c.discarded,
            (self.finished_at - self.started_at).num_milliseconds()
        ));
        out
    }
}

/// Collects results from every pipeline of a run.
#[derive(Debug)]
pub struct Aggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    dry_run: bool,
    results: Vec<RepoResult>,
    discarded: Vec<DiscardedLine>,
}

impl Aggregator {
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            dry_run,
            results: Vec::new(),
            discarded: Vec::new(),
        }
    }

    pub fn record(&mut self, result: RepoResult) {
        self.results.push(result);
    }

    pub fn discard(&mut self, line: DiscardedLine) {
        self.discarded.push(line);
    }

    /// Log one line per failure and build the report, ordered by task line.
    pub fn finish(mut self) -> RunReport {
        self.results.sort_by_key(|r| r.line);
        self.discarded.sort_by_key(|d| d.line);

        let mut counts = Counts {
            discarded: self.discarded.len(),
            ..Counts::default()
        };
        for result in &self.results {
            match &result.outcome {
                Outcome::Published { .. } => counts.published += 1,
                Outcome::AlreadyPublished { .. } => counts.already_published += 1,
                Outcome::NothingToDo => counts.nothing_to_do += 1,
                Outcome::DryRun { .. } => counts.dry_run += 1,
                Outcome::Failed(err) => {
                    counts.failed += 1;
                    tracing::error!(
                        repo = %err.repo_key,
                        stage = %err.stage,
                        kind = err.kind.as_str(),
                        tag = %err.tag(),
                        "{}",
                        err.cause
                    );
                }
            }
        }

        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            counts,
            results: self.results,
            discarded: self.discarded,
        }
    }
}
